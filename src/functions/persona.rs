//! Persona messaging
//!
//! `Send Message` lets the agent talk to a role-played contact. The contact
//! is itself a model call through the shared gateway, forced to answer via a
//! `process` tool. Conversation history lives in the run context, so two
//! samples never see each other's messages.

use async_openai::types::{
    ChatCompletionNamedToolChoice, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionToolChoiceOption, ChatCompletionToolType,
    FunctionName,
};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::HalpertError;
use crate::function::{schema_value, tool_spec, Function, FunctionError, RunContext};
use crate::gateway::{CompletionRequest, SharedGateway};

const PROCESS_FUNCTION: &str = "process";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendMessageInput {
    pub message: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct SendMessageOutput {
    /// The contact's reply, if they chose to answer
    pub message: Option<String>,
}

/// Arguments of the persona's `process` call.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PersonaResponse {
    pub reasoning: String,
    pub should_respond: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// Sent by the agent
    Input(String),
    /// Sent by the persona
    Output(String),
}

/// Per-run conversation with one persona.
#[derive(Debug, Default)]
pub struct History(pub Vec<Turn>);

/// "Send Message" to a role-played persona.
#[derive(Debug, Clone)]
pub struct SendMessage {
    persona: String,
    gateway: SharedGateway,
    model: String,
}

impl SendMessage {
    pub fn new(persona: impl Into<String>, gateway: SharedGateway, model: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            gateway,
            model: model.into(),
        }
    }

    fn history_key(&self) -> String {
        format!("{}:{}", self.slug(), self.persona)
    }

    fn request(&self, history: &[Turn]) -> Result<CompletionRequest, HalpertError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(format!(
                    "You are role playing the following persona: {}. Use the process function to either respond with a message or not when someone sends you a message. Make sure to closely follow the persona.",
                    self.persona
                ))
                .build()?
                .into(),
        ];
        for turn in history {
            messages.push(match turn {
                Turn::Input(text) => ChatCompletionRequestUserMessageArgs::default()
                    .content(text.as_str())
                    .build()?
                    .into(),
                Turn::Output(text) => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(text.as_str())
                    .build()?
                    .into(),
            });
        }
        let process = tool_spec(
            PROCESS_FUNCTION,
            "Process a message by either responding with a message or not.",
            schema_value::<PersonaResponse>(),
        );
        Ok(CompletionRequest::new(&self.model, messages)
            .with_tools(vec![process])
            .with_tool_choice(ChatCompletionToolChoiceOption::Named(
                ChatCompletionNamedToolChoice {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionName {
                        name: PROCESS_FUNCTION.to_string(),
                    },
                },
            )))
    }
}

#[async_trait]
impl Function for SendMessage {
    fn name(&self) -> &str {
        "Send Message"
    }

    fn description(&self) -> &str {
        "Send a message"
    }

    fn input_schema(&self) -> Value {
        schema_value::<SendMessageInput>()
    }

    fn output_schema(&self) -> Value {
        schema_value::<SendMessageOutput>()
    }

    async fn call(&self, input: Value, cx: &mut RunContext) -> Result<Value, FunctionError> {
        let input: SendMessageInput = serde_json::from_value(input)
            .map_err(|e| FunctionError::InvalidArguments(e.to_string()))?;

        let key = self.history_key();
        let history = {
            let history = cx.state_mut::<History>(&key);
            history.0.push(Turn::Input(input.message));
            history.0.clone()
        };

        let req = self.request(&history).map_err(FunctionError::failed)?;
        let resp = self.gateway.complete(req).await.map_err(FunctionError::failed)?;
        let call = resp
            .choices
            .first()
            .and_then(|c| c.message.tool_calls.as_ref())
            .and_then(|calls| calls.iter().find(|c| c.function.name == PROCESS_FUNCTION))
            .ok_or_else(|| FunctionError::failed(HalpertError::malformed("persona did not call process")))?;
        let response: PersonaResponse = serde_json::from_str(&call.function.arguments)
            .map_err(|e| FunctionError::failed(HalpertError::malformed(format!("process arguments: {}", e))))?;
        debug!(persona = %self.persona, reasoning = %response.reasoning, should_respond = response.should_respond, "persona response");

        let reply = response.message;
        if let Some(text) = reply.as_ref().filter(|m| !m.is_empty()) {
            cx.state_mut::<History>(&key).0.push(Turn::Output(text.clone()));
        }
        serde_json::to_value(SendMessageOutput { message: reply }).map_err(FunctionError::failed)
    }
}
