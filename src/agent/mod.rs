//! Agent loop
//!
//! Drives one task through the completion gateway until the model calls
//! `done` or the run ends unexpectedly, then asks the quiz.
//!
//! States
//! - `Running`: each step offers every function plus `done`, tool choice "auto"
//! - `TerminatedByAgent`: the model called `done`
//! - `TerminatedUnexpected`: a non-tool finish, an unknown function, rejected
//!   arguments (under `ArgumentErrorPolicy::Terminate`) or the step budget
//! - `QuizExtracted`: terminal; answers were parsed and zipped with the questions
//!
//! Tool calls within a batch run strictly in the order the model emitted them.
//! The assistant turn appended to the transcript carries only the calls that
//! actually ran, so every tool call id in the transcript has a result.

use std::future::Future;
use std::pin::Pin;

use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionNamedToolChoice,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolChoiceOption,
    ChatCompletionToolType, CreateChatCompletionResponse, FinishReason, FunctionName,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::{BoxError, Service};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{HalpertError, Result};
use crate::function::{tool_spec, FunctionError, FunctionSet, RunContext};
use crate::gateway::{CompletionRequest, SharedGateway};
use crate::observability::Usage;
use crate::sample::{Evaluation, QuizAnswer};

pub const SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Follow the instructions and use the available functions to complete the task. Always call functions, and never respond with a text message! Do not make any assumptions about the task, and do not use any outside knowledge.";

const QUIZ_PROMPT: &str = "You are a helpful AI assistant. Answer the questions based on the messages so far using the answer function. Question:\n";

pub const DONE_FUNCTION: &str = "done";
pub const ANSWER_FUNCTION: &str = "answer";

/// What to do when a function rejects the model's arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentErrorPolicy {
    /// End the run as unexpected and go to the quiz
    #[default]
    Terminate,
    /// Hand the error back as the tool result and keep going
    ReportToModel,
}

/// Why a run ended without the model calling `done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The completion finished for something other than tool calls
    FinishReason(String),
    UnknownFunction(String),
    InvalidArguments { function: String, message: String },
    MaxSteps(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running,
    TerminatedByAgent,
    TerminatedUnexpected(StopReason),
    QuizExtracted,
}

/// Auxiliary accounting accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunAux {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub tool_invocations: usize,
}

impl RunAux {
    fn add(&mut self, usage: Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }
}

/// One task for the agent: instructions, functions and the questions to ask afterwards.
#[derive(Debug)]
pub struct AgentTask {
    pub instructions: String,
    pub functions: FunctionSet,
    pub questions: Vec<String>,
    pub context: RunContext,
}

/// Result of a full run, quiz included.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Transcript as handed to the quiz phase
    pub transcript: Vec<ChatCompletionRequestMessage>,
    /// Completion steps taken in the running phase
    pub steps: usize,
    /// `QuizExtracted` once the run is complete
    pub state: LoopState,
    /// How the running phase ended: `TerminatedByAgent` or `TerminatedUnexpected`
    pub termination: LoopState,
    /// Slugs of every function call that ran, in order
    pub invoked: Vec<String>,
    pub quiz: Vec<QuizAnswer>,
    pub aux: RunAux,
}

impl AgentRun {
    pub fn evaluation(&self) -> Evaluation {
        Evaluation {
            functions: dedup(&self.invoked),
            quiz: self.quiz.clone(),
        }
    }
}

/// Distinct entries in first-seen order.
pub fn dedup(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

/// The agent loop as a tower service over `AgentTask`.
#[derive(Clone, Debug)]
pub struct AgentLoop {
    gateway: SharedGateway,
    model: String,
    max_steps: Option<usize>,
    argument_errors: ArgumentErrorPolicy,
}

impl AgentLoop {
    pub fn new(gateway: SharedGateway, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            max_steps: None,
            argument_errors: ArgumentErrorPolicy::default(),
        }
    }

    pub fn max_steps(mut self, max: Option<usize>) -> Self {
        self.max_steps = max;
        self
    }

    pub fn argument_errors(mut self, policy: ArgumentErrorPolicy) -> Self {
        self.argument_errors = policy;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run a task to `QuizExtracted`.
    pub async fn run(&self, task: AgentTask) -> Result<AgentRun> {
        let AgentTask {
            instructions,
            functions,
            questions,
            mut context,
        } = task;

        let mut transcript: Vec<ChatCompletionRequestMessage> = vec![
            system_message(SYSTEM_PROMPT)?,
            ChatCompletionRequestUserMessageArgs::default()
                .content(instructions)
                .build()?
                .into(),
        ];
        let mut tools = functions.tool_specs();
        tools.push(done_tool());

        let mut aux = RunAux::default();
        let mut invoked = Vec::new();
        let mut steps = 0usize;
        let mut state = LoopState::Running;

        while state == LoopState::Running {
            if let Some(max) = self.max_steps {
                if steps >= max {
                    warn!(max_steps = max, "step budget exhausted");
                    state = LoopState::TerminatedUnexpected(StopReason::MaxSteps(max));
                    break;
                }
            }
            steps += 1;
            let req = CompletionRequest::new(&self.model, transcript.clone()).with_tools(tools.clone());
            let resp = self.gateway.complete(req).await?;
            aux.add(Usage::of(&resp));

            state = self
                .step(resp, &functions, &mut context, &mut transcript, &mut invoked, &mut aux)
                .instrument(info_span!("step", step_no = steps))
                .await?;
        }
        info!(steps, termination = ?state, "agent loop finished");
        let termination = state;

        let quiz = self.quiz(&transcript, &questions).await?;
        let state = LoopState::QuizExtracted;

        Ok(AgentRun {
            transcript,
            steps,
            state,
            termination,
            invoked,
            quiz,
            aux,
        })
    }

    async fn step(
        &self,
        resp: CreateChatCompletionResponse,
        functions: &FunctionSet,
        cx: &mut RunContext,
        transcript: &mut Vec<ChatCompletionRequestMessage>,
        invoked: &mut Vec<String>,
        aux: &mut RunAux,
    ) -> Result<LoopState> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| HalpertError::malformed("completion has no choices"))?;

        let calls = choice.message.tool_calls.clone().unwrap_or_default();
        if choice.finish_reason != Some(FinishReason::ToolCalls) || calls.is_empty() {
            let reason = finish_reason_name(choice.finish_reason);
            warn!(finish_reason = %reason, "unexpected finish reason");
            return Ok(LoopState::TerminatedUnexpected(StopReason::FinishReason(reason)));
        }

        let mut executed: Vec<ChatCompletionMessageToolCall> = Vec::new();
        let mut results: Vec<ChatCompletionRequestMessage> = Vec::new();
        let mut state = LoopState::Running;

        for call in calls {
            let name = call.function.name.clone();
            if name == DONE_FUNCTION {
                debug!("agent called done");
                state = LoopState::TerminatedByAgent;
                break;
            }
            let Some(function) = functions.get(&name) else {
                warn!(function = %name, "unexpected function call");
                state = LoopState::TerminatedUnexpected(StopReason::UnknownFunction(name));
                break;
            };

            let outcome = match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(args) => {
                    debug!(function = %name, arguments = %args, "calling function");
                    function.call(args, cx).await
                }
                Err(e) => Err(FunctionError::InvalidArguments(e.to_string())),
            };

            let content = match outcome {
                Ok(output) => {
                    debug!(function = %name, output = %output, "function returned");
                    output.to_string()
                }
                Err(FunctionError::InvalidArguments(message)) => match self.argument_errors {
                    ArgumentErrorPolicy::Terminate => {
                        warn!(function = %name, error = %message, "invalid function arguments");
                        state = LoopState::TerminatedUnexpected(StopReason::InvalidArguments {
                            function: name,
                            message,
                        });
                        break;
                    }
                    ArgumentErrorPolicy::ReportToModel => {
                        debug!(function = %name, error = %message, "reporting invalid arguments to model");
                        json!({ "error": message }).to_string()
                    }
                },
                Err(FunctionError::Failed(source)) => {
                    return Err(HalpertError::FunctionFailed {
                        function: name,
                        source,
                    })
                }
            };

            aux.tool_invocations += 1;
            invoked.push(name);
            results.push(
                ChatCompletionRequestToolMessageArgs::default()
                    .content(content)
                    .tool_call_id(call.id.clone())
                    .build()?
                    .into(),
            );
            executed.push(call);
        }

        if !executed.is_empty() {
            let mut assistant = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(content) = choice.message.content {
                assistant.content(content);
            }
            transcript.push(assistant.tool_calls(executed).build()?.into());
            transcript.extend(results);
        }
        Ok(state)
    }

    async fn quiz(
        &self,
        transcript: &[ChatCompletionRequestMessage],
        questions: &[String],
    ) -> Result<Vec<QuizAnswer>> {
        if questions.is_empty() {
            return Ok(Vec::new());
        }

        let listing = questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {}", i, q))
            .collect::<Vec<_>>()
            .join("\n");
        let mut messages = vec![system_message(&format!("{}{}", QUIZ_PROMPT, listing))?];
        messages.extend(transcript.iter().skip(1).cloned());

        let req = CompletionRequest::new(&self.model, messages)
            .with_tools(vec![answer_tool()])
            .with_tool_choice(ChatCompletionToolChoiceOption::Named(
                ChatCompletionNamedToolChoice {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionName {
                        name: ANSWER_FUNCTION.to_string(),
                    },
                },
            ));
        let resp = self.gateway.complete(req).await?;
        let answers = parse_answers(&resp)?;
        debug!(?answers, "quiz answered");

        Ok(questions
            .iter()
            .enumerate()
            .map(|(i, q)| QuizAnswer {
                question: q.clone(),
                answer: answers.get(i).cloned().flatten(),
            })
            .collect())
    }
}

impl Service<AgentTask> for AgentLoop {
    type Response = AgentRun;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, task: AgentTask) -> Self::Future {
        let this = self.clone();
        let span = info_span!("agent_run", model = %this.model);
        Box::pin(async move { this.run(task).await.map_err(BoxError::from) }.instrument(span))
    }
}

fn system_message(content: &str) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(content)
        .build()?
        .into())
}

fn done_tool() -> ChatCompletionTool {
    tool_spec(
        DONE_FUNCTION,
        "Call this function when you are done with the task.",
        json!({"type": "object", "properties": {}}),
    )
}

fn answer_tool() -> ChatCompletionTool {
    tool_spec(
        ANSWER_FUNCTION,
        "Call this function to answer all questions. If you do not know the answer to a specific question, enter an empty string. VERY IMPORTANT: answer all questions, even if you do not know the answer to some of them.",
        json!({
            "type": "object",
            "properties": {
                "num_questions": {"type": "integer"},
                "answers": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["answers"]
        }),
    )
}

/// Answers from the forced `answer` call, by position. Non-string entries are
/// kept as their JSON text; `null` is an absent answer.
fn parse_answers(resp: &CreateChatCompletionResponse) -> Result<Vec<Option<String>>> {
    let call = resp
        .choices
        .first()
        .and_then(|c| c.message.tool_calls.as_ref())
        .and_then(|calls| calls.iter().find(|c| c.function.name == ANSWER_FUNCTION))
        .ok_or_else(|| HalpertError::malformed("quiz completion has no answer call"))?;
    let args: Value = serde_json::from_str(&call.function.arguments)
        .map_err(|e| HalpertError::malformed(format!("answer arguments: {}", e)))?;
    let answers = args
        .get("answers")
        .and_then(Value::as_array)
        .ok_or_else(|| HalpertError::malformed("answer arguments carry no answers list"))?;
    Ok(answers
        .iter()
        .map(|a| match a {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect())
}

fn finish_reason_name(reason: Option<FinishReason>) -> String {
    match reason {
        Some(r) => serde_json::to_value(r)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", r)),
        None => "none".to_string(),
    }
}
