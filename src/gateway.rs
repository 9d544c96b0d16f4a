//! Completion gateway
//!
//! Every model call goes through a `CachedGateway`: the request is
//! fingerprinted over `(messages, model, tools, tool_choice)`, a stored
//! response is replayed when present, and on a miss exactly one upstream
//! request is issued with fixed sampling parameters. The raw response is
//! persisted before it is returned. There are no retries here.
//!
//! Composition
//! - `ServiceBuilder::new().layer(TracingLayer::new()).layer(CacheLayer::new(cache, sampling)).service(OpenAIUpstream::new(client))`
//! - `SharedGateway` erases the stack so functions and the agent loop can share it

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionTool, ChatCompletionToolChoiceOption,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_openai::Client;
use serde::Serialize;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info};

use crate::cache::{CacheStore, Fingerprint, Fingerprinter};
use crate::error::{HalpertError, Result};
use crate::observability::TracingLayer;

/// Fixed sampling parameters applied to every upstream request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub seed: i64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            seed: 42,
        }
    }
}

/// The semantically relevant part of a chat completion request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatCompletionRequestMessage>,
    pub model: String,
    pub tools: Vec<ChatCompletionTool>,
    pub tool_choice: Option<ChatCompletionToolChoiceOption>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatCompletionRequestMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ChatCompletionTool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ChatCompletionToolChoiceOption) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    /// Cache key. Field order is part of the key: messages, model, tools, tool_choice.
    pub fn fingerprint(&self) -> std::result::Result<Fingerprint, serde_json::Error> {
        let mut fp = Fingerprinter::new();
        fp.push(&self.messages)?
            .push(&self.model)?
            .push(&self.tools)?
            .push(&self.tool_choice)?;
        Ok(fp.finish())
    }

    /// Wire request with sampling applied. An unset tool choice is sent as "auto".
    pub fn to_openai(
        &self,
        sampling: Sampling,
    ) -> std::result::Result<CreateChatCompletionRequest, OpenAIError> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(self.messages.clone())
            .temperature(sampling.temperature)
            .seed(sampling.seed);
        if !self.tools.is_empty() {
            builder.tools(self.tools.clone()).tool_choice(
                self.tool_choice
                    .clone()
                    .unwrap_or(ChatCompletionToolChoiceOption::Auto),
            );
        }
        builder.build()
    }
}

/// Layer that puts a response cache in front of an upstream completion service.
#[derive(Clone)]
pub struct CacheLayer {
    cache: Arc<dyn CacheStore>,
    sampling: Sampling,
}

impl CacheLayer {
    pub fn new(cache: Arc<dyn CacheStore>, sampling: Sampling) -> Self {
        Self { cache, sampling }
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CachedGateway<S>;

    fn layer(&self, upstream: S) -> Self::Service {
        CachedGateway {
            upstream,
            cache: self.cache.clone(),
            sampling: self.sampling,
        }
    }
}

/// Caching completion service. See the module docs.
#[derive(Clone)]
pub struct CachedGateway<S> {
    upstream: S,
    cache: Arc<dyn CacheStore>,
    sampling: Sampling,
}

impl<S> CachedGateway<S> {
    pub fn new(upstream: S, cache: Arc<dyn CacheStore>, sampling: Sampling) -> Self {
        Self {
            upstream,
            cache,
            sampling,
        }
    }
}

impl<S> Service<CompletionRequest> for CachedGateway<S>
where
    S: Service<CreateChatCompletionRequest, Response = CreateChatCompletionResponse, Error = BoxError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = CreateChatCompletionResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        // Upstream readiness is awaited inside `call`, only on a miss.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        let clone = self.upstream.clone();
        let mut upstream = std::mem::replace(&mut self.upstream, clone);
        let cache = self.cache.clone();
        let sampling = self.sampling;

        Box::pin(async move {
            let fp = req.fingerprint().map_err(HalpertError::from)?;

            if let Some(bytes) = cache.get(&fp).await.map_err(HalpertError::from)? {
                debug!(fingerprint = %fp, "completion cache hit");
                return Ok(decode(&bytes)?);
            }

            info!(fingerprint = %fp, model = %req.model, "completion cache miss");
            let wire = req.to_openai(sampling).map_err(HalpertError::from)?;
            let response = upstream
                .ready()
                .await
                .map_err(HalpertError::Upstream)?
                .call(wire)
                .await
                .map_err(HalpertError::Upstream)?;

            let bytes = serde_json::to_vec_pretty(&response).map_err(HalpertError::from)?;
            cache.put(&fp, &bytes).await.map_err(HalpertError::from)?;
            // A concurrent writer may have stored first; the stored entry wins.
            let stored = cache.get(&fp).await.map_err(HalpertError::from)?;
            Ok(decode(stored.as_deref().unwrap_or(&bytes))?)
        })
    }
}

fn decode(bytes: &[u8]) -> std::result::Result<CreateChatCompletionResponse, HalpertError> {
    serde_json::from_slice(bytes)
        .map_err(|e| HalpertError::malformed(format!("stored response does not decode: {}", e)))
}

/// Upstream service calling the OpenAI chat completions API.
#[derive(Clone)]
pub struct OpenAIUpstream {
    client: Client<OpenAIConfig>,
}

impl OpenAIUpstream {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }
}

impl Default for OpenAIUpstream {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl Service<CreateChatCompletionRequest> for OpenAIUpstream {
    type Response = CreateChatCompletionResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client.chat().create(req).await?;
            Ok(resp)
        })
    }
}

/// Type-erased completion service.
pub type CompletionSvc = BoxCloneService<CompletionRequest, CreateChatCompletionResponse, BoxError>;

/// Cloneable handle to one completion stack, shared by the agent loop and by
/// functions that talk to the model themselves.
#[derive(Clone)]
pub struct SharedGateway {
    inner: Arc<tokio::sync::Mutex<CompletionSvc>>,
}

impl SharedGateway {
    pub fn new<S>(svc: S) -> Self
    where
        S: Service<CompletionRequest, Response = CreateChatCompletionResponse, Error = BoxError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(BoxCloneService::new(svc))),
        }
    }

    /// Gateway over any upstream, with tracing and caching layered on.
    pub fn layered<U>(upstream: U, cache: Arc<dyn CacheStore>, sampling: Sampling) -> Self
    where
        U: Service<CreateChatCompletionRequest, Response = CreateChatCompletionResponse, Error = BoxError>
            + Clone
            + Send
            + 'static,
        U::Future: Send + 'static,
    {
        let svc = ServiceBuilder::new()
            .layer(TracingLayer::new())
            .layer(CacheLayer::new(cache, sampling))
            .service(upstream);
        Self::new(svc)
    }

    /// Gateway over the OpenAI API.
    pub fn openai(client: Client<OpenAIConfig>, cache: Arc<dyn CacheStore>, sampling: Sampling) -> Self {
        Self::layered(OpenAIUpstream::new(client), cache, sampling)
    }

    pub async fn complete(&self, req: CompletionRequest) -> Result<CreateChatCompletionResponse> {
        let mut svc = self.inner.lock().await.clone();
        let resp = svc
            .ready()
            .await
            .map_err(HalpertError::from_boxed)?
            .call(req)
            .await
            .map_err(HalpertError::from_boxed)?;
        Ok(resp)
    }
}

impl std::fmt::Debug for SharedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGateway").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Script {
    responses: VecDeque<CreateChatCompletionResponse>,
    requests: Vec<CreateChatCompletionRequest>,
}

/// Upstream that replays a fixed list of responses and records every request.
///
/// Used for offline runs and tests; an exhausted script is an upstream error.
#[derive(Clone, Default)]
pub struct ScriptedUpstream {
    script: Arc<Mutex<Script>>,
}

impl ScriptedUpstream {
    pub fn new(responses: impl IntoIterator<Item = CreateChatCompletionResponse>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                responses: responses.into_iter().collect(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn push(&self, response: CreateChatCompletionResponse) {
        self.lock().responses.push_back(response);
    }

    /// Number of upstream calls made so far.
    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<CreateChatCompletionRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Service<CreateChatCompletionRequest> for ScriptedUpstream {
    type Response = CreateChatCompletionResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let next = {
            let mut script = self.lock();
            script.requests.push(req);
            script.responses.pop_front()
        };
        Box::pin(async move { next.ok_or_else(|| BoxError::from("scripted upstream exhausted")) })
    }
}
