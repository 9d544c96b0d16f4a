//! Observability: tracing around completion calls
//!
//! `TracingLayer` decorates a completion service with an `info_span` carrying
//! the model and the request size, then logs what came back: finish reason,
//! requested tool calls and token usage.
//!
//! Composition
//! - `ServiceBuilder::new().layer(TracingLayer::new()).layer(CacheLayer::new(..)).service(upstream)`

use std::future::Future;
use std::pin::Pin;

use async_openai::types::CreateChatCompletionResponse;
use tower::{BoxError, Layer, Service};
use tracing::{info, info_span, Instrument};

use crate::gateway::CompletionRequest;

/// Token counts reported by the completion service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn of(resp: &CreateChatCompletionResponse) -> Self {
        resp.usage
            .as_ref()
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens as usize,
                completion_tokens: u.completion_tokens as usize,
            })
            .unwrap_or_default()
    }
}

/// Layer that adds tracing around completion calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<CompletionRequest> for Tracing<S>
where
    S: Service<CompletionRequest, Response = CreateChatCompletionResponse, Error = BoxError>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = CreateChatCompletionResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CompletionRequest) -> Self::Future {
        let span = info_span!(
            "completion",
            model = %req.model,
            messages = req.messages.len(),
            tools = req.tools.len()
        );
        let fut = self.inner.call(req).instrument(span.clone());
        Box::pin(async move {
            let out = fut.await?;
            span.in_scope(|| log_response(&out));
            Ok(out)
        })
    }
}

fn log_response(out: &CreateChatCompletionResponse) {
    let usage = Usage::of(out);
    match out.choices.first() {
        Some(choice) => {
            let calls: Vec<&str> = choice
                .message
                .tool_calls
                .iter()
                .flatten()
                .map(|tc| tc.function.name.as_str())
                .collect();
            info!(
                finish_reason = ?choice.finish_reason,
                tool_calls = ?calls,
                prompt = usage.prompt_tokens,
                completion = usage.completion_tokens,
                "completion returned"
            );
        }
        None => info!("completion returned no choices"),
    }
}
