//! Shared builders for scripted completion responses.

#![allow(dead_code)]

use async_openai::types::CreateChatCompletionResponse;
use serde_json::{json, Value};

/// A response whose assistant turn requests the given `(id, name, arguments)` calls.
pub fn tool_calls(calls: &[(&str, &str, Value)]) -> CreateChatCompletionResponse {
    let calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, args)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": args.to_string()}
            })
        })
        .collect();
    serde_json::from_value(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4-1106-preview",
        "choices": [{
            "index": 0,
            "finish_reason": "tool_calls",
            "message": {"role": "assistant", "content": null, "tool_calls": calls}
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    }))
    .expect("valid completion response")
}

/// The forced `answer` call of the quiz phase.
pub fn answers(values: &[&str]) -> CreateChatCompletionResponse {
    let mut resp = tool_calls(&[("quiz", "answer", json!({"num_questions": values.len(), "answers": values}))]);
    resp.choices[0].finish_reason = Some(async_openai::types::FinishReason::Stop);
    resp
}

pub fn done(id: &str) -> CreateChatCompletionResponse {
    tool_calls(&[(id, "done", json!({}))])
}

/// A plain text reply.
pub fn text(content: &str) -> CreateChatCompletionResponse {
    serde_json::from_value(json!({
        "id": "chatcmpl-text",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4-1106-preview",
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": {"role": "assistant", "content": content}
        }]
    }))
    .expect("valid completion response")
}
