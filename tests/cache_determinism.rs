//! Replaying completions from an on-disk cache.

mod common;

use std::sync::Arc;

use async_openai::types::{ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs};
use halpert::cache::{CacheStore, FsCache};
use halpert::function::tool_spec;
use halpert::gateway::{CompletionRequest, Sampling, ScriptedUpstream, SharedGateway};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::tool_calls;

fn user(content: &str) -> ChatCompletionRequestMessage {
    ChatCompletionRequestUserMessageArgs::default()
        .content(content)
        .build()
        .unwrap()
        .into()
}

fn request(content: &str) -> CompletionRequest {
    CompletionRequest::new("gpt-4-1106-preview", vec![user(content)])
}

fn gateway(upstream: &ScriptedUpstream, cache: &FsCache) -> SharedGateway {
    SharedGateway::layered(upstream.clone(), Arc::new(cache.clone()), Sampling::default())
}

#[tokio::test]
async fn second_run_replays_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FsCache::new(dir.path()).unwrap();

    let first_upstream =
        ScriptedUpstream::new([tool_calls(&[("c1", "add", json!({"a": 1, "b": 2}))])]);
    let first = gateway(&first_upstream, &cache)
        .complete(request("What is 1 + 2?"))
        .await
        .unwrap();
    assert_eq!(first_upstream.calls(), 1);

    // A fresh gateway over the same directory, as a new process would build.
    let second_upstream = ScriptedUpstream::default();
    let second = gateway(&second_upstream, &FsCache::new(dir.path()).unwrap())
        .complete(request("What is 1 + 2?"))
        .await
        .unwrap();
    assert_eq!(second_upstream.calls(), 0);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[tokio::test]
async fn entries_are_named_by_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FsCache::new(dir.path()).unwrap();
    let upstream = ScriptedUpstream::new([tool_calls(&[("c1", "add", json!({"a": 1, "b": 2}))])]);

    let req = request("What is 1 + 2?");
    gateway(&upstream, &cache).complete(req.clone()).await.unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let expected = format!("{}.json", req.fingerprint().unwrap());
    assert_eq!(names, vec![expected.clone()]);
    assert_eq!(expected.len(), 32 + ".json".len());

    let stored = cache.get(&req.fingerprint().unwrap()).await.unwrap().unwrap();
    let stored: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    assert_eq!(stored["choices"][0]["message"]["tool_calls"][0]["function"]["name"], "add");
}

#[tokio::test]
async fn any_content_change_misses() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FsCache::new(dir.path()).unwrap();
    let upstream = ScriptedUpstream::new([common::text("3"), common::text("4")]);
    let gw = gateway(&upstream, &cache);

    gw.complete(request("What is 1 + 2?")).await.unwrap();
    gw.complete(request("What is 1 + 3?")).await.unwrap();
    gw.complete(request("What is 1 + 2?")).await.unwrap();

    assert_eq!(upstream.calls(), 2);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}

#[test]
fn tool_schema_key_order_does_not_change_the_key() {
    let schema_a: serde_json::Value =
        serde_json::from_str(r#"{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"integer"}}}"#)
            .unwrap();
    let schema_b: serde_json::Value =
        serde_json::from_str(r#"{"properties":{"b":{"type":"integer"},"a":{"type":"integer"}},"type":"object"}"#)
            .unwrap();

    let a = request("What is 1 + 2?").with_tools(vec![tool_spec("add", "Add two numbers", schema_a)]);
    let b = request("What is 1 + 2?").with_tools(vec![tool_spec("add", "Add two numbers", schema_b)]);
    assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

    let renamed = request("What is 1 + 2?").with_tools(vec![tool_spec(
        "sum",
        "Add two numbers",
        json!({"type": "object"}),
    )]);
    assert_ne!(a.fingerprint().unwrap(), renamed.fingerprint().unwrap());
}
