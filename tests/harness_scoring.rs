//! End-to-end harness runs: preparation, tracking, submission and scoring.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use halpert::agent::{AgentLoop, AgentRun, AgentTask};
use halpert::cache::InMemoryCache;
use halpert::function::{Function, FunctionSet};
use halpert::functions;
use halpert::gateway::{Sampling, ScriptedUpstream, SharedGateway};
use halpert::harness::Halpert;
use halpert::sample::{Expected, QuizItem, Sample};
use halpert::snapshot::{SnapshotBackend, SnapshotRestore};
use halpert::HalpertError;
use pretty_assertions::assert_eq;
use serde_json::json;
use tower::util::BoxCloneService;
use tower::BoxError;

use common::{answers, done, tool_calls};

fn add_sample() -> Sample {
    let add: Arc<dyn Function> = Arc::new(functions::add());
    Sample::new(
        "Add two numbers",
        "What is 1782937829 + 973912412?",
        FunctionSet::new(vec![add]),
        Expected {
            functions: vec!["add".into()],
            quiz: vec![
                QuizItem::new("What is the first term?", "1782937829"),
                QuizItem::new("What is the second term?", "973912412"),
                QuizItem::new("What is the sum?", "2756850241"),
            ],
        },
    )
    .unwrap()
}

fn agent(upstream: &ScriptedUpstream) -> AgentLoop {
    let gateway = SharedGateway::layered(
        upstream.clone(),
        Arc::new(InMemoryCache::default()),
        Sampling::default(),
    );
    AgentLoop::new(gateway, "gpt-4-1106-preview")
}

fn add_call() -> async_openai::types::CreateChatCompletionResponse {
    tool_calls(&[("c1", "add", json!({"a": 1782937829i64, "b": 973912412i64}))])
}

#[tokio::test]
async fn perfect_run_scores_one() {
    let upstream = ScriptedUpstream::new([
        add_call(),
        done("c2"),
        answers(&["1782937829", "973912412", "2756850241"]),
    ]);
    let harness = Halpert::new(vec![add_sample()]);
    harness.run_sample(0, agent(&upstream), None).await.unwrap();

    let report = harness.evaluate().unwrap();
    let score = &report.scores[0];
    assert_eq!(score.quiz_accuracy, 1.0);
    assert_eq!(score.function_precision, 1.0);
    assert_eq!(score.steps, 1);
    assert_eq!(score.evaluation.functions, vec!["add"]);
}

#[tokio::test]
async fn short_answer_list_counts_missing_as_wrong() {
    let upstream = ScriptedUpstream::new([add_call(), done("c2"), answers(&["1782937829", "973912412"])]);
    let harness = Halpert::new(vec![add_sample()]);
    harness.run_sample(0, agent(&upstream), None).await.unwrap();

    let report = harness.evaluate().unwrap();
    assert!((report.scores[0].quiz_accuracy - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(report.scores[0].evaluation.quiz[2].answer, None);
}

#[tokio::test]
async fn evaluate_before_running_is_incomplete() {
    let harness = Halpert::new(vec![add_sample(), add_sample()]);
    let err = harness.evaluate().unwrap_err();
    assert!(matches!(err, HalpertError::IncompleteRun { missing } if missing == vec![0, 1]));
}

/// Calls `add` as many times as the instructions say, then answers nothing.
fn scripted_agent() -> BoxCloneService<AgentTask, AgentRun, BoxError> {
    BoxCloneService::new(tower::service_fn(|mut task: AgentTask| async move {
        let times: usize = task.instructions.parse()?;
        let add = task.functions.get("add").ok_or("add missing")?.clone();
        for _ in 0..times {
            tokio::task::yield_now().await;
            add.call(json!({"a": 1, "b": 1}), &mut task.context).await?;
        }
        Ok::<_, BoxError>(AgentRun {
            transcript: vec![],
            steps: times,
            state: halpert::LoopState::QuizExtracted,
            termination: halpert::LoopState::TerminatedByAgent,
            invoked: vec!["add".into(); times],
            quiz: vec![],
            aux: Default::default(),
        })
    }))
}

fn counted_sample(times: usize) -> Sample {
    let add: Arc<dyn Function> = Arc::new(functions::add());
    Sample::new(
        format!("add {} times", times),
        times.to_string(),
        FunctionSet::new(vec![add]),
        Expected {
            functions: vec!["add".into()],
            quiz: vec![],
        },
    )
    .unwrap()
}

#[tokio::test]
async fn concurrent_samples_keep_their_own_invocations() {
    let harness = Halpert::new(vec![counted_sample(1), counted_sample(3), counted_sample(2)]);
    harness.run_all(scripted_agent(), 3, None).await.unwrap();

    let report = harness.evaluate().unwrap();
    let steps: Vec<usize> = report.scores.iter().map(|s| s.steps).collect();
    assert_eq!(steps, vec![1, 3, 2]);
}

#[derive(Debug, Default)]
struct RecordingBackend {
    restored: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl SnapshotBackend for RecordingBackend {
    async fn restore(&self, checkpoint: &str) -> Result<(), BoxError> {
        if self.fail {
            return Err("backend unreachable".into());
        }
        self.restored.lock().unwrap().push(checkpoint.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn snapshot_is_restored_before_the_run() {
    let backend = Arc::new(RecordingBackend::default());
    let sample = counted_sample(1).with_preparation(Arc::new(SnapshotRestore::new("cal", backend.clone())));
    let harness = Halpert::new(vec![sample, counted_sample(2)]);
    harness.run_all(scripted_agent(), 2, None).await.unwrap();

    assert_eq!(*backend.restored.lock().unwrap(), vec!["cal".to_string()]);
    assert_eq!(harness.evaluate().unwrap().scores[0].steps, 1);
}

#[tokio::test]
async fn failed_restore_aborts_only_that_sample() {
    let backend = Arc::new(RecordingBackend {
        fail: true,
        ..Default::default()
    });
    let sample = counted_sample(1).with_preparation(Arc::new(SnapshotRestore::new("cal", backend)));
    let harness = Halpert::new(vec![sample, counted_sample(2)]);
    harness.run_all(scripted_agent(), 1, None).await.unwrap();

    let report = harness.evaluate().unwrap();
    assert_eq!(report.scores[0].steps, 0);
    assert_eq!(report.scores[0].function_precision, 0.0);
    assert_eq!(report.scores[1].steps, 2);
}

#[tokio::test(start_paused = true)]
async fn run_timeout_records_an_aborted_sample() {
    let slow = tower::service_fn(|_task: AgentTask| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err::<AgentRun, BoxError>("unreachable".into())
    });
    let harness = Halpert::new(vec![add_sample()]);
    harness
        .run_sample(0, slow, Some(Duration::from_secs(1)))
        .await
        .unwrap();

    let report = harness.evaluate().unwrap();
    assert_eq!(report.scores[0].quiz_accuracy, 0.0);
    assert_eq!(report.scores[0].evaluation.quiz.len(), 3);
}

#[tokio::test]
async fn running_a_sample_twice_is_rejected() {
    let harness = Halpert::new(vec![counted_sample(1)]);
    harness.run_sample(0, scripted_agent(), None).await.unwrap();
    let err = harness.run_sample(0, scripted_agent(), None).await.unwrap_err();
    assert!(matches!(err, HalpertError::DuplicateSubmission { index: 0 }));
}
