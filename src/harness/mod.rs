//! Evaluation harness
//!
//! `Halpert` owns the ordered sample list. For each sample it prepares a
//! fresh, tracked copy of the sample's functions (resetting any backend
//! first), hands them to the agent, records the quiz outcome and finally
//! scores every sample.
//!
//! Scoring
//! - quiz accuracy: position-aligned exact matches / expected questions
//! - function precision: |invoked ∩ expected| / |expected|
//! - steps: total function invocations, duplicates included

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tower::{BoxError, Service, ServiceExt};
use tracing::{error, info, info_span, warn, Instrument};

use crate::agent::{dedup, AgentRun, AgentTask};
use crate::error::{HalpertError, Result};
use crate::function::{FunctionSet, RunContext};
use crate::sample::{Evaluation, QuizAnswer, QuizItem, Sample};
use crate::tracking::{track_all, InvocationLog};

/// A sample ready to run: tracked functions and a fresh run context.
#[derive(Debug)]
pub struct PreparedSample {
    pub index: usize,
    pub functions: FunctionSet,
    pub context: RunContext,
}

/// Scores for one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleScore {
    pub index: usize,
    pub name: String,
    pub quiz_accuracy: f64,
    pub function_precision: f64,
    pub steps: usize,
    pub evaluation: Evaluation,
}

/// Per-sample scores in sample order. Informational; no pass/fail threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub scores: Vec<SampleScore>,
}

impl Report {
    pub fn mean_quiz_accuracy(&self) -> f64 {
        mean(self.scores.iter().map(|s| s.quiz_accuracy))
    }

    pub fn mean_function_precision(&self) -> f64 {
        mean(self.scores.iter().map(|s| s.function_precision))
    }
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    values.sum::<f64>() / n as f64
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>3}  {:<32} {:>6} {:>9} {:>5}",
            "#", "sample", "quiz", "functions", "steps"
        )?;
        for s in &self.scores {
            writeln!(
                f,
                "{:>3}  {:<32} {:>6.2} {:>9.2} {:>5}",
                s.index,
                truncate(&s.name, 32),
                s.quiz_accuracy,
                s.function_precision,
                s.steps
            )?;
        }
        write!(
            f,
            "{:>3}  {:<32} {:>6.2} {:>9.2}",
            "",
            "mean",
            self.mean_quiz_accuracy(),
            self.mean_function_precision()
        )
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        s.chars().take(width - 1).chain(std::iter::once('…')).collect()
    }
}

/// Fraction of expected answers matched exactly at the same position.
pub fn quiz_accuracy(expected: &[QuizItem], actual: &[QuizAnswer]) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let correct = expected
        .iter()
        .enumerate()
        .filter(|(i, item)| {
            actual
                .get(*i)
                .and_then(|a| a.answer.as_deref())
                .is_some_and(|a| a == item.answer)
        })
        .count();
    correct as f64 / expected.len() as f64
}

/// Fraction of expected functions that were invoked at least once.
pub fn function_precision(expected: &[String], invoked: &[String]) -> f64 {
    let expected: HashSet<&str> = expected.iter().map(String::as_str).collect();
    if expected.is_empty() {
        return 1.0;
    }
    let invoked: HashSet<&str> = invoked.iter().map(String::as_str).collect();
    expected.intersection(&invoked).count() as f64 / expected.len() as f64
}

/// The evaluation harness.
#[derive(Debug)]
pub struct Halpert {
    samples: Vec<Sample>,
    log: InvocationLog,
    submissions: Mutex<HashMap<usize, Vec<QuizAnswer>>>,
}

impl Halpert {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            log: InvocationLog::new(),
            submissions: Mutex::new(HashMap::new()),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample(&self, index: usize) -> Result<&Sample> {
        self.samples
            .get(index)
            .ok_or(HalpertError::SampleOutOfRange { index })
    }

    /// Reset the sample's backend if it has one, then hand out freshly tracked
    /// functions and a context whose clock follows the sample's reference date.
    ///
    /// Preparing a sample again starts a new invocation record. A sample
    /// whose quiz was already submitted cannot be prepared again.
    pub async fn prepare(&self, index: usize) -> Result<PreparedSample> {
        let sample = self.sample(index)?;
        if self.is_submitted(index) {
            return Err(HalpertError::DuplicateSubmission { index });
        }
        if let Some(prep) = &sample.preparation {
            prep.prepare()
                .await
                .map_err(|source| HalpertError::Preparation {
                    sample: sample.name.clone(),
                    source,
                })?;
        }
        self.log.open(index);
        Ok(PreparedSample {
            index,
            functions: track_all(&sample.functions, index, &self.log),
            context: RunContext::for_date(sample.date),
        })
    }

    /// Record the quiz outcome for a sample. At most once per sample.
    pub fn submit(&self, index: usize, quiz: Vec<QuizAnswer>) -> Result<()> {
        self.sample(index)?;
        let mut subs = self.lock_submissions();
        if subs.contains_key(&index) {
            return Err(HalpertError::DuplicateSubmission { index });
        }
        subs.insert(index, quiz);
        Ok(())
    }

    pub fn is_submitted(&self, index: usize) -> bool {
        self.lock_submissions().contains_key(&index)
    }

    /// Invocations recorded for a sample so far.
    pub fn invocations(&self, index: usize) -> Option<Vec<String>> {
        self.log.get(index)
    }

    /// Score every sample. Fails unless each one was prepared and submitted.
    pub fn evaluate(&self) -> Result<Report> {
        let subs = self.lock_submissions();
        let missing: Vec<usize> = (0..self.samples.len())
            .filter(|i| !self.log.has(*i) || !subs.contains_key(i))
            .collect();
        if !missing.is_empty() {
            return Err(HalpertError::IncompleteRun { missing });
        }

        let scores = self
            .samples
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                let invoked = self.log.get(index).unwrap_or_default();
                let quiz = subs.get(&index).cloned().unwrap_or_default();
                let score = SampleScore {
                    index,
                    name: sample.name.clone(),
                    quiz_accuracy: quiz_accuracy(&sample.expected.quiz, &quiz),
                    function_precision: function_precision(&sample.expected.functions, &invoked),
                    steps: invoked.len(),
                    evaluation: Evaluation {
                        functions: dedup(&invoked),
                        quiz,
                    },
                };
                info!(
                    sample = %score.name,
                    quiz = score.quiz_accuracy,
                    functions = score.function_precision,
                    steps = score.steps,
                    "sample scored"
                );
                score
            })
            .collect();
        Ok(Report { scores })
    }

    /// Prepare, run and submit one sample.
    ///
    /// A failed run is submitted with whatever invocations were recorded and
    /// no answers; only harness misuse is returned as an error.
    pub async fn run_sample<S>(&self, index: usize, agent: S, timeout: Option<Duration>) -> Result<()>
    where
        S: Service<AgentTask, Response = AgentRun, Error = BoxError> + Send,
        S::Future: Send,
    {
        let sample = self.sample(index)?;
        if self.is_submitted(index) {
            return Err(HalpertError::DuplicateSubmission { index });
        }
        let span = info_span!("sample", index, name = %sample.name);
        let outcome = self.run_agent(index, sample, agent, timeout).instrument(span).await;

        let quiz = match outcome {
            Ok(run) => {
                info!(index, steps = run.steps, termination = ?run.termination, "sample finished");
                run.quiz
            }
            Err(e) => {
                error!(index, error = %e, "sample aborted");
                if !self.log.has(index) {
                    self.log.open(index);
                }
                sample
                    .questions()
                    .into_iter()
                    .map(|question| QuizAnswer {
                        question,
                        answer: None,
                    })
                    .collect()
            }
        };
        self.submit(index, quiz)
    }

    async fn run_agent<S>(
        &self,
        index: usize,
        sample: &Sample,
        agent: S,
        timeout: Option<Duration>,
    ) -> Result<AgentRun>
    where
        S: Service<AgentTask, Response = AgentRun, Error = BoxError> + Send,
        S::Future: Send,
    {
        info!("running sample");
        let prepared = self.prepare(index).await?;
        let task = AgentTask {
            instructions: sample.instructions.clone(),
            functions: prepared.functions,
            questions: sample.questions(),
            context: prepared.context,
        };
        let run = agent.oneshot(task);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| HalpertError::Timeout)?,
            None => run.await,
        };
        result.map_err(HalpertError::from_boxed)
    }

    /// Run every sample and submit its outcome.
    ///
    /// Samples without a backend preparation run up to `concurrency` at a
    /// time. Samples with one share external state, so they run one after
    /// another.
    pub async fn run_all<S>(&self, agent: S, concurrency: usize, timeout: Option<Duration>) -> Result<()>
    where
        S: Service<AgentTask, Response = AgentRun, Error = BoxError> + Clone + Send,
        S::Future: Send,
    {
        let (stateful, stateless): (Vec<usize>, Vec<usize>) =
            (0..self.samples.len()).partition(|&i| self.samples[i].needs_preparation());

        futures::stream::iter(stateless)
            .map(|index| self.run_sample(index, agent.clone(), timeout))
            .buffer_unordered(concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        for index in stateful {
            self.run_sample(index, agent.clone(), timeout).await?;
        }
        Ok(())
    }

    fn lock_submissions(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Vec<QuizAnswer>>> {
        self.submissions.lock().unwrap_or_else(|e| {
            warn!("submission lock poisoned");
            e.into_inner()
        })
    }
}
