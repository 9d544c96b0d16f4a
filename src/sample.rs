//! Samples and outcomes
//!
//! A `Sample` is one evaluable task: instructions, the functions the agent
//! may use, an optional reference date and the `Expected` outcome. Identity
//! is the sample's position in the harness, not its content.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{HalpertError, Result};
use crate::function::FunctionSet;
use crate::snapshot::Preparation;

/// One quiz question with its expected answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizItem {
    pub question: String,
    pub answer: String,
}

impl QuizItem {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// One quiz question with the agent's answer, if it gave one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizAnswer {
    pub question: String,
    pub answer: Option<String>,
}

/// What a correct run looks like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expected {
    /// Slugs the agent should invoke
    pub functions: Vec<String>,
    pub quiz: Vec<QuizItem>,
}

/// What a run actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Invoked slugs, deduplicated in first-call order
    pub functions: Vec<String>,
    /// Index-aligned with `Expected::quiz`
    pub quiz: Vec<QuizAnswer>,
}

/// Reference date used when a sample does not name one.
pub fn default_reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 11, 26).expect("valid calendar date")
}

#[derive(Clone)]
pub struct Sample {
    pub name: String,
    pub instructions: String,
    /// Frozen "today" for the run; `None` uses the system clock
    pub date: Option<NaiveDate>,
    pub functions: FunctionSet,
    pub expected: Expected,
    pub preparation: Option<Arc<dyn Preparation>>,
}

impl Sample {
    /// Build a sample. Every expected slug must name one of `functions`.
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        functions: FunctionSet,
        expected: Expected,
    ) -> Result<Self> {
        let name = name.into();
        let unknown: Vec<&str> = expected
            .functions
            .iter()
            .filter(|slug| !functions.contains(slug))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(HalpertError::InvalidSample {
                sample: name,
                message: format!("expected functions not provided: {}", unknown.join(", ")),
            });
        }
        Ok(Self {
            name,
            instructions: instructions.into(),
            date: Some(default_reference_date()),
            functions,
            expected,
            preparation: None,
        })
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// Run against the wall clock instead of a reference date.
    pub fn with_system_clock(mut self) -> Self {
        self.date = None;
        self
    }

    pub fn with_preparation(mut self, preparation: Arc<dyn Preparation>) -> Self {
        self.preparation = Some(preparation);
        self
    }

    pub fn questions(&self) -> Vec<String> {
        self.expected.quiz.iter().map(|q| q.question.clone()).collect()
    }

    /// Whether the sample touches a shared stateful backend.
    pub fn needs_preparation(&self) -> bool {
        self.preparation.is_some()
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("name", &self.name)
            .field("date", &self.date)
            .field("functions", &self.functions)
            .field("expected", &self.expected)
            .field("preparation", &self.preparation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Function, RawFunction};
    use serde_json::json;
    use tower::BoxError;

    fn functions() -> FunctionSet {
        FunctionSet::new(vec![Arc::new(RawFunction::new(
            "Add",
            "Add two numbers",
            json!({"type": "object"}),
            json!({"type": "object"}),
            |_| async move { Ok::<_, BoxError>(json!({})) },
        )) as Arc<dyn Function>])
    }

    #[test]
    fn expected_functions_must_be_available() {
        let err = Sample::new(
            "bad",
            "do it",
            functions(),
            Expected {
                functions: vec!["add".into(), "subtract".into()],
                quiz: vec![],
            },
        )
        .unwrap_err();
        assert!(matches!(err, HalpertError::InvalidSample { message, .. } if message.contains("subtract")));
    }

    #[test]
    fn questions_follow_quiz_order() {
        let sample = Sample::new(
            "ok",
            "do it",
            functions(),
            Expected {
                functions: vec!["add".into()],
                quiz: vec![QuizItem::new("first?", "1"), QuizItem::new("second?", "2")],
            },
        )
        .unwrap();
        assert_eq!(sample.questions(), vec!["first?", "second?"]);
        assert!(!sample.needs_preparation());
        assert_eq!(sample.date, Some(default_reference_date()));
        assert_eq!(sample.with_system_clock().date, None);
    }
}
