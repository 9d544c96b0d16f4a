//! Configuration for evaluation runs
//!
//! Defaults reproduce the reference setup; environment variables and TOML
//! files override them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::ArgumentErrorPolicy;
use crate::gateway::Sampling;

/// Evaluation run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalpertConfig {
    /// Model used by the agent and by persona functions
    pub model: String,

    /// Root of the response cache
    pub cache_dir: PathBuf,

    /// Sampling seed sent with every upstream request
    pub seed: i64,

    /// Sampling temperature sent with every upstream request
    pub temperature: f32,

    /// Completion steps allowed before the loop is cut off; `None` is unbounded
    pub max_steps: Option<usize>,

    /// Handling of arguments a function rejects
    pub argument_errors: ArgumentErrorPolicy,

    /// Samples without a backend preparation run this many at a time
    pub concurrency: usize,

    /// Deadline for one full agent run
    pub run_timeout: Option<Duration>,
}

impl Default for HalpertConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4-1106-preview".to_string(),
            cache_dir: default_cache_dir(),
            seed: 42,
            temperature: 0.0,
            max_steps: None,
            argument_errors: ArgumentErrorPolicy::Terminate,
            concurrency: 1,
            run_timeout: None,
        }
    }
}

/// `~/.cache/halpert/openai`, or a relative `.cache/halpert/openai` without a home directory.
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".cache")
        .join("halpert")
        .join("openai")
}

impl HalpertConfig {
    pub fn sampling(&self) -> Sampling {
        Sampling {
            temperature: self.temperature,
            seed: self.seed,
        }
    }

    /// Defaults with `HALPERT_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load from a TOML file; missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let contents = std::fs::read_to_string(path)?;
        let config: HalpertConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Defaults, or the TOML file at `path`, with `HALPERT_*` environment
    /// overrides applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with(
        path: Option<&Path>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_overrides(var))
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model) = var("HALPERT_MODEL") {
            self.model = model;
        }
        if let Some(dir) = var("HALPERT_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(steps) = var("HALPERT_MAX_STEPS") {
            match steps.parse::<usize>() {
                Ok(n) => self.max_steps = Some(n),
                Err(_) => warn!(value = %steps, "ignoring invalid HALPERT_MAX_STEPS"),
            }
        }
        if let Some(n) = var("HALPERT_CONCURRENCY") {
            match n.parse::<usize>() {
                Ok(n) if n > 0 => self.concurrency = n,
                _ => warn!(value = %n, "ignoring invalid HALPERT_CONCURRENCY"),
            }
        }
        self
    }
}
