//! # halpert
//!
//! Evaluate tool-using LLM agents against reproducible samples.
//!
//! A sample is a task, the functions an agent may call, and the expected
//! outcome: which functions should be used and a quiz of questions the agent
//! should be able to answer afterwards. The harness runs an agent loop per
//! sample, observes which functions it actually invoked, asks the quiz and
//! scores both.
//!
//! ## Core Concepts
//!
//! - **Gateway**: every model call goes through a content-addressed response
//!   cache, so repeated evaluations replay byte-identical responses for free
//! - **Functions**: schema-typed capabilities, resolved by slug
//! - **Tracking**: a per-sample decorator records each invocation
//! - **Agent loop**: a Tower service driving one task until the model calls `done`
//! - **Harness**: prepares samples, collects quiz outcomes and scores them
//!
//! ## Getting Started
//!
//! Set your OpenAI API key in the `OPENAI_API_KEY` environment variable.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use halpert::{functions, AgentLoop, Client, FsCache, Halpert, HalpertConfig, SharedGateway};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = HalpertConfig::from_env();
//! let cache = FsCache::new(&config.cache_dir)?;
//! let gateway = SharedGateway::openai(Client::new(), Arc::new(cache), config.sampling());
//!
//! let harness = Halpert::new(functions::samples(&gateway, &config.model)?);
//! let agent = AgentLoop::new(gateway, &config.model);
//! harness.run_all(agent, config.concurrency, config.run_timeout).await?;
//!
//! println!("{}", harness.evaluate()?);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod function;
pub mod functions;
pub mod gateway;
pub mod harness;
pub mod observability;
pub mod sample;
pub mod snapshot;
pub mod tracking;

pub use agent::{
    AgentLoop, AgentRun, AgentTask, ArgumentErrorPolicy, LoopState, RunAux, StopReason,
};
pub use cache::{CacheError, CacheStore, Fingerprint, FsCache, InMemoryCache};
pub use config::HalpertConfig;
pub use error::{HalpertError, Result};
pub use function::{
    function_typed, slugify, Clock, FixedClock, Function, FunctionError, FunctionSet, RawFunction,
    RunContext, SystemClock, TypedFunction,
};
pub use gateway::{
    CacheLayer, CachedGateway, CompletionRequest, OpenAIUpstream, Sampling, ScriptedUpstream,
    SharedGateway,
};
pub use harness::{Halpert, PreparedSample, Report, SampleScore};
pub use observability::TracingLayer;
pub use sample::{Evaluation, Expected, QuizAnswer, QuizItem, Sample};
pub use snapshot::{CommandSnapshotBackend, Preparation, SnapshotBackend, SnapshotRestore};
pub use tracking::{InvocationLog, Tracked};

// Re-export async-openai types that users need
pub use async_openai::{config::OpenAIConfig, Client};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
