//! Backend preparation
//!
//! Some samples run against an external stateful backend (an ERP database, a
//! mail server) that must be reset to a named checkpoint before the agent
//! starts. The harness only knows about `Preparation`; how a backend is reset
//! lives behind `SnapshotBackend`.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tower::BoxError;
use tracing::{debug, info};

/// Work to run before a sample's functions are handed out. Failure is fatal
/// to the sample.
#[async_trait]
pub trait Preparation: Send + Sync + Debug {
    async fn prepare(&self) -> Result<(), BoxError>;
}

/// Named-checkpoint restore. Returns once the backend is in exactly that state.
#[async_trait]
pub trait SnapshotBackend: Send + Sync + Debug {
    async fn restore(&self, checkpoint: &str) -> Result<(), BoxError>;
}

/// Preparation that restores one checkpoint on one backend.
#[derive(Debug, Clone)]
pub struct SnapshotRestore {
    checkpoint: String,
    backend: Arc<dyn SnapshotBackend>,
}

impl SnapshotRestore {
    pub fn new(checkpoint: impl Into<String>, backend: Arc<dyn SnapshotBackend>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            backend,
        }
    }

    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }
}

#[async_trait]
impl Preparation for SnapshotRestore {
    async fn prepare(&self) -> Result<(), BoxError> {
        info!(checkpoint = %self.checkpoint, "restoring snapshot");
        self.backend.restore(&self.checkpoint).await
    }
}

/// Backend reset by an external command, e.g. a database restore script.
///
/// Every `{checkpoint}` in the arguments is replaced with the checkpoint name.
#[derive(Debug, Clone)]
pub struct CommandSnapshotBackend {
    program: String,
    args: Vec<String>,
}

impl CommandSnapshotBackend {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn args_for(&self, checkpoint: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{checkpoint}", checkpoint))
            .collect()
    }
}

#[async_trait]
impl SnapshotBackend for CommandSnapshotBackend {
    async fn restore(&self, checkpoint: &str) -> Result<(), BoxError> {
        let args = self.args_for(checkpoint);
        debug!(program = %self.program, ?args, "running restore command");
        let output = Command::new(&self.program).args(&args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "restore of {} exited with {}: {}",
                checkpoint,
                output.status,
                stderr.trim()
            )
            .into());
        }
        Ok(())
    }
}
