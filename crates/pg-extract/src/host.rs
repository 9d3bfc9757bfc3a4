//! The engine's view of whoever is running it.
//!
//! The engine reports status and hands over checkpoints through
//! [`ExtractionHost`]; it never writes files or prints on its own.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::checkpoint::{BatchId, Checkpoint};
use crate::error::{ExtractError, Result};
use crate::state::CheckpointFile;

/// Logging, progress and checkpoint callbacks used by the engine.
#[async_trait]
pub trait ExtractionHost: Send + Sync {
    /// Human-readable status line.
    fn log(&self, message: &str);

    /// Progress notification. Purely observational.
    fn report_progress(&self, current: Option<usize>, total: Option<usize>, message: &str);

    /// Persist the position reached after batch `batch_id`.
    ///
    /// Called once per non-empty batch. Repeating a call with the same
    /// arguments must be harmless.
    async fn persist_checkpoint(&self, batch_id: BatchId, checkpoint: &Checkpoint) -> Result<()>;
}

/// Host that logs through `tracing` and optionally keeps a checkpoint file.
pub struct TracingHost {
    progress_json: bool,
    state: Option<(PathBuf, Mutex<CheckpointFile>)>,
}

impl TracingHost {
    pub fn new() -> Self {
        Self {
            progress_json: false,
            state: None,
        }
    }

    /// Also write progress updates as JSON lines to stderr.
    pub fn with_progress_json(mut self, enabled: bool) -> Self {
        self.progress_json = enabled;
        self
    }

    /// Persist checkpoints to `path`, starting from `file`.
    pub fn with_checkpoint_file(mut self, path: impl Into<PathBuf>, file: CheckpointFile) -> Self {
        self.state = Some((path.into(), Mutex::new(file)));
        self
    }

    /// Mark the checkpoint file completed, if one is configured.
    pub fn finish(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.with_file(|file| file.mark_completed(checkpoint))
    }

    fn with_file(&self, update: impl FnOnce(&mut CheckpointFile)) -> Result<()> {
        let Some((path, file)) = &self.state else {
            return Ok(());
        };
        let mut file = file
            .lock()
            .map_err(|_| ExtractError::State("Checkpoint file lock poisoned".to_string()))?;
        update(&mut file);
        file.save(path)
    }
}

impl Default for TracingHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionHost for TracingHost {
    fn log(&self, message: &str) {
        info!("{}", message);
    }

    fn report_progress(&self, current: Option<usize>, total: Option<usize>, message: &str) {
        match (current, total) {
            (Some(current), Some(total)) => info!("{} ({}/{})", message, current, total),
            _ => info!("{}", message),
        }

        if self.progress_json {
            let line = serde_json::json!({
                "type": "progress",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "current": current,
                "total": total,
                "message": message,
            });
            eprintln!("{}", line);
        }
    }

    async fn persist_checkpoint(&self, batch_id: BatchId, checkpoint: &Checkpoint) -> Result<()> {
        self.with_file(|file| file.record(batch_id, checkpoint))
    }
}
