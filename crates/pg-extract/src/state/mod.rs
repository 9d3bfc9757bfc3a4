//! File-based checkpoint persistence for resume capability.

use crate::checkpoint::{BatchId, Checkpoint};
use crate::error::{ExtractError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Checkpoint as stored between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the extraction identity in the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Position to resume from.
    pub checkpoint: Checkpoint,

    /// Batch that produced `checkpoint`.
    #[serde(default)]
    pub last_batch_id: Option<BatchId>,

    /// Batches reported so far in this run.
    #[serde(default)]
    pub batches: u64,

    /// Set once every table has been read.
    #[serde(default)]
    pub completed: bool,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over the serialized file (excluding this field) using config_hash as key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl CheckpointFile {
    pub fn new(run_id: String, config_hash: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            config_hash,
            started_at: now,
            updated_at: now,
            checkpoint: Checkpoint::start(),
            last_batch_id: None,
            batches: 0,
            completed: false,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| ExtractError::State(format!("Failed to serialize checkpoint for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| ExtractError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a checkpoint file, verifying its signature when present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: Self = serde_json::from_str(&content)
            .map_err(|e| ExtractError::State(format!("Checkpoint file is not valid: {}", e)))?;

        match &file.hmac {
            Some(stored) => {
                if stored != &file.compute_hmac()? {
                    return Err(ExtractError::State(
                        "Checkpoint file integrity check failed: HMAC mismatch".to_string(),
                    ));
                }
            }
            None => {
                tracing::warn!("Checkpoint file has no HMAC signature, integrity cannot be verified");
            }
        }

        Ok(file)
    }

    /// Save atomically: write a temp file, then rename over the target.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ExtractError::State(format!("Failed to serialize checkpoint: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Refuse to resume against a different extraction configuration.
    pub fn validate_config_hash(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(ExtractError::State(
                "Configuration changed since the checkpoint was written; start a fresh run"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Record a delivered batch.
    pub fn record(&mut self, batch_id: BatchId, checkpoint: &Checkpoint) {
        self.checkpoint = checkpoint.clone();
        self.last_batch_id = Some(batch_id);
        self.batches += 1;
        self.updated_at = Utc::now();
    }

    /// Record that every table has been read.
    pub fn mark_completed(&mut self, checkpoint: &Checkpoint) {
        self.checkpoint = checkpoint.clone();
        self.completed = true;
        self.updated_at = Utc::now();
    }
}
