//! Transfer engine configuration.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Default size of a single read/write chunk during file copies (512 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default minimum delay between two in-file progress events.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;

/// Default capacity of the event stream.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Default number of finished-but-unacknowledged sessions kept around.
pub const DEFAULT_MAX_RETAINED_OUTCOMES: usize = 64;

/// Configuration for the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct TransferConfig {
    /// Bytes read and written per chunk when copying file content.
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum milliseconds between progress events emitted inside a single file copy.
    #[builder(default = "DEFAULT_PROGRESS_INTERVAL_MS")]
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Capacity of the broadcast event stream.
    #[builder(default = "DEFAULT_EVENT_CAPACITY")]
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Maximum number of terminal sessions retained until acknowledged.
    #[builder(default = "DEFAULT_MAX_RETAINED_OUTCOMES")]
    #[serde(default = "default_max_retained_outcomes")]
    pub max_retained_outcomes: usize,

    /// Copy permission bits and modification time onto written files.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub preserve_metadata: bool,

    /// Never attempt a rename for moves; always copy, verify, then remove.
    #[builder(default = "false")]
    #[serde(default)]
    pub force_copy_on_move: bool,

    /// Stop the session at the first failed step instead of continuing.
    #[builder(default = "false")]
    #[serde(default)]
    pub stop_on_error: bool,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_max_retained_outcomes() -> usize {
    DEFAULT_MAX_RETAINED_OUTCOMES
}

fn default_true() -> bool {
    true
}

impl TransferConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.chunk_size == Some(0) {
            return Err("Chunk size must be greater than zero".to_string());
        }
        if self.event_capacity == Some(0) {
            return Err("Event capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl TransferConfig {
    /// Create a new config builder.
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// Minimum delay between in-file progress events.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_retained_outcomes: DEFAULT_MAX_RETAINED_OUTCOMES,
            preserve_metadata: true,
            force_copy_on_move: false,
            stop_on_error: false,
        }
    }
}
