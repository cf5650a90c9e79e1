//! Trash integration.

use std::path::Path;

use thiserror::Error;

/// Error reported by a trash service.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TrashError {
    /// A human-readable error message.
    pub message: String,
}

impl TrashError {
    /// Create a new trash error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Something that can move paths to a trash can.
pub trait TrashService: Send + Sync {
    /// Move `path` (file or whole directory) to the trash.
    fn move_to_trash(&self, path: &Path) -> Result<(), TrashError>;
}

/// The desktop trash, via the `trash` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTrash;

impl TrashService for SystemTrash {
    fn move_to_trash(&self, path: &Path) -> Result<(), TrashError> {
        trash::delete(path).map_err(|e| TrashError::new(e.to_string()))
    }
}
