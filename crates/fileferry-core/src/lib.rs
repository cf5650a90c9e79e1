//! Core types for fileferry.
//!
//! This crate provides the data model shared by the transfer engine and its
//! front ends: requests, planned steps, error types and configuration.

mod config;
mod error;
mod plan;
mod request;

pub use config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_RETAINED_OUTCOMES,
    DEFAULT_PROGRESS_INTERVAL_MS, TransferConfig, TransferConfigBuilder,
};
pub use error::{FailureKind, PlanError, RecursionError, StepFailure, TransferError};
pub use plan::{SessionId, StepKind, TransferPlan, TransferStep};
pub use request::{DeleteMode, TransferKind, TransferRequest};
