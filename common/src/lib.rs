//! Common types shared across the Gantry workspace.
//!
//! This crate holds the engine-wide error taxonomy and the failure-cause
//! values that travel through the task graph with the data they describe.

pub mod error;

pub use error::{BlobFailure, EngineError, FailureCause, Result};
