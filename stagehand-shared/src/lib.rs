//! Types shared between the stagehand runtime and its binary.
//!
//! Holds the error taxonomy and the fixed paths/names that units and the
//! orchestrator agree on.

pub mod constants;
pub mod errors;

pub use errors::{StagehandError, StagehandResult, combine};
