//! stagehand: container-staged release, deploy and destroy pipelines.
//!
//! Each pipeline stage runs in a short-lived container ("unit") against a
//! Docker-compatible engine. Stages exchange state through a shared volume
//! mounted at `/build`, never through process memory.
//!
//! ```text
//! flow ──► pipeline executor ──► stage runner ──► engine + stream multiplexer
//!   │                                  │
//!   └── cleanup stack                  └── handoff (tar in / out of units)
//! ```

pub mod cleanup;
pub mod engine;
pub mod flow;
pub mod handoff;
pub mod logging;
pub mod pipeline;
pub mod stage;
pub mod stream;

pub use engine::{DockerEngine, Engine, SharedEngine};
pub use flow::{GlobalState, Manifest};
pub use stagehand_shared::{StagehandError, StagehandResult};
