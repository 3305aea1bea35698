//! Single-stage unit lifecycle.
//!
//! ```text
//! create ─► attach ─► multiplex(start) ─► inspect ─► [before_remove] ─► remove
//!   │                      │ cancelled                                   ▲
//!   │                      └──────────► stop (best effort) ──────────────┤
//!   └── any failure after create ────────────────────────────────────────┘
//! ```
//!
//! Removal runs on every path once the unit exists, so creates and removes
//! always pair up.

use super::{LaunchSpec, StageIo};
use crate::engine::{Engine, ExitResult, SharedEngine, UnitId};
use crate::handoff::StageOutput;
use crate::stream;
use async_trait::async_trait;
use stagehand_shared::constants::provision::STOP_TIMEOUT_SECS;
use stagehand_shared::{StagehandError, StagehandResult, combine};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hook run against a successfully exited unit before it is removed.
#[async_trait]
pub trait BeforeRemove: Send + Sync {
    async fn before_remove(&self, engine: &dyn Engine, unit: &UnitId)
    -> StagehandResult<StageOutput>;
}

/// Outcome of a successful stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub exit: ExitResult,
    /// Set when a [`BeforeRemove`] hook ran.
    pub output: Option<StageOutput>,
}

pub struct StageRunner {
    engine: SharedEngine,
    cancel: CancellationToken,
}

impl StageRunner {
    pub fn new(engine: SharedEngine, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Run one stage to completion.
    ///
    /// Fails with `StageFailed` when the unit exits with anything other than
    /// the launch spec's success code; the hook does not run in that case. Removal
    /// failures are appended to the primary outcome, never substituted.
    pub async fn run(
        &self,
        spec: &LaunchSpec,
        io: StageIo,
        hook: Option<&dyn BeforeRemove>,
    ) -> StagehandResult<StageReport> {
        let unit = self
            .engine
            .create_unit(spec, io.input.is_some())
            .await?;
        tracing::debug!(
            stage = %spec.name_prefix,
            unit_id = %unit.short(),
            image = %spec.image,
            "Unit created"
        );

        let result = self.drive(spec, &unit, io, hook).await;

        if matches!(&result, Err(e) if e.is_cancelled()) {
            let timeout = Duration::from_secs(STOP_TIMEOUT_SECS);
            if let Err(e) = self.engine.stop(&unit, timeout).await {
                tracing::warn!(unit_id = %unit.short(), "Failed to stop cancelled unit: {}", e);
            }
        }

        let mut cleanup = Vec::new();
        match self.engine.remove(&unit).await {
            Ok(()) => tracing::debug!(unit_id = %unit.short(), "Unit removed"),
            Err(e) => {
                tracing::warn!(unit_id = %unit.short(), "Failed to remove unit: {}", e);
                cleanup.push(e);
            }
        }

        combine(result, cleanup)
    }

    async fn drive(
        &self,
        spec: &LaunchSpec,
        unit: &UnitId,
        io: StageIo,
        hook: Option<&dyn BeforeRemove>,
    ) -> StagehandResult<StageReport> {
        let StageIo {
            input,
            stdout,
            stderr,
        } = io;

        let transport = self.engine.attach(unit, input.is_some()).await?;
        stream::multiplex(
            transport,
            input,
            stdout,
            stderr,
            || self.engine.start(unit),
            &self.cancel,
        )
        .await?;

        let exit = self.engine.inspect(unit).await?;
        if exit.running {
            return Err(StagehandError::Internal(format!(
                "{} unit {} still running after its output closed",
                spec.name_prefix,
                unit.short()
            )));
        }
        if exit.exit_code != spec.success_exit_code {
            return Err(StagehandError::StageFailed {
                stage: spec.name_prefix.clone(),
                code: exit.exit_code,
            });
        }

        let output = match hook {
            Some(hook) => Some(hook.before_remove(self.engine.as_ref(), unit).await?),
            None => None,
        };

        Ok(StageReport { exit, output })
    }
}
