//! Commands executed inside an already running unit.

use super::LaunchSpec;
use crate::engine::{Engine, ExecSpec, SharedEngine, UnitId};
use crate::handoff;
use crate::stream::{self, Sink};
use bytes::Bytes;
use stagehand_shared::constants::DEFAULT_SUCCESS_EXIT_CODE;
use stagehand_shared::constants::provision::STOP_TIMEOUT_SECS;
use stagehand_shared::{StagehandError, StagehandResult, combine};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `spec` inside `unit`, streaming its output, and fail unless it exits
/// successfully.
pub async fn exec_in_unit(
    engine: &dyn Engine,
    unit: &UnitId,
    spec: &ExecSpec,
    stdout: Sink,
    stderr: Sink,
    cancel: &CancellationToken,
) -> StagehandResult<()> {
    let exec = engine.create_exec(unit, spec).await?;
    // Starting an exec session attaches in the same call.
    let transport = engine.start_exec(&exec).await?;
    stream::multiplex(transport, None, stdout, stderr, || async { Ok(()) }, cancel).await?;

    let exit = engine.inspect_exec(&exec).await?;
    let name = describe(&spec.command);
    if exit.running {
        return Err(StagehandError::Internal(format!(
            "{} still running after its output closed",
            name
        )));
    }
    if exit.exit_code != DEFAULT_SUCCESS_EXIT_CODE {
        return Err(StagehandError::StageFailed {
            stage: name,
            code: exit.exit_code,
        });
    }
    Ok(())
}

/// Leading words of a command, enough to name it in an error.
fn describe(command: &[String]) -> String {
    command.iter().take(2).cloned().collect::<Vec<_>>().join(" ")
}

/// A started unit that stays alive across several exec sessions.
///
/// Call [`ProvisionUnit::done`] exactly once to stop and remove it.
#[derive(Clone)]
pub struct ProvisionUnit {
    engine: SharedEngine,
    id: UnitId,
    cancel: CancellationToken,
}

impl ProvisionUnit {
    /// Create and start the unit. If starting fails the unit is removed
    /// before returning.
    pub async fn start(
        engine: SharedEngine,
        spec: &LaunchSpec,
        cancel: CancellationToken,
    ) -> StagehandResult<Self> {
        let id = engine.create_unit(spec, false).await?;
        tracing::debug!(unit_id = %id.short(), image = %spec.image, "Provisioning unit created");

        if let Err(e) = engine.start(&id).await {
            let cleanup = engine.remove(&id).await.err().into_iter().collect();
            return combine(Err(e), cleanup);
        }

        Ok(Self { engine, id, cancel })
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub async fn exec(&self, spec: &ExecSpec, stdout: Sink, stderr: Sink) -> StagehandResult<()> {
        tracing::debug!(unit_id = %self.id.short(), command = ?spec.command, "Exec");
        exec_in_unit(
            self.engine.as_ref(),
            &self.id,
            spec,
            stdout,
            stderr,
            &self.cancel,
        )
        .await
    }

    /// Write one file into `dir` inside the unit.
    pub async fn copy_file(&self, dir: &str, name: &str, contents: &[u8]) -> StagehandResult<()> {
        let archive = handoff::single_file_archive(name, contents)?;
        self.copy_archive(dir, archive).await
    }

    /// Extract a tar archive into `dir` inside the unit.
    pub async fn copy_archive(&self, dir: &str, archive: Bytes) -> StagehandResult<()> {
        self.engine.copy_to(&self.id, dir, archive).await
    }

    /// Stop then remove the unit.
    ///
    /// A failed stop is only logged since removal is forced; a failed
    /// removal is returned.
    pub async fn done(&self) -> StagehandResult<()> {
        let timeout = Duration::from_secs(STOP_TIMEOUT_SECS);
        if let Err(e) = self.engine.stop(&self.id, timeout).await {
            tracing::warn!(unit_id = %self.id.short(), "Failed to stop provisioning unit: {}", e);
        }
        self.engine.remove(&self.id).await?;
        tracing::debug!(unit_id = %self.id.short(), "Provisioning unit removed");
        Ok(())
    }
}
