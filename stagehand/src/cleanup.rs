//! Deferred teardown.
//!
//! Flows register a teardown action right after acquiring each resource
//! (volume, provisioning unit). [`CleanupStack::finish`] runs them in
//! reverse registration order once the flow is over, collects every
//! failure, and folds them into the flow's own result.

use futures::future::BoxFuture;
use stagehand_shared::{StagehandError, StagehandResult, combine};
use std::future::Future;

struct Action {
    name: String,
    run: BoxFuture<'static, StagehandResult<()>>,
}

#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<Action>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. It does not run until [`CleanupStack::run`].
    pub fn push<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Future<Output = StagehandResult<()>> + Send + 'static,
    {
        self.actions.push(Action {
            name: name.into(),
            run: Box::pin(action),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, last registered first. All actions run even when
    /// earlier ones fail.
    pub async fn run(&mut self) -> Vec<StagehandError> {
        let mut failures = Vec::new();
        while let Some(action) = self.actions.pop() {
            match action.run.await {
                Ok(()) => tracing::debug!(action = %action.name, "Cleanup done"),
                Err(e) => {
                    tracing::warn!(action = %action.name, "Cleanup failed: {}", e);
                    failures.push(e);
                }
            }
        }
        failures
    }

    /// Run all actions and combine their failures with `primary`.
    pub async fn finish<T>(mut self, primary: StagehandResult<T>) -> StagehandResult<T> {
        let failures = self.run().await;
        combine(primary, failures)
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            let pending: Vec<&str> = self.actions.iter().map(|a| a.name.as_str()).collect();
            tracing::warn!(?pending, "Cleanup stack dropped with pending actions");
        }
    }
}
