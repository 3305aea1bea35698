//! Accumulated state of a running pipeline.

use crate::handoff::{Metadata, StageOutput};
use std::collections::BTreeMap;

/// Environment and metadata merged from completed stages.
///
/// Keys are only added or overridden, never removed; a later merge wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    pub env: BTreeMap<String, String>,
    pub metadata: Metadata,
}

impl PipelineState {
    pub fn merge_env(&mut self, env: &BTreeMap<String, String>) {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn merge(&mut self, output: &StageOutput) {
        self.merge_env(&output.env);
        self.metadata.extend(
            output
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}
