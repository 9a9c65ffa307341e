//! Server-side flow request shapes. The flow engine builds these; the
//! query executor turns them into per-layer path counts.

use serde::{Deserialize, Serialize};

use crate::filter::FilterNode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutputMode {
    #[default]
    Sankey,
    Sunburst,
}

/// Execution hint for how the semantic layer should walk event sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    #[default]
    Auto,
    Lateral,
    Window,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStartingStep {
    pub name: String,
    #[serde(default)]
    pub filters: Vec<FilterNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFlowQuery {
    pub cube: String,
    pub binding_key: String,
    pub time_dimension: String,
    pub event_dimension: String,
    pub starting_step: FlowStartingStep,
    pub steps_before: u32,
    pub steps_after: u32,
    pub output_mode: FlowOutputMode,
    pub join_strategy: JoinStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_filters: Vec<FilterNode>,
}

impl ServerFlowQuery {
    /// Every layer the query covers, from the furthest "before" step to the
    /// furthest "after" step.
    pub fn layers(&self) -> Vec<i32> {
        let before = -(self.steps_before as i32);
        let after = self.steps_after as i32;
        (before..=after).collect()
    }
}

/// One layer of a flow query. Layer 0 returns `{count}`; any other layer
/// returns `{path, count}` rows where `path` lists event values from the
/// anchor outward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLayerRequest {
    pub flow: ServerFlowQuery,
    pub layer: i32,
}
