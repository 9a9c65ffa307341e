//! Flow analysis — event paths before and after an anchor event.
//!
//! Layer requests have no data dependency on each other, so they are issued
//! concurrently. The graph is only assembled once every layer has answered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use drilldown_core::config::{FlowConfigDefaults, FLOW_MAX_DEPTH, FLOW_MIN_DEPTH};
use drilldown_core::error::{DrilldownError, DrilldownResult, ValidationError};
use drilldown_core::executor::QueryExecutor;
use drilldown_core::filter::FilterNode;
use drilldown_core::flow_query::{
    FlowLayerRequest, FlowOutputMode, FlowStartingStep, JoinStrategy, ServerFlowQuery,
};
use drilldown_core::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::binding::value_key;

/// Editable flow configuration as held by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    #[serde(default)]
    pub cube: Option<String>,
    #[serde(default)]
    pub binding_key: Option<String>,
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default)]
    pub event_dimension: Option<String>,
    pub starting_step: FlowStartingStep,
    #[serde(default)]
    pub steps_before: u32,
    #[serde(default = "default_steps_after")]
    pub steps_after: u32,
    #[serde(default)]
    pub output_mode: FlowOutputMode,
    #[serde(default)]
    pub join_strategy: JoinStrategy,
    #[serde(default)]
    pub event_filters: Vec<FilterNode>,
}

fn default_steps_after() -> u32 {
    FlowConfigDefaults::default().steps_after
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::from_defaults(&FlowConfigDefaults::default())
    }
}

/// Clamps a requested depth into `FLOW_MIN_DEPTH..=FLOW_MAX_DEPTH`.
pub fn clamp_depth(requested: i64) -> u32 {
    requested.clamp(FLOW_MIN_DEPTH as i64, FLOW_MAX_DEPTH as i64) as u32
}

impl FlowConfig {
    pub fn from_defaults(defaults: &FlowConfigDefaults) -> Self {
        Self {
            cube: None,
            binding_key: None,
            time_dimension: None,
            event_dimension: None,
            starting_step: FlowStartingStep {
                name: String::new(),
                filters: Vec::new(),
            },
            steps_before: clamp_depth(defaults.steps_before as i64),
            steps_after: clamp_depth(defaults.steps_after as i64),
            output_mode: FlowOutputMode::default(),
            join_strategy: JoinStrategy::default(),
            event_filters: Vec::new(),
        }
    }

    pub fn set_steps_before(&mut self, requested: i64) -> u32 {
        self.steps_before = clamp_depth(requested);
        self.steps_before
    }

    pub fn set_steps_after(&mut self, requested: i64) -> u32 {
        self.steps_after = clamp_depth(requested);
        self.steps_after
    }

    /// The stored `steps_before` survives a switch to sunburst; only the
    /// built query ignores it.
    pub fn set_output_mode(&mut self, mode: FlowOutputMode) {
        self.output_mode = mode;
    }
}

/// Builds the server flow query, or `None` while a required field is still
/// missing or the starting step has no filters.
pub fn build_flow_query(config: &FlowConfig) -> Option<ServerFlowQuery> {
    let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    if config.starting_step.filters.is_empty() {
        return None;
    }
    let steps_before = match config.output_mode {
        FlowOutputMode::Sunburst => 0,
        FlowOutputMode::Sankey => clamp_depth(config.steps_before as i64),
    };
    Some(ServerFlowQuery {
        cube: present(&config.cube)?,
        binding_key: present(&config.binding_key)?,
        time_dimension: present(&config.time_dimension)?,
        event_dimension: present(&config.event_dimension)?,
        starting_step: config.starting_step.clone(),
        steps_before,
        steps_after: clamp_depth(config.steps_after as i64),
        output_mode: config.output_mode,
        join_strategy: config.join_strategy,
        event_filters: config.event_filters.clone(),
    })
}

pub fn validate_flow(config: &FlowConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (name, value) in [
        ("cube", &config.cube),
        ("bindingKey", &config.binding_key),
        ("timeDimension", &config.time_dimension),
        ("eventDimension", &config.event_dimension),
    ] {
        if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
            errors.push(ValidationError::MissingField(name.to_string()));
        }
    }
    if config.starting_step.filters.is_empty() {
        errors.push(ValidationError::EmptyStartingStep);
    }
    errors
}

// ─── Graph ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SankeyNode {
    pub id: String,
    pub name: String,
    /// Negative before the anchor, 0 for the anchor, positive after.
    pub layer: i32,
    pub value: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SankeyLink {
    pub source: String,
    pub target: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    pub nodes: Vec<SankeyNode>,
    pub links: Vec<SankeyLink>,
    pub output_mode: FlowOutputMode,
    pub dropped_links: usize,
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&SankeyNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

fn row_count(row: &Row) -> u64 {
    match row.get("count") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn row_path(row: &Row) -> Option<Vec<String>> {
    row.get("path")?
        .as_array()?
        .iter()
        .map(value_key)
        .collect()
}

const PATH_SEPARATOR: &str = " › ";

fn node_id(mode: FlowOutputMode, anchor: &str, layer: i32, path: &[String]) -> String {
    match (mode, path.last()) {
        (_, None) => format!("0:{anchor}"),
        (FlowOutputMode::Sankey, Some(value)) => format!("{layer}:{value}"),
        (FlowOutputMode::Sunburst, Some(_)) => {
            let mut id = anchor.to_string();
            for step in path {
                id.push_str(PATH_SEPARATOR);
                id.push_str(step);
            }
            id
        }
    }
}

/// Folds per-layer rows into a node/link graph.
///
/// Sankey nodes are keyed by `(layer, value)` and aggregate every path that
/// reaches them. Sunburst nodes are keyed by the full path from the anchor.
/// Links whose endpoints do not resolve to a node are dropped.
pub fn assemble_graph(flow: &ServerFlowQuery, layers: &[(i32, Vec<Row>)]) -> FlowGraph {
    let mode = flow.output_mode;
    let anchor = flow.starting_step.name.as_str();

    let mut nodes: Vec<SankeyNode> = Vec::new();
    let mut node_index: HashMap<String, usize> = HashMap::new();
    let mut links: Vec<SankeyLink> = Vec::new();
    let mut link_index: HashMap<(String, String), usize> = HashMap::new();

    let mut ordered: Vec<&(i32, Vec<Row>)> = layers.iter().collect();
    ordered.sort_by_key(|(layer, _)| layer.unsigned_abs());

    for (layer, rows) in ordered {
        let layer = *layer;
        let depth = layer.unsigned_abs() as usize;
        for row in rows {
            let count = row_count(row);
            let path = if layer == 0 {
                Vec::new()
            } else {
                match row_path(row) {
                    Some(path) if path.len() == depth => path,
                    _ => {
                        warn!(layer, ?row, "Skipping malformed flow row");
                        continue;
                    }
                }
            };

            let id = node_id(mode, anchor, layer, &path);
            match node_index.get(&id) {
                Some(&i) => {
                    let node = &mut nodes[i];
                    node.value = Some(node.value.unwrap_or(0) + count);
                }
                None => {
                    node_index.insert(id.clone(), nodes.len());
                    nodes.push(SankeyNode {
                        id: id.clone(),
                        name: path.last().map_or_else(|| anchor.to_string(), Clone::clone),
                        layer,
                        value: Some(count),
                    });
                }
            }

            if layer == 0 {
                continue;
            }
            let parent_layer = layer - layer.signum();
            let parent = node_id(mode, anchor, parent_layer, &path[..depth - 1]);
            // links follow time: before-layers point toward the anchor
            let key = if layer > 0 { (parent, id) } else { (id, parent) };
            match link_index.get(&key) {
                Some(&i) => links[i].value += count,
                None => {
                    link_index.insert(key.clone(), links.len());
                    links.push(SankeyLink {
                        source: key.0,
                        target: key.1,
                        value: count,
                    });
                }
            }
        }
    }

    let before = links.len();
    links.retain(|link| {
        let resolved = node_index.contains_key(&link.source) && node_index.contains_key(&link.target);
        if !resolved {
            warn!(source = %link.source, target = %link.target, "Dropping orphan flow link");
        }
        resolved
    });
    let dropped_links = before - links.len();
    if dropped_links > 0 {
        metrics::counter!("drilldown.flow.orphan_links").increment(dropped_links as u64);
    }

    FlowGraph {
        nodes,
        links,
        output_mode: mode,
        dropped_links,
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FlowEngine {
    executor: Arc<dyn QueryExecutor>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine").finish()
    }
}

impl FlowEngine {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Requests every layer concurrently and assembles the graph. Any
    /// failing layer fails the whole flow.
    pub async fn execute(&self, config: &FlowConfig) -> DrilldownResult<FlowGraph> {
        if let Some(first) = validate_flow(config).into_iter().next() {
            return Err(first.into());
        }
        let flow = build_flow_query(config).ok_or(ValidationError::EmptyStartingStep)?;
        let started = Instant::now();
        info!(
            cube = %flow.cube,
            before = flow.steps_before,
            after = flow.steps_after,
            mode = ?flow.output_mode,
            "Executing flow"
        );

        let mut tasks = JoinSet::new();
        for layer in flow.layers() {
            let executor = self.executor.clone();
            let request = FlowLayerRequest {
                flow: flow.clone(),
                layer,
            };
            tasks.spawn(async move {
                let rows = executor.load_flow_layer(&request).await;
                (request.layer, rows)
            });
        }

        let mut layers = Vec::new();
        let mut failure: Option<DrilldownError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (layer, rows) = joined.map_err(anyhow::Error::from)?;
            match rows {
                Ok(rows) => {
                    debug!(layer, rows = rows.len(), "Flow layer loaded");
                    layers.push((layer, rows));
                }
                Err(e) => {
                    warn!(layer, error = %e, "Flow layer failed");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            metrics::counter!("drilldown.flow.errors").increment(1);
            return Err(e);
        }

        layers.sort_by_key(|(layer, _)| *layer);
        let graph = assemble_graph(&flow, &layers);
        metrics::histogram!("drilldown.flow.duration_ms").record(started.elapsed().as_millis() as f64);
        info!(nodes = graph.nodes.len(), links = graph.links.len(), "Flow assembled");
        Ok(graph)
    }
}
