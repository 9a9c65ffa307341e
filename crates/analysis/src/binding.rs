//! Binding keys — the entity identifier used to correlate events across
//! funnel steps, flow layers and retention queries.

use std::collections::HashSet;

use drilldown_core::query::{cell, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeBinding {
    pub cube: String,
    pub dimension: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindingKeyDimension {
    Single(String),
    /// One mapping per cube referenced by any step.
    CrossCube(Vec<CubeBinding>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingKey {
    pub dimension: BindingKeyDimension,
}

impl BindingKey {
    pub fn single(dimension: impl Into<String>) -> Self {
        Self {
            dimension: BindingKeyDimension::Single(dimension.into()),
        }
    }

    pub fn cross_cube(mappings: Vec<CubeBinding>) -> Self {
        Self {
            dimension: BindingKeyDimension::CrossCube(mappings),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.dimension {
            BindingKeyDimension::Single(d) => d.trim().is_empty(),
            BindingKeyDimension::CrossCube(m) => m.is_empty(),
        }
    }

    /// Binding dimension to use for a query on `cube`.
    pub fn dimension_for(&self, cube: Option<&str>) -> Option<&str> {
        match &self.dimension {
            BindingKeyDimension::Single(d) => Some(d.as_str()),
            BindingKeyDimension::CrossCube(mappings) => {
                let cube = cube?;
                mappings
                    .iter()
                    .find(|m| m.cube == cube)
                    .map(|m| m.dimension.as_str())
            }
        }
    }
}

/// Deduplicated binding-key values in first-appearance order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingValues {
    /// Capped at the requested limit.
    pub values: Vec<String>,
    /// Unique count before the cap.
    pub total_unique: usize,
}

/// Collects the distinct values of `dimension` across `rows`; nulls and
/// missing cells are skipped.
pub fn extract_values(rows: &[Row], dimension: &str, limit: usize) -> BindingValues {
    let mut seen: HashSet<String> = HashSet::new();
    let mut values = Vec::new();
    for row in rows {
        let Some(value) = cell(row, dimension).and_then(value_key) else {
            continue;
        };
        if seen.insert(value.clone()) && values.len() < limit {
            values.push(value);
        }
    }
    BindingValues {
        values,
        total_unique: seen.len(),
    }
}

/// String form of a cell used for identity comparisons; `None` for nulls.
pub fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
