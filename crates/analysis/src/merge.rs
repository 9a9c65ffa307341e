//! Multi-query execution and result combination.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use drilldown_core::error::{DrilldownResult, ValidationError};
use drilldown_core::executor::QueryExecutor;
use drilldown_core::query::cell;
use drilldown_core::{Query, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Column added to every concatenated row naming its source query.
pub const QUERY_LABEL_FIELD: &str = "__queryLabel";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Concat,
    Merge,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiQueryConfig {
    #[serde(default)]
    pub queries: Vec<Query>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub merge_keys: Vec<String>,
    #[serde(default)]
    pub query_labels: Vec<String>,
}

impl MultiQueryConfig {
    pub fn label(&self, index: usize) -> String {
        self.query_labels
            .get(index)
            .filter(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("Query {}", index + 1))
    }

    /// Valid queries with their index and label; placeholders are skipped.
    pub fn active_queries(&self) -> Vec<(usize, String, &Query)> {
        self.queries
            .iter()
            .enumerate()
            .filter(|(_, q)| q.is_valid())
            .map(|(i, q)| (i, self.label(i), q))
            .collect()
    }
}

/// Multi-query mode needs at least two independently valid queries.
pub fn is_multi_query_mode(config: &MultiQueryConfig) -> bool {
    config.queries.iter().filter(|q| q.is_valid()).count() >= 2
}

pub fn validate_multi_query(config: &MultiQueryConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if !config.query_labels.is_empty() && config.query_labels.len() != config.queries.len() {
        errors.push(ValidationError::LabelCountMismatch {
            expected: config.queries.len(),
            found: config.query_labels.len(),
        });
    }
    let mut seen = HashSet::new();
    for (_, label, _) in config.active_queries() {
        if !seen.insert(label.clone()) {
            errors.push(ValidationError::DuplicateQueryLabel { label });
        }
    }
    if config.merge_strategy == MergeStrategy::Merge {
        if config.merge_keys.is_empty() {
            errors.push(ValidationError::MissingMergeKeys);
        }
        for key in &config.merge_keys {
            for (_, label, query) in config.active_queries() {
                if !query.has_dimension(key) && !query.has_time_dimension(key) {
                    errors.push(ValidationError::MergeKeyNotInQuery {
                        key: key.clone(),
                        label,
                    });
                }
            }
        }
    }
    errors
}

// ─── Combination ────────────────────────────────────────────────────────────

/// One member's rows, as fed to the combiners.
#[derive(Debug, Clone, Copy)]
pub struct MemberRows<'a> {
    pub label: &'a str,
    pub query: &'a Query,
    pub rows: &'a [Row],
}

/// Row union; every row is tagged with its source label.
pub fn concat_results(members: &[MemberRows<'_>]) -> Vec<Row> {
    let mut out = Vec::with_capacity(members.iter().map(|m| m.rows.len()).sum());
    for member in members {
        for row in member.rows {
            let mut tagged = row.clone();
            tagged.insert(QUERY_LABEL_FIELD.to_string(), Value::String(member.label.to_string()));
            out.push(tagged);
        }
    }
    out
}

/// Output column for each member's measures. A measure name already taken
/// by an earlier member becomes `{measure}__{label}`.
fn measure_columns(members: &[MemberRows<'_>]) -> Vec<Vec<(String, String)>> {
    let mut claimed: Vec<String> = Vec::new();
    members
        .iter()
        .map(|member| {
            member
                .query
                .measures
                .iter()
                .map(|measure| {
                    let column = if claimed.contains(measure) {
                        format!("{measure}__{}", member.label)
                    } else {
                        measure.clone()
                    };
                    claimed.push(column.clone());
                    (measure.clone(), column)
                })
                .collect()
        })
        .collect()
}

/// Outer join on `keys`. Key tuples keep first-appearance order; measures a
/// member did not produce for a tuple are `null`.
pub fn merge_results(members: &[MemberRows<'_>], keys: &[String]) -> Vec<Row> {
    let columns = measure_columns(members);
    let all_columns: Vec<&String> = columns.iter().flatten().map(|(_, c)| c).collect();

    let mut merged: Vec<Row> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();

    for (member, member_columns) in members.iter().zip(&columns) {
        for row in member.rows {
            let tuple: Vec<Value> = keys
                .iter()
                .map(|k| cell(row, k).cloned().unwrap_or(Value::Null))
                .collect();
            let identity: Vec<String> = tuple.iter().map(Value::to_string).collect();

            let slot = *index.entry(identity).or_insert_with(|| {
                let mut fresh = Row::new();
                for (key, value) in keys.iter().zip(&tuple) {
                    fresh.insert(key.clone(), value.clone());
                }
                for column in &all_columns {
                    fresh.insert((*column).clone(), Value::Null);
                }
                merged.push(fresh);
                merged.len() - 1
            });

            let target = &mut merged[slot];
            for (measure, column) in member_columns {
                if let Some(value) = row.get(measure) {
                    target.insert(column.clone(), value.clone());
                }
            }
            // other dimensions: first member to supply them wins
            for (field, value) in row {
                let is_measure = member_columns.iter().any(|(m, _)| m == field);
                if !is_measure && !target.contains_key(field) {
                    target.insert(field.clone(), value.clone());
                }
            }
        }
    }
    merged
}

pub fn combine(strategy: MergeStrategy, members: &[MemberRows<'_>], keys: &[String]) -> Vec<Row> {
    match strategy {
        MergeStrategy::Concat => concat_results(members),
        MergeStrategy::Merge => merge_results(members, keys),
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum QueryProgress {
    Loading,
    Success { row_count: usize },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberOutcome {
    pub index: usize,
    pub label: String,
    pub query: Query,
    pub rows: Vec<Row>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiQueryResult {
    pub merge_strategy: MergeStrategy,
    pub members: Vec<MemberOutcome>,
    /// Combined rows of the members that succeeded.
    pub rows: Vec<Row>,
}

impl MultiQueryResult {
    pub fn failed(&self) -> impl Iterator<Item = &MemberOutcome> {
        self.members.iter().filter(|m| m.error.is_some())
    }
}

/// Fans member queries out concurrently. Progress per label is published
/// to a shared map as each member resolves.
#[derive(Clone)]
pub struct MultiQueryEngine {
    executor: Arc<dyn QueryExecutor>,
    progress: Arc<DashMap<String, QueryProgress>>,
}

impl std::fmt::Debug for MultiQueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiQueryEngine")
            .field("tracked", &self.progress.len())
            .finish()
    }
}

impl MultiQueryEngine {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor,
            progress: Arc::new(DashMap::new()),
        }
    }

    /// Publishes progress into a map owned by the caller.
    pub fn with_progress(
        executor: Arc<dyn QueryExecutor>,
        progress: Arc<DashMap<String, QueryProgress>>,
    ) -> Self {
        Self { executor, progress }
    }

    pub fn progress(&self) -> Arc<DashMap<String, QueryProgress>> {
        self.progress.clone()
    }

    pub fn progress_of(&self, label: &str) -> Option<QueryProgress> {
        self.progress.get(label).map(|p| p.value().clone())
    }

    pub async fn execute(&self, config: &MultiQueryConfig) -> DrilldownResult<MultiQueryResult> {
        if let Some(first) = validate_multi_query(config).into_iter().next() {
            return Err(first.into());
        }
        let active = config.active_queries();
        info!(
            queries = active.len(),
            strategy = ?config.merge_strategy,
            "Executing multi-query"
        );

        self.progress.clear();
        let mut tasks = JoinSet::new();
        for (index, label, query) in active {
            self.progress.insert(label.clone(), QueryProgress::Loading);
            let executor = self.executor.clone();
            let progress = self.progress.clone();
            let query = query.clone();
            tasks.spawn(async move {
                let result = executor.execute(&query).await;
                let state = match &result {
                    Ok(r) => QueryProgress::Success {
                        row_count: r.rows.len(),
                    },
                    Err(e) => QueryProgress::Error {
                        message: e.to_string(),
                    },
                };
                progress.insert(label.clone(), state);
                (index, label, query, result)
            });
        }

        let mut members = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, label, query, result) = joined.map_err(anyhow::Error::from)?;
            let outcome = match result {
                Ok(r) => {
                    debug!(label = %label, rows = r.rows.len(), "Member query resolved");
                    MemberOutcome {
                        index,
                        label,
                        query,
                        rows: r.rows,
                        error: None,
                    }
                }
                Err(e) => {
                    metrics::counter!("drilldown.multi_query.member_errors").increment(1);
                    warn!(label = %label, error = %e, "Member query failed");
                    MemberOutcome {
                        index,
                        label,
                        query,
                        rows: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            members.push(outcome);
        }
        members.sort_by_key(|m| m.index);

        let succeeded: Vec<MemberRows<'_>> = members
            .iter()
            .filter(|m| m.error.is_none())
            .map(|m| MemberRows {
                label: &m.label,
                query: &m.query,
                rows: &m.rows,
            })
            .collect();
        let rows = combine(config.merge_strategy, &succeeded, &config.merge_keys);

        Ok(MultiQueryResult {
            merge_strategy: config.merge_strategy,
            members,
            rows,
        })
    }
}
