//! Funnel analysis — tracks entity progression through sequential steps.
//!
//! Step `i` can only be built once step `i-1` has produced its binding-key
//! values, so steps always execute one after another, in order.

use std::sync::Arc;
use std::time::Instant;

use drilldown_core::config::DEFAULT_BINDING_KEY_LIMIT;
use drilldown_core::error::{DrilldownError, DrilldownResult, ValidationError};
use drilldown_core::executor::QueryExecutor;
use drilldown_core::filter::{FilterNode, FilterOperator};
use drilldown_core::time::IsoDuration;
use drilldown_core::Query;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binding::{extract_values, BindingKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStep {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub query: Query,
    /// ISO-8601 duration, e.g. `P7D`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_convert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_dimension: Option<String>,
}

impl FunnelStep {
    pub fn new(name: impl Into<String>, query: Query) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            query,
            time_to_convert: None,
            time_dimension: None,
        }
    }

    pub fn with_time_to_convert(mut self, duration: &str, time_dimension: &str) -> Self {
        self.time_to_convert = Some(duration.to_string());
        self.time_dimension = Some(time_dimension.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelConfig {
    #[serde(default)]
    pub binding_key: Option<BindingKey>,
    #[serde(default)]
    pub steps: Vec<FunnelStep>,
    #[serde(default = "default_binding_key_limit")]
    pub binding_key_limit: usize,
    #[serde(default = "default_count_unique")]
    pub count_unique: bool,
}

fn default_binding_key_limit() -> usize {
    DEFAULT_BINDING_KEY_LIMIT
}
fn default_count_unique() -> bool {
    true
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            binding_key: None,
            steps: Vec::new(),
            binding_key_limit: default_binding_key_limit(),
            count_unique: default_count_unique(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "step")]
pub enum FunnelStatus {
    Idle,
    Executing(usize),
    Success,
    Partial,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStepResult {
    pub step_index: usize,
    pub step_name: String,
    pub binding_key_values: Vec<String>,
    pub binding_key_total_count: usize,
    pub count: u64,
    pub conversion_rate: Option<f64>,
    pub cumulative_conversion_rate: f64,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelSummary {
    pub entered: u64,
    pub converted: u64,
    pub overall_conversion_rate: f64,
    pub completed_steps: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelResult {
    pub status: FunnelStatus,
    pub steps: Vec<FunnelStepResult>,
    pub summary: FunnelSummary,
}

/// Structural checks run before any step executes.
pub fn validate_funnel(config: &FunnelConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let binding_key = config.binding_key.as_ref().filter(|k| !k.is_empty());
    if binding_key.is_none() {
        errors.push(ValidationError::MissingBindingKey);
    }
    if config.steps.len() < 2 {
        errors.push(ValidationError::TooFewFunnelSteps(config.steps.len()));
    }

    for (index, step) in config.steps.iter().enumerate() {
        if !step.query.is_valid() {
            errors.push(ValidationError::EmptyStepQuery { step: index });
        }
        if let Some(raw) = &step.time_to_convert {
            if raw.parse::<IsoDuration>().is_err() {
                errors.push(ValidationError::InvalidDuration {
                    step: index,
                    value: raw.clone(),
                });
            } else if step.time_dimension.is_none() {
                errors.push(ValidationError::MissingStepTimeDimension { step: index });
            }
        }
        if let Some(key) = binding_key {
            let cube = step.query.primary_cube();
            if key.dimension_for(cube.as_deref()).is_none() {
                errors.push(ValidationError::MissingCubeMapping {
                    step: index,
                    cube: cube.unwrap_or_default(),
                });
            }
        }
    }
    errors
}

fn binding_dimension(config: &FunnelConfig, index: usize) -> Option<String> {
    let step = config.steps.get(index)?;
    let cube = step.query.primary_cube();
    config
        .binding_key
        .as_ref()?
        .dimension_for(cube.as_deref())
        .map(str::to_string)
}

/// Builds the query for step `index`.
///
/// Every step selects its binding-key dimension. Steps after the first are
/// restricted to the previous step's binding-key values, and a step with a
/// time to convert also gets a `withinDurationAfter` filter anchored on the
/// previous step's time dimension.
pub fn build_step_query(
    config: &FunnelConfig,
    index: usize,
    previous_values: Option<&[String]>,
) -> DrilldownResult<Query> {
    let step = config
        .steps
        .get(index)
        .ok_or_else(|| DrilldownError::Config(format!("funnel has no step {index}")))?;
    let dimension = binding_dimension(config, index).ok_or(ValidationError::MissingBindingKey)?;

    let mut query = step.query.clone().with_dimension(&dimension);
    if index == 0 {
        return Ok(query);
    }

    query = query.with_filter(FilterNode::simple(
        &dimension,
        FilterOperator::In,
        previous_values.unwrap_or_default().to_vec(),
    ));

    if let (Some(raw), Some(time_dimension)) = (&step.time_to_convert, &step.time_dimension) {
        let duration: IsoDuration = raw.parse().map_err(|_| ValidationError::InvalidDuration {
            step: index,
            value: raw.clone(),
        })?;
        let anchor = config.steps[index - 1]
            .time_dimension
            .clone()
            .unwrap_or_else(|| time_dimension.clone());
        query = query.with_filter(FilterNode::simple(
            time_dimension,
            FilterOperator::WithinDurationAfter,
            vec![duration.to_string(), anchor],
        ));
    }
    Ok(query)
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Runs funnels against the semantic layer.
#[derive(Clone)]
pub struct FunnelEngine {
    executor: Arc<dyn QueryExecutor>,
}

impl std::fmt::Debug for FunnelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunnelEngine").finish()
    }
}

impl FunnelEngine {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Executes every step in order. A failing step carries its error and
    /// stops the funnel; the status is `partial` when earlier steps
    /// succeeded and `error` otherwise.
    pub async fn execute(&self, config: &FunnelConfig) -> DrilldownResult<FunnelResult> {
        if let Some(first) = validate_funnel(config).into_iter().next() {
            return Err(first.into());
        }

        info!(steps = config.steps.len(), "Executing funnel");
        let mut results: Vec<FunnelStepResult> = Vec::with_capacity(config.steps.len());
        let mut status = FunnelStatus::Idle;
        let mut previous_values: Option<Vec<String>> = None;

        for (index, step) in config.steps.iter().enumerate() {
            status = FunnelStatus::Executing(index);
            debug!(?status, step = %step.name, "Funnel step starting");
            let started = Instant::now();

            let dimension = binding_dimension(config, index).ok_or(ValidationError::MissingBindingKey)?;
            let query = build_step_query(config, index, previous_values.as_deref())?;

            let rows = if previous_values.as_ref().is_some_and(|v| v.is_empty()) {
                // nothing left to restrict to; an empty IN list is not sent
                debug!(step = index, "Previous step matched no entities, skipping query");
                Ok(Vec::new())
            } else {
                self.executor.execute(&query).await.map(|r| r.rows)
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            metrics::histogram!("drilldown.funnel.step_ms").record(elapsed_ms as f64);

            let rows = match rows {
                Ok(rows) => rows,
                Err(e) => {
                    metrics::counter!("drilldown.funnel.step_errors").increment(1);
                    warn!(step = index, error = %e, "Funnel step failed");
                    results.push(FunnelStepResult {
                        step_index: index,
                        step_name: step.name.clone(),
                        binding_key_values: Vec::new(),
                        binding_key_total_count: 0,
                        count: 0,
                        conversion_rate: None,
                        cumulative_conversion_rate: 0.0,
                        execution_time_ms: elapsed_ms,
                        error: Some(e.to_string()),
                    });
                    status = if index > 0 {
                        FunnelStatus::Partial
                    } else {
                        FunnelStatus::Error
                    };
                    break;
                }
            };

            let extracted = extract_values(&rows, &dimension, config.binding_key_limit);
            let count = if config.count_unique {
                extracted.total_unique as u64
            } else {
                rows.len() as u64
            };
            let first_count = results.first().map_or(count, |r| r.count);
            let conversion_rate = results.last().map(|prev| ratio(count, prev.count));

            results.push(FunnelStepResult {
                step_index: index,
                step_name: step.name.clone(),
                binding_key_values: extracted.values.clone(),
                binding_key_total_count: extracted.total_unique,
                count,
                conversion_rate,
                cumulative_conversion_rate: ratio(count, first_count),
                execution_time_ms: elapsed_ms,
                error: None,
            });
            previous_values = Some(extracted.values);
        }

        if matches!(status, FunnelStatus::Executing(_)) {
            status = FunnelStatus::Success;
        }
        let summary = summarize(&results, config.steps.len());
        info!(?status, converted = summary.converted, "Funnel complete");
        Ok(FunnelResult {
            status,
            steps: results,
            summary,
        })
    }
}

fn summarize(results: &[FunnelStepResult], total_steps: usize) -> FunnelSummary {
    let succeeded: Vec<&FunnelStepResult> = results.iter().filter(|r| r.error.is_none()).collect();
    let entered = succeeded.first().map_or(0, |r| r.count);
    let converted = succeeded.last().map_or(0, |r| r.count);
    FunnelSummary {
        entered,
        converted,
        overall_conversion_rate: ratio(converted, entered),
        completed_steps: succeeded.len(),
        total_steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drilldown_core::executor::{failing_executor, rows_from_json, CaptureExecutor, ExecutorRequest};
    use drilldown_core::filter::SimpleFilter;
    use serde_json::json;

    fn step(name: &str, measure: &str) -> FunnelStep {
        FunnelStep::new(
            name,
            Query {
                measures: vec![measure.to_string()],
                ..Default::default()
            },
        )
    }

    fn three_step_config() -> FunnelConfig {
        FunnelConfig {
            binding_key: Some(BindingKey::single("Events.userId")),
            steps: vec![
                step("Signup", "Events.signups"),
                step("Activate", "Events.activations"),
                step("Purchase", "Events.purchases"),
            ],
            ..Default::default()
        }
    }

    fn in_filter(query: &Query) -> Option<&SimpleFilter> {
        query.filters.iter().find_map(|f| match f {
            FilterNode::Simple(s) if s.operator == FilterOperator::In => Some(s),
            _ => None,
        })
    }

    /// Answers each step with the users listed for its measure.
    fn scripted_executor() -> Arc<CaptureExecutor> {
        Arc::new(CaptureExecutor::new(|request| {
            let ExecutorRequest::Query(query) = request else {
                return Ok(Vec::new());
            };
            let users: &[&str] = match query.measures[0].as_str() {
                "Events.signups" => &["u1", "u2", "u3", "u1"],
                "Events.activations" => &["u1", "u2"],
                "Events.purchases" => &["u1"],
                _ => &[],
            };
            let allowed = in_filter(query).map(|f| f.values.clone());
            let rows: Vec<_> = users
                .iter()
                .filter(|u| allowed.as_ref().map_or(true, |a| a.iter().any(|x| x.as_str() == **u)))
                .map(|u| json!({"Events.userId": u}))
                .collect();
            rows_from_json(json!(rows))
        }))
    }

    #[tokio::test]
    async fn test_three_step_funnel() {
        let executor = scripted_executor();
        let engine = FunnelEngine::new(executor.clone());
        let result = engine.execute(&three_step_config()).await.unwrap();

        assert_eq!(result.status, FunnelStatus::Success);
        let counts: Vec<u64> = result.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![3, 2, 1]);

        assert_eq!(result.steps[0].conversion_rate, None);
        assert!((result.steps[1].conversion_rate.unwrap() - 0.667).abs() < 1e-3);
        assert!((result.steps[1].cumulative_conversion_rate - 0.667).abs() < 1e-3);
        assert!((result.steps[2].conversion_rate.unwrap() - 0.5).abs() < 1e-9);
        assert!((result.steps[2].cumulative_conversion_rate - 0.333).abs() < 1e-3);
        for s in &result.steps {
            assert_eq!(s.cumulative_conversion_rate, s.count as f64 / counts[0] as f64);
        }

        // steps run in order, each restricted to the previous step's users
        let queries = executor.queries();
        assert_eq!(queries.len(), 3);
        assert!(in_filter(&queries[0]).is_none());
        assert_eq!(in_filter(&queries[1]).unwrap().values, vec!["u1", "u2", "u3"]);
        assert_eq!(in_filter(&queries[2]).unwrap().values, vec!["u1", "u2"]);
        assert!(queries.iter().all(|q| q.has_dimension("Events.userId")));

        assert_eq!(result.summary.entered, 3);
        assert_eq!(result.summary.converted, 1);
    }

    #[tokio::test]
    async fn test_binding_key_cap_keeps_total() {
        let mut config = three_step_config();
        config.binding_key_limit = 2;
        let executor = scripted_executor();
        let result = FunnelEngine::new(executor.clone()).execute(&config).await.unwrap();
        assert_eq!(result.steps[0].binding_key_values, vec!["u1", "u2"]);
        assert_eq!(result.steps[0].binding_key_total_count, 3);
        assert_eq!(result.steps[0].count, 3);
    }

    #[tokio::test]
    async fn test_row_count_mode() {
        let mut config = three_step_config();
        config.count_unique = false;
        let result = FunnelEngine::new(scripted_executor()).execute(&config).await.unwrap();
        assert_eq!(result.steps[0].count, 4);
    }

    #[tokio::test]
    async fn test_failure_after_first_step_is_partial() {
        let executor = Arc::new(CaptureExecutor::new(|request| match request {
            ExecutorRequest::Query(q) if q.measures[0] == "Events.activations" => {
                Err(DrilldownError::Execution("timeout".into()))
            }
            _ => rows_from_json(json!([{"Events.userId": "u1"}])),
        }));
        let result = FunnelEngine::new(executor.clone())
            .execute(&three_step_config())
            .await
            .unwrap();
        assert_eq!(result.status, FunnelStatus::Partial);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[1].error.as_deref().unwrap().contains("timeout"));
        // the third step never ran
        assert_eq!(executor.count(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_first_step_is_error() {
        let result = FunnelEngine::new(failing_executor("down"))
            .execute(&three_step_config())
            .await
            .unwrap();
        assert_eq!(result.status, FunnelStatus::Error);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.summary.completed_steps, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_never_executes() {
        let executor = Arc::new(CaptureExecutor::empty());
        let mut config = three_step_config();
        config.steps.truncate(1);
        let err = FunnelEngine::new(executor.clone()).execute(&config).await.unwrap_err();
        assert!(matches!(
            err,
            DrilldownError::Validation(ValidationError::TooFewFunnelSteps(1))
        ));
        assert_eq!(executor.count(), 0);
    }

    #[tokio::test]
    async fn test_empty_previous_step_short_circuits() {
        let executor = Arc::new(CaptureExecutor::empty());
        let result = FunnelEngine::new(executor.clone())
            .execute(&three_step_config())
            .await
            .unwrap();
        assert_eq!(result.status, FunnelStatus::Success);
        assert!(result.steps.iter().all(|s| s.count == 0));
        assert_eq!(executor.count(), 1);
    }

    #[test]
    fn test_time_to_convert_filter() {
        let mut config = three_step_config();
        config.steps[0].time_dimension = Some("Events.signedUpAt".into());
        config.steps[1] = config.steps[1]
            .clone()
            .with_time_to_convert("P7D", "Events.activatedAt");
        let query = build_step_query(&config, 1, Some(&["u1".to_string()])).unwrap();
        let window = query
            .filters
            .iter()
            .find_map(|f| match f {
                FilterNode::Simple(s) if s.operator == FilterOperator::WithinDurationAfter => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(window.member, "Events.activatedAt");
        assert_eq!(window.values, vec!["P7D".to_string(), "Events.signedUpAt".to_string()]);
    }

    #[test]
    fn test_validation() {
        let config = FunnelConfig::default();
        let errors = validate_funnel(&config);
        assert!(errors.contains(&ValidationError::MissingBindingKey));
        assert!(errors.contains(&ValidationError::TooFewFunnelSteps(0)));

        let mut config = three_step_config();
        config.steps[2].time_to_convert = Some("seven days".into());
        assert_eq!(
            validate_funnel(&config),
            vec![ValidationError::InvalidDuration {
                step: 2,
                value: "seven days".into()
            }]
        );

        config.steps[2].time_to_convert = Some("P1D".into());
        assert_eq!(
            validate_funnel(&config),
            vec![ValidationError::MissingStepTimeDimension { step: 2 }]
        );
    }

    #[test]
    fn test_cross_cube_validation_and_binding() {
        use crate::binding::CubeBinding;
        let config = FunnelConfig {
            binding_key: Some(BindingKey::cross_cube(vec![
                CubeBinding {
                    cube: "Signups".into(),
                    dimension: "Signups.userId".into(),
                },
                CubeBinding {
                    cube: "Orders".into(),
                    dimension: "Orders.customerId".into(),
                },
            ])),
            steps: vec![
                step("Signup", "Signups.count"),
                step("Order", "Orders.count"),
                step("Refund", "Refunds.count"),
            ],
            ..Default::default()
        };
        assert_eq!(
            validate_funnel(&config),
            vec![ValidationError::MissingCubeMapping {
                step: 2,
                cube: "Refunds".into()
            }]
        );

        let query = build_step_query(&config, 1, Some(&["u9".to_string()])).unwrap();
        assert!(query.has_dimension("Orders.customerId"));
        assert_eq!(in_filter(&query).unwrap().member, "Orders.customerId");
    }
}
