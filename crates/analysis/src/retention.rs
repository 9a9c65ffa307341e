//! Retention analysis — cohort matrices built from a cohort query and an
//! activity query.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use drilldown_core::config::{
    RetentionConfigDefaults, RETENTION_MAX_PERIODS, RETENTION_MIN_PERIODS, RETENTION_WARN_PERIODS,
};
use drilldown_core::error::{DrilldownResult, ValidationError, ValidationWarning};
use drilldown_core::executor::QueryExecutor;
use drilldown_core::filter::FilterNode;
use drilldown_core::query::{cell, TimeDimension};
use drilldown_core::time::{parse_date, DateRange, Granularity};
use drilldown_core::{Query, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::binding::value_key;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionType {
    /// Returned in period k: active in exactly cohort period + k.
    #[default]
    Classic,
    /// Returned in period k: active in any period from cohort period + k on.
    Rolling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    #[serde(default)]
    pub cube: Option<String>,
    #[serde(default)]
    pub binding_key: Option<String>,
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub cohort_filters: Vec<FilterNode>,
    #[serde(default)]
    pub activity_filters: Vec<FilterNode>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_periods")]
    pub periods: u32,
    #[serde(default)]
    pub retention_type: RetentionType,
    #[serde(default)]
    pub breakdowns: Vec<String>,
}

fn default_granularity() -> Granularity {
    Granularity::Week
}
fn default_periods() -> u32 {
    RetentionConfigDefaults::default().periods
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self::from_defaults(&RetentionConfigDefaults::default())
    }
}

impl RetentionConfig {
    pub fn from_defaults(defaults: &RetentionConfigDefaults) -> Self {
        Self {
            cube: None,
            binding_key: None,
            time_dimension: None,
            date_range: None,
            cohort_filters: Vec::new(),
            activity_filters: Vec::new(),
            granularity: default_granularity(),
            periods: clamp_periods(defaults.periods as i64),
            retention_type: RetentionType::default(),
            breakdowns: Vec::new(),
        }
    }

    pub fn set_periods(&mut self, requested: i64) -> u32 {
        self.periods = clamp_periods(requested);
        self.periods
    }
}

pub fn clamp_periods(requested: i64) -> u32 {
    requested.clamp(RETENTION_MIN_PERIODS as i64, RETENTION_MAX_PERIODS as i64) as u32
}

pub fn validate_retention(config: &RetentionConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (name, value) in [
        ("cube", &config.cube),
        ("bindingKey", &config.binding_key),
        ("timeDimension", &config.time_dimension),
    ] {
        if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
            errors.push(ValidationError::MissingField(name.to_string()));
        }
    }
    match config.date_range {
        None => errors.push(ValidationError::MissingField("dateRange".into())),
        Some(range) if range.end() < range.start() => {
            errors.push(ValidationError::InvalidDateRange(format!(
                "{} is before {}",
                range.end(),
                range.start()
            )));
        }
        Some(_) => {}
    }
    if !(RETENTION_MIN_PERIODS..=RETENTION_MAX_PERIODS).contains(&config.periods) {
        errors.push(ValidationError::PeriodsOutOfRange {
            value: config.periods,
            min: RETENTION_MIN_PERIODS,
            max: RETENTION_MAX_PERIODS,
        });
    }
    errors
}

pub fn retention_warnings(config: &RetentionConfig) -> Vec<ValidationWarning> {
    if config.periods > RETENTION_WARN_PERIODS {
        vec![ValidationWarning::LargeRetentionWindow {
            periods: config.periods,
        }]
    } else {
        Vec::new()
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ValidationError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ValidationError::MissingField(name.to_string()))
}

/// Entities, breakdown values, and the bucketed time of every event that
/// qualifies for cohort entry within the date range.
pub fn build_cohort_query(config: &RetentionConfig) -> Result<Query, ValidationError> {
    let binding_key = required(&config.binding_key, "bindingKey")?;
    let time_dimension = required(&config.time_dimension, "timeDimension")?;
    let range = config
        .date_range
        .ok_or_else(|| ValidationError::MissingField("dateRange".into()))?;

    let mut query = Query::default().with_dimension(binding_key);
    for breakdown in &config.breakdowns {
        query = query.with_dimension(breakdown);
    }
    let mut td = TimeDimension::new(time_dimension, config.granularity);
    td.date_range = Some(range);
    query.time_dimensions.push(td);
    query.filters = config.cohort_filters.clone();
    Ok(query)
}

/// Entity activity over the date range pushed out by `periods` periods so
/// the last cohort can still return.
pub fn build_activity_query(config: &RetentionConfig) -> Result<Query, ValidationError> {
    let binding_key = required(&config.binding_key, "bindingKey")?;
    let time_dimension = required(&config.time_dimension, "timeDimension")?;
    let range = config
        .date_range
        .ok_or_else(|| ValidationError::MissingField("dateRange".into()))?;

    let mut query = Query::default().with_dimension(binding_key);
    let mut td = TimeDimension::new(time_dimension, config.granularity);
    td.date_range = Some(range.extend_by(config.granularity, config.periods));
    query.time_dimensions.push(td);
    query.filters = config.activity_filters.clone();
    Ok(query)
}

// ─── Matrix ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionCell {
    pub period: u32,
    pub returned_count: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortRow {
    pub cohort_period: NaiveDate,
    pub entered_count: u64,
    pub cells: Vec<RetentionCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionMatrix {
    /// One entry per configured breakdown; empty when there are none.
    pub breakdown_values: Vec<Option<String>>,
    pub cohorts: Vec<CohortRow>,
    /// Per-period totals weighted by cohort size.
    pub summary: Vec<RetentionCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionResult {
    pub granularity: Granularity,
    pub periods: u32,
    pub retention_type: RetentionType,
    pub matrices: Vec<RetentionMatrix>,
    pub warnings: Vec<ValidationWarning>,
}

fn row_period(row: &Row, time_dimension: &str, granularity: Granularity) -> Option<NaiveDate> {
    let raw = cell(row, time_dimension)?.as_str()?;
    parse_date(raw).map(|d| granularity.truncate(d))
}

fn rate(returned: u64, entered: u64) -> f64 {
    if entered == 0 {
        0.0
    } else {
        returned as f64 / entered as f64
    }
}

/// Builds one matrix per breakdown combination from the two result sets.
pub fn compute_matrix(
    config: &RetentionConfig,
    cohort_rows: &[Row],
    activity_rows: &[Row],
) -> Result<RetentionResult, ValidationError> {
    let binding_key = required(&config.binding_key, "bindingKey")?;
    let time_dimension = required(&config.time_dimension, "timeDimension")?;
    let range = config
        .date_range
        .ok_or_else(|| ValidationError::MissingField("dateRange".into()))?;
    let granularity = config.granularity;
    let periods = config.periods;

    // earliest qualifying period per entity; the breakdown values come from
    // the row that set it, so each entity enters exactly one cohort
    let mut entry: HashMap<String, (NaiveDate, Vec<Option<String>>)> = HashMap::new();
    for row in cohort_rows {
        let Some(entity) = cell(row, binding_key).and_then(value_key) else {
            continue;
        };
        let Some(period) = row_period(row, time_dimension, granularity) else {
            continue;
        };
        if period > range.end() || period < granularity.truncate(range.start()) {
            continue;
        }
        let breakdown: Vec<Option<String>> = config
            .breakdowns
            .iter()
            .map(|b| cell(row, b).and_then(value_key))
            .collect();
        match entry.get_mut(&entity) {
            Some(earliest) if period < earliest.0 => *earliest = (period, breakdown),
            Some(_) => {}
            None => {
                entry.insert(entity, (period, breakdown));
            }
        }
    }

    let mut activity: HashMap<String, BTreeSet<NaiveDate>> = HashMap::new();
    for row in activity_rows {
        let (Some(entity), Some(period)) = (
            cell(row, binding_key).and_then(value_key),
            row_period(row, time_dimension, granularity),
        ) else {
            continue;
        };
        activity.entry(entity).or_default().insert(period);
    }

    // breakdown → cohort period → entities
    let mut grouped: BTreeMap<Vec<Option<String>>, BTreeMap<NaiveDate, Vec<&str>>> = BTreeMap::new();
    for (entity, (period, breakdown)) in &entry {
        grouped
            .entry(breakdown.clone())
            .or_default()
            .entry(*period)
            .or_default()
            .push(entity.as_str());
    }

    let returned = |entity: &str, target: NaiveDate| -> bool {
        let Some(active) = activity.get(entity) else {
            return false;
        };
        match config.retention_type {
            RetentionType::Classic => active.contains(&target),
            RetentionType::Rolling => active.range(target..).next().is_some(),
        }
    };

    let mut matrices = Vec::with_capacity(grouped.len());
    for (breakdown_values, cohorts) in grouped {
        let mut rows = Vec::with_capacity(cohorts.len());
        let mut totals = vec![(0u64, 0u64); periods as usize];
        for (cohort_period, entities) in cohorts {
            let entered = entities.len() as u64;
            let mut cells = Vec::with_capacity(periods as usize);
            for k in 0..periods {
                let Some(target) = granularity.advance(cohort_period, k as i64) else {
                    break;
                };
                let count = entities.iter().filter(|e| returned(e, target)).count() as u64;
                totals[k as usize].0 += count;
                totals[k as usize].1 += entered;
                cells.push(RetentionCell {
                    period: k,
                    returned_count: count,
                    rate: rate(count, entered),
                });
            }
            rows.push(CohortRow {
                cohort_period,
                entered_count: entered,
                cells,
            });
        }
        let summary = totals
            .iter()
            .enumerate()
            .map(|(k, (returned, entered))| RetentionCell {
                period: k as u32,
                returned_count: *returned,
                rate: rate(*returned, *entered),
            })
            .collect();
        matrices.push(RetentionMatrix {
            breakdown_values,
            cohorts: rows,
            summary,
        });
    }

    Ok(RetentionResult {
        granularity,
        periods,
        retention_type: config.retention_type,
        matrices,
        warnings: retention_warnings(config),
    })
}

// ─── Engine ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RetentionEngine {
    executor: Arc<dyn QueryExecutor>,
}

impl std::fmt::Debug for RetentionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionEngine").finish()
    }
}

impl RetentionEngine {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Runs the cohort and activity queries concurrently, then computes the
    /// matrices.
    pub async fn execute(&self, config: &RetentionConfig) -> DrilldownResult<RetentionResult> {
        if let Some(first) = validate_retention(config).into_iter().next() {
            return Err(first.into());
        }
        let cohort_query = build_cohort_query(config)?;
        let activity_query = build_activity_query(config)?;
        let started = Instant::now();
        info!(
            periods = config.periods,
            granularity = %config.granularity,
            breakdowns = config.breakdowns.len(),
            "Executing retention"
        );

        let (cohort, activity) = tokio::join!(
            self.executor.execute(&cohort_query),
            self.executor.execute(&activity_query)
        );
        let (cohort, activity) = (cohort?, activity?);
        debug!(
            cohort_rows = cohort.rows.len(),
            activity_rows = activity.rows.len(),
            "Retention queries returned"
        );

        let result = compute_matrix(config, &cohort.rows, &activity.rows)?;
        metrics::histogram!("drilldown.retention.duration_ms")
            .record(started.elapsed().as_millis() as f64);
        Ok(result)
    }
}
