//! Query builder — turns flat UI selections (metric list, breakdown list,
//! filter tree, comparison toggles) into a canonical [`Query`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::filter::{self, FilterNode, FilterOperator, SimpleFilter};
use crate::query::{Query, SortDirection, TimeDimension};
use crate::time::Granularity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricItem {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl MetricItem {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownItem {
    pub field: String,
    #[serde(default)]
    pub is_time_dimension: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    #[serde(default)]
    pub enable_comparison: bool,
}

impl BreakdownItem {
    pub fn dimension(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            is_time_dimension: false,
            granularity: None,
            enable_comparison: false,
        }
    }

    pub fn time(field: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            field: field.into(),
            is_time_dimension: true,
            granularity: Some(granularity),
            enable_comparison: false,
        }
    }

    pub fn with_comparison(mut self) -> Self {
        self.enable_comparison = true;
        self
    }
}

/// Fluent builder over the same inputs as [`build_query`].
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    metrics: Vec<MetricItem>,
    breakdowns: Vec<BreakdownItem>,
    filters: Vec<FilterNode>,
    order: Vec<(String, SortDirection)>,
    limit: Option<u32>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric(mut self, field: impl Into<String>) -> Self {
        self.metrics.push(MetricItem::new(field));
        self
    }

    pub fn metrics(mut self, metrics: Vec<MetricItem>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn breakdown(mut self, item: BreakdownItem) -> Self {
        self.breakdowns.push(item);
        self
    }

    pub fn breakdowns(mut self, breakdowns: Vec<BreakdownItem>) -> Self {
        self.breakdowns = breakdowns;
        self
    }

    pub fn filters(mut self, filters: Vec<FilterNode>) -> Self {
        self.filters = filters;
        self
    }

    pub fn filter(mut self, node: FilterNode) -> Self {
        self.filters = filter::add_at_path(&self.filters, &[], node);
        self
    }

    pub fn order(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> Query {
        let mut query = build_query(&self.metrics, &self.breakdowns, &self.filters, &self.order);
        query.limit = self.limit;
        query
    }
}

/// Builds a query from UI selections.
///
/// Non-time breakdowns become dimensions; time breakdowns become time
/// dimensions (granularity defaults to `day`). A time breakdown with
/// comparison enabled moves its `inDateRange` filter into
/// `compareDateRange = [current, prior]`, where the prior period has the
/// same inclusive day count and ends the day before the current one starts.
/// Without such a filter the comparison is silently skipped.
pub fn build_query(
    metrics: &[MetricItem],
    breakdowns: &[BreakdownItem],
    filters: &[FilterNode],
    order: &[(String, SortDirection)],
) -> Query {
    let mut measures: Vec<String> = Vec::with_capacity(metrics.len());
    for metric in metrics {
        if !measures.contains(&metric.field) {
            measures.push(metric.field.clone());
        }
    }

    let mut dimensions: Vec<String> = Vec::new();
    let mut time_dimensions: Vec<TimeDimension> = Vec::new();
    let mut filters = filter::canonicalize(filters);
    let mut comparison_applied = false;

    for item in breakdowns {
        if !item.is_time_dimension {
            if !dimensions.contains(&item.field) {
                dimensions.push(item.field.clone());
            }
            continue;
        }
        if time_dimensions.iter().any(|td| td.dimension == item.field) {
            continue;
        }

        let mut td = TimeDimension::new(&item.field, item.granularity.unwrap_or_default());
        if item.enable_comparison {
            if comparison_applied {
                debug!(field = %item.field, "ignoring second comparison breakdown");
            } else if let Some(range) = filter::find_simple(&filters, |f| is_date_filter(f, &item.field))
                .and_then(SimpleFilter::resolved_date_range)
            {
                filters = filter::remove_where(&filters, |f| is_date_filter(f, &item.field));
                td.compare_date_range = Some(vec![range, range.prior_period()]);
                comparison_applied = true;
            } else {
                debug!(field = %item.field, "comparison enabled without a date filter");
            }
        }
        time_dimensions.push(td);
    }

    Query {
        measures,
        dimensions,
        time_dimensions,
        filters,
        order: order.to_vec(),
        limit: None,
    }
}

/// Turns comparison on for `index` (clearing it everywhere else) or off.
/// Enabling a breakdown that is missing or not a time dimension is a no-op.
pub fn set_comparison(breakdowns: &[BreakdownItem], index: usize, enabled: bool) -> Vec<BreakdownItem> {
    if enabled && !breakdowns.get(index).is_some_and(|b| b.is_time_dimension) {
        return breakdowns.to_vec();
    }
    breakdowns
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut item = item.clone();
            if i == index {
                item.enable_comparison = enabled && item.is_time_dimension;
            } else if enabled {
                item.enable_comparison = false;
            }
            item
        })
        .collect()
}

fn is_date_filter(f: &SimpleFilter, member: &str) -> bool {
    f.member == member
        && f.operator == FilterOperator::InDateRange
        && f.resolved_date_range().is_some()
}
