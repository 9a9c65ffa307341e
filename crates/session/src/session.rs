//! The analysis session: one store owning the active mode's configuration.
//!
//! Every setter edits the configuration, recomputes validation and, when the
//! configuration is executable, hands a fresh job to the scheduler. Blocking
//! validation errors clear pending work instead of executing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use drilldown_analysis::binding::BindingKey;
use drilldown_analysis::flow::{build_flow_query, validate_flow, FlowConfig, FlowEngine, FlowGraph};
use drilldown_analysis::funnel::{
    build_step_query, validate_funnel, FunnelConfig, FunnelEngine, FunnelResult, FunnelStep,
};
use drilldown_analysis::merge::{
    is_multi_query_mode, validate_multi_query, MergeStrategy, MultiQueryConfig, MultiQueryEngine,
    MultiQueryResult, QueryProgress,
};
use drilldown_analysis::retention::{
    build_activity_query, build_cohort_query, retention_warnings, validate_retention,
    RetentionConfig, RetentionEngine, RetentionResult, RetentionType,
};
use drilldown_core::builder::{build_query, set_comparison, BreakdownItem, MetricItem};
use drilldown_core::error::{DrilldownError, DrilldownResult, ValidationError, ValidationWarning};
use drilldown_core::executor::{DryRunResult, QueryExecutor};
use drilldown_core::filter::{self, FilterNode};
use drilldown_core::flow_query::{FlowOutputMode, FlowStartingStep, JoinStrategy, ServerFlowQuery};
use drilldown_core::query::SortDirection;
use drilldown_core::time::{DateRange, Granularity};
use drilldown_core::{AppConfig, Query, Row};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::scheduler::{ExecutionScheduler, ExecutionSnapshot};
use crate::state_machine::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Query,
    Funnel,
    Flow,
    Retention,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Query => "query",
            AnalysisMode::Funnel => "funnel",
            AnalysisMode::Flow => "flow",
            AnalysisMode::Retention => "retention",
        }
    }
}

/// One query tab as edited in the builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTab {
    #[serde(default)]
    pub metrics: Vec<MetricItem>,
    #[serde(default)]
    pub breakdowns: Vec<BreakdownItem>,
    #[serde(default)]
    pub filters: Vec<FilterNode>,
    #[serde(default)]
    pub order: Vec<(String, SortDirection)>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl QueryTab {
    pub fn build(&self) -> Query {
        let mut query = build_query(&self.metrics, &self.breakdowns, &self.filters, &self.order);
        query.limit = self.limit;
        query
    }
}

/// Plain query mode. Becomes multi-query mode once two or more tabs build
/// valid queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModeConfig {
    #[serde(default = "default_tabs")]
    pub tabs: Vec<QueryTab>,
    #[serde(default)]
    pub active_tab: usize,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub merge_keys: Vec<String>,
    #[serde(default)]
    pub query_labels: Vec<String>,
}

fn default_tabs() -> Vec<QueryTab> {
    vec![QueryTab::default()]
}

impl Default for QueryModeConfig {
    fn default() -> Self {
        Self {
            tabs: default_tabs(),
            active_tab: 0,
            merge_strategy: MergeStrategy::default(),
            merge_keys: Vec::new(),
            query_labels: Vec::new(),
        }
    }
}

impl QueryModeConfig {
    pub fn multi_query_config(&self) -> MultiQueryConfig {
        MultiQueryConfig {
            queries: self.tabs.iter().map(QueryTab::build).collect(),
            merge_strategy: self.merge_strategy,
            merge_keys: self.merge_keys.clone(),
            query_labels: self.query_labels.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnalysisConfig {
    Query(QueryModeConfig),
    Funnel(FunnelConfig),
    Flow(FlowConfig),
    Retention(RetentionConfig),
}

impl AnalysisConfig {
    pub fn default_for(mode: AnalysisMode, settings: &AppConfig) -> Self {
        match mode {
            AnalysisMode::Query => AnalysisConfig::Query(QueryModeConfig::default()),
            AnalysisMode::Funnel => AnalysisConfig::Funnel(FunnelConfig {
                binding_key_limit: settings.funnel.binding_key_limit,
                count_unique: settings.funnel.count_unique,
                ..FunnelConfig::default()
            }),
            AnalysisMode::Flow => AnalysisConfig::Flow(FlowConfig::from_defaults(&settings.flow)),
            AnalysisMode::Retention => {
                AnalysisConfig::Retention(RetentionConfig::from_defaults(&settings.retention))
            }
        }
    }

    pub fn mode(&self) -> AnalysisMode {
        match self {
            AnalysisConfig::Query(_) => AnalysisMode::Query,
            AnalysisConfig::Funnel(_) => AnalysisMode::Funnel,
            AnalysisConfig::Flow(_) => AnalysisMode::Flow,
            AnalysisConfig::Retention(_) => AnalysisMode::Retention,
        }
    }

    /// Blocking problems; execution only happens when this is empty.
    pub fn validation_errors(&self) -> Vec<ValidationError> {
        match self {
            AnalysisConfig::Query(config) => {
                let multi = config.multi_query_config();
                if multi.active_queries().is_empty() {
                    vec![ValidationError::EmptyQuery {
                        label: multi.label(config.active_tab),
                    }]
                } else if is_multi_query_mode(&multi) {
                    validate_multi_query(&multi)
                } else {
                    Vec::new()
                }
            }
            AnalysisConfig::Funnel(config) => validate_funnel(config),
            AnalysisConfig::Flow(config) => validate_flow(config),
            AnalysisConfig::Retention(config) => validate_retention(config),
        }
    }

    pub fn validation_warnings(&self) -> Vec<ValidationWarning> {
        match self {
            AnalysisConfig::Retention(config) => retention_warnings(config),
            _ => Vec::new(),
        }
    }

    /// The query objects this configuration produces, for inspection.
    pub fn built_queries(&self) -> DrilldownResult<BuiltQueries> {
        Ok(match self {
            AnalysisConfig::Query(config) => {
                let multi = config.multi_query_config();
                BuiltQueries::Query {
                    multi_query: is_multi_query_mode(&multi),
                    queries: multi.active_queries().into_iter().map(|(_, _, q)| q.clone()).collect(),
                }
            }
            AnalysisConfig::Funnel(config) => BuiltQueries::Funnel {
                steps: (0..config.steps.len())
                    .map(|i| build_step_query(config, i, None))
                    .collect::<DrilldownResult<Vec<_>>>()?,
            },
            AnalysisConfig::Flow(config) => BuiltQueries::Flow {
                query: build_flow_query(config),
            },
            AnalysisConfig::Retention(config) => BuiltQueries::Retention {
                cohort: build_cohort_query(config)?,
                activity: build_activity_query(config)?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BuiltQueries {
    #[serde(rename_all = "camelCase")]
    Query { queries: Vec<Query>, multi_query: bool },
    /// Steps after the first carry an empty binding-key restriction until
    /// the previous step has run.
    Funnel { steps: Vec<Query> },
    Flow { query: Option<ServerFlowQuery> },
    Retention { cohort: Query, activity: Query },
}

impl BuiltQueries {
    /// Plain queries that can be sent to `dry_run`.
    pub fn plain_queries(&self) -> Vec<&Query> {
        match self {
            BuiltQueries::Query { queries, .. } => queries.iter().collect(),
            BuiltQueries::Funnel { steps } => steps.iter().collect(),
            BuiltQueries::Flow { .. } => Vec::new(),
            BuiltQueries::Retention { cohort, activity } => vec![cohort, activity],
        }
    }
}

/// Chart-ready output of the latest successful execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnalysisOutput {
    Query {
        label: String,
        query: Query,
        rows: Vec<Row>,
    },
    MultiQuery(MultiQueryResult),
    Funnel(FunnelResult),
    Flow(FlowGraph),
    Retention(RetentionResult),
}

async fn run(
    executor: Arc<dyn QueryExecutor>,
    config: AnalysisConfig,
    progress: Arc<DashMap<String, QueryProgress>>,
) -> DrilldownResult<AnalysisOutput> {
    metrics::counter!("drilldown.session.runs", "mode" => config.mode().as_str()).increment(1);
    match config {
        AnalysisConfig::Query(config) => {
            let multi = config.multi_query_config();
            if is_multi_query_mode(&multi) {
                let engine = MultiQueryEngine::with_progress(executor, progress);
                return Ok(AnalysisOutput::MultiQuery(engine.execute(&multi).await?));
            }
            let (label, query) = multi
                .active_queries()
                .into_iter()
                .next()
                .map(|(_, label, query)| (label, query.clone()))
                .ok_or_else(|| ValidationError::EmptyQuery {
                    label: multi.label(config.active_tab),
                })?;

            progress.insert(label.clone(), QueryProgress::Loading);
            match executor.execute(&query).await {
                Ok(result) => {
                    progress.insert(
                        label.clone(),
                        QueryProgress::Success {
                            row_count: result.rows.len(),
                        },
                    );
                    Ok(AnalysisOutput::Query {
                        label,
                        query,
                        rows: result.rows,
                    })
                }
                Err(e) => {
                    progress.insert(
                        label,
                        QueryProgress::Error {
                            message: e.to_string(),
                        },
                    );
                    Err(e)
                }
            }
        }
        AnalysisConfig::Funnel(config) => Ok(AnalysisOutput::Funnel(
            FunnelEngine::new(executor).execute(&config).await?,
        )),
        AnalysisConfig::Flow(config) => Ok(AnalysisOutput::Flow(
            FlowEngine::new(executor).execute(&config).await?,
        )),
        AnalysisConfig::Retention(config) => Ok(AnalysisOutput::Retention(
            RetentionEngine::new(executor).execute(&config).await?,
        )),
    }
}

fn wrong_mode(expected: AnalysisMode, actual: AnalysisMode) -> DrilldownError {
    DrilldownError::Config(format!(
        "session is in {} mode, not {} mode",
        actual.as_str(),
        expected.as_str()
    ))
}

/// Owns the active analysis configuration and its execution state. Setters
/// must be called from within a tokio runtime.
pub struct AnalysisSession {
    executor: Arc<dyn QueryExecutor>,
    settings: AppConfig,
    config: AnalysisConfig,
    scheduler: ExecutionScheduler<AnalysisOutput>,
    /// Progress of the most recently scheduled run. Each run writes into its
    /// own map, so a superseded run can never touch the visible one.
    progress: RwLock<Arc<DashMap<String, QueryProgress>>>,
}

impl std::fmt::Debug for AnalysisSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisSession")
            .field("mode", &self.config.mode())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl AnalysisSession {
    pub fn new(executor: Arc<dyn QueryExecutor>, settings: AppConfig) -> Self {
        let scheduler = ExecutionScheduler::new(Duration::from_millis(settings.scheduler.debounce_ms));
        Self {
            executor,
            config: AnalysisConfig::default_for(AnalysisMode::Query, &settings),
            settings,
            scheduler,
            progress: RwLock::new(Arc::new(DashMap::new())),
        }
    }

    /// Starts from an existing configuration without scheduling anything.
    pub fn with_config(
        executor: Arc<dyn QueryExecutor>,
        settings: AppConfig,
        config: AnalysisConfig,
    ) -> Self {
        let mut session = Self::new(executor, settings);
        session.config = config;
        session
    }

    pub fn mode(&self) -> AnalysisMode {
        self.config.mode()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn validation_errors(&self) -> Vec<ValidationError> {
        self.config.validation_errors()
    }

    pub fn validation_warnings(&self) -> Vec<ValidationWarning> {
        self.config.validation_warnings()
    }

    pub fn built_queries(&self) -> DrilldownResult<BuiltQueries> {
        self.config.built_queries()
    }

    // ─── Execution state ────────────────────────────────────────────────

    pub fn status(&self) -> ExecutionStatus {
        self.scheduler.status()
    }

    pub fn output(&self) -> Option<AnalysisOutput> {
        self.scheduler.output()
    }

    pub fn error(&self) -> Option<String> {
        self.scheduler.error()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot<AnalysisOutput> {
        self.scheduler.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.scheduler.subscribe()
    }

    pub async fn settled(&self) -> ExecutionSnapshot<AnalysisOutput> {
        self.scheduler.settled().await
    }

    pub fn query_progress(&self, label: &str) -> Option<QueryProgress> {
        self.progress.read().get(label).map(|p| p.value().clone())
    }

    /// Installs an empty progress map for a new run and returns it.
    fn reset_progress(&self) -> Arc<DashMap<String, QueryProgress>> {
        let progress = Arc::new(DashMap::new());
        *self.progress.write() = progress.clone();
        progress
    }

    /// Compiled SQL for every plain query the configuration builds.
    pub async fn dry_run(&self) -> DrilldownResult<Vec<DryRunResult>> {
        let built = self.built_queries()?;
        let mut out = Vec::new();
        for query in built.plain_queries() {
            out.push(self.executor.dry_run(query).await?);
        }
        Ok(out)
    }

    fn reschedule(&self) {
        let errors = self.validation_errors();
        if !errors.is_empty() {
            debug!(mode = self.mode().as_str(), errors = errors.len(), "Configuration not executable");
            self.reset_progress();
            self.scheduler.clear();
            return;
        }
        let executor = self.executor.clone();
        let config = self.config.clone();
        let progress = self.reset_progress();
        let generation = self
            .scheduler
            .schedule(move || run(executor, config, progress));
        debug!(mode = self.mode().as_str(), generation, "Execution scheduled");
    }

    // ─── Mode ───────────────────────────────────────────────────────────

    /// Switches mode, starting from that mode's defaults.
    pub fn set_mode(&mut self, mode: AnalysisMode) {
        if mode == self.mode() {
            return;
        }
        info!(from = self.mode().as_str(), to = mode.as_str(), "Switching analysis mode");
        self.config = AnalysisConfig::default_for(mode, &self.settings);
        self.reset_progress();
        self.scheduler.clear();
    }

    /// Replaces the whole configuration.
    pub fn load(&mut self, config: AnalysisConfig) {
        self.config = config;
        self.reschedule();
    }

    /// Resets the current mode to its defaults and drops all results.
    pub fn clear_mode(&mut self) {
        self.config = AnalysisConfig::default_for(self.mode(), &self.settings);
        self.reset_progress();
        self.scheduler.clear();
    }

    // ─── Query mode ─────────────────────────────────────────────────────

    fn edit_query_mode<R>(&mut self, edit: impl FnOnce(&mut QueryModeConfig) -> R) -> DrilldownResult<R> {
        let actual = self.mode();
        let AnalysisConfig::Query(config) = &mut self.config else {
            return Err(wrong_mode(AnalysisMode::Query, actual));
        };
        let out = edit(config);
        self.reschedule();
        Ok(out)
    }

    fn edit_active_tab(&mut self, edit: impl FnOnce(&mut QueryTab)) -> DrilldownResult<()> {
        self.edit_query_mode(|config| {
            let index = config.active_tab.min(config.tabs.len().saturating_sub(1));
            if let Some(tab) = config.tabs.get_mut(index) {
                edit(tab);
            }
        })
    }

    pub fn set_metrics(&mut self, metrics: Vec<MetricItem>) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.metrics = metrics)
    }

    pub fn set_breakdowns(&mut self, breakdowns: Vec<BreakdownItem>) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.breakdowns = breakdowns)
    }

    /// Enabling comparison on one time breakdown disables it on the others.
    pub fn set_comparison(&mut self, index: usize, enabled: bool) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.breakdowns = set_comparison(&tab.breakdowns, index, enabled))
    }

    pub fn set_filters(&mut self, filters: Vec<FilterNode>) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.filters = filter::canonicalize(&filters))
    }

    pub fn add_filter(&mut self, path: &[usize], node: FilterNode) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.filters = filter::add_at_path(&tab.filters, path, node))
    }

    pub fn remove_filter(&mut self, path: &[usize]) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.filters = filter::remove_at_path(&tab.filters, path))
    }

    pub fn replace_filter(&mut self, path: &[usize], node: FilterNode) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.filters = filter::replace_at_path(&tab.filters, path, node))
    }

    pub fn toggle_filter_group(&mut self, path: &[usize]) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.filters = filter::toggle_group_type(&tab.filters, path))
    }

    pub fn set_order(&mut self, order: Vec<(String, SortDirection)>) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.order = order)
    }

    pub fn set_limit(&mut self, limit: Option<u32>) -> DrilldownResult<()> {
        self.edit_active_tab(|tab| tab.limit = limit)
    }

    /// Appends an empty tab, makes it active and returns its index.
    pub fn add_query_tab(&mut self) -> DrilldownResult<usize> {
        self.edit_query_mode(|config| {
            config.tabs.push(QueryTab::default());
            config.active_tab = config.tabs.len() - 1;
            config.active_tab
        })
    }

    pub fn remove_query_tab(&mut self, index: usize) -> DrilldownResult<()> {
        self.edit_query_mode(|config| {
            if index < config.tabs.len() && config.tabs.len() > 1 {
                config.tabs.remove(index);
                if index < config.query_labels.len() {
                    config.query_labels.remove(index);
                }
                config.active_tab = config.active_tab.min(config.tabs.len() - 1);
            }
        })
    }

    /// Changes which tab the query setters edit. Does not re-execute.
    pub fn select_query_tab(&mut self, index: usize) -> DrilldownResult<()> {
        let actual = self.mode();
        let AnalysisConfig::Query(config) = &mut self.config else {
            return Err(wrong_mode(AnalysisMode::Query, actual));
        };
        if index >= config.tabs.len() {
            return Err(DrilldownError::Config(format!("no query tab {index}")));
        }
        config.active_tab = index;
        Ok(())
    }

    pub fn set_merge_strategy(&mut self, strategy: MergeStrategy) -> DrilldownResult<()> {
        self.edit_query_mode(|config| config.merge_strategy = strategy)
    }

    pub fn set_merge_keys(&mut self, keys: Vec<String>) -> DrilldownResult<()> {
        self.edit_query_mode(|config| config.merge_keys = keys)
    }

    pub fn set_query_labels(&mut self, labels: Vec<String>) -> DrilldownResult<()> {
        self.edit_query_mode(|config| config.query_labels = labels)
    }

    // ─── Funnel mode ────────────────────────────────────────────────────

    fn edit_funnel<R>(&mut self, edit: impl FnOnce(&mut FunnelConfig) -> R) -> DrilldownResult<R> {
        let actual = self.mode();
        let AnalysisConfig::Funnel(config) = &mut self.config else {
            return Err(wrong_mode(AnalysisMode::Funnel, actual));
        };
        let out = edit(config);
        self.reschedule();
        Ok(out)
    }

    pub fn set_funnel_binding_key(&mut self, key: Option<BindingKey>) -> DrilldownResult<()> {
        self.edit_funnel(|config| config.binding_key = key)
    }

    pub fn add_funnel_step(&mut self, step: FunnelStep) -> DrilldownResult<()> {
        self.edit_funnel(|config| config.steps.push(step))
    }

    pub fn update_funnel_step(&mut self, index: usize, step: FunnelStep) -> DrilldownResult<()> {
        self.edit_funnel(|config| {
            if let Some(slot) = config.steps.get_mut(index) {
                *slot = step;
            }
        })
    }

    pub fn remove_funnel_step(&mut self, index: usize) -> DrilldownResult<()> {
        self.edit_funnel(|config| {
            if index < config.steps.len() {
                config.steps.remove(index);
            }
        })
    }

    pub fn move_funnel_step(&mut self, from: usize, to: usize) -> DrilldownResult<()> {
        self.edit_funnel(|config| {
            if from < config.steps.len() && to < config.steps.len() {
                let step = config.steps.remove(from);
                config.steps.insert(to, step);
            }
        })
    }

    pub fn set_binding_key_limit(&mut self, limit: usize) -> DrilldownResult<()> {
        self.edit_funnel(|config| config.binding_key_limit = limit.max(1))
    }

    pub fn set_count_unique(&mut self, count_unique: bool) -> DrilldownResult<()> {
        self.edit_funnel(|config| config.count_unique = count_unique)
    }

    // ─── Flow mode ──────────────────────────────────────────────────────

    fn edit_flow<R>(&mut self, edit: impl FnOnce(&mut FlowConfig) -> R) -> DrilldownResult<R> {
        let actual = self.mode();
        let AnalysisConfig::Flow(config) = &mut self.config else {
            return Err(wrong_mode(AnalysisMode::Flow, actual));
        };
        let out = edit(config);
        self.reschedule();
        Ok(out)
    }

    pub fn set_flow_cube(&mut self, cube: Option<String>) -> DrilldownResult<()> {
        self.edit_flow(|config| config.cube = cube)
    }

    pub fn set_flow_binding_key(&mut self, binding_key: Option<String>) -> DrilldownResult<()> {
        self.edit_flow(|config| config.binding_key = binding_key)
    }

    pub fn set_flow_time_dimension(&mut self, dimension: Option<String>) -> DrilldownResult<()> {
        self.edit_flow(|config| config.time_dimension = dimension)
    }

    pub fn set_flow_event_dimension(&mut self, dimension: Option<String>) -> DrilldownResult<()> {
        self.edit_flow(|config| config.event_dimension = dimension)
    }

    pub fn set_flow_starting_step(&mut self, step: FlowStartingStep) -> DrilldownResult<()> {
        self.edit_flow(|config| config.starting_step = step)
    }

    /// Returns the clamped depth actually stored.
    pub fn set_flow_steps_before(&mut self, requested: i64) -> DrilldownResult<u32> {
        self.edit_flow(|config| config.set_steps_before(requested))
    }

    pub fn set_flow_steps_after(&mut self, requested: i64) -> DrilldownResult<u32> {
        self.edit_flow(|config| config.set_steps_after(requested))
    }

    pub fn set_flow_output_mode(&mut self, mode: FlowOutputMode) -> DrilldownResult<()> {
        self.edit_flow(|config| config.set_output_mode(mode))
    }

    pub fn set_flow_join_strategy(&mut self, strategy: JoinStrategy) -> DrilldownResult<()> {
        self.edit_flow(|config| config.join_strategy = strategy)
    }

    pub fn set_flow_event_filters(&mut self, filters: Vec<FilterNode>) -> DrilldownResult<()> {
        self.edit_flow(|config| config.event_filters = filters)
    }

    // ─── Retention mode ─────────────────────────────────────────────────

    fn edit_retention<R>(&mut self, edit: impl FnOnce(&mut RetentionConfig) -> R) -> DrilldownResult<R> {
        let actual = self.mode();
        let AnalysisConfig::Retention(config) = &mut self.config else {
            return Err(wrong_mode(AnalysisMode::Retention, actual));
        };
        let out = edit(config);
        self.reschedule();
        Ok(out)
    }

    pub fn set_retention_cube(&mut self, cube: Option<String>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.cube = cube)
    }

    pub fn set_retention_binding_key(&mut self, binding_key: Option<String>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.binding_key = binding_key)
    }

    pub fn set_retention_time_dimension(&mut self, dimension: Option<String>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.time_dimension = dimension)
    }

    pub fn set_retention_date_range(&mut self, range: Option<DateRange>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.date_range = range)
    }

    pub fn set_retention_cohort_filters(&mut self, filters: Vec<FilterNode>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.cohort_filters = filters)
    }

    pub fn set_retention_activity_filters(&mut self, filters: Vec<FilterNode>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.activity_filters = filters)
    }

    pub fn set_retention_granularity(&mut self, granularity: Granularity) -> DrilldownResult<()> {
        self.edit_retention(|config| config.granularity = granularity)
    }

    /// Returns the clamped period count actually stored.
    pub fn set_retention_periods(&mut self, requested: i64) -> DrilldownResult<u32> {
        self.edit_retention(|config| config.set_periods(requested))
    }

    pub fn set_retention_type(&mut self, retention_type: RetentionType) -> DrilldownResult<()> {
        self.edit_retention(|config| config.retention_type = retention_type)
    }

    pub fn set_retention_breakdowns(&mut self, breakdowns: Vec<String>) -> DrilldownResult<()> {
        self.edit_retention(|config| config.breakdowns = breakdowns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drilldown_core::executor::{rows_from_json, CaptureExecutor};
    use serde_json::json;

    fn session_with(executor: Arc<CaptureExecutor>) -> AnalysisSession {
        AnalysisSession::new(executor, AppConfig::default())
    }

    fn region_rows() -> Arc<CaptureExecutor> {
        Arc::new(CaptureExecutor::new(|_| {
            rows_from_json(json!([{"Orders.region": "US", "Orders.count": 5}]))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_setters_debounce_into_one_execution() {
        let executor = region_rows();
        let mut session = session_with(executor.clone());
        session.set_metrics(vec![MetricItem::new("Orders.count")]).unwrap();
        session
            .set_breakdowns(vec![BreakdownItem::dimension("Orders.region")])
            .unwrap();
        session.set_limit(Some(10)).unwrap();
        assert_eq!(session.status(), ExecutionStatus::Debouncing);

        let snapshot = session.settled().await;
        assert_eq!(snapshot.status, ExecutionStatus::Success);
        assert_eq!(executor.count(), 1);
        let sent = &executor.queries()[0];
        assert_eq!(sent.dimensions, vec!["Orders.region"]);
        assert_eq!(sent.limit, Some(10));
        assert!(matches!(snapshot.output, Some(AnalysisOutput::Query { ref rows, .. }) if rows.len() == 1));
        assert_eq!(
            session.query_progress("Query 1"),
            Some(QueryProgress::Success { row_count: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors_block_execution() {
        let executor = Arc::new(CaptureExecutor::empty());
        let mut session = session_with(executor.clone());
        assert!(matches!(
            session.validation_errors().as_slice(),
            [ValidationError::EmptyQuery { .. }]
        ));

        session.set_mode(AnalysisMode::Funnel);
        session
            .set_funnel_binding_key(Some(BindingKey::single("Events.userId")))
            .unwrap();
        session
            .add_funnel_step(FunnelStep::new(
                "Signup",
                Query {
                    measures: vec!["Events.count".into()],
                    ..Default::default()
                },
            ))
            .unwrap();
        assert_eq!(
            session.validation_errors(),
            vec![ValidationError::TooFewFunnelSteps(1)]
        );
        assert_eq!(session.status(), ExecutionStatus::Idle);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_valid_tabs_switch_to_multi_query() {
        let executor = region_rows();
        let mut session = session_with(executor.clone());
        session.set_metrics(vec![MetricItem::new("Orders.count")]).unwrap();
        session.add_query_tab().unwrap();
        // an empty placeholder tab keeps single-query mode
        assert!(matches!(
            session.built_queries().unwrap(),
            BuiltQueries::Query { multi_query: false, .. }
        ));
        session.set_metrics(vec![MetricItem::new("Orders.total")]).unwrap();
        session.set_query_labels(vec!["Count".into(), "Total".into()]).unwrap();

        let snapshot = session.settled().await;
        match snapshot.output {
            Some(AnalysisOutput::MultiQuery(result)) => {
                assert_eq!(result.members.len(), 2);
                assert_eq!(result.rows.len(), 2);
            }
            other => panic!("unexpected output {other:?}"),
        }
        assert_eq!(executor.count(), 2);
        assert!(session.query_progress("Total").is_some());
    }

    struct SlowExecutor;

    #[async_trait::async_trait]
    impl QueryExecutor for SlowExecutor {
        async fn execute(&self, _query: &Query) -> DrilldownResult<drilldown_core::executor::QueryResult> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(drilldown_core::executor::QueryResult {
                rows: rows_from_json(json!([{"Orders.count": 1}]))?,
            })
        }

        async fn dry_run(&self, query: &Query) -> DrilldownResult<DryRunResult> {
            CaptureExecutor::empty().dry_run(query).await
        }

        async fn load_flow_layer(
            &self,
            _request: &drilldown_core::flow_query::FlowLayerRequest,
        ) -> DrilldownResult<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_mode_hides_progress_of_in_flight_run() {
        let mut session = AnalysisSession::new(Arc::new(SlowExecutor), AppConfig::default());
        session.set_metrics(vec![MetricItem::new("Orders.count")]).unwrap();
        session.add_query_tab().unwrap();
        session.set_metrics(vec![MetricItem::new("Orders.total")]).unwrap();

        // past the debounce window, both members in flight
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.query_progress("Query 1"), Some(QueryProgress::Loading));

        session.clear_mode();
        assert!(session.query_progress("Query 1").is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.status(), ExecutionStatus::Idle);
        assert!(session.output().is_none());
        assert!(session.query_progress("Query 1").is_none());
        assert!(session.query_progress("Query 2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_replaces_progress_of_superseded_run() {
        let mut session = AnalysisSession::new(Arc::new(SlowExecutor), AppConfig::default());
        session.set_metrics(vec![MetricItem::new("Orders.count")]).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.query_progress("Query 1"), Some(QueryProgress::Loading));

        session.set_limit(Some(5)).unwrap();
        assert!(session.query_progress("Query 1").is_none());

        // the first run resolves while the second is still running
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(session.query_progress("Query 1"), Some(QueryProgress::Loading));

        session.settled().await;
        assert_eq!(
            session.query_progress("Query 1"),
            Some(QueryProgress::Success { row_count: 1 })
        );
    }

    #[tokio::test]
    async fn test_setter_for_wrong_mode_is_rejected() {
        let mut session = session_with(Arc::new(CaptureExecutor::empty()));
        let err = session.set_flow_steps_before(2).unwrap_err();
        assert!(err.to_string().contains("query mode"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_setters_clamp() {
        let mut session = session_with(Arc::new(CaptureExecutor::empty()));
        session.set_mode(AnalysisMode::Flow);
        assert_eq!(session.set_flow_steps_before(-1).unwrap(), 0);
        assert_eq!(session.set_flow_steps_before(10).unwrap(), 5);
        session.set_flow_output_mode(FlowOutputMode::Sunburst).unwrap();
        // still missing fields, nothing is built
        assert!(matches!(
            session.built_queries().unwrap(),
            BuiltQueries::Flow { query: None }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_periods_warning() {
        let mut session = session_with(Arc::new(CaptureExecutor::empty()));
        session.set_mode(AnalysisMode::Retention);
        assert_eq!(session.set_retention_periods(40).unwrap(), 40);
        assert_eq!(
            session.validation_warnings(),
            vec![ValidationWarning::LargeRetentionWindow { periods: 40 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_and_clear_mode() {
        let executor = region_rows();
        let mut session = session_with(executor.clone());
        session.set_metrics(vec![MetricItem::new("Orders.count")]).unwrap();
        let dry = session.dry_run().await.unwrap();
        assert_eq!(dry.len(), 1);
        assert!(dry[0].sql.contains("Orders.count"));

        session.settled().await;
        assert!(session.output().is_some());
        session.clear_mode();
        assert_eq!(session.status(), ExecutionStatus::Idle);
        assert!(session.output().is_none());
        assert_eq!(session.config(), &AnalysisConfig::Query(QueryModeConfig::default()));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config: AnalysisConfig = serde_json::from_value(json!({
            "mode": "funnel",
            "bindingKey": {"dimension": "Events.userId"},
            "steps": [
                {"name": "Signup", "query": {"measures": ["Events.count"]}},
                {"name": "Buy", "query": {"measures": ["Events.count"]}, "timeToConvert": "P7D", "timeDimension": "Events.ts"}
            ]
        }))
        .unwrap();
        assert_eq!(config.mode(), AnalysisMode::Funnel);
        assert!(config.validation_errors().is_empty());
        match config.built_queries().unwrap() {
            BuiltQueries::Funnel { steps } => assert_eq!(steps.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
