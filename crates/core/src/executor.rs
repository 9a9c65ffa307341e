//! Query execution seam — the semantic-layer API the engines run against.
//!
//! Engines accept an `Arc<dyn QueryExecutor>`; the hosting application
//! supplies the real client. No retry logic lives behind this trait.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DrilldownError, DrilldownResult};
use crate::flow_query::FlowLayerRequest;
use crate::query::{Query, Row};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
}

/// Compiled SQL plus planner analysis, for inspection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunResult {
    pub sql: String,
    pub analysis: serde_json::Value,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &Query) -> DrilldownResult<QueryResult>;

    async fn dry_run(&self, query: &Query) -> DrilldownResult<DryRunResult>;

    async fn load_flow_layer(&self, request: &FlowLayerRequest) -> DrilldownResult<Vec<Row>>;
}

/// A request seen by [`CaptureExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorRequest {
    Query(Query),
    FlowLayer(FlowLayerRequest),
}

type Responder = dyn Fn(&ExecutorRequest) -> DrilldownResult<Vec<Row>> + Send + Sync;

/// In-memory executor that records every request and answers through a
/// responder closure. Used by tests and by the CLI's offline mode.
pub struct CaptureExecutor {
    requests: Mutex<Vec<ExecutorRequest>>,
    responder: Box<Responder>,
}

impl CaptureExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ExecutorRequest) -> DrilldownResult<Vec<Row>> + Send + Sync + 'static,
    {
        Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Answers every request with zero rows.
    pub fn empty() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    pub fn requests(&self) -> Vec<ExecutorRequest> {
        self.requests.lock().clone()
    }

    /// Only the plain queries, in arrival order.
    pub fn queries(&self) -> Vec<Query> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                ExecutorRequest::Query(q) => Some(q.clone()),
                ExecutorRequest::FlowLayer(_) => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }

    fn answer(&self, request: ExecutorRequest) -> DrilldownResult<Vec<Row>> {
        let result = (self.responder)(&request);
        self.requests.lock().push(request);
        result
    }
}

#[async_trait]
impl QueryExecutor for CaptureExecutor {
    async fn execute(&self, query: &Query) -> DrilldownResult<QueryResult> {
        let rows = self.answer(ExecutorRequest::Query(query.clone()))?;
        Ok(QueryResult { rows })
    }

    async fn dry_run(&self, query: &Query) -> DrilldownResult<DryRunResult> {
        let sql = serde_json::to_string_pretty(query)?;
        Ok(DryRunResult {
            sql: format!("-- offline dry run\n{sql}"),
            analysis: serde_json::json!({
                "members": query.members(),
                "cubes": query.cubes(),
            }),
        })
    }

    async fn load_flow_layer(&self, request: &FlowLayerRequest) -> DrilldownResult<Vec<Row>> {
        self.answer(ExecutorRequest::FlowLayer(request.clone()))
    }
}

/// Convenience: a shared executor that always fails, for error-path tests.
pub fn failing_executor(message: &str) -> Arc<CaptureExecutor> {
    let message = message.to_string();
    Arc::new(CaptureExecutor::new(move |_| {
        Err(DrilldownError::Execution(message.clone()))
    }))
}

/// Parses a JSON array literal into rows.
pub fn rows_from_json(value: serde_json::Value) -> DrilldownResult<Vec<Row>> {
    Ok(serde_json::from_value(value)?)
}
