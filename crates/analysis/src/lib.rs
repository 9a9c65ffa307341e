//! Analysis engines — funnel, flow, retention and multi-query execution
//! against a [`drilldown_core::QueryExecutor`].

pub mod binding;
pub mod flow;
pub mod funnel;
pub mod merge;
pub mod retention;

pub use binding::{BindingKey, CubeBinding};
pub use flow::{FlowConfig, FlowEngine, FlowGraph};
pub use funnel::{FunnelConfig, FunnelEngine, FunnelResult, FunnelStatus, FunnelStep};
pub use merge::{MergeStrategy, MultiQueryConfig, MultiQueryEngine, MultiQueryResult, QueryProgress};
pub use retention::{RetentionConfig, RetentionEngine, RetentionResult, RetentionType};
