//! Drilldown core — query model, filter tree, query builder, and the
//! execution seam shared by every analysis engine.

pub mod builder;
pub mod chart;
pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod flow_query;
pub mod query;
pub mod time;

pub use builder::{build_query, BreakdownItem, MetricItem, QueryBuilder};
pub use config::AppConfig;
pub use error::{DrilldownError, DrilldownResult, ValidationError, ValidationWarning};
pub use executor::{CaptureExecutor, QueryExecutor};
pub use filter::FilterNode;
pub use query::{Query, Row};
