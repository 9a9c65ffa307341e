//! Analysis session store plus the debounced execution scheduler behind it.

pub mod scheduler;
pub mod session;
pub mod state_machine;

pub use scheduler::{ExecutionScheduler, ExecutionSnapshot};
pub use session::{
    AnalysisConfig, AnalysisMode, AnalysisOutput, AnalysisSession, BuiltQueries, QueryModeConfig,
    QueryTab,
};
pub use state_machine::{ExecutionStateMachine, ExecutionStatus};
