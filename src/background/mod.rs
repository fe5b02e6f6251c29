//! 后台执行：优先级队列、并发上限、资源节流与多角色结果聚合

pub mod executor;
pub mod monitor;
pub mod queue;
pub mod types;

pub use executor::{BackgroundExecutor, Comparator};
pub use monitor::{ProcSampler, ResourceMonitor, ResourceSampler, ResourceUsage, StaticSampler};
pub use queue::ExecutionQueue;
pub use types::{
    AggregationReport, BackgroundExecution, ExecutionStatus, ExecutorStatus, Priority, RoleOutcome,
};
