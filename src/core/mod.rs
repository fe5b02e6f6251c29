//! 核心编排层：错误类型、编排器、构建器、优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod shutdown;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{
    ChannelError, CollaborationError, ConfigError, GraphError, HandoffError, SetupError,
    WorkflowError,
};
pub use orchestrator::{
    BlockingPredicate, Orchestrator, RecoveryOutcome, RecoveryStep, ValidationOutcome,
};
pub use shutdown::{
    run_with_graceful_shutdown, OrchestratorStopCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason, WorkflowStateCleanup,
};
