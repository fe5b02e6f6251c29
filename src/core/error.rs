//! 编排核心的错误类型
//!
//! 角色调用失败不会出现在这里：它们总是被就地收敛为 `InvocationResult { success: false, .. }`，
//! 以便编排逻辑按结果分支。这里只放基础设施错误（状态损坏、依赖成环、超时、交接失败、配置错误）。

use thiserror::Error;

/// 工作流状态机错误
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid phase: {0}")]
    InvalidPhase(String),

    #[error("Phase '{phase}' requires variant '{expected}', workflow variant is '{actual}'")]
    VariantMismatch {
        phase: String,
        expected: String,
        actual: String,
    },

    /// 自动迁移时退出条件 / 验证门 / 阻塞问题 / 人工检查点未全部满足
    #[error("Preconditions unmet for leaving '{phase}': {}", unmet.join(", "))]
    PreconditionsUnmet { phase: String, unmet: Vec<String> },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Workflow not initialized")]
    NotInitialized,

    #[error("No earlier phase to roll back to")]
    RollbackUnavailable,

    #[error("Invalid phase catalog: {0}")]
    InvalidCatalog(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 依赖图错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cyclic dependency detected at role '{role}'")]
    CycleDetected { role: String },
}

/// 消息通道错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Request to '{role}' timed out after {timeout_ms}ms")]
    Timeout { role: String, timeout_ms: u64 },

    /// 响应端在回复前被丢弃（调用任务 panic 或运行时关闭）
    #[error("Channel closed before '{role}' responded")]
    Closed { role: String },
}

/// 角色间交接错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    #[error("Handoff {handoff_id} rejected by validator: {reason}")]
    ValidationFailed { handoff_id: String, reason: String },

    #[error("Role '{role}' failed to acknowledge handoff {handoff_id}: {reason}")]
    AcknowledgmentFailed {
        handoff_id: String,
        role: String,
        reason: String,
    },
}

/// 协作执行错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaborationError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Invalid participants for {mode}: {reason}")]
    InvalidParticipants { mode: String, reason: String },
}

/// 组件配置错误（构造时校验）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Confidence weights must sum to 1.0, got {0}")]
    InvalidWeights(f64),

    #[error("Routing thresholds must be descending within [0, 1]: {0}")]
    InvalidThresholds(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 编排器装配错误
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid workflow variant: {0}")]
    InvalidVariant(String),
}
