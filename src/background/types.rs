//! 后台执行类型

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invoker::{InvocationOptions, InvocationResult};

/// 执行 ID
pub type ExecutionId = String;

/// 优先级：Critical > High > Medium > Low > Background
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Background => "background",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// 等待出队
    Queued,
    /// 正在执行
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 单次后台执行
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundExecution {
    pub id: ExecutionId,
    pub role: String,
    pub task: String,
    pub options: InvocationOptions,
    pub priority: Priority,
    pub status: ExecutionStatus,
    /// 0-100，仅 watched 模式有意义
    pub progress: u8,
    pub result: Option<InvocationResult>,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl BackgroundExecution {
    pub fn new(role: &str, task: &str, options: InvocationOptions, priority: Priority) -> Self {
        Self {
            id: format!("exec_{}", uuid::Uuid::new_v4()),
            role: role.to_string(),
            task: task.to_string(),
            options,
            priority,
            status: ExecutionStatus::Queued,
            progress: 0,
            result: None,
            error: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 聚合报告中的单个角色结果
#[derive(Debug, Clone, Serialize)]
pub struct RoleOutcome {
    pub role: String,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub result: Option<InvocationResult>,
    pub duration_ms: u64,
}

/// 多角色执行的聚合报告
#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    /// 所有成功结果在比较器意义下等价
    pub consistent: bool,
    /// 按请求顺序
    pub outcomes: Vec<RoleOutcome>,
}

/// 执行器状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStatus {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub throttled: bool,
}
