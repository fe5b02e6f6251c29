//! 协作类型

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::invoker::{InvocationOptions, InvocationResult};

/// 协作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollaborationMode {
    Sequential,
    Parallel,
    Collaborative,
    Competitive,
    DependencyOrdered,
}

impl CollaborationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaborationMode::Sequential => "sequential",
            CollaborationMode::Parallel => "parallel",
            CollaborationMode::Collaborative => "collaborative",
            CollaborationMode::Competitive => "competitive",
            CollaborationMode::DependencyOrdered => "dependency-ordered",
        }
    }
}

impl fmt::Display for CollaborationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollaborationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "collaborative" => Ok(Self::Collaborative),
            "competitive" => Ok(Self::Competitive),
            "dependency-ordered" => Ok(Self::DependencyOrdered),
            other => Err(format!("unknown collaboration mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantResult {
    pub role: String,
    pub result: InvocationResult,
}

/// 竞争模式中被评分的方案
#[derive(Debug, Clone, Serialize)]
pub struct ScoredSolution {
    pub role: String,
    pub result: InvocationResult,
    pub authority_score: f64,
    pub secondary_score: f64,
    /// 加权总分
    pub score: f64,
}

/// 一次协作的结果；按模式填充相应字段
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationOutcome {
    pub id: String,
    pub mode: CollaborationMode,
    pub participants: Vec<String>,
    pub task: String,
    pub success: bool,
    /// 按参与者请求顺序（依赖有序模式下按层级顺序）
    pub results: Vec<ParticipantResult>,
    pub failures: Vec<ParticipantResult>,
    /// 顺序模式中止时失败的参与者
    pub failed_participant: Option<String>,
    /// 中止前已收集的结果数
    pub completed: usize,
    /// 竞争模式：成功方案按得分降序
    pub solutions: Vec<ScoredSolution>,
    pub winner: Option<String>,
    /// 依赖有序模式的分层
    pub levels: Vec<Vec<String>>,
    /// 依赖有序模式中失败的层级
    pub failed_level: Option<usize>,
    /// 顺序模式的最终输出
    pub output: Option<Value>,
    pub duration_ms: u64,
}

impl CollaborationOutcome {
    pub(crate) fn new(id: String, mode: CollaborationMode, participants: &[String], task: &str) -> Self {
        Self {
            id,
            mode,
            participants: participants.to_vec(),
            task: task.to_string(),
            success: false,
            results: Vec::new(),
            failures: Vec::new(),
            failed_participant: None,
            completed: 0,
            solutions: Vec::new(),
            winner: None,
            levels: Vec::new(),
            failed_level: None,
            output: None,
            duration_ms: 0,
        }
    }
}

/// 写入协作历史的摘要
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationSummary {
    pub id: String,
    pub mode: CollaborationMode,
    pub participants: Vec<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// 每种模式的成功统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatternStats {
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

/// 冲突中的候选角色；context 中的 `confidence` 用于同优先级排序
#[derive(Debug, Clone, Serialize)]
pub struct ConflictCandidate {
    pub role: String,
    pub context: InvocationOptions,
}

impl ConflictCandidate {
    pub fn new(role: impl Into<String>, context: InvocationOptions) -> Self {
        Self {
            role: role.into(),
            context,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.context
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub issue: String,
    pub candidates: Vec<ConflictCandidate>,
}

/// 冲突解决结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Resolved {
        winner: String,
        justification: String,
        confidence: f64,
        analysis: Option<Value>,
    },
    /// 交给外部决策者
    Escalated {
        reason: String,
        candidates: Vec<String>,
    },
}

impl Resolution {
    pub fn winner(&self) -> Option<&str> {
        match self {
            Resolution::Resolved { winner, .. } => Some(winner),
            Resolution::Escalated { .. } => None,
        }
    }
}

/// 交接回执
#[derive(Debug, Clone, Serialize)]
pub struct HandoffReceipt {
    pub handoff_id: String,
    pub from: String,
    pub to: String,
    pub validated: bool,
    pub acknowledgment: Value,
    pub completed_at: DateTime<Utc>,
}
