//! 决策相关类型

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invoker::{InvocationOptions, InvocationResult};

/// 自治级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingLevel {
    FullyAutomatic,
    AutomaticWithNotification,
    AutomaticWithPreview,
    RequireApproval,
}

impl RoutingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingLevel::FullyAutomatic => "fully_automatic",
            RoutingLevel::AutomaticWithNotification => "automatic_with_notification",
            RoutingLevel::AutomaticWithPreview => "automatic_with_preview",
            RoutingLevel::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for RoutingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Approved => "approved",
            DecisionStatus::Rejected => "rejected",
        }
    }
}

/// 五个归一化因子（均在 [0, 1]）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    /// 同 (role, action) 的历史成功率
    pub history: f64,
    /// 前置验证强度
    pub validation: f64,
    pub coverage: f64,
    /// 角色整体准确率
    pub accuracy: f64,
    /// 1 - 复杂度
    pub simplicity: f64,
}

/// 一次决策。status 离开 pending 后只允许附加 result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub role: String,
    pub action: String,
    pub context: InvocationOptions,
    pub confidence: f64,
    pub factors: ConfidenceFactors,
    pub level: RoutingLevel,
    pub status: DecisionStatus,
    pub result: Option<InvocationResult>,
    /// 被拒绝（审批拒绝、预览取消、审批超时）的原因
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Decision {
    /// 已执行且角色调用成功
    pub fn succeeded(&self) -> bool {
        self.status == DecisionStatus::Approved
            && self.result.as_ref().map(|r| r.success).unwrap_or(false)
    }

    pub fn executed(&self) -> bool {
        self.result.is_some()
    }
}

/// 等待审批的决策摘要
#[derive(Debug, Clone, Serialize)]
pub struct PendingApprovalInfo {
    pub decision_id: String,
    pub role: String,
    pub action: String,
    pub confidence: f64,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoProceedCheck {
    pub can_proceed: bool,
    pub unmet: Vec<String>,
}

/// 决策统计（基于有界历史）
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStatistics {
    pub total: usize,
    pub by_level: BTreeMap<RoutingLevel, usize>,
    pub approved: usize,
    pub rejected: usize,
    pub approval_rate: f64,
    /// 已执行决策中角色调用成功的比例
    pub success_rate: f64,
    pub average_confidence: f64,
}
