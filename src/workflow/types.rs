//! 工作流类型定义
//!
//! 阶段定义（启动时确定、只读）、工作流实例（状态机独占）、阶段元数据与迁移历史。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 持久化文档的结构版本
pub const SCHEMA_VERSION: u32 = 1;

/// 回滚产生的历史条目的 reason 前缀
pub const ROLLBACK_REASON_PREFIX: &str = "rollback from ";

/// 工作流变体：全新项目 / 既有系统
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    Fresh,
    ExistingSystem,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Fresh => "fresh",
            Variant::ExistingSystem => "existing-system",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fresh" | "greenfield" => Ok(Variant::Fresh),
            "existing-system" | "existing" | "brownfield" => Ok(Variant::ExistingSystem),
            other => Err(format!("unknown workflow variant '{other}'")),
        }
    }
}

/// 阶段类型：通用阶段，或只属于某个变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Universal,
    VariantOnly(Variant),
}

impl PhaseKind {
    pub fn applies_to(&self, variant: Variant) -> bool {
        match self {
            PhaseKind::Universal => true,
            PhaseKind::VariantOnly(v) => *v == variant,
        }
    }
}

/// 阶段定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    pub kind: PhaseKind,
    /// 仅用于进度展示，允许 1.5 这样的插入值
    pub order: f64,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub exit_conditions: Vec<String>,
    #[serde(default)]
    pub validation_gates: Vec<String>,
    #[serde(default)]
    pub human_checkpoint: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PhaseDefinition {
    pub fn new(id: impl Into<String>, kind: PhaseKind, order: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            order,
            required_roles: Vec::new(),
            exit_conditions: Vec::new(),
            validation_gates: Vec::new(),
            human_checkpoint: None,
            description: None,
        }
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.required_roles = roles.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn exits(mut self, conditions: &[&str]) -> Self {
        self.exit_conditions = conditions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn gates(mut self, gates: &[&str]) -> Self {
        self.validation_gates = gates.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn checkpoint(mut self, name: impl Into<String>) -> Self {
        self.human_checkpoint = Some(name.into());
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// 迁移历史条目（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: Option<String>,
    pub to: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn is_rollback(&self) -> bool {
        self.reason.starts_with(ROLLBACK_REASON_PREFIX)
    }
}

/// 阻塞问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub reason: String,
    #[serde(default)]
    pub details: Value,
    pub raised_at: DateTime<Utc>,
}

/// 单个阶段的运行时元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetadata {
    pub completion_percentage: u8,
    pub exit_condition_status: BTreeMap<String, bool>,
    pub validation_gates_status: BTreeMap<String, bool>,
    pub artifacts_created: Vec<String>,
    pub blocking_issues: Vec<BlockingIssue>,
    pub blocked: bool,
    pub human_checkpoint_approved: bool,
    pub paused: bool,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseMetadata {
    /// 进入阶段时的默认元数据：所有条件与验证门为 false
    pub fn for_phase(def: &PhaseDefinition) -> Self {
        let now = Utc::now();
        Self {
            completion_percentage: 0,
            exit_condition_status: def
                .exit_conditions
                .iter()
                .map(|c| (c.clone(), false))
                .collect(),
            validation_gates_status: def
                .validation_gates
                .iter()
                .map(|g| (g.clone(), false))
                .collect(),
            artifacts_created: Vec::new(),
            blocking_issues: Vec::new(),
            blocked: false,
            human_checkpoint_approved: false,
            paused: false,
            entered_at: now,
            updated_at: now,
        }
    }

    /// 与时间戳无关的内容比较
    pub fn same_content(&self, other: &Self) -> bool {
        self.completion_percentage == other.completion_percentage
            && self.exit_condition_status == other.exit_condition_status
            && self.validation_gates_status == other.validation_gates_status
            && self.artifacts_created == other.artifacts_created
            && self.blocking_issues == other.blocking_issues
            && self.blocked == other.blocked
            && self.human_checkpoint_approved == other.human_checkpoint_approved
            && self.paused == other.paused
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 工作流实例（状态机独占，每次变更后持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub schema_version: u32,
    pub current_phase: String,
    pub variant: Variant,
    pub history: Vec<HistoryEntry>,
    pub metadata: BTreeMap<String, PhaseMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn current_metadata(&self) -> Option<&PhaseMetadata> {
        self.metadata.get(&self.current_phase)
    }

    pub(crate) fn current_metadata_mut(&mut self) -> Option<&mut PhaseMetadata> {
        self.metadata.get_mut(&self.current_phase)
    }
}

/// 自动迁移就绪检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    /// 形如 `exit:<name>`、`gate:<name>`、`blocking:<reason>`、`checkpoint:<name>`
    pub unmet: Vec<String>,
}

/// 对外展示的状态摘要
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub current_phase: String,
    pub variant: Variant,
    pub progress_percentage: f64,
    pub blocked: bool,
    pub paused: bool,
    pub readiness: Readiness,
    pub transitions: usize,
}
