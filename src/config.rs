//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MAESTRO__*` 覆盖（双下划线表示嵌套，如 `MAESTRO__ROUTER__PREVIEW_DELAY_MS=0`）。
//! 每个段都有默认值，空配置即可运行。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::decision::{ConfidenceWeights, RoutingThresholds};

/// 需要人工处理的修复路由目标
pub const HUMAN: &str = "human";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workflow: WorkflowSection,
    pub channel: ChannelSection,
    pub router: RouterSection,
    pub collaboration: CollaborationSection,
    pub background: BackgroundSection,
    pub orchestrator: OrchestratorSection,
    /// role → depends_on；为空时使用内置标准依赖图
    pub dependencies: HashMap<String, Vec<String>>,
}

/// [workflow] 段：状态目录、备份保留数、阶段目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub state_dir: PathBuf,
    pub backup_retention: usize,
    /// 每次变更后自动落盘
    pub auto_persist: bool,
    /// 首次初始化使用的变体：fresh / existing-system
    pub variant: String,
    /// 自定义阶段目录（TOML），未设置时使用内置目录
    pub catalog_path: Option<PathBuf>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".maestro"),
            backup_retention: 10,
            auto_persist: true,
            variant: "fresh".to_string(),
            catalog_path: None,
        }
    }
}

/// [channel] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// 角色调用的默认超时（毫秒）
    pub default_timeout_ms: u64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

/// [router] 段：置信度权重、路由阈值、预览与审批
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub weights: ConfidenceWeights,
    pub thresholds: RoutingThresholds,
    pub preview_delay_ms: u64,
    /// 审批等待上限；未设置时无限等待，直到显式批准或拒绝
    pub approval_timeout_ms: Option<u64>,
    pub history_capacity: usize,
    /// 无历史记录时的成功率先验
    pub history_prior: f64,
    /// role → 总是需要审批的动作
    pub always_require_approval: HashMap<String, Vec<String>>,
    /// role → 自动推进前必须为真的上下文条件
    pub auto_proceed_conditions: HashMap<String, Vec<String>>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            weights: ConfidenceWeights::default(),
            thresholds: RoutingThresholds::default(),
            preview_delay_ms: 5_000,
            approval_timeout_ms: None,
            history_capacity: 1_000,
            history_prior: 0.5,
            always_require_approval: HashMap::new(),
            auto_proceed_conditions: HashMap::new(),
        }
    }
}

/// [collaboration] 段：竞争评分、冲突解决、交接
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollaborationSection {
    /// 权威评分角色（默认权重 0.6）
    pub authority_scorer: String,
    /// 次级评分角色（默认权重 0.4）
    pub secondary_scorer: String,
    pub authority_weight: f64,
    pub secondary_weight: f64,
    /// 冲突解决的最低置信度，低于则升级给人工
    pub conflict_threshold: f64,
    pub role_priorities: HashMap<String, u32>,
    /// 冲突分析角色，未设置时跳过分析
    pub analysis_role: Option<String>,
    /// 交接校验角色
    pub validation_role: String,
    pub history_capacity: usize,
}

impl Default for CollaborationSection {
    fn default() -> Self {
        let role_priorities = [
            ("architect", 100),
            ("product-owner", 90),
            ("analyst", 80),
            ("qa", 70),
            ("developer", 60),
            ("reviewer", 50),
            ("devops", 40),
            ("documenter", 30),
        ]
        .into_iter()
        .map(|(role, p)| (role.to_string(), p))
        .collect();

        Self {
            authority_scorer: "architect".to_string(),
            secondary_scorer: "qa".to_string(),
            authority_weight: 0.6,
            secondary_weight: 0.4,
            conflict_threshold: 0.6,
            role_priorities,
            analysis_role: Some("analyst".to_string()),
            validation_role: "qa".to_string(),
            history_capacity: 500,
        }
    }
}

/// [background] 段：并发上限与资源节流
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackgroundSection {
    pub max_concurrent: usize,
    /// CPU 使用率阈值（百分比）
    pub cpu_threshold: f64,
    /// 内存使用率阈值（百分比）
    pub memory_threshold: f64,
    pub sample_interval_ms: u64,
    /// watched 模式的进度上报间隔
    pub progress_interval_ms: u64,
    /// 已结束执行的保留时长，超过后由 cleanup 清除
    pub retain_finished_secs: u64,
}

impl Default for BackgroundSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            sample_interval_ms: 1_000,
            progress_interval_ms: 500,
            retain_finished_secs: 3_600,
        }
    }
}

/// [orchestrator.recovery] 段：自动恢复六个步骤各自调用的角色
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryRoles {
    pub analyze: String,
    pub truth_check: String,
    pub impact_trace: String,
    pub impact_assessment: String,
    pub verify: String,
}

impl Default for RecoveryRoles {
    fn default() -> Self {
        Self {
            analyze: "analyst".to_string(),
            truth_check: "architect".to_string(),
            impact_trace: "analyst".to_string(),
            impact_assessment: "architect".to_string(),
            verify: "qa".to_string(),
        }
    }
}

/// [orchestrator] 段：后台验证、阻塞阈值、恢复路由
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub validator_roles: Vec<String>,
    /// 进入阶段时向所需角色发送 initialize
    pub initialize_roles_on_entry: bool,
    pub min_pass_rate: f64,
    /// 允许的性能回退比例
    pub max_performance_regression: f64,
    pub recovery: RecoveryRoles,
    /// 原因类别 → 修复角色；未命中或为 `human` 时升级给人工
    pub fix_routes: HashMap<String, String>,
    /// 修复动作先经过决策路由
    pub route_fixes_through_router: bool,
    /// 阶段被阻塞时自动启动恢复流程
    pub auto_recover_blocked: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let fix_routes = [
            ("truth-gap", "architect"),
            ("implementation-bug", "developer"),
            ("test-error", "qa"),
            ("unclear-requirement", HUMAN),
            ("architecture-mismatch", "architect"),
        ]
        .into_iter()
        .map(|(cause, role)| (cause.to_string(), role.to_string()))
        .collect();

        Self {
            validator_roles: vec!["qa".to_string(), "reviewer".to_string()],
            initialize_roles_on_entry: true,
            min_pass_rate: 0.8,
            max_performance_regression: 0.1,
            recovery: RecoveryRoles::default(),
            fix_routes,
            route_fixes_through_router: false,
            auto_recover_blocked: false,
        }
    }
}

/// 从 config 目录加载配置，环境变量 MAESTRO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MAESTRO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MAESTRO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
