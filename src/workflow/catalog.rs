//! 阶段目录：启动时加载一次的只读阶段定义集合
//!
//! 可用内置标准目录，也可从 TOML 文档加载：
//!
//! ```toml
//! [start]
//! fresh = "ideation"
//! existing-system = "context-analysis"
//!
//! [[phases]]
//! id = "ideation"
//! kind = { variant-only = "fresh" }
//! order = 0.0
//! required_roles = ["analyst"]
//! exit_conditions = ["vision_documented"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::core::WorkflowError;
use crate::workflow::types::{PhaseDefinition, PhaseKind, Variant};

#[derive(Debug, Clone, Deserialize)]
struct CatalogDocument {
    start: StartPhases,
    phases: Vec<PhaseDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
struct StartPhases {
    fresh: String,
    #[serde(rename = "existing-system")]
    existing_system: String,
}

/// 阶段目录
#[derive(Debug, Clone)]
pub struct PhaseCatalog {
    phases: Vec<PhaseDefinition>,
    start: BTreeMap<Variant, String>,
}

impl PhaseCatalog {
    /// 构建并校验：id 唯一、每个变体恰有一个合法起始阶段
    pub fn new(phases: Vec<PhaseDefinition>, start: BTreeMap<Variant, String>) -> Result<Self, WorkflowError> {
        let mut seen = HashSet::new();
        for phase in &phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(WorkflowError::InvalidCatalog(format!(
                    "duplicate phase id '{}'",
                    phase.id
                )));
            }
            if !phase.order.is_finite() {
                return Err(WorkflowError::InvalidCatalog(format!(
                    "phase '{}' has non-finite order",
                    phase.id
                )));
            }
        }

        for variant in [Variant::Fresh, Variant::ExistingSystem] {
            let id = start.get(&variant).ok_or_else(|| {
                WorkflowError::InvalidCatalog(format!("no start phase for variant '{variant}'"))
            })?;
            let phase = phases.iter().find(|p| &p.id == id).ok_or_else(|| {
                WorkflowError::InvalidCatalog(format!("start phase '{id}' is not defined"))
            })?;
            if !phase.kind.applies_to(variant) {
                return Err(WorkflowError::InvalidCatalog(format!(
                    "start phase '{id}' does not apply to variant '{variant}'"
                )));
            }
        }

        Ok(Self { phases, start })
    }

    /// 内置标准目录
    pub fn standard() -> Self {
        let phases = vec![
            PhaseDefinition::new("ideation", PhaseKind::VariantOnly(Variant::Fresh), 0.0)
                .describe("Shape the product vision for a new system")
                .roles(&["analyst"])
                .exits(&["vision_documented"]),
            PhaseDefinition::new(
                "context-analysis",
                PhaseKind::VariantOnly(Variant::ExistingSystem),
                0.0,
            )
            .describe("Map the existing system before changing it")
            .roles(&["analyst", "architect"])
            .exits(&["codebase_mapped", "constraints_documented"]),
            PhaseDefinition::new("requirements", PhaseKind::Universal, 1.0)
                .roles(&["product-owner", "analyst"])
                .exits(&["requirements_approved"])
                .gates(&["traceability"])
                .checkpoint("requirements-signoff"),
            PhaseDefinition::new("architecture", PhaseKind::Universal, 2.0)
                .roles(&["architect"])
                .exits(&["architecture_documented"])
                .gates(&["consistency"]),
            PhaseDefinition::new(
                "integration-planning",
                PhaseKind::VariantOnly(Variant::ExistingSystem),
                2.5,
            )
            .roles(&["architect", "developer"])
            .exits(&["migration_plan_ready"]),
            PhaseDefinition::new("implementation", PhaseKind::Universal, 3.0)
                .roles(&["developer"])
                .exits(&["build_passing"])
                .gates(&["unit_tests"]),
            PhaseDefinition::new("validation", PhaseKind::Universal, 4.0)
                .roles(&["qa", "reviewer"])
                .exits(&["pass_rate_met"])
                .gates(&["unit_tests", "drift"]),
            PhaseDefinition::new("release", PhaseKind::Universal, 5.0)
                .roles(&["devops"])
                .exits(&["deployed"])
                .checkpoint("release-signoff"),
        ];
        let start = BTreeMap::from([
            (Variant::Fresh, "ideation".to_string()),
            (Variant::ExistingSystem, "context-analysis".to_string()),
        ]);
        // 内置目录满足全部校验规则
        Self { phases, start }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, WorkflowError> {
        let doc: CatalogDocument = toml::from_str(text)
            .map_err(|e| WorkflowError::InvalidCatalog(e.to_string()))?;
        let start = BTreeMap::from([
            (Variant::Fresh, doc.start.fresh),
            (Variant::ExistingSystem, doc.start.existing_system),
        ]);
        Self::new(doc.phases, start)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn get(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn start_phase(&self, variant: Variant) -> Option<&PhaseDefinition> {
        self.start.get(&variant).and_then(|id| self.get(id))
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    /// 适用于某变体的阶段，按 order 排序
    pub fn applicable(&self, variant: Variant) -> Vec<&PhaseDefinition> {
        let mut phases: Vec<_> = self
            .phases
            .iter()
            .filter(|p| p.kind.applies_to(variant))
            .collect();
        phases.sort_by(|a, b| a.order.total_cmp(&b.order));
        phases
    }

    /// 进度百分比：当前阶段在适用阶段序列中的位置
    pub fn progress_percentage(&self, variant: Variant, phase_id: &str) -> f64 {
        let phases = self.applicable(variant);
        match phases.iter().position(|p| p.id == phase_id) {
            Some(_) if phases.len() == 1 => 100.0,
            Some(index) => (index as f64 / (phases.len() - 1) as f64) * 100.0,
            None => 0.0,
        }
    }
}

impl Default for PhaseCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
