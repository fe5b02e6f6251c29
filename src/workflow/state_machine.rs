//! 工作流状态机
//!
//! 独占 `WorkflowInstance`：所有变更串行执行（单写者互斥锁），先在副本上修改、落盘成功后才提交，
//! 随后通过 watch 通道发布快照，读者随时可读到一致的内存快照。迁移、回滚、阻塞等动作以事件形式对外广播。

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::core::WorkflowError;
use crate::events::{Event, EventBus};
use crate::workflow::catalog::PhaseCatalog;
use crate::workflow::store::StateStore;
use crate::workflow::types::{
    BlockingIssue, HistoryEntry, PhaseMetadata, Readiness, Variant, WorkflowInstance,
    WorkflowStatus, ROLLBACK_REASON_PREFIX, SCHEMA_VERSION,
};

/// 自动迁移的 reason；只有它会触发前置条件检查
pub const AUTOMATIC: &str = "automatic";

/// 工作流状态机
pub struct StateMachine {
    catalog: Arc<PhaseCatalog>,
    store: Option<StateStore>,
    auto_persist: bool,
    instance: Mutex<Option<WorkflowInstance>>,
    snapshot_tx: watch::Sender<Option<WorkflowInstance>>,
    events: EventBus,
}

impl StateMachine {
    /// 纯内存状态机（不落盘）
    pub fn new(catalog: Arc<PhaseCatalog>, events: EventBus) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            catalog,
            store: None,
            auto_persist: true,
            instance: Mutex::new(None),
            snapshot_tx,
            events,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// 关闭后需显式调用 `persist`
    pub fn with_auto_persist(mut self, enabled: bool) -> Self {
        self.auto_persist = enabled;
        self
    }

    pub fn catalog(&self) -> &PhaseCatalog {
        &self.catalog
    }

    pub fn store(&self) -> Option<&StateStore> {
        self.store.as_ref()
    }

    /// 当前快照（不等待进行中的变更）
    pub fn snapshot(&self) -> Option<WorkflowInstance> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<WorkflowInstance>> {
        self.snapshot_tx.subscribe()
    }

    pub fn current_phase(&self) -> Option<String> {
        self.snapshot_tx
            .borrow()
            .as_ref()
            .map(|i| i.current_phase.clone())
    }

    /// 初始化：已有持久化状态则加载（必要时从备份恢复），否则按变体进入唯一的起始阶段
    pub async fn initialize(&self, variant: Variant) -> Result<WorkflowInstance, WorkflowError> {
        let mut guard = self.instance.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        if let Some(store) = &self.store {
            if store.exists().await {
                let instance = store.recover(&self.catalog).await?;
                tracing::info!(
                    "Loaded persisted workflow at phase '{}' ({})",
                    instance.current_phase,
                    instance.variant
                );
                *guard = Some(instance.clone());
                self.snapshot_tx.send_replace(Some(instance.clone()));
                return Ok(instance);
            }
        }

        let start = self.catalog.start_phase(variant).ok_or_else(|| {
            WorkflowError::InvalidCatalog(format!("no start phase for variant '{variant}'"))
        })?;
        let now = Utc::now();
        let instance = WorkflowInstance {
            schema_version: SCHEMA_VERSION,
            current_phase: start.id.clone(),
            variant,
            history: vec![HistoryEntry {
                from: None,
                to: start.id.clone(),
                reason: "initialize".to_string(),
                timestamp: now,
            }],
            metadata: [(start.id.clone(), PhaseMetadata::for_phase(start))].into(),
            created_at: now,
            updated_at: now,
        };
        let entered = Event::PhaseEntered {
            phase: start.id.clone(),
            required_roles: start.required_roles.clone(),
            reason: "initialize".to_string(),
        };

        self.commit(&mut guard, instance.clone()).await?;
        tracing::info!("Workflow initialized at phase '{}' ({})", start.id, variant);
        self.events.publish(entered);
        Ok(instance)
    }

    /// 从持久化存储恢复（主文件损坏时回退到最新有效备份）
    pub async fn recover(&self) -> Result<WorkflowInstance, WorkflowError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| WorkflowError::RecoveryFailed("no state store configured".into()))?;
        let mut guard = self.instance.lock().await;
        let instance = store.recover(&self.catalog).await?;
        *guard = Some(instance.clone());
        self.snapshot_tx.send_replace(Some(instance.clone()));
        Ok(instance)
    }

    /// 迁移到目标阶段；force 跳过变体与前置条件检查
    pub async fn transition_to(
        &self,
        phase_id: &str,
        reason: &str,
        force: bool,
    ) -> Result<WorkflowInstance, WorkflowError> {
        self.mutate(|instance| apply_transition(instance, &self.catalog, phase_id, reason, force))
            .await
            .map(|(instance, _)| instance)
    }

    /// 回滚到指定阶段，未指定时回到历史中的上一个阶段
    ///
    /// 「上一个阶段」取最近一次正向进入当前阶段时的来源阶段，回滚条目不计入，
    /// 所以连续两次 `rollback(None)` 会沿正向路径逐级后退，而不是在两个阶段间来回。
    pub async fn rollback(&self, target: Option<&str>) -> Result<WorkflowInstance, WorkflowError> {
        let catalog = Arc::clone(&self.catalog);
        self.mutate(move |instance| {
            let target_id = match target {
                Some(t) => t.to_string(),
                None => instance
                    .history
                    .iter()
                    .rev()
                    .find(|h| h.to == instance.current_phase && !h.is_rollback())
                    .and_then(|h| h.from.clone())
                    .ok_or(WorkflowError::RollbackUnavailable)?,
            };
            let target_def = catalog
                .get(&target_id)
                .ok_or_else(|| WorkflowError::InvalidPhase(target_id.clone()))?;

            // 下游产物失效（仅信号）
            let mut phases = Vec::new();
            let mut artifacts = Vec::new();
            for (id, meta) in &instance.metadata {
                let downstream = catalog
                    .get(id)
                    .map(|d| d.order > target_def.order)
                    .unwrap_or(false);
                if downstream {
                    phases.push(id.clone());
                    artifacts.extend(meta.artifacts_created.iter().cloned());
                }
            }

            if let Some(meta) = instance.metadata.get_mut(&target_id) {
                for passed in meta.validation_gates_status.values_mut() {
                    *passed = false;
                }
            }

            let from = instance.current_phase.clone();
            let mut events = vec![Event::ArtifactsInvalidated {
                rollback_to: target_id.clone(),
                phases,
                artifacts,
            }];
            let reason = format!("{ROLLBACK_REASON_PREFIX}{from}");
            events.extend(apply_transition(instance, &catalog, &target_id, &reason, true)?.1);
            tracing::info!("Rolled back workflow from '{}' to '{}'", from, target_id);
            Ok(((), events))
        })
        .await
        .map(|(instance, _)| instance)
    }

    /// 当前阶段是否可以自动迁移
    pub fn can_auto_transition(&self) -> Result<bool, WorkflowError> {
        self.readiness().map(|r| r.ready)
    }

    /// 自动迁移就绪详情
    pub fn readiness(&self) -> Result<Readiness, WorkflowError> {
        let guard = self.snapshot_tx.borrow();
        let instance = guard.as_ref().ok_or(WorkflowError::NotInitialized)?;
        Ok(readiness(instance, &self.catalog))
    }

    /// 追加阻塞问题并标记阶段阻塞
    pub async fn block(&self, reason: &str, details: Value) -> Result<(), WorkflowError> {
        self.mutate(|instance| {
            let phase = instance.current_phase.clone();
            let meta = current_meta(instance)?;
            meta.blocking_issues.push(BlockingIssue {
                reason: reason.to_string(),
                details: details.clone(),
                raised_at: Utc::now(),
            });
            meta.blocked = true;
            tracing::warn!("Phase '{}' blocked: {}", phase, reason);
            Ok((
                (),
                vec![Event::PhaseBlocked {
                    phase,
                    reason: reason.to_string(),
                    details,
                }],
            ))
        })
        .await
        .map(|_| ())
    }

    /// 清空阻塞问题
    pub async fn unblock(&self, reason: &str, resolved_by: &str) -> Result<(), WorkflowError> {
        self.mutate(|instance| {
            let phase = instance.current_phase.clone();
            let meta = current_meta(instance)?;
            meta.blocking_issues.clear();
            meta.blocked = false;
            tracing::info!("Phase '{}' unblocked by {}: {}", phase, resolved_by, reason);
            Ok((
                (),
                vec![Event::PhaseUnblocked {
                    phase,
                    reason: reason.to_string(),
                    resolved_by: resolved_by.to_string(),
                }],
            ))
        })
        .await
        .map(|_| ())
    }

    pub async fn mark_exit_condition(&self, name: &str, met: bool) -> Result<(), WorkflowError> {
        self.update_current(|phase, meta| {
            if !meta.exit_condition_status.contains_key(name) {
                tracing::warn!("Exit condition '{}' is not declared for phase '{}'", name, phase);
            }
            meta.exit_condition_status.insert(name.to_string(), met);
        })
        .await
    }

    pub async fn set_validation_gate(&self, name: &str, passed: bool) -> Result<(), WorkflowError> {
        self.update_current(|phase, meta| {
            if !meta.validation_gates_status.contains_key(name) {
                tracing::warn!("Validation gate '{}' is not declared for phase '{}'", name, phase);
            }
            meta.validation_gates_status.insert(name.to_string(), passed);
        })
        .await
    }

    pub async fn approve_human_checkpoint(&self) -> Result<(), WorkflowError> {
        self.update_current(|_, meta| meta.human_checkpoint_approved = true)
            .await
    }

    pub async fn record_artifact(&self, artifact: &str) -> Result<(), WorkflowError> {
        self.update_current(|_, meta| meta.artifacts_created.push(artifact.to_string()))
            .await
    }

    pub async fn set_completion(&self, percentage: u8) -> Result<(), WorkflowError> {
        self.update_current(|_, meta| meta.completion_percentage = percentage.min(100))
            .await
    }

    pub async fn pause(&self) -> Result<(), WorkflowError> {
        self.update_current(|_, meta| meta.paused = true).await
    }

    pub async fn resume(&self) -> Result<(), WorkflowError> {
        self.update_current(|_, meta| meta.paused = false).await
    }

    /// 显式重置：删除持久化状态并清空内存实例
    pub async fn reset(&self) -> Result<(), WorkflowError> {
        let mut guard = self.instance.lock().await;
        if let Some(store) = &self.store {
            store.remove().await?;
        }
        *guard = None;
        self.snapshot_tx.send_replace(None);
        tracing::info!("Workflow reset");
        Ok(())
    }

    /// 显式落盘（auto_persist 关闭时使用）
    pub async fn persist(&self) -> Result<(), WorkflowError> {
        let guard = self.instance.lock().await;
        let instance = guard.as_ref().ok_or(WorkflowError::NotInitialized)?;
        match &self.store {
            Some(store) => store.save(instance).await,
            None => Ok(()),
        }
    }

    pub fn progress_percentage(&self) -> Option<f64> {
        let guard = self.snapshot_tx.borrow();
        guard
            .as_ref()
            .map(|i| self.catalog.progress_percentage(i.variant, &i.current_phase))
    }

    pub fn status(&self) -> Result<WorkflowStatus, WorkflowError> {
        let guard = self.snapshot_tx.borrow();
        let instance = guard.as_ref().ok_or(WorkflowError::NotInitialized)?;
        let meta = instance.current_metadata();
        Ok(WorkflowStatus {
            current_phase: instance.current_phase.clone(),
            variant: instance.variant,
            progress_percentage: self
                .catalog
                .progress_percentage(instance.variant, &instance.current_phase),
            blocked: meta.map(|m| m.blocked).unwrap_or(false),
            paused: meta.map(|m| m.paused).unwrap_or(false),
            readiness: readiness(instance, &self.catalog),
            transitions: instance.history.len().saturating_sub(1),
        })
    }

    async fn update_current<F>(&self, update: F) -> Result<(), WorkflowError>
    where
        F: FnOnce(&str, &mut PhaseMetadata),
    {
        self.mutate(|instance| {
            let phase = instance.current_phase.clone();
            let meta = current_meta(instance)?;
            update(&phase, meta);
            meta.touch();
            Ok(((), Vec::new()))
        })
        .await
        .map(|_| ())
    }

    /// 单写者变更：在副本上修改 → 落盘 → 提交 → 发布事件
    async fn mutate<T, F>(&self, change: F) -> Result<(WorkflowInstance, T), WorkflowError>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<(T, Vec<Event>), WorkflowError>,
    {
        let mut guard = self.instance.lock().await;
        let mut candidate = guard.clone().ok_or(WorkflowError::NotInitialized)?;
        let (value, events) = change(&mut candidate)?;
        candidate.updated_at = Utc::now();

        self.commit(&mut guard, candidate.clone()).await?;
        drop(guard);

        for event in events {
            self.events.publish(event);
        }
        Ok((candidate, value))
    }

    async fn commit(
        &self,
        guard: &mut Option<WorkflowInstance>,
        instance: WorkflowInstance,
    ) -> Result<(), WorkflowError> {
        if self.auto_persist {
            if let Some(store) = &self.store {
                store.save(&instance).await?;
            }
        }
        *guard = Some(instance.clone());
        self.snapshot_tx.send_replace(Some(instance));
        Ok(())
    }
}

fn current_meta(instance: &mut WorkflowInstance) -> Result<&mut PhaseMetadata, WorkflowError> {
    let phase = instance.current_phase.clone();
    instance
        .current_metadata_mut()
        .ok_or(WorkflowError::InvalidPhase(phase))
}

/// 就绪判定：退出条件全满足、验证门全通过、无阻塞问题、人工检查点（若声明）已批准
pub fn readiness(instance: &WorkflowInstance, catalog: &PhaseCatalog) -> Readiness {
    let mut unmet = Vec::new();
    let Some(def) = catalog.get(&instance.current_phase) else {
        return Readiness {
            ready: false,
            unmet: vec![format!("phase:{}", instance.current_phase)],
        };
    };
    let meta = instance.current_metadata();
    let status_of = |map: Option<&std::collections::BTreeMap<String, bool>>, key: &str| {
        map.and_then(|m| m.get(key)).copied().unwrap_or(false)
    };

    for condition in &def.exit_conditions {
        if !status_of(meta.map(|m| &m.exit_condition_status), condition) {
            unmet.push(format!("exit:{condition}"));
        }
    }
    for gate in &def.validation_gates {
        if !status_of(meta.map(|m| &m.validation_gates_status), gate) {
            unmet.push(format!("gate:{gate}"));
        }
    }
    if let Some(meta) = meta {
        for issue in &meta.blocking_issues {
            unmet.push(format!("blocking:{}", issue.reason));
        }
    }
    if let Some(checkpoint) = &def.human_checkpoint {
        if !meta.map(|m| m.human_checkpoint_approved).unwrap_or(false) {
            unmet.push(format!("checkpoint:{checkpoint}"));
        }
    }

    Readiness {
        ready: unmet.is_empty(),
        unmet,
    }
}

fn apply_transition(
    instance: &mut WorkflowInstance,
    catalog: &PhaseCatalog,
    phase_id: &str,
    reason: &str,
    force: bool,
) -> Result<(WorkflowInstance, Vec<Event>), WorkflowError> {
    let target = catalog
        .get(phase_id)
        .ok_or_else(|| WorkflowError::InvalidPhase(phase_id.to_string()))?;

    if !force {
        if !target.kind.applies_to(instance.variant) {
            let expected = match target.kind {
                crate::workflow::types::PhaseKind::VariantOnly(v) => v.to_string(),
                crate::workflow::types::PhaseKind::Universal => "any".to_string(),
            };
            return Err(WorkflowError::VariantMismatch {
                phase: phase_id.to_string(),
                expected,
                actual: instance.variant.to_string(),
            });
        }
        if reason == AUTOMATIC {
            let check = readiness(instance, catalog);
            if !check.ready {
                return Err(WorkflowError::PreconditionsUnmet {
                    phase: instance.current_phase.clone(),
                    unmet: check.unmet,
                });
            }
        }
    }

    let from = instance.current_phase.clone();
    let now = Utc::now();
    instance.history.push(HistoryEntry {
        from: Some(from.clone()),
        to: target.id.clone(),
        reason: reason.to_string(),
        timestamp: now,
    });
    instance
        .metadata
        .insert(target.id.clone(), PhaseMetadata::for_phase(target));
    instance.current_phase = target.id.clone();

    tracing::info!("Workflow transitioned '{}' -> '{}' ({})", from, target.id, reason);
    let events = vec![
        Event::PhaseCompleted { phase: from },
        Event::PhaseEntered {
            phase: target.id.clone(),
            required_roles: target.required_roles.clone(),
            reason: reason.to_string(),
        },
    ];
    Ok((instance.clone(), events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;

    fn machine() -> StateMachine {
        StateMachine::new(Arc::new(PhaseCatalog::standard()), EventBus::default())
    }

    #[tokio::test]
    async fn test_initialize_fresh_variant() {
        let sm = machine();
        let instance = sm.initialize(Variant::Fresh).await.unwrap();
        assert_eq!(instance.current_phase, "ideation");
        assert_eq!(instance.history.len(), 1);
        assert_eq!(sm.current_phase().as_deref(), Some("ideation"));
    }

    #[tokio::test]
    async fn test_initialize_existing_variant() {
        let sm = machine();
        let instance = sm.initialize(Variant::ExistingSystem).await.unwrap();
        assert_eq!(instance.current_phase, "context-analysis");
    }

    #[tokio::test]
    async fn test_unknown_phase_rejected() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        let err = sm.transition_to("nowhere", "manual", false).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidPhase(_)));
    }

    #[tokio::test]
    async fn test_variant_mismatch_unless_forced() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        let err = sm
            .transition_to("integration-planning", "manual", false)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::VariantMismatch { .. }));

        let instance = sm
            .transition_to("integration-planning", "manual", true)
            .await
            .unwrap();
        assert_eq!(instance.current_phase, "integration-planning");
    }

    #[tokio::test]
    async fn test_automatic_transition_requires_exit_conditions() {
        let sm = machine();
        sm.initialize(Variant::ExistingSystem).await.unwrap();
        sm.mark_exit_condition("codebase_mapped", true).await.unwrap();

        let err = sm
            .transition_to("requirements", AUTOMATIC, false)
            .await
            .unwrap_err();
        match err {
            WorkflowError::PreconditionsUnmet { unmet, .. } => {
                assert_eq!(unmet, vec!["exit:constraints_documented".to_string()]);
            }
            other => panic!("Expected PreconditionsUnmet, got {other:?}"),
        }

        sm.mark_exit_condition("constraints_documented", true).await.unwrap();
        let instance = sm.transition_to("requirements", AUTOMATIC, false).await.unwrap();
        assert_eq!(instance.current_phase, "requirements");
    }

    #[tokio::test]
    async fn test_readiness_covers_gates_blocks_and_checkpoint() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        sm.transition_to("requirements", "manual", false).await.unwrap();
        sm.mark_exit_condition("requirements_approved", true).await.unwrap();

        let r = sm.readiness().unwrap();
        assert_eq!(
            r.unmet,
            vec!["gate:traceability".to_string(), "checkpoint:requirements-signoff".to_string()]
        );

        sm.set_validation_gate("traceability", true).await.unwrap();
        sm.approve_human_checkpoint().await.unwrap();
        sm.block("traceability broken", Value::Null).await.unwrap();
        assert!(!sm.can_auto_transition().unwrap());

        sm.unblock("fixed", "developer").await.unwrap();
        assert!(sm.can_auto_transition().unwrap());
    }

    #[tokio::test]
    async fn test_transition_emits_completed_then_entered() {
        let bus = EventBus::default();
        let sm = StateMachine::new(Arc::new(PhaseCatalog::standard()), bus.clone());
        sm.initialize(Variant::Fresh).await.unwrap();
        let mut sub = bus.subscribe(&[Topic::PhaseCompleted, Topic::PhaseEntered]);

        sm.transition_to("requirements", "manual", false).await.unwrap();

        match sub.recv().await.unwrap() {
            Event::PhaseCompleted { phase } => assert_eq!(phase, "ideation"),
            other => panic!("unexpected {other:?}"),
        }
        match sub.recv().await.unwrap() {
            Event::PhaseEntered { phase, required_roles, .. } => {
                assert_eq!(phase, "requirements");
                assert_eq!(required_roles, vec!["product-owner", "analyst"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rollback_to_previous_phase() {
        let bus = EventBus::default();
        let sm = StateMachine::new(Arc::new(PhaseCatalog::standard()), bus.clone());
        sm.initialize(Variant::Fresh).await.unwrap();
        sm.transition_to("requirements", "manual", false).await.unwrap();
        sm.transition_to("architecture", "manual", false).await.unwrap();
        sm.record_artifact("adr-001").await.unwrap();
        let mut sub = bus.subscribe(&[Topic::ArtifactsInvalidated]);

        let instance = sm.rollback(None).await.unwrap();
        assert_eq!(instance.current_phase, "requirements");

        match sub.recv().await.unwrap() {
            Event::ArtifactsInvalidated { artifacts, phases, .. } => {
                assert_eq!(artifacts, vec!["adr-001".to_string()]);
                assert!(phases.contains(&"architecture".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
        // 产物仅被标记失效，元数据仍在
        assert!(instance.metadata["architecture"]
            .artifacts_created
            .contains(&"adr-001".to_string()));
    }

    #[tokio::test]
    async fn test_rollback_then_transition_resets_metadata() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        sm.transition_to("requirements", "manual", false).await.unwrap();
        let defaults = sm.snapshot().unwrap().metadata["requirements"].clone();

        for _ in 0..2 {
            sm.set_validation_gate("traceability", true).await.unwrap();
            sm.mark_exit_condition("requirements_approved", true).await.unwrap();
            sm.transition_to("architecture", "manual", false).await.unwrap();
            sm.rollback(None).await.unwrap();
            let meta = sm.snapshot().unwrap().metadata["requirements"].clone();
            assert!(meta.same_content(&defaults));

            sm.transition_to("requirements", "manual", true).await.unwrap();
            let meta = sm.snapshot().unwrap().metadata["requirements"].clone();
            assert!(meta.same_content(&defaults));
        }
    }

    #[tokio::test]
    async fn test_repeated_rollback_walks_back() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        sm.transition_to("requirements", "manual", false).await.unwrap();
        sm.transition_to("architecture", "manual", false).await.unwrap();

        assert_eq!(sm.rollback(None).await.unwrap().current_phase, "requirements");
        assert_eq!(sm.rollback(None).await.unwrap().current_phase, "ideation");
        assert!(matches!(
            sm.rollback(None).await,
            Err(WorkflowError::RollbackUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_rollback_without_history() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        assert!(matches!(
            sm.rollback(None).await,
            Err(WorkflowError::RollbackUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let sm = machine();
        assert!(matches!(
            sm.transition_to("requirements", "manual", false).await,
            Err(WorkflowError::NotInitialized)
        ));
        assert!(sm.status().is_err());
    }

    #[tokio::test]
    async fn test_persisted_state_is_loaded_on_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(PhaseCatalog::standard());
        {
            let sm = StateMachine::new(Arc::clone(&catalog), EventBus::default())
                .with_store(StateStore::new(dir.path(), 10));
            sm.initialize(Variant::Fresh).await.unwrap();
            sm.transition_to("requirements", "manual", false).await.unwrap();
        }

        let sm = StateMachine::new(catalog, EventBus::default())
            .with_store(StateStore::new(dir.path(), 10));
        // 变体参数被持久化状态覆盖
        let instance = sm.initialize(Variant::ExistingSystem).await.unwrap();
        assert_eq!(instance.current_phase, "requirements");
        assert_eq!(instance.variant, Variant::Fresh);
        assert_eq!(instance.history.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let sm = StateMachine::new(Arc::new(PhaseCatalog::standard()), EventBus::default())
            .with_store(StateStore::new(dir.path(), 10));
        sm.initialize(Variant::Fresh).await.unwrap();
        sm.reset().await.unwrap();

        assert!(sm.snapshot().is_none());
        assert!(!sm.store().unwrap().exists().await);
    }

    #[tokio::test]
    async fn test_status_reports_progress() {
        let sm = machine();
        sm.initialize(Variant::Fresh).await.unwrap();
        sm.transition_to("release", "manual", false).await.unwrap();
        sm.pause().await.unwrap();
        let status = sm.status().unwrap();
        assert_eq!(status.progress_percentage, 100.0);
        assert!(status.paused);
        assert_eq!(status.transitions, 1);
    }
}
