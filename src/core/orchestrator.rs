//! 编排器：顶层协调
//!
//! 负责：监听状态机的阶段进入事件并初始化所需角色、主角色 + 后台验证扇出、
//! 阻塞条件评估、六步自动恢复（失败时发出升级信号，问题不会被静默丢弃）。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::background::{AggregationReport, BackgroundExecutor, ExecutionStatus, Priority, RoleOutcome};
use crate::channel::MessageChannel;
use crate::collaboration::CollaborationCoordinator;
use crate::config::{OrchestratorSection, HUMAN};
use crate::core::WorkflowError;
use crate::decision::DecisionRouter;
use crate::events::{Event, EventBus, Topic};
use crate::invoker::{InvocationOptions, InvocationResult};
use crate::workflow::StateMachine;

/// 阻塞条件名
pub const PASS_RATE_BELOW_THRESHOLD: &str = "pass-rate-below-threshold";
pub const CONSISTENCY_CHECK_FAILED: &str = "consistency-check-failed";
pub const TRACEABILITY_BROKEN: &str = "traceability-broken";
pub const CRITICAL_DRIFT: &str = "critical-drift";
pub const PERFORMANCE_REGRESSION: &str = "performance-regression";

type Predicate = Arc<dyn Fn(&InvocationOptions) -> bool + Send + Sync>;

/// 命名的阻塞谓词
#[derive(Clone)]
pub struct BlockingPredicate {
    pub name: String,
    check: Predicate,
}

impl BlockingPredicate {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&InvocationOptions) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn evaluate(&self, context: &InvocationOptions) -> bool {
        (self.check)(context)
    }
}

impl std::fmt::Debug for BlockingPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPredicate").field("name", &self.name).finish()
    }
}

fn context_number(context: &InvocationOptions, key: &str) -> Option<f64> {
    context.get(key).and_then(Value::as_f64)
}

fn context_flag(context: &InvocationOptions, key: &str) -> bool {
    context.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// 默认阻塞谓词（阈值来自配置）
pub fn default_predicates(config: &OrchestratorSection) -> Vec<BlockingPredicate> {
    let min_pass_rate = config.min_pass_rate;
    let max_regression = config.max_performance_regression;
    vec![
        BlockingPredicate::new(PASS_RATE_BELOW_THRESHOLD, move |ctx| {
            context_number(ctx, "pass_rate").is_some_and(|rate| rate < min_pass_rate)
        }),
        BlockingPredicate::new(CONSISTENCY_CHECK_FAILED, |ctx| {
            context_flag(ctx, "consistency_check_failed")
        }),
        BlockingPredicate::new(TRACEABILITY_BROKEN, |ctx| {
            context_flag(ctx, "traceability_broken")
        }),
        BlockingPredicate::new(CRITICAL_DRIFT, |ctx| context_flag(ctx, "critical_drift")),
        BlockingPredicate::new(PERFORMANCE_REGRESSION, move |ctx| {
            context_number(ctx, "performance_regression").is_some_and(|r| r > max_regression)
        }),
    ]
}

/// 主角色 + 并行验证的结果：没有部分成功
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// 主角色失败，未启动验证
    Failed { primary: InvocationResult },
    Validated {
        primary: InvocationResult,
        report: AggregationReport,
    },
    NeedsReview {
        primary: InvocationResult,
        report: AggregationReport,
        failures: Vec<RoleOutcome>,
    },
}

impl ValidationOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "failed",
            Self::Validated { .. } => "validated",
            Self::NeedsReview { .. } => "needs_review",
        }
    }

    pub fn is_validated(&self) -> bool {
        matches!(self, Self::Validated { .. })
    }
}

/// 自动恢复的六个步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStep {
    Analyze,
    TruthCheck,
    ImpactTrace,
    ImpactAssessment,
    RouteAndFix,
    Verify,
}

impl RecoveryStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::TruthCheck => "truth-check",
            Self::ImpactTrace => "impact-trace",
            Self::ImpactAssessment => "impact-assessment",
            Self::RouteAndFix => "route-and-fix",
            Self::Verify => "verify",
        }
    }

    fn task(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze-issue",
            Self::TruthCheck => "check-authoritative-truth",
            Self::ImpactTrace => "trace-impact",
            Self::ImpactAssessment => "assess-impact",
            Self::RouteAndFix => "apply-fix",
            Self::Verify => "verify-resolution",
        }
    }

    /// 该步骤结果在后续步骤选项中的键
    fn output_key(&self) -> &'static str {
        match self {
            Self::Analyze => "analysis",
            Self::TruthCheck => "truth_check",
            Self::ImpactTrace => "impact_trace",
            Self::ImpactAssessment => "impact_assessment",
            Self::RouteAndFix => "fix",
            Self::Verify => "verification",
        }
    }
}

impl std::fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 自动恢复结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Resolved {
        issue: String,
        cause: String,
        fixed_by: String,
        completed_steps: Vec<RecoveryStep>,
    },
    /// 已发出升级信号
    Escalated {
        issue: String,
        failed_step: RecoveryStep,
        reason: String,
        completed_steps: Vec<RecoveryStep>,
    },
}

impl RecoveryOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn failed_step(&self) -> Option<RecoveryStep> {
        match self {
            Self::Escalated { failed_step, .. } => Some(*failed_step),
            Self::Resolved { .. } => None,
        }
    }
}

/// 编排器（由 `OrchestratorBuilder` 装配）
pub struct Orchestrator {
    state: Arc<StateMachine>,
    channel: Arc<MessageChannel>,
    router: Arc<DecisionRouter>,
    coordinator: Arc<CollaborationCoordinator>,
    executor: BackgroundExecutor,
    events: EventBus,
    config: OrchestratorSection,
    predicates: Vec<BlockingPredicate>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: Arc<StateMachine>,
        channel: Arc<MessageChannel>,
        router: Arc<DecisionRouter>,
        coordinator: Arc<CollaborationCoordinator>,
        executor: BackgroundExecutor,
        events: EventBus,
        config: OrchestratorSection,
        shutdown: CancellationToken,
    ) -> Self {
        let predicates = default_predicates(&config);
        Self {
            state,
            channel,
            router,
            coordinator,
            executor,
            events,
            config,
            predicates,
            shutdown,
        }
    }

    /// 追加自定义阻塞谓词
    pub fn with_predicate(mut self, predicate: BlockingPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    pub fn router(&self) -> &Arc<DecisionRouter> {
        &self.router
    }

    pub fn coordinator(&self) -> &Arc<CollaborationCoordinator> {
        &self.coordinator
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 启动后台调度与阶段事件监听；须在 `initialize` 之前调用才能响应初始阶段
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![self.executor.start(), self.spawn_listener()]
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.executor.shutdown();
    }

    /// 监听阶段进入（以及可选的阻塞）事件
    ///
    /// 走可靠订阅：展示层事件再多也不会挤掉阶段信号。每个事件的处理都在独立任务中进行，监听循环不被角色调用拖住。
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut topics = vec![Topic::PhaseEntered];
        if self.config.auto_recover_blocked {
            topics.push(Topic::PhaseBlocked);
        }
        let mut subscription = self.events.subscribe_reliable(&topics);
        let this = Arc::clone(self);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };
                match event {
                    Event::PhaseEntered {
                        phase,
                        required_roles,
                        ..
                    } if this.config.initialize_roles_on_entry => {
                        let orchestrator = Arc::clone(&this);
                        tokio::spawn(async move {
                            orchestrator.initialize_roles(&phase, &required_roles).await;
                        });
                    }
                    Event::PhaseBlocked { reason, details, .. } => {
                        let orchestrator = Arc::clone(&this);
                        tokio::spawn(async move {
                            let context = match details {
                                Value::Object(map) => map.into_iter().collect(),
                                _ => InvocationOptions::new(),
                            };
                            if let Err(e) = orchestrator.execute_auto_recovery(&reason, context).await {
                                tracing::error!("Auto recovery for '{}' aborted: {}", reason, e);
                            }
                        });
                    }
                    _ => {}
                }
            }
            tracing::debug!("Orchestrator listener stopped");
        })
    }

    async fn initialize_roles(&self, phase: &str, roles: &[String]) {
        tracing::info!("Initializing {} role(s) for phase '{}'", roles.len(), phase);
        let options: InvocationOptions = [("phase".to_string(), json!(phase))].into_iter().collect();
        let calls = roles
            .iter()
            .map(|role| self.channel.invoke(role, "initialize", options.clone()));
        for (role, result) in roles.iter().zip(join_all(calls).await) {
            if !result.success {
                tracing::warn!(
                    "Role '{}' failed to initialize for phase '{}': {}",
                    role,
                    phase,
                    result.error_message()
                );
            }
        }
    }

    /// 主角色同步执行；成功后向验证角色扇出（后台执行器），全部成功才算 validated
    pub async fn execute_with_parallel_validation(
        &self,
        primary_role: &str,
        task: &str,
        options: InvocationOptions,
    ) -> ValidationOutcome {
        let primary = self.channel.invoke(primary_role, task, options.clone()).await;
        if !primary.success {
            tracing::warn!(
                "Primary role '{}' failed, skipping validation: {}",
                primary_role,
                primary.error_message()
            );
            return ValidationOutcome::Failed { primary };
        }

        let mut validation_options = options;
        validation_options.insert("primary_role".to_string(), json!(primary_role));
        validation_options.insert("primary_result".to_string(), primary.payload.clone());
        let report = self
            .executor
            .execute_multiple(
                &self.config.validator_roles,
                &format!("validate:{task}"),
                validation_options,
                Priority::High,
            )
            .await;

        let failures: Vec<RoleOutcome> = report
            .outcomes
            .iter()
            .filter(|o| o.status != ExecutionStatus::Completed)
            .cloned()
            .collect();
        if failures.is_empty() {
            tracing::info!("Task '{}' by '{}' validated by {} role(s)", task, primary_role, report.total);
            ValidationOutcome::Validated { primary, report }
        } else {
            tracing::warn!(
                "Task '{}' by '{}' needs review: {} of {} validations failed",
                task,
                primary_role,
                failures.len(),
                report.total
            );
            ValidationOutcome::NeedsReview {
                primary,
                report,
                failures,
            }
        }
    }

    /// 评估阻塞谓词；命中的条件逐一阻塞当前阶段，返回命中的条件名
    pub async fn check_blocking_conditions(
        &self,
        context: &InvocationOptions,
    ) -> Result<Vec<String>, WorkflowError> {
        let triggered: Vec<&BlockingPredicate> =
            self.predicates.iter().filter(|p| p.evaluate(context)).collect();
        let details = json!(context);
        for predicate in &triggered {
            self.state.block(&predicate.name, details.clone()).await?;
        }
        Ok(triggered.into_iter().map(|p| p.name.clone()).collect())
    }

    /// 六步自动恢复：任一步骤失败即中止并升级；验证确认解决后解除阻塞
    pub async fn execute_auto_recovery(
        &self,
        issue: &str,
        context: InvocationOptions,
    ) -> Result<RecoveryOutcome, WorkflowError> {
        tracing::info!("Starting auto recovery for '{}'", issue);
        let roles = &self.config.recovery;
        let mut options = context;
        options.insert("issue".to_string(), json!(issue));
        let mut completed = Vec::new();

        let investigation = [
            (RecoveryStep::Analyze, &roles.analyze),
            (RecoveryStep::TruthCheck, &roles.truth_check),
            (RecoveryStep::ImpactTrace, &roles.impact_trace),
            (RecoveryStep::ImpactAssessment, &roles.impact_assessment),
        ];
        let mut analysis = None;
        for (step, role) in investigation {
            let result = self.channel.invoke(role, step.task(), options.clone()).await;
            if !result.success {
                return Ok(self.escalate(issue, step, result.error_message(), completed));
            }
            options.insert(step.output_key().to_string(), result.payload.clone());
            if step == RecoveryStep::Analyze {
                analysis = Some(result);
            }
            completed.push(step);
        }

        let cause = analysis
            .as_ref()
            .and_then(|a| a.text("cause"))
            .unwrap_or("unknown")
            .to_string();
        let fix_role = match self.config.fix_routes.get(&cause) {
            Some(role) if role != HUMAN => role.clone(),
            _ => {
                let reason = format!("cause '{cause}' requires a human decision");
                return Ok(self.escalate(issue, RecoveryStep::RouteAndFix, reason, completed));
            }
        };
        options.insert("cause".to_string(), json!(cause));

        match self.apply_fix(&fix_role, options.clone()).await {
            Ok(payload) => {
                options.insert(RecoveryStep::RouteAndFix.output_key().to_string(), payload);
            }
            Err(reason) => {
                return Ok(self.escalate(issue, RecoveryStep::RouteAndFix, reason, completed));
            }
        }
        completed.push(RecoveryStep::RouteAndFix);

        let verification = self
            .channel
            .invoke(&roles.verify, RecoveryStep::Verify.task(), options)
            .await;
        if !verification.success {
            return Ok(self.escalate(issue, RecoveryStep::Verify, verification.error_message(), completed));
        }
        if verification.flag("resolved") != Some(true) {
            let reason = verification
                .text("reason")
                .unwrap_or("verification did not confirm resolution")
                .to_string();
            return Ok(self.escalate(issue, RecoveryStep::Verify, reason, completed));
        }
        completed.push(RecoveryStep::Verify);

        // 解除阻塞失败（如持久化出错）时问题仍处于阻塞状态，先升级再向上返回错误
        if let Err(e) = self
            .state
            .unblock(&format!("auto recovery resolved '{issue}'"), &fix_role)
            .await
        {
            self.escalate(issue, RecoveryStep::Verify, format!("unblock failed: {e}"), completed);
            return Err(e);
        }
        tracing::info!("Issue '{}' resolved by '{}' (cause: {})", issue, fix_role, cause);
        Ok(RecoveryOutcome::Resolved {
            issue: issue.to_string(),
            cause,
            fixed_by: fix_role,
            completed_steps: completed,
        })
    }

    async fn apply_fix(&self, role: &str, options: InvocationOptions) -> Result<Value, String> {
        let task = RecoveryStep::RouteAndFix.task();
        if self.config.route_fixes_through_router {
            let decision = self.router.make_decision(role, task, options).await;
            if decision.succeeded() {
                return Ok(decision.result.map(|r| r.payload).unwrap_or(Value::Null));
            }
            return Err(decision
                .rejection_reason
                .clone()
                .or_else(|| decision.result.as_ref().map(InvocationResult::error_message))
                .unwrap_or_else(|| "fix decision was not executed".to_string()));
        }

        let result = self.channel.invoke(role, task, options).await;
        if result.success {
            Ok(result.payload)
        } else {
            Err(result.error_message())
        }
    }

    fn escalate(
        &self,
        issue: &str,
        step: RecoveryStep,
        reason: String,
        completed_steps: Vec<RecoveryStep>,
    ) -> RecoveryOutcome {
        tracing::warn!("Auto recovery for '{}' escalated at {}: {}", issue, step, reason);
        self.events.publish(Event::Escalation {
            issue: issue.to_string(),
            step: step.as_str().to_string(),
            reason: reason.clone(),
        });
        RecoveryOutcome::Escalated {
            issue: issue.to_string(),
            failed_step: step,
            reason,
            completed_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::OrchestratorBuilder;
    use crate::invoker::ScriptedInvoker;
    use crate::workflow::Variant;
    use std::time::Duration;

    async fn orchestrator(invoker: ScriptedInvoker, config: AppConfig) -> (Arc<Orchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.workflow.state_dir = dir.path().to_path_buf();
        let orchestrator = OrchestratorBuilder::new(config)
            .with_invoker(Arc::new(invoker))
            .build()
            .unwrap();
        orchestrator.start();
        orchestrator.state().initialize(Variant::Fresh).await.unwrap();
        (orchestrator, dir)
    }

    fn recovery_invoker(cause: &'static str, resolved: bool) -> ScriptedInvoker {
        ScriptedInvoker::new()
            .on("analyst", move |task, _| {
                if task == "analyze-issue" {
                    InvocationResult::ok(json!({"cause": cause}))
                } else {
                    InvocationResult::ok(json!({"affected": ["requirements"]}))
                }
            })
            .on("qa", move |_, _| InvocationResult::ok(json!({"resolved": resolved})))
    }

    #[tokio::test]
    async fn test_phase_entry_initializes_roles() {
        let invoker = ScriptedInvoker::new();
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;

        orch.state()
            .transition_to("requirements", "manual", true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let init_calls: Vec<String> = invoker
            .calls()
            .into_iter()
            .filter(|c| c.task == "initialize")
            .map(|c| c.role)
            .collect();
        assert!(init_calls.contains(&"analyst".to_string()));
        assert!(init_calls.contains(&"product-owner".to_string()));
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_primary_failure_skips_validators() {
        let invoker = ScriptedInvoker::new().failing("developer", "compile error");
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;

        let outcome = orch
            .execute_with_parallel_validation("developer", "build", InvocationOptions::new())
            .await;
        assert_eq!(outcome.status(), "failed");
        assert_eq!(invoker.call_count("reviewer"), 0);
    }

    #[tokio::test]
    async fn test_all_validators_pass() {
        let invoker = ScriptedInvoker::new();
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;

        let outcome = orch
            .execute_with_parallel_validation("developer", "build", InvocationOptions::new())
            .await;
        assert!(outcome.is_validated());
        let review = invoker.calls().into_iter().find(|c| c.role == "reviewer").unwrap();
        assert_eq!(review.options.get("primary_role"), Some(&json!("developer")));
    }

    #[tokio::test]
    async fn test_one_failed_validator_needs_review() {
        let invoker = ScriptedInvoker::new().failing("reviewer", "style violations");
        let (orch, _dir) = orchestrator(invoker, AppConfig::default()).await;

        match orch
            .execute_with_parallel_validation("developer", "build", InvocationOptions::new())
            .await
        {
            ValidationOutcome::NeedsReview { failures, report, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].role, "reviewer");
                assert_eq!(report.successful, 1);
            }
            other => panic!("unexpected {}", other.status()),
        }
    }

    #[tokio::test]
    async fn test_blocking_conditions_block_phase() {
        let (orch, _dir) = orchestrator(ScriptedInvoker::new(), AppConfig::default()).await;
        let context: InvocationOptions = [
            ("pass_rate".to_string(), json!(0.5)),
            ("critical_drift".to_string(), json!(true)),
            ("performance_regression".to_string(), json!(0.05)),
        ]
        .into_iter()
        .collect();

        let hits = orch.check_blocking_conditions(&context).await.unwrap();
        assert_eq!(hits, vec![PASS_RATE_BELOW_THRESHOLD, CRITICAL_DRIFT]);

        let snapshot = orch.state().snapshot().unwrap();
        let meta = snapshot.current_metadata().unwrap();
        assert!(meta.blocked);
        assert_eq!(meta.blocking_issues.len(), 2);
    }

    #[tokio::test]
    async fn test_no_conditions_leaves_phase_unblocked() {
        let (orch, _dir) = orchestrator(ScriptedInvoker::new(), AppConfig::default()).await;
        let context: InvocationOptions = [("pass_rate".to_string(), json!(0.95))].into_iter().collect();
        assert!(orch.check_blocking_conditions(&context).await.unwrap().is_empty());
        assert!(!orch.state().snapshot().unwrap().current_metadata().unwrap().blocked);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.workflow.state_dir = dir.path().to_path_buf();
        let orch = OrchestratorBuilder::new(config)
            .with_invoker(Arc::new(ScriptedInvoker::new()))
            .with_predicate(BlockingPredicate::new("license-violation", |ctx| {
                context_flag(ctx, "gpl_dependency")
            }))
            .build()
            .unwrap();
        orch.state().initialize(Variant::Fresh).await.unwrap();

        let context: InvocationOptions =
            [("gpl_dependency".to_string(), json!(true))].into_iter().collect();
        assert_eq!(
            orch.check_blocking_conditions(&context).await.unwrap(),
            vec!["license-violation"]
        );
    }

    #[tokio::test]
    async fn test_recovery_resolves_and_unblocks() {
        let invoker = recovery_invoker("implementation-bug", true);
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;
        orch.state().block(CRITICAL_DRIFT, Value::Null).await.unwrap();

        let outcome = orch
            .execute_auto_recovery(CRITICAL_DRIFT, InvocationOptions::new())
            .await
            .unwrap();

        match outcome {
            RecoveryOutcome::Resolved { fixed_by, completed_steps, .. } => {
                assert_eq!(fixed_by, "developer");
                assert_eq!(completed_steps.len(), 6);
            }
            other => panic!("unexpected {other:?}"),
        }
        let fix = invoker.calls().into_iter().find(|c| c.task == "apply-fix").unwrap();
        assert_eq!(fix.role, "developer");
        assert_eq!(fix.options.get("analysis"), Some(&json!({"cause": "implementation-bug"})));
        assert!(!orch.state().snapshot().unwrap().current_metadata().unwrap().blocked);
    }

    #[tokio::test]
    async fn test_recovery_aborts_at_failing_step() {
        let invoker = recovery_invoker("truth-gap", true).failing("architect", "no source of truth");
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;
        let mut escalations = orch.events().subscribe(&[Topic::Escalation]);

        let outcome = orch
            .execute_auto_recovery("traceability-broken", InvocationOptions::new())
            .await
            .unwrap();

        assert_eq!(outcome.failed_step(), Some(RecoveryStep::TruthCheck));
        assert!(invoker.calls().iter().all(|c| c.task != "trace-impact"));
        match escalations.recv().await.unwrap() {
            Event::Escalation { step, reason, .. } => {
                assert_eq!(step, "truth-check");
                assert_eq!(reason, "no source of truth");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_human_cause_escalates() {
        let invoker = recovery_invoker("unclear-requirement", true);
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;

        let outcome = orch
            .execute_auto_recovery("ambiguity", InvocationOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed_step(), Some(RecoveryStep::RouteAndFix));
        assert_eq!(invoker.calls().iter().filter(|c| c.task == "apply-fix").count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_cause_escalates() {
        let invoker = recovery_invoker("cosmic-rays", true);
        let (orch, _dir) = orchestrator(invoker, AppConfig::default()).await;
        let outcome = orch
            .execute_auto_recovery("flake", InvocationOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed_step(), Some(RecoveryStep::RouteAndFix));
    }

    #[tokio::test]
    async fn test_unconfirmed_resolution_keeps_block() {
        let invoker = recovery_invoker("test-error", false);
        let (orch, _dir) = orchestrator(invoker, AppConfig::default()).await;
        orch.state().block("flaky-suite", Value::Null).await.unwrap();

        let outcome = orch
            .execute_auto_recovery("flaky-suite", InvocationOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed_step(), Some(RecoveryStep::Verify));
        assert!(orch.state().snapshot().unwrap().current_metadata().unwrap().blocked);
    }

    #[tokio::test]
    async fn test_fix_routed_through_router() {
        let mut config = AppConfig::default();
        config.orchestrator.route_fixes_through_router = true;
        config
            .router
            .always_require_approval
            .insert("developer".to_string(), vec!["apply-fix".to_string()]);
        let invoker = recovery_invoker("implementation-bug", true);
        let (orch, _dir) = orchestrator(invoker.clone(), config).await;

        let router = Arc::clone(orch.router());
        let approver = tokio::spawn(async move {
            loop {
                if let Some(pending) = router.pending_approvals().await.first() {
                    router.reject(&pending.decision_id, "not during freeze").await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let outcome = orch
            .execute_auto_recovery("regression", InvocationOptions::new())
            .await
            .unwrap();
        approver.await.unwrap();

        match outcome {
            RecoveryOutcome::Escalated { failed_step, reason, .. } => {
                assert_eq!(failed_step, RecoveryStep::RouteAndFix);
                assert_eq!(reason, "not during freeze");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(invoker.calls().iter().filter(|c| c.task == "apply-fix").count(), 0);
    }

    #[tokio::test]
    async fn test_blocked_phase_triggers_recovery_when_enabled() {
        let mut config = AppConfig::default();
        config.orchestrator.auto_recover_blocked = true;
        let invoker = recovery_invoker("test-error", true);
        let (orch, _dir) = orchestrator(invoker.clone(), config).await;
        let mut unblocked = orch.events().subscribe(&[Topic::PhaseUnblocked]);

        orch.state().block("flaky-suite", Value::Null).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), unblocked.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::PhaseUnblocked { resolved_by, .. } if resolved_by == "qa"));
    }

    #[tokio::test]
    async fn test_blocked_signal_survives_event_flood() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.workflow.state_dir = dir.path().to_path_buf();
        config.orchestrator.auto_recover_blocked = true;
        let invoker = recovery_invoker("test-error", true).delay("analyst", Duration::from_millis(200));
        let orch = OrchestratorBuilder::new(config)
            .with_invoker(Arc::new(invoker))
            .with_events(EventBus::new(16))
            .build()
            .unwrap();
        orch.start();
        orch.state().initialize(Variant::Fresh).await.unwrap();

        orch.state().block("flaky-suite", Value::Null).await.unwrap();
        for i in 0..100 {
            orch.executor()
                .fire_and_forget("documenter", &format!("note-{i}"), InvocationOptions::new(), Priority::Low)
                .await;
        }

        let state = Arc::clone(orch.state());
        tokio::time::timeout(Duration::from_secs(5), async move {
            while state.snapshot().unwrap().current_metadata().unwrap().blocked {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_phase_entry_does_not_stall_listener() {
        let invoker = ScriptedInvoker::new().hang("analyst");
        let (orch, _dir) = orchestrator(invoker.clone(), AppConfig::default()).await;

        orch.state()
            .transition_to("requirements", "manual", true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(invoker
            .calls()
            .iter()
            .any(|c| c.role == "product-owner" && c.task == "initialize"));
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_unblock_failure_escalates() {
        let invoker = recovery_invoker("implementation-bug", true);
        let (orch, _dir) = orchestrator(invoker, AppConfig::default()).await;
        let mut escalations = orch.events().subscribe_reliable(&[Topic::Escalation]);
        orch.state().block(CRITICAL_DRIFT, Value::Null).await.unwrap();

        let backups = orch.state().store().unwrap().backup_dir();
        std::fs::remove_dir_all(&backups).unwrap();
        std::fs::write(&backups, "not a directory").unwrap();

        let err = orch
            .execute_auto_recovery(CRITICAL_DRIFT, InvocationOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Persistence(_)));
        match escalations.try_recv().unwrap() {
            Event::Escalation { step, reason, .. } => {
                assert_eq!(step, "verify");
                assert!(reason.starts_with("unblock failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(orch.state().snapshot().unwrap().current_metadata().unwrap().blocked);
    }
}
