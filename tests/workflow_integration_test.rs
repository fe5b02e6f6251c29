//! 编排核心集成测试：通过 OrchestratorBuilder 装配完整组件，使用脚本化调用器

use std::sync::Arc;
use std::time::Duration;

use maestro::background::{ExecutionStatus, Priority};
use maestro::collaboration::CollaborationMode;
use maestro::config::AppConfig;
use maestro::core::{GraphError, Orchestrator, OrchestratorBuilder, WorkflowError};
use maestro::decision::{ConfidenceWeights, DecisionStatus, RoutingLevel};
use maestro::events::{Event, Topic};
use maestro::invoker::{InvocationOptions, InvocationResult, ScriptedInvoker};
use maestro::workflow::{Variant, AUTOMATIC};
use serde_json::json;

fn config_in(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.workflow.state_dir = dir.to_path_buf();
    config
}

fn build(config: AppConfig, invoker: ScriptedInvoker) -> Arc<Orchestrator> {
    OrchestratorBuilder::new(config)
        .with_invoker(Arc::new(invoker))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_workflow_advances_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let orch = build(config_in(dir.path()), ScriptedInvoker::new());
    orch.start();
    orch.state().initialize(Variant::Fresh).await.unwrap();
    assert_eq!(orch.state().current_phase().as_deref(), Some("ideation"));

    let err = orch
        .state()
        .transition_to("requirements", AUTOMATIC, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::PreconditionsUnmet { .. }));

    orch.state()
        .mark_exit_condition("vision_documented", true)
        .await
        .unwrap();
    assert!(orch.state().can_auto_transition().unwrap());
    orch.state()
        .transition_to("requirements", AUTOMATIC, false)
        .await
        .unwrap();
    orch.shutdown();

    // 同一状态目录重新装配：加载持久化状态而不是重新开始
    let restarted = build(config_in(dir.path()), ScriptedInvoker::new());
    let instance = restarted.state().initialize(Variant::Fresh).await.unwrap();
    assert_eq!(instance.current_phase, "requirements");
    assert_eq!(instance.history.len(), 2);
}

#[tokio::test]
async fn test_corrupt_primary_restores_last_backup() {
    let dir = tempfile::tempdir().unwrap();
    let orch = build(config_in(dir.path()), ScriptedInvoker::new());
    orch.state().initialize(Variant::ExistingSystem).await.unwrap();
    orch.state()
        .transition_to("architecture", "manual", true)
        .await
        .unwrap();
    orch.state().record_artifact("adr-001").await.unwrap();
    let expected = orch.state().snapshot().unwrap();

    let primary = orch.state().store().unwrap().primary_path();
    std::fs::write(&primary, "{ not json").unwrap();

    let restarted = build(config_in(dir.path()), ScriptedInvoker::new());
    let recovered = restarted.state().initialize(Variant::ExistingSystem).await.unwrap();
    assert_eq!(recovered, expected);
}

#[tokio::test]
async fn test_rollback_then_reenter_resets_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let orch = build(config_in(dir.path()), ScriptedInvoker::new());
    let mut invalidated = orch.events().subscribe(&[Topic::ArtifactsInvalidated]);
    orch.state().initialize(Variant::Fresh).await.unwrap();
    orch.state().transition_to("requirements", "manual", true).await.unwrap();
    orch.state().set_validation_gate("traceability", true).await.unwrap();
    orch.state().transition_to("architecture", "manual", true).await.unwrap();
    orch.state().record_artifact("c4-diagram").await.unwrap();

    orch.state().rollback(None).await.unwrap();
    let after_rollback = orch.state().snapshot().unwrap();
    assert_eq!(after_rollback.current_phase, "requirements");
    assert!(!after_rollback.current_metadata().unwrap().validation_gates_status["traceability"]);
    assert!(invalidated.try_recv().is_some());

    orch.state().transition_to("architecture", "manual", true).await.unwrap();
    let reentered = orch.state().snapshot().unwrap();
    assert!(reentered.current_metadata().unwrap().artifacts_created.is_empty());
}

#[tokio::test]
async fn test_confident_decision_runs_without_approval() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.router.weights = ConfidenceWeights {
        history: 0.0,
        validation: 0.5,
        coverage: 0.5,
        accuracy: 0.0,
        complexity: 0.0,
    };
    let invoker = ScriptedInvoker::new();
    let orch = build(config, invoker.clone());
    let mut approvals = orch.events().subscribe(&[Topic::ApprovalRequired]);

    let context: InvocationOptions = [
        ("validation_strength".to_string(), json!(1.0)),
        ("coverage".to_string(), json!(1.0)),
    ]
    .into_iter()
    .collect();
    let decision = orch.router().make_decision("developer", "refactor", context).await;

    assert_eq!(decision.level, RoutingLevel::FullyAutomatic);
    assert_eq!(decision.status, DecisionStatus::Approved);
    assert!(decision.succeeded());
    assert_eq!(invoker.call_count("developer"), 1);
    assert!(approvals.try_recv().is_none());
    assert_eq!(orch.router().statistics().await.total, 1);
}

#[tokio::test]
async fn test_approval_waits_for_external_response() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new();
    let orch = build(config_in(dir.path()), invoker.clone());
    let mut approvals = orch.events().subscribe(&[Topic::ApprovalRequired]);

    let router = Arc::clone(orch.router());
    let pending = tokio::spawn(async move {
        router
            .make_decision("devops", "deploy", InvocationOptions::new())
            .await
    });

    let decision_id = match approvals.recv().await.unwrap() {
        Event::ApprovalRequired { decision_id, .. } => decision_id,
        other => panic!("unexpected {other:?}"),
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(invoker.call_count("devops"), 0);

    assert!(orch.router().approve(&decision_id).await);
    let decision = pending.await.unwrap();
    assert_eq!(decision.level, RoutingLevel::RequireApproval);
    assert!(decision.succeeded());
    assert_eq!(invoker.call_count("devops"), 1);
}

#[tokio::test]
async fn test_dependency_ordered_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new();
    let orch = build(config_in(dir.path()), invoker.clone());

    let roles: Vec<String> = ["devops", "qa", "developer", "architect"]
        .iter()
        .map(|r| r.to_string())
        .collect();
    let outcome = orch
        .coordinator()
        .execute(CollaborationMode::DependencyOrdered, &roles, "ship", InvocationOptions::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(
        outcome.levels,
        vec![vec!["architect"], vec!["developer"], vec!["qa"], vec!["devops"]]
    );
    let started: Vec<String> = invoker.calls().into_iter().map(|c| c.role).collect();
    assert_eq!(started, vec!["architect", "developer", "qa", "devops"]);
}

#[tokio::test]
async fn test_cyclic_dependencies_execute_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.dependencies.insert("a".to_string(), vec!["b".to_string()]);
    config.dependencies.insert("b".to_string(), vec!["a".to_string()]);
    let invoker = ScriptedInvoker::new();
    let orch = build(config, invoker.clone());

    let roles = vec!["a".to_string(), "b".to_string()];
    let err = orch
        .coordinator()
        .dependency_ordered(&roles, "t", InvocationOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::CycleDetected { .. }));
    assert!(invoker.calls().is_empty());
}

#[tokio::test]
async fn test_competitive_keeps_best_successful_solution() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ScriptedInvoker::new()
        .failing("developer-c", "timeout")
        .on("architect", |_, options| {
            let score = match options.get("candidate_role").and_then(|v| v.as_str()) {
                Some("developer-a") => 0.4,
                _ => 0.9,
            };
            InvocationResult::ok(json!({ "score": score }))
        })
        .on("qa", |_, _| InvocationResult::ok(json!({ "score": 0.5 })));
    let orch = build(config_in(dir.path()), invoker);

    let roles: Vec<String> = ["developer-a", "developer-b", "developer-c"]
        .iter()
        .map(|r| r.to_string())
        .collect();
    let outcome = orch
        .coordinator()
        .execute(CollaborationMode::Competitive, &roles, "solve", InvocationOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome.solutions.len(), 2);
    assert_eq!(outcome.winner.as_deref(), Some("developer-b"));
}

#[tokio::test]
async fn test_background_validation_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.orchestrator.validator_roles = vec!["qa".into(), "reviewer".into(), "security".into()];
    let invoker = ScriptedInvoker::new().failing("security", "CVE found");
    let orch = build(config, invoker);
    orch.start();

    let outcome = orch
        .execute_with_parallel_validation("developer", "feature-x", InvocationOptions::new())
        .await;
    assert_eq!(outcome.status(), "needs_review");

    let id = orch
        .executor()
        .fire_and_forget("documenter", "changelog", InvocationOptions::new(), Priority::Low)
        .await;
    let done = orch.executor().wait(&id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(!orch.executor().cancel_execution(&id).await);
    orch.shutdown();
}
