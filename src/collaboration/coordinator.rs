//! 协作协调器
//!
//! 所有模式都通过消息通道调用参与者。并行类模式用 `join_all` 等待全部完成，
//! 返回的结果列表始终保持参与者的请求顺序，与完成先后无关。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::channel::MessageChannel;
use crate::collaboration::types::{
    CollaborationMode, CollaborationOutcome, CollaborationSummary, ParticipantResult, PatternStats,
    ScoredSolution,
};
use crate::config::CollaborationSection;
use crate::core::{CollaborationError, GraphError};
use crate::decision::confidence::normalize;
use crate::events::{Event, EventBus};
use crate::graph::DependencyGraph;
use crate::invoker::{InvocationOptions, InvocationResult};

pub struct CollaborationCoordinator {
    pub(super) channel: Arc<MessageChannel>,
    pub(super) graph: Arc<DependencyGraph>,
    pub(super) config: CollaborationSection,
    pub(super) events: EventBus,
    history: RwLock<VecDeque<CollaborationSummary>>,
}

impl CollaborationCoordinator {
    pub fn new(
        config: CollaborationSection,
        channel: Arc<MessageChannel>,
        graph: Arc<DependencyGraph>,
        events: EventBus,
    ) -> Self {
        Self {
            channel,
            graph,
            config,
            events,
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// 按模式分派
    pub async fn execute(
        &self,
        mode: CollaborationMode,
        roles: &[String],
        task: &str,
        options: InvocationOptions,
    ) -> Result<CollaborationOutcome, CollaborationError> {
        match mode {
            CollaborationMode::Sequential => Ok(self.sequential(roles, task, options).await),
            CollaborationMode::Parallel => Ok(self.parallel(roles, task, options).await),
            CollaborationMode::Collaborative => match roles {
                [primary, supporting] => Ok(self.collaborative(primary, supporting, task, options).await),
                _ => Err(CollaborationError::InvalidParticipants {
                    mode: mode.to_string(),
                    reason: format!("expected exactly 2 roles, got {}", roles.len()),
                }),
            },
            CollaborationMode::Competitive => Ok(self.competitive(roles, task, options).await),
            CollaborationMode::DependencyOrdered => Ok(self
                .dependency_ordered(roles, task, options)
                .await?),
        }
    }

    /// 顺序执行：前一个参与者的载荷作为下一个的 `input`；任一失败立即中止
    pub async fn sequential(&self, roles: &[String], task: &str, options: InvocationOptions) -> CollaborationOutcome {
        let (mut outcome, started) = self.begin(CollaborationMode::Sequential, roles, task);
        let mut input: Option<Value> = None;
        let mut previous: Option<&str> = None;

        for role in roles {
            let mut opts = options.clone();
            if let Some(value) = input.take() {
                opts.insert("input".to_string(), value);
            }
            if let Some(prev) = previous {
                opts.insert("previous_role".to_string(), json!(prev));
            }

            let result = self.channel.invoke(role, task, opts).await;
            if !result.success {
                tracing::warn!(
                    "Sequential collaboration {} aborted at '{}' after {} results: {}",
                    outcome.id,
                    role,
                    outcome.results.len(),
                    result.error_message()
                );
                outcome.failed_participant = Some(role.clone());
                outcome.failures.push(ParticipantResult {
                    role: role.clone(),
                    result,
                });
                break;
            }
            input = Some(result.payload.clone());
            previous = Some(role);
            outcome.results.push(ParticipantResult {
                role: role.clone(),
                result,
            });
        }

        outcome.completed = outcome.results.len();
        outcome.success = outcome.failed_participant.is_none();
        if outcome.success {
            outcome.output = input;
        }
        self.finish(outcome, started).await
    }

    /// 并行执行：零失败即成功；失败与成功一并返回，不中止
    pub async fn parallel(&self, roles: &[String], task: &str, options: InvocationOptions) -> CollaborationOutcome {
        let (mut outcome, started) = self.begin(CollaborationMode::Parallel, roles, task);
        let results = self.invoke_all(roles, task, &options).await;
        split_results(&mut outcome, results);
        outcome.completed = outcome.results.len();
        outcome.success = outcome.failures.is_empty();
        self.finish(outcome, started).await
    }

    /// 协同执行：主角色与以 watch 模式伴随的支持角色，两者都成功才算成功
    pub async fn collaborative(
        &self,
        primary: &str,
        supporting: &str,
        task: &str,
        options: InvocationOptions,
    ) -> CollaborationOutcome {
        let roles = vec![primary.to_string(), supporting.to_string()];
        let (mut outcome, started) = self.begin(CollaborationMode::Collaborative, &roles, task);

        let mut primary_opts = options.clone();
        primary_opts.insert("mode".to_string(), json!("primary"));
        primary_opts.insert("supporting_role".to_string(), json!(supporting));
        let mut supporting_opts = options;
        supporting_opts.insert("mode".to_string(), json!("watch"));
        supporting_opts.insert("primary_role".to_string(), json!(primary));

        let (primary_result, supporting_result) = tokio::join!(
            self.channel.invoke(primary, task, primary_opts),
            self.channel.invoke(supporting, task, supporting_opts),
        );
        split_results(
            &mut outcome,
            vec![
                (primary.to_string(), primary_result),
                (supporting.to_string(), supporting_result),
            ],
        );
        outcome.completed = outcome.results.len();
        outcome.success = outcome.failures.is_empty();
        self.finish(outcome, started).await
    }

    /// 竞争执行：所有参与者解同一任务，成功方案由两个评分角色打分后降序排列；同分时请求顺序靠前者胜
    pub async fn competitive(&self, roles: &[String], task: &str, options: InvocationOptions) -> CollaborationOutcome {
        let (mut outcome, started) = self.begin(CollaborationMode::Competitive, roles, task);
        let results = self.invoke_all(roles, task, &options).await;
        split_results(&mut outcome, results);

        let scoring = outcome
            .results
            .iter()
            .map(|p| self.score_solution(task, p));
        let mut solutions = join_all(scoring).await;
        // 稳定排序保证同分时保持请求顺序
        solutions.sort_by(|a, b| b.score.total_cmp(&a.score));

        outcome.winner = solutions.first().map(|s| s.role.clone());
        outcome.solutions = solutions;
        outcome.completed = outcome.results.len();
        outcome.success = outcome.winner.is_some();
        if let Some(winner) = &outcome.winner {
            tracing::info!("Competitive collaboration {} won by '{}'", outcome.id, winner);
        }
        self.finish(outcome, started).await
    }

    async fn score_solution(&self, task: &str, participant: &ParticipantResult) -> ScoredSolution {
        let options: InvocationOptions = [
            ("candidate_role".to_string(), json!(participant.role)),
            ("solution".to_string(), participant.result.payload.clone()),
            ("task".to_string(), json!(task)),
        ]
        .into_iter()
        .collect();

        let (authority, secondary) = tokio::join!(
            self.channel
                .invoke(&self.config.authority_scorer, "score", options.clone()),
            self.channel
                .invoke(&self.config.secondary_scorer, "score", options),
        );
        let authority_score = score_of(&authority);
        let secondary_score = score_of(&secondary);
        ScoredSolution {
            role: participant.role.clone(),
            result: participant.result.clone(),
            authority_score,
            secondary_score,
            score: self.config.authority_weight * authority_score
                + self.config.secondary_weight * secondary_score,
        }
    }

    /// 依赖有序执行：拓扑分层后逐层并行；成环时不执行任何角色，某层失败则中止后续层
    pub async fn dependency_ordered(
        &self,
        roles: &[String],
        task: &str,
        options: InvocationOptions,
    ) -> Result<CollaborationOutcome, GraphError> {
        let levels = self.graph.levels(roles)?;
        let (mut outcome, started) = self.begin(CollaborationMode::DependencyOrdered, roles, task);
        outcome.levels = levels.clone();
        let mut outputs: HashMap<String, Value> = HashMap::new();

        for (index, level) in levels.iter().enumerate() {
            tracing::debug!("Collaboration {} running level {}: {:?}", outcome.id, index, level);
            let invocations = level.iter().map(|role| {
                let mut opts = options.clone();
                let upstream: serde_json::Map<String, Value> = self
                    .graph
                    .depends_on(role)
                    .iter()
                    .filter_map(|dep| outputs.get(dep).map(|v| (dep.clone(), v.clone())))
                    .collect();
                if !upstream.is_empty() {
                    opts.insert("upstream".to_string(), Value::Object(upstream));
                }
                async move { (role.clone(), self.channel.invoke(role, task, opts).await) }
            });
            let results = join_all(invocations).await;

            let failed = results.iter().any(|(_, r)| !r.success);
            for (role, result) in &results {
                if result.success {
                    outputs.insert(role.clone(), result.payload.clone());
                }
            }
            split_results(&mut outcome, results);

            if failed {
                tracing::warn!(
                    "Dependency-ordered collaboration {} aborted at level {}",
                    outcome.id,
                    index
                );
                outcome.failed_level = Some(index);
                break;
            }
        }

        outcome.completed = outcome.results.len();
        outcome.success = outcome.failed_level.is_none();
        Ok(self.finish(outcome, started).await)
    }

    async fn invoke_all(
        &self,
        roles: &[String],
        task: &str,
        options: &InvocationOptions,
    ) -> Vec<(String, InvocationResult)> {
        let invocations = roles.iter().map(|role| async move {
            let result = self.channel.invoke(role, task, options.clone()).await;
            (role.clone(), result)
        });
        join_all(invocations).await
    }

    fn begin(&self, mode: CollaborationMode, roles: &[String], task: &str) -> (CollaborationOutcome, Instant) {
        let id = format!("collab_{}", uuid::Uuid::new_v4());
        tracing::info!("Collaboration {} started ({}) with {:?}", id, mode, roles);
        self.events.publish(Event::CollaborationStarted {
            collaboration_id: id.clone(),
            mode: mode.to_string(),
            participants: roles.to_vec(),
        });
        (CollaborationOutcome::new(id, mode, roles, task), Instant::now())
    }

    async fn finish(&self, mut outcome: CollaborationOutcome, started: Instant) -> CollaborationOutcome {
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Collaboration {} finished ({}): success={}, {} results, {} failures",
            outcome.id,
            outcome.mode,
            outcome.success,
            outcome.results.len(),
            outcome.failures.len()
        );
        self.events.publish(Event::CollaborationFinished {
            collaboration_id: outcome.id.clone(),
            mode: outcome.mode.to_string(),
            success: outcome.success,
        });

        let mut history = self.history.write().await;
        if history.len() >= self.config.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(CollaborationSummary {
            id: outcome.id.clone(),
            mode: outcome.mode,
            participants: outcome.participants.clone(),
            success: outcome.success,
            duration_ms: outcome.duration_ms,
            finished_at: Utc::now(),
        });
        outcome
    }

    pub async fn history(&self) -> Vec<CollaborationSummary> {
        self.history.read().await.iter().cloned().collect()
    }

    /// 各模式的成功率与平均耗时
    pub async fn pattern_statistics(&self) -> BTreeMap<CollaborationMode, PatternStats> {
        let history = self.history.read().await;
        let mut stats: BTreeMap<CollaborationMode, PatternStats> = BTreeMap::new();
        for summary in history.iter() {
            let entry = stats.entry(summary.mode).or_default();
            entry.total += 1;
            entry.successful += usize::from(summary.success);
            entry.average_duration_ms += summary.duration_ms as f64;
        }
        for entry in stats.values_mut() {
            entry.success_rate = entry.successful as f64 / entry.total as f64;
            entry.average_duration_ms /= entry.total as f64;
        }
        stats
    }
}

/// 评分载荷中的 `score`（或裸数值），失败或缺失记 0
fn score_of(result: &InvocationResult) -> f64 {
    if !result.success {
        return 0.0;
    }
    result.number("score").map(normalize).unwrap_or(0.0)
}

fn split_results(outcome: &mut CollaborationOutcome, results: Vec<(String, InvocationResult)>) {
    for (role, result) in results {
        let entry = ParticipantResult { role, result };
        if entry.result.success {
            outcome.results.push(entry);
        } else {
            outcome.failures.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::ScriptedInvoker;
    use std::time::Duration;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn coordinator(invoker: ScriptedInvoker) -> CollaborationCoordinator {
        let channel = Arc::new(MessageChannel::new(Arc::new(invoker), Duration::from_secs(2)));
        CollaborationCoordinator::new(
            CollaborationSection::default(),
            channel,
            Arc::new(DependencyGraph::standard()),
            EventBus::default(),
        )
    }

    /// 评分角色按候选角色名给分
    fn scorer(scores: &'static [(&'static str, f64)]) -> impl Fn(&str, &InvocationOptions) -> InvocationResult {
        move |_, options| {
            let candidate = options
                .get("candidate_role")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let score = scores
                .iter()
                .find(|(role, _)| *role == candidate)
                .map(|(_, s)| *s)
                .unwrap_or(0.0);
            InvocationResult::ok(json!({ "score": score }))
        }
    }

    #[tokio::test]
    async fn test_sequential_chains_output() {
        let invoker = ScriptedInvoker::new()
            .on("analyst", |_, _| InvocationResult::ok(json!("draft")))
            .on("architect", |_, opts| {
                let input = opts.get("input").and_then(Value::as_str).unwrap_or_default();
                InvocationResult::ok(json!(format!("{input}+design")))
            });
        let outcome = coordinator(invoker)
            .sequential(&roles(&["analyst", "architect"]), "outline", InvocationOptions::new())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.output, Some(json!("draft+design")));
    }

    #[tokio::test]
    async fn test_sequential_aborts_on_failure() {
        let invoker = ScriptedInvoker::new().failing("architect", "no capacity");
        let outcome = coordinator(invoker.clone())
            .sequential(&roles(&["analyst", "architect", "developer"]), "t", InvocationOptions::new())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.failed_participant.as_deref(), Some("architect"));
        assert_eq!(outcome.completed, 1);
        assert_eq!(invoker.call_count("developer"), 0);
    }

    #[tokio::test]
    async fn test_parallel_preserves_request_order() {
        let invoker = ScriptedInvoker::new()
            .delay("qa", Duration::from_millis(40))
            .failing("reviewer", "lint errors");
        let outcome = coordinator(invoker)
            .parallel(&roles(&["qa", "developer", "reviewer"]), "check", InvocationOptions::new())
            .await;

        assert!(!outcome.success);
        let ok: Vec<_> = outcome.results.iter().map(|p| p.role.as_str()).collect();
        assert_eq!(ok, vec!["qa", "developer"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].role, "reviewer");
    }

    #[tokio::test]
    async fn test_collaborative_runs_supporting_in_watch_mode() {
        let invoker = ScriptedInvoker::new();
        let outcome = coordinator(invoker.clone())
            .collaborative("developer", "qa", "implement", InvocationOptions::new())
            .await;

        assert!(outcome.success);
        let qa_call = invoker.calls().into_iter().find(|c| c.role == "qa").unwrap();
        assert_eq!(qa_call.options.get("mode"), Some(&json!("watch")));
    }

    #[tokio::test]
    async fn test_execute_collaborative_requires_two_roles() {
        let result = coordinator(ScriptedInvoker::new())
            .execute(
                CollaborationMode::Collaborative,
                &roles(&["developer"]),
                "t",
                InvocationOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(CollaborationError::InvalidParticipants { .. })));
    }

    #[tokio::test]
    async fn test_competitive_picks_highest_score() {
        let invoker = ScriptedInvoker::new()
            .failing("dev-c", "crashed")
            .on("architect", scorer(&[("dev-a", 0.5), ("dev-b", 0.9)]))
            .on("qa", scorer(&[("dev-a", 0.8), ("dev-b", 0.7)]));
        let outcome = coordinator(invoker)
            .competitive(&roles(&["dev-a", "dev-b", "dev-c"]), "solve", InvocationOptions::new())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.solutions.len(), 2);
        assert_eq!(outcome.winner.as_deref(), Some("dev-b"));
        // 0.6 * 0.9 + 0.4 * 0.7
        assert!((outcome.solutions[0].score - 0.82).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_competitive_tie_goes_to_first_requested() {
        let invoker = ScriptedInvoker::new()
            .on("architect", |_, _| InvocationResult::ok(json!({ "score": 0.5 })))
            .on("qa", |_, _| InvocationResult::ok(json!({ "score": 0.5 })));
        let outcome = coordinator(invoker)
            .competitive(&roles(&["dev-b", "dev-a"]), "solve", InvocationOptions::new())
            .await;
        assert_eq!(outcome.winner.as_deref(), Some("dev-b"));
    }

    #[tokio::test]
    async fn test_dependency_ordered_runs_after_dependencies() {
        let invoker = ScriptedInvoker::new().delay("developer", Duration::from_millis(20));
        let outcome = coordinator(invoker.clone())
            .dependency_ordered(&roles(&["devops", "qa", "developer", "reviewer"]), "ship", InvocationOptions::new())
            .await
            .unwrap();

        assert!(outcome.success);
        let calls = invoker.calls();
        let started = |r: &str| calls.iter().find(|c| c.role == r).unwrap().started_at;
        let finished = |r: &str| calls.iter().find(|c| c.role == r).unwrap().finished_at.unwrap();
        assert!(finished("developer") <= started("qa"));
        assert!(finished("developer") <= started("reviewer"));
        assert!(finished("qa") <= started("devops"));
        assert!(finished("reviewer") <= started("devops"));

        let devops = calls.iter().find(|c| c.role == "devops").unwrap();
        let upstream = devops.options.get("upstream").unwrap();
        assert!(upstream.get("qa").is_some());
    }

    #[tokio::test]
    async fn test_dependency_ordered_cycle_executes_nothing() {
        let invoker = ScriptedInvoker::new();
        let channel = Arc::new(MessageChannel::new(Arc::new(invoker.clone()), Duration::from_secs(1)));
        let graph = DependencyGraph::from_dependencies([("a", vec!["b"]), ("b", vec!["a"])]);
        let coordinator = CollaborationCoordinator::new(
            CollaborationSection::default(),
            channel,
            Arc::new(graph),
            EventBus::default(),
        );

        let err = coordinator
            .dependency_ordered(&roles(&["a", "b"]), "t", InvocationOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_ordered_aborts_failed_level() {
        let invoker = ScriptedInvoker::new().failing("developer", "build failed");
        let outcome = coordinator(invoker.clone())
            .dependency_ordered(&roles(&["architect", "developer", "qa"]), "t", InvocationOptions::new())
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.failed_level, Some(1));
        assert_eq!(invoker.call_count("qa"), 0);
    }

    #[tokio::test]
    async fn test_pattern_statistics() {
        let invoker = ScriptedInvoker::new().failing("reviewer", "nope");
        let c = coordinator(invoker);
        c.parallel(&roles(&["qa"]), "t", InvocationOptions::new()).await;
        c.parallel(&roles(&["reviewer"]), "t", InvocationOptions::new()).await;
        c.sequential(&roles(&["qa"]), "t", InvocationOptions::new()).await;

        let stats = c.pattern_statistics().await;
        assert_eq!(stats[&CollaborationMode::Parallel].total, 2);
        assert_eq!(stats[&CollaborationMode::Parallel].success_rate, 0.5);
        assert_eq!(stats[&CollaborationMode::Sequential].successful, 1);
        assert_eq!(c.history().await.len(), 3);
    }
}
