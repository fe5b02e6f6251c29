//! 决策路由器
//!
//! `make_decision` 计算置信度并选择自治级别，然后按级别执行：
//! - fully_automatic：立即执行
//! - automatic_with_notification：执行前后各发一条通知
//! - automatic_with_preview：发布预览，延迟到期前未被取消则执行（计时器与取消信号竞争，先到者生效）
//! - require_approval：发布审批请求并挂起，直到 `approve` / `reject`（可选超时，超时视为拒绝）
//!
//! 等待中的预览与审批以决策 id 为键登记，解决后立即移除。无论哪个级别，决策返回前都会写入有界历史。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{oneshot, RwLock};

use crate::channel::MessageChannel;
use crate::config::RouterSection;
use crate::core::ConfigError;
use crate::decision::confidence::ConfidenceModel;
use crate::decision::history::DecisionHistory;
use crate::decision::types::{
    AutoProceedCheck, Decision, DecisionStatus, PendingApprovalInfo, RouterStatistics, RoutingLevel,
};
use crate::events::{Event, EventBus};
use crate::invoker::InvocationOptions;

/// 审批结果
#[derive(Debug)]
enum Verdict {
    Approved,
    Rejected(String),
}

struct PendingApproval {
    info: PendingApprovalInfo,
    responder: oneshot::Sender<Verdict>,
}

/// 决策路由器（通过 Arc 共享，审批与取消由其他任务调用）
pub struct DecisionRouter {
    model: ConfidenceModel,
    preview_delay: Duration,
    approval_timeout: Option<Duration>,
    always_require_approval: HashMap<String, HashSet<String>>,
    auto_proceed_conditions: HashMap<String, Vec<String>>,
    history: RwLock<DecisionHistory>,
    approvals: RwLock<HashMap<String, PendingApproval>>,
    previews: RwLock<HashMap<String, oneshot::Sender<()>>>,
    channel: Arc<MessageChannel>,
    events: EventBus,
}

impl DecisionRouter {
    /// 构造时校验权重与阈值
    pub fn new(
        config: &RouterSection,
        channel: Arc<MessageChannel>,
        events: EventBus,
    ) -> Result<Self, ConfigError> {
        let model = ConfidenceModel::new(config.weights, config.thresholds)?;
        if !(0.0..=1.0).contains(&config.history_prior) {
            return Err(ConfigError::Invalid(format!(
                "history_prior must be within [0, 1], got {}",
                config.history_prior
            )));
        }
        let always_require_approval = config
            .always_require_approval
            .iter()
            .map(|(role, actions)| (role.clone(), actions.iter().cloned().collect()))
            .collect();

        Ok(Self {
            model,
            preview_delay: Duration::from_millis(config.preview_delay_ms),
            approval_timeout: config.approval_timeout_ms.map(Duration::from_millis),
            always_require_approval,
            auto_proceed_conditions: config.auto_proceed_conditions.clone(),
            history: RwLock::new(DecisionHistory::new(
                config.history_capacity,
                config.history_prior,
            )),
            approvals: RwLock::new(HashMap::new()),
            previews: RwLock::new(HashMap::new()),
            channel,
            events,
        })
    }

    fn requires_approval(&self, role: &str, action: &str) -> bool {
        self.always_require_approval
            .get(role)
            .map(|actions| actions.contains(action))
            .unwrap_or(false)
    }

    /// 计算置信度、路由并执行；返回已写入历史的决策
    pub async fn make_decision(&self, role: &str, action: &str, context: InvocationOptions) -> Decision {
        let factors = {
            let history = self.history.read().await;
            self.model.factors(&history, role, action, &context)
        };
        let confidence = self.model.score(&factors);
        let level = if self.requires_approval(role, action) {
            RoutingLevel::RequireApproval
        } else {
            self.model.level(confidence)
        };

        let mut decision = Decision {
            id: format!("dec_{}", uuid::Uuid::new_v4()),
            role: role.to_string(),
            action: action.to_string(),
            context,
            confidence,
            factors,
            level,
            status: DecisionStatus::Pending,
            result: None,
            rejection_reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        tracing::info!(
            role = %role,
            action = %action,
            "Decision {} routed to {} (confidence {:.3})",
            decision.id,
            level,
            confidence
        );
        self.events.publish(Event::DecisionRequested {
            decision_id: decision.id.clone(),
            role: role.to_string(),
            action: action.to_string(),
            confidence,
            level: level.as_str().to_string(),
        });

        match level {
            RoutingLevel::FullyAutomatic => self.execute(&mut decision).await,
            RoutingLevel::AutomaticWithNotification => {
                self.notify(&decision, "before_execution");
                self.execute(&mut decision).await;
                self.notify(&decision, "after_execution");
            }
            RoutingLevel::AutomaticWithPreview => self.run_preview(&mut decision).await,
            RoutingLevel::RequireApproval => self.run_approval(&mut decision).await,
        }

        decision.resolved_at = Some(Utc::now());
        self.events.publish(Event::DecisionResolved {
            decision_id: decision.id.clone(),
            status: decision.status.as_str().to_string(),
        });
        self.history.write().await.push(decision.clone());
        decision
    }

    async fn execute(&self, decision: &mut Decision) {
        decision.status = DecisionStatus::Approved;
        let result = self
            .channel
            .invoke(&decision.role, &decision.action, decision.context.clone())
            .await;
        if !result.success {
            tracing::warn!(
                "Decision {} executed but '{}' failed: {}",
                decision.id,
                decision.role,
                result.error_message()
            );
        }
        decision.result = Some(result);
    }

    fn notify(&self, decision: &Decision, stage: &str) {
        self.events.publish(Event::DecisionNotification {
            decision_id: decision.id.clone(),
            role: decision.role.clone(),
            action: decision.action.clone(),
            stage: stage.to_string(),
        });
    }

    async fn run_preview(&self, decision: &mut Decision) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.previews
            .write()
            .await
            .insert(decision.id.clone(), cancel_tx);

        let preview = json!({
            "role": decision.role,
            "action": decision.action,
            "confidence": decision.confidence,
            "context": decision.context,
        });
        self.events.publish(Event::PreviewShown {
            decision_id: decision.id.clone(),
            preview,
            delay_ms: self.preview_delay.as_millis() as u64,
        });

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.preview_delay) => false,
            signal = cancel_rx => signal.is_ok(),
        };
        self.previews.write().await.remove(&decision.id);

        if cancelled {
            tracing::info!("Preview of decision {} cancelled", decision.id);
            decision.status = DecisionStatus::Rejected;
            decision.rejection_reason = Some("preview cancelled".to_string());
        } else {
            self.execute(decision).await;
        }
    }

    async fn run_approval(&self, decision: &mut Decision) {
        let (tx, rx) = oneshot::channel();
        let info = PendingApprovalInfo {
            decision_id: decision.id.clone(),
            role: decision.role.clone(),
            action: decision.action.clone(),
            confidence: decision.confidence,
            requested_at: Utc::now(),
        };
        self.approvals.write().await.insert(
            decision.id.clone(),
            PendingApproval {
                info,
                responder: tx,
            },
        );
        self.events.publish(Event::ApprovalRequired {
            decision_id: decision.id.clone(),
            role: decision.role.clone(),
            action: decision.action.clone(),
            confidence: decision.confidence,
        });

        let verdict = match self.approval_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(v) => v.ok(),
                Err(_) => Some(Verdict::Rejected(format!(
                    "approval timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => rx.await.ok(),
        };
        self.approvals.write().await.remove(&decision.id);

        match verdict {
            Some(Verdict::Approved) => {
                tracing::info!("Decision {} approved", decision.id);
                self.execute(decision).await;
            }
            Some(Verdict::Rejected(reason)) => {
                tracing::info!("Decision {} rejected: {}", decision.id, reason);
                decision.status = DecisionStatus::Rejected;
                decision.rejection_reason = Some(reason);
            }
            None => {
                decision.status = DecisionStatus::Rejected;
                decision.rejection_reason = Some("approval channel closed".to_string());
            }
        }
    }

    /// 批准等待中的决策；id 未知或已解决时返回 false
    pub async fn approve(&self, decision_id: &str) -> bool {
        self.resolve(decision_id, Verdict::Approved).await
    }

    pub async fn reject(&self, decision_id: &str, reason: &str) -> bool {
        self.resolve(decision_id, Verdict::Rejected(reason.to_string()))
            .await
    }

    async fn resolve(&self, decision_id: &str, verdict: Verdict) -> bool {
        match self.approvals.write().await.remove(decision_id) {
            Some(pending) => pending.responder.send(verdict).is_ok(),
            None => false,
        }
    }

    /// 在预览窗口内取消执行
    pub async fn cancel_preview(&self, decision_id: &str) -> bool {
        match self.previews.write().await.remove(decision_id) {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    pub async fn pending_approvals(&self) -> Vec<PendingApprovalInfo> {
        let mut pending: Vec<_> = self
            .approvals
            .read()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect();
        pending.sort_by_key(|p| p.requested_at);
        pending
    }

    pub async fn pending_previews(&self) -> Vec<String> {
        self.previews.read().await.keys().cloned().collect()
    }

    /// 检查角色声明的条件是否都在上下文中为真（纯函数，不经过决策流程）
    pub fn can_auto_proceed(&self, role: &str, context: &InvocationOptions) -> AutoProceedCheck {
        let unmet: Vec<String> = self
            .auto_proceed_conditions
            .get(role)
            .map(|conditions| {
                conditions
                    .iter()
                    .filter(|c| !context.get(c.as_str()).map(truthy).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        AutoProceedCheck {
            can_proceed: unmet.is_empty(),
            unmet,
        }
    }

    pub async fn history(&self) -> Vec<Decision> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn statistics(&self) -> RouterStatistics {
        let history = self.history.read().await;
        let mut stats = RouterStatistics {
            total: history.len(),
            ..RouterStatistics::default()
        };
        let mut executed = 0usize;
        let mut succeeded = 0usize;
        let mut confidence_sum = 0.0;

        for decision in history.iter() {
            *stats.by_level.entry(decision.level).or_default() += 1;
            match decision.status {
                DecisionStatus::Approved => stats.approved += 1,
                DecisionStatus::Rejected => stats.rejected += 1,
                DecisionStatus::Pending => {}
            }
            if decision.executed() {
                executed += 1;
                succeeded += usize::from(decision.succeeded());
            }
            confidence_sum += decision.confidence;
        }

        if stats.total > 0 {
            stats.approval_rate = stats.approved as f64 / stats.total as f64;
            stats.average_confidence = confidence_sum / stats.total as f64;
        }
        if executed > 0 {
            stats.success_rate = succeeded as f64 / executed as f64;
        }
        stats
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Null => false,
        _ => true,
    }
}
