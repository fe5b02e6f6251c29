//! 冲突解决
//!
//! 候选角色按静态优先级表排序，同优先级按各自上下文中的 confidence 排序。
//! 排名第一的候选 confidence 低于阈值时升级给外部决策者，否则（可选地）请分析角色给出理由。

use serde_json::{json, Value};

use crate::collaboration::coordinator::CollaborationCoordinator;
use crate::collaboration::types::{Conflict, ConflictCandidate, Resolution};
use crate::events::Event;
use crate::invoker::InvocationOptions;

impl CollaborationCoordinator {
    fn priority_of(&self, role: &str) -> u32 {
        self.config.role_priorities.get(role).copied().unwrap_or(0)
    }

    /// 候选排名：优先级降序，再按 confidence 降序；完全相同时保持输入顺序
    pub fn rank_candidates<'a>(&self, candidates: &'a [ConflictCandidate]) -> Vec<&'a ConflictCandidate> {
        let mut ranked: Vec<&ConflictCandidate> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            self.priority_of(&b.role)
                .cmp(&self.priority_of(&a.role))
                .then_with(|| b.confidence().total_cmp(&a.confidence()))
        });
        ranked
    }

    pub async fn resolve_conflict(&self, conflict: &Conflict) -> Resolution {
        let ranked = self.rank_candidates(&conflict.candidates);
        let names: Vec<String> = ranked.iter().map(|c| c.role.clone()).collect();

        let Some(top) = ranked.first() else {
            return self.escalate(conflict, names, "no candidates to choose from".to_string());
        };
        let confidence = top.confidence();
        if confidence < self.config.conflict_threshold {
            let reason = format!(
                "top candidate '{}' confidence {:.2} below threshold {:.2}",
                top.role, confidence, self.config.conflict_threshold
            );
            return self.escalate(conflict, names, reason);
        }

        let priority = self.priority_of(&top.role);
        let mut justification = format!(
            "'{}' ranks first with priority {} and confidence {:.2}",
            top.role, priority, confidence
        );
        let mut analysis = None;

        if let Some(analyst) = &self.config.analysis_role {
            let options: InvocationOptions = [
                ("issue".to_string(), json!(conflict.issue)),
                ("winner".to_string(), json!(top.role)),
                ("candidates".to_string(), json!(names)),
            ]
            .into_iter()
            .collect();
            let result = self.channel.invoke(analyst, "analyze-conflict", options).await;
            if result.success {
                if let Some(text) = result.text("justification") {
                    justification = text.to_string();
                }
                analysis = Some(result.payload);
            } else {
                tracing::warn!(
                    "Conflict analysis by '{}' failed, keeping ranking justification: {}",
                    analyst,
                    result.error_message()
                );
            }
        }

        tracing::info!("Conflict '{}' resolved in favour of '{}'", conflict.issue, top.role);
        Resolution::Resolved {
            winner: top.role.clone(),
            justification,
            confidence,
            analysis,
        }
    }

    fn escalate(&self, conflict: &Conflict, candidates: Vec<String>, reason: String) -> Resolution {
        tracing::warn!("Conflict '{}' escalated: {}", conflict.issue, reason);
        self.events.publish(Event::ConflictEscalated {
            issue: conflict.issue.clone(),
            candidates: candidates.clone(),
            reason: reason.clone(),
        });
        Resolution::Escalated { reason, candidates }
    }
}

/// 构造候选上下文的便捷函数
pub fn candidate(role: &str, confidence: f64) -> ConflictCandidate {
    let context: InvocationOptions = [("confidence".to_string(), Value::from(confidence))]
        .into_iter()
        .collect();
    ConflictCandidate::new(role, context)
}
