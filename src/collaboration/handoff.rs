//! 角色间交接：打包数据与交接 id，可选校验，目标角色确认后完成

use chrono::Utc;
use serde_json::{json, Value};

use crate::collaboration::coordinator::CollaborationCoordinator;
use crate::collaboration::types::HandoffReceipt;
use crate::core::HandoffError;
use crate::events::Event;
use crate::invoker::InvocationOptions;

impl CollaborationCoordinator {
    pub async fn handoff(
        &self,
        from: &str,
        to: &str,
        data: Value,
        validate: bool,
    ) -> Result<HandoffReceipt, HandoffError> {
        let handoff_id = format!("handoff_{}", uuid::Uuid::new_v4());
        let package: InvocationOptions = [
            ("handoff_id".to_string(), json!(handoff_id)),
            ("from".to_string(), json!(from)),
            ("to".to_string(), json!(to)),
            ("data".to_string(), data),
        ]
        .into_iter()
        .collect();

        if validate {
            let validator = &self.config.validation_role;
            let result = self
                .channel
                .invoke(validator, "validate-handoff", package.clone())
                .await;
            let reason = if !result.success {
                Some(result.error_message())
            } else if result.flag("valid") == Some(false) {
                Some(
                    result
                        .text("reason")
                        .unwrap_or("rejected by validator")
                        .to_string(),
                )
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::warn!("Handoff {} {} -> {} failed validation: {}", handoff_id, from, to, reason);
                return Err(HandoffError::ValidationFailed { handoff_id, reason });
            }
        }

        let ack = self.channel.invoke(to, "acknowledge", package).await;
        if !ack.success {
            let reason = ack.error_message();
            tracing::warn!("Handoff {} not acknowledged by '{}': {}", handoff_id, to, reason);
            return Err(HandoffError::AcknowledgmentFailed {
                handoff_id,
                role: to.to_string(),
                reason,
            });
        }

        tracing::info!("Handoff {} completed: {} -> {}", handoff_id, from, to);
        self.events.publish(Event::HandoffCompleted {
            handoff_id: handoff_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(HandoffReceipt {
            handoff_id,
            from: from.to_string(),
            to: to.to_string(),
            validated: validate,
            acknowledgment: ack.payload,
            completed_at: Utc::now(),
        })
    }
}
