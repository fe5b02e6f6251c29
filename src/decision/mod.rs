//! 决策路由：按置信度把动作分派到四个自治级别

pub mod confidence;
pub mod history;
pub mod router;
pub mod types;

pub use confidence::{ConfidenceModel, ConfidenceWeights, RoutingThresholds};
pub use history::DecisionHistory;
pub use router::DecisionRouter;
pub use types::{
    AutoProceedCheck, ConfidenceFactors, Decision, DecisionStatus, PendingApprovalInfo,
    RouterStatistics, RoutingLevel,
};
