//! 多角色协作：顺序 / 并行 / 协同 / 竞争 / 依赖有序执行，冲突解决与交接

pub mod conflict;
pub mod coordinator;
pub mod handoff;
pub mod types;

pub use coordinator::CollaborationCoordinator;
pub use types::{
    CollaborationMode, CollaborationOutcome, CollaborationSummary, Conflict, ConflictCandidate,
    HandoffReceipt, ParticipantResult, PatternStats, Resolution, ScoredSolution,
};
