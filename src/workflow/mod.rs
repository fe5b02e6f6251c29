//! 工作流：阶段目录、状态机与持久化

pub mod catalog;
pub mod state_machine;
pub mod store;
pub mod types;

pub use catalog::PhaseCatalog;
pub use state_machine::{readiness, StateMachine, AUTOMATIC};
pub use store::StateStore;
pub use types::*;
