//! 角色调用层：外部执行者抽象与实现（Echo / Scripted）

pub mod mock;
pub mod traits;

pub use mock::{EchoInvoker, RecordedCall, ScriptedInvoker};
pub use traits::{InvocationOptions, InvocationResult, RoleInvoker};
