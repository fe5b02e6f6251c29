//! Maestro - 多阶段工作流自治编排核心
//!
//! 模块划分：
//! - **background**: 后台执行器（优先级队列、并发上限、资源节流、结果聚合）
//! - **channel**: 请求/响应关联与超时
//! - **collaboration**: 多角色协作模式、冲突裁决、交接
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、编排器、构建器、优雅关闭
//! - **decision**: 置信度模型与四级自治路由
//! - **events**: 事件总线（供外部展示层订阅）
//! - **graph**: 角色依赖图（拓扑排序、分层）
//! - **invoker**: 外部角色执行者抽象
//! - **workflow**: 阶段目录、状态机、持久化与备份恢复

pub mod background;
pub mod channel;
pub mod collaboration;
pub mod config;
pub mod core;
pub mod decision;
pub mod events;
pub mod graph;
pub mod invoker;
pub mod observability;
pub mod workflow;

pub use core::{Orchestrator, OrchestratorBuilder};
