//! 本地调用器（用于演示与测试，无需真实执行者）
//!
//! - `EchoInvoker`：回显角色与任务，总是成功
//! - `ScriptedInvoker`：按角色注册处理函数、延迟或挂起，并记录每次调用

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::invoker::{InvocationOptions, InvocationResult, RoleInvoker};

/// Echo 调用器：载荷为 `{role, task, options}`
#[derive(Debug, Default)]
pub struct EchoInvoker;

#[async_trait]
impl RoleInvoker for EchoInvoker {
    async fn invoke(&self, role: &str, task: &str, options: &InvocationOptions) -> InvocationResult {
        InvocationResult::ok(json!({
            "role": role,
            "task": task,
            "options": options,
        }))
    }
}

type Handler = Arc<dyn Fn(&str, &InvocationOptions) -> InvocationResult + Send + Sync>;

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub role: String,
    pub task: String,
    pub options: InvocationOptions,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

/// 脚本化调用器：未注册的角色回显成功
#[derive(Default, Clone)]
pub struct ScriptedInvoker {
    handlers: HashMap<String, Handler>,
    delays: HashMap<String, Duration>,
    hanging: Vec<String>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为角色注册处理函数（入参为 task 与 options）
    pub fn on<F>(mut self, role: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &InvocationOptions) -> InvocationResult + Send + Sync + 'static,
    {
        self.handlers.insert(role.into(), Arc::new(handler));
        self
    }

    /// 角色总是返回失败
    pub fn failing(self, role: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        self.on(role, move |_, _| InvocationResult::failed(error.clone()))
    }

    /// 角色在返回前等待一段时间
    pub fn delay(mut self, role: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(role.into(), delay);
        self
    }

    /// 角色永不返回
    pub fn hang(mut self, role: impl Into<String>) -> Self {
        self.hanging.push(role.into());
        self
    }

    /// 所有调用记录（按开始顺序）
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 某角色被调用的次数
    pub fn call_count(&self, role: &str) -> usize {
        self.calls().iter().filter(|c| c.role == role).count()
    }

    /// 按完成时间排序的角色列表
    pub fn completion_order(&self) -> Vec<String> {
        let mut finished: Vec<_> = self
            .calls()
            .into_iter()
            .filter_map(|c| c.finished_at.map(|t| (t, c.role)))
            .collect();
        finished.sort_by_key(|(t, _)| *t);
        finished.into_iter().map(|(_, role)| role).collect()
    }
}

#[async_trait]
impl RoleInvoker for ScriptedInvoker {
    async fn invoke(&self, role: &str, task: &str, options: &InvocationOptions) -> InvocationResult {
        let index = {
            let mut calls = match self.calls.lock() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            calls.push(RecordedCall {
                role: role.to_string(),
                task: task.to_string(),
                options: options.clone(),
                started_at: Instant::now(),
                finished_at: None,
            });
            calls.len() - 1
        };

        if self.hanging.iter().any(|r| r == role) {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delays.get(role) {
            tokio::time::sleep(*delay).await;
        }

        let result = match self.handlers.get(role) {
            Some(handler) => handler(task, options),
            None => InvocationResult::ok(json!({ "role": role, "task": task })),
        };

        if let Ok(mut calls) = self.calls.lock() {
            if let Some(call) = calls.get_mut(index) {
                call.finished_at = Some(Instant::now());
            }
        }
        result
    }
}
