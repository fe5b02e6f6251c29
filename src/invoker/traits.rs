//! 角色调用抽象
//!
//! 编排核心不关心角色如何完成任务，只通过 `RoleInvoker::invoke(role, task, options)` 调用，
//! 结果统一为 `InvocationResult`（成功标志 + 任意 JSON 载荷 + 可选错误）。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 调用选项：任意键值
pub type InvocationOptions = HashMap<String, Value>;

/// 单次角色调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 耗时（毫秒），由消息通道回填
    #[serde(default)]
    pub duration_ms: u64,
}

impl InvocationResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// 读取载荷中的数值字段（载荷本身是数字时直接返回）
    pub fn number(&self, key: &str) -> Option<f64> {
        match &self.payload {
            Value::Number(n) => n.as_f64(),
            Value::Object(map) => map.get(key).and_then(Value::as_f64),
            _ => None,
        }
    }

    /// 读取载荷中的字符串字段
    pub fn text(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// 读取载荷中的布尔字段
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    pub fn error_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "unknown error".to_string())
    }
}

/// 外部执行者：可能很慢，也可能永不返回（调用方负责超时）
#[async_trait]
pub trait RoleInvoker: Send + Sync {
    async fn invoke(&self, role: &str, task: &str, options: &InvocationOptions) -> InvocationResult;
}
