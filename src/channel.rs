//! 消息通道：请求/响应关联与超时
//!
//! `send` 为请求登记一个 oneshot 接收端（以 correlation id 为键），并在后台任务中调用执行者；
//! 执行者返回后通过 `deliver` 投递同 id 的响应。响应先到则返回响应，超时先到则移除登记并返回 `Timeout`，
//! 之后迟到的响应会被丢弃。外部响应方也可以直接调用 `deliver`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::core::ChannelError;
use crate::invoker::{InvocationOptions, InvocationResult, RoleInvoker};

/// 发往角色的请求
#[derive(Debug, Clone)]
pub struct RoleRequest {
    pub correlation_id: String,
    pub role: String,
    pub task: String,
    pub options: InvocationOptions,
}

impl RoleRequest {
    pub fn new(role: impl Into<String>, task: impl Into<String>, options: InvocationOptions) -> Self {
        Self {
            correlation_id: format!("req_{}", uuid::Uuid::new_v4()),
            role: role.into(),
            task: task.into(),
            options,
        }
    }
}

/// 带关联 id 的响应
#[derive(Debug, Clone)]
pub struct RoleResponse {
    pub correlation_id: String,
    pub result: InvocationResult,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RoleResponse>>>>;

/// 消息通道
pub struct MessageChannel {
    invoker: Arc<dyn RoleInvoker>,
    pending: PendingMap,
    default_timeout: Duration,
}

impl MessageChannel {
    pub fn new(invoker: Arc<dyn RoleInvoker>, default_timeout: Duration) -> Self {
        Self {
            invoker,
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 发送请求并等待同 id 的响应，或在 timeout 后返回 `Timeout`
    pub async fn send(&self, request: RoleRequest, timeout: Duration) -> Result<RoleResponse, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let correlation_id = request.correlation_id.clone();
        let role = request.role.clone();
        lock(&self.pending).insert(correlation_id.clone(), tx);

        let invoker = Arc::clone(&self.invoker);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = invoker
                .invoke(&request.role, &request.task, &request.options)
                .await;
            let result = result.with_duration(started.elapsed().as_millis() as u64);
            deliver_to(
                &pending,
                RoleResponse {
                    correlation_id: request.correlation_id,
                    result,
                },
            );
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                lock(&self.pending).remove(&correlation_id);
                Err(ChannelError::Closed { role })
            }
            Err(_) => {
                lock(&self.pending).remove(&correlation_id);
                tracing::warn!(role = %role, "Request {} timed out after {:?}", correlation_id, timeout);
                Err(ChannelError::Timeout {
                    role,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// 投递响应；无对应登记（已超时或未知 id）时返回 false
    pub fn deliver(&self, response: RoleResponse) -> bool {
        deliver_to(&self.pending, response)
    }

    /// 尚未收到响应的请求数
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// 调用角色；超时与通道错误收敛为失败结果
    pub async fn invoke(&self, role: &str, task: &str, options: InvocationOptions) -> InvocationResult {
        self.invoke_with_timeout(role, task, options, self.default_timeout)
            .await
    }

    pub async fn invoke_with_timeout(
        &self,
        role: &str,
        task: &str,
        options: InvocationOptions,
        timeout: Duration,
    ) -> InvocationResult {
        match self.send(RoleRequest::new(role, task, options), timeout).await {
            Ok(response) => response.result,
            Err(e) => InvocationResult::failed(e.to_string()),
        }
    }
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<RoleResponse>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn deliver_to(pending: &PendingMap, response: RoleResponse) -> bool {
    let sender = lock(pending).remove(&response.correlation_id);
    match sender {
        Some(tx) => tx.send(response).is_ok(),
        None => {
            tracing::debug!("Dropping late response {}", response.correlation_id);
            false
        }
    }
}
