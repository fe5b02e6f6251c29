//! 优雅关闭处理
//!
//! 关闭信号（Ctrl+C / SIGTERM）或主循环结束都会取消编排器的关闭 token：
//! 后台调度、资源监控与阶段监听共享这个 token，随之停止。
//! 之后按注册顺序运行清理任务（单个任务有超时），最后落盘工作流状态。

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::Orchestrator;
use crate::core::WorkflowError;
use crate::workflow::StateMachine;

const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 主循环自行结束（事件总线关闭）
    AppFinished,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserInitiated => "ctrl-c",
            Self::Signal => "sigterm",
            Self::AppFinished => "application finished",
        };
        f.write_str(s)
    }
}

/// 关闭信号管理器：持有编排器的关闭 token，记录第一个关闭原因
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: OnceLock::new(),
        }
    }

    /// 与编排器共享关闭 token
    pub fn for_orchestrator(orchestrator: &Orchestrator) -> Self {
        Self::new(orchestrator.shutdown_token())
    }

    /// 触发关闭；重复触发只保留第一个原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason.clone()).is_ok() {
            tracing::info!("Shutdown requested: {}", reason);
        }
        self.token.cancel();
    }

    /// 关闭原因；token 被直接取消（如 `Orchestrator::shutdown`）时为 None
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序运行清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout,
        }
    }

    /// 编排器的标准清理：先停止调度与监听，再落盘工作流状态
    pub fn for_orchestrator(orchestrator: &Arc<Orchestrator>) -> Self {
        let mut coordinator = Self::new(DEFAULT_CLEANUP_TIMEOUT);
        coordinator.register(OrchestratorStopCleanup::new(Arc::clone(orchestrator)));
        coordinator.register(WorkflowStateCleanup::new(Arc::clone(orchestrator.state())));
        coordinator
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务，返回失败或超时的任务数
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let mut failed = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(
                        "Cleanup task '{}' timed out after {}ms",
                        name,
                        self.timeout.as_millis()
                    );
                }
            }
        }

        tracing::info!("All cleanup tasks finished ({} failed)", failed);
        failed
    }
}

/// 停止后台调度、资源监控与阶段监听，并汇报未完成的执行
pub struct OrchestratorStopCleanup {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorStopCleanup {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for OrchestratorStopCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.orchestrator.shutdown();
        let status = self.orchestrator.executor().status().await;
        if status.queued + status.running > 0 {
            tracing::warn!(
                "Stopping with {} queued and {} running background execution(s)",
                status.queued,
                status.running
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Orchestrator"
    }
}

/// 工作流状态落盘
pub struct WorkflowStateCleanup {
    state: Arc<StateMachine>,
}

impl WorkflowStateCleanup {
    pub fn new(state: Arc<StateMachine>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkflowStateCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let Some(phase) = self.state.current_phase() else {
            tracing::debug!("Workflow never initialized, nothing to persist");
            return Ok(());
        };
        match self.state.persist().await {
            Ok(()) => {
                tracing::info!(
                    "Workflow state persisted at phase '{}' ({:.0}% complete)",
                    phase,
                    self.state.progress_percentage().unwrap_or(0.0)
                );
                Ok(())
            }
            Err(WorkflowError::NotInitialized) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "WorkflowState"
    }
}

/// 运行主应用直到收到关闭信号（或主应用自行结束），然后执行清理
///
/// 返回失败的清理任务数
pub async fn run_with_graceful_shutdown<F>(
    manager: Arc<ShutdownManager>,
    app: F,
    coordinator: ShutdownCoordinator,
) -> usize
where
    F: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => manager.shutdown(ShutdownReason::AppFinished),
        _ = manager.wait_for_shutdown() => {}
    }
    match manager.reason() {
        Some(reason) => tracing::info!("Shutting down ({})", reason),
        None => tracing::info!("Shutting down (cancelled)"),
    }

    coordinator.run_cleanup().await
}
