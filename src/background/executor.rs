//! 后台执行器
//!
//! 入队后立即返回执行 ID；调度循环按「先取并发许可、再出队」的顺序工作，保证出队时一定有空位，
//! 因此队列中的等待顺序就是严格的优先级顺序。节流期间调度循环暂停出队，进行中的执行不受影响。
//! 取消是协作式的：已排队的不再启动，运行中的不再落结果（角色自身的工作不会被强行中止）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::background::monitor::{ResourceMonitor, ResourceSampler};
use crate::background::queue::ExecutionQueue;
use crate::background::types::{
    AggregationReport, BackgroundExecution, ExecutionId, ExecutionStatus, ExecutorStatus, Priority,
    RoleOutcome,
};
use crate::channel::MessageChannel;
use crate::config::BackgroundSection;
use crate::events::{Event, EventBus};
use crate::invoker::{InvocationOptions, InvocationResult};

/// 结果等价比较器（用于聚合报告的一致性判定）
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

type Callback = Box<dyn FnOnce(Result<Value, String>) + Send>;

struct ExecutionRecord {
    execution: BackgroundExecution,
    cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
    /// 仅在持有写锁时取出；Mutex 使记录满足 Sync
    callback: std::sync::Mutex<Option<Callback>>,
    progress_tx: Option<watch::Sender<u8>>,
}

struct Inner {
    channel: Arc<MessageChannel>,
    config: BackgroundSection,
    events: EventBus,
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    queue: Mutex<ExecutionQueue>,
    wakeup: Notify,
    semaphore: Arc<Semaphore>,
    throttle_tx: watch::Sender<bool>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    comparator: Comparator,
    shutdown: CancellationToken,
}

/// 后台执行器（可克隆，内部共享）
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<Inner>,
}

impl BackgroundExecutor {
    pub fn new(config: BackgroundSection, channel: Arc<MessageChannel>, events: EventBus) -> Self {
        Self::build(config, channel, events, None, CancellationToken::new())
    }

    fn build(
        config: BackgroundSection,
        channel: Arc<MessageChannel>,
        events: EventBus,
        sampler: Option<Arc<dyn ResourceSampler>>,
        shutdown: CancellationToken,
    ) -> Self {
        // 0 表示不限并发
        let permits = if config.max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_concurrent
        };
        let (throttle_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                events,
                records: RwLock::new(HashMap::new()),
                queue: Mutex::new(ExecutionQueue::new()),
                wakeup: Notify::new(),
                semaphore: Arc::new(Semaphore::new(permits)),
                throttle_tx,
                sampler,
                comparator: Arc::new(|a: &Value, b: &Value| a == b),
                shutdown,
            }),
        }
    }

    /// 启用资源监控（start 时启动采样循环）
    pub fn with_sampler(self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.rebuild(|inner| inner.sampler = Some(sampler))
    }

    pub fn with_comparator(self, comparator: Comparator) -> Self {
        self.rebuild(|inner| inner.comparator = comparator)
    }

    /// 与外部关闭信号联动
    pub fn with_shutdown(self, token: CancellationToken) -> Self {
        self.rebuild(|inner| inner.shutdown = token)
    }

    fn rebuild(self, change: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                change(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            // 已被共享：配置阶段之后不再修改
            Err(inner) => Self { inner },
        }
    }

    /// 启动调度循环（以及资源监控）
    pub fn start(&self) -> JoinHandle<()> {
        if let Some(sampler) = &self.inner.sampler {
            let monitor = ResourceMonitor::new(
                Arc::clone(sampler),
                self.inner.config.cpu_threshold,
                self.inner.config.memory_threshold,
                Duration::from_millis(self.inner.config.sample_interval_ms),
            );
            monitor.spawn(
                self.inner.throttle_tx.clone(),
                self.inner.events.clone(),
                self.inner.shutdown.clone(),
            );
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tracing::info!("Background dispatcher started");
            dispatch_loop(inner).await;
            tracing::info!("Background dispatcher stopped");
        })
    }

    /// 停止调度（不影响进行中的执行）
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_throttled(&self) -> bool {
        *self.inner.throttle_tx.borrow()
    }

    async fn enqueue(
        &self,
        role: &str,
        task: &str,
        options: InvocationOptions,
        priority: Priority,
        callback: Option<Callback>,
        progress_tx: Option<watch::Sender<u8>>,
    ) -> ExecutionId {
        let execution = BackgroundExecution::new(role, task, options, priority);
        let id = execution.id.clone();
        let (status_tx, _) = watch::channel(ExecutionStatus::Queued);

        self.inner.records.write().await.insert(
            id.clone(),
            ExecutionRecord {
                execution,
                cancel: CancellationToken::new(),
                status_tx,
                callback: std::sync::Mutex::new(callback),
                progress_tx,
            },
        );
        self.inner.queue.lock().await.push(id.clone(), priority);
        self.inner.wakeup.notify_one();

        tracing::debug!(role = %role, "Queued background execution {} ({})", id, priority);
        self.inner.events.publish(Event::ExecutionQueued {
            execution_id: id.clone(),
            role: role.to_string(),
            priority: priority.as_str().to_string(),
        });
        id
    }

    /// 入队后立即返回
    pub async fn fire_and_forget(
        &self,
        role: &str,
        task: &str,
        options: InvocationOptions,
        priority: Priority,
    ) -> ExecutionId {
        self.enqueue(role, task, options, priority, None, None).await
    }

    /// 完成（或取消）时调用 callback：成功为 `Ok(payload)`，失败为 `Err(error)`
    pub async fn execute_with_callback<F>(
        &self,
        role: &str,
        task: &str,
        options: InvocationOptions,
        priority: Priority,
        callback: F,
    ) -> ExecutionId
    where
        F: FnOnce(Result<Value, String>) + Send + 'static,
    {
        self.enqueue(role, task, options, priority, Some(Box::new(callback)), None)
            .await
    }

    /// 入队并周期上报进度，返回进度接收端
    pub async fn execute_watched(
        &self,
        role: &str,
        task: &str,
        options: InvocationOptions,
        priority: Priority,
    ) -> (ExecutionId, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0u8);
        let id = self
            .enqueue(role, task, options, priority, None, Some(tx))
            .await;
        (id, rx)
    }

    /// 多个角色各自排队执行同一任务，全部结束后返回聚合报告
    pub async fn execute_multiple(
        &self,
        roles: &[String],
        task: &str,
        options: InvocationOptions,
        priority: Priority,
    ) -> AggregationReport {
        let mut ids = Vec::with_capacity(roles.len());
        for role in roles {
            ids.push(
                self.fire_and_forget(role, task, options.clone(), priority)
                    .await,
            );
        }

        let finished = join_all(ids.iter().map(|id| self.wait(id))).await;
        let outcomes: Vec<RoleOutcome> = finished
            .into_iter()
            .zip(ids)
            .zip(roles)
            .map(|((execution, id), role)| match execution {
                Some(e) => RoleOutcome {
                    role: role.clone(),
                    execution_id: id,
                    status: e.status,
                    result: e.result,
                    duration_ms: e.duration_ms,
                },
                None => RoleOutcome {
                    role: role.clone(),
                    execution_id: id,
                    status: ExecutionStatus::Cancelled,
                    result: None,
                    duration_ms: 0,
                },
            })
            .collect();

        aggregate(outcomes, &self.inner.comparator)
    }

    /// 仅 queued / running 可取消；终态返回 false 且不改变状态
    pub async fn cancel_execution(&self, id: &str) -> bool {
        let callback = {
            let mut records = self.inner.records.write().await;
            let Some(record) = records.get_mut(id) else {
                return false;
            };
            if record.execution.status.is_terminal() {
                return false;
            }
            record.execution.status = ExecutionStatus::Cancelled;
            record.execution.finished_at = Some(Utc::now());
            record.cancel.cancel();
            record.status_tx.send_replace(ExecutionStatus::Cancelled);
            take_callback(record)
        };

        tracing::info!("Background execution {} cancelled", id);
        self.inner.events.publish(Event::ExecutionFinished {
            execution_id: id.to_string(),
            status: ExecutionStatus::Cancelled.as_str().to_string(),
        });
        if let Some(callback) = callback {
            callback(Err("cancelled".to_string()));
        }
        true
    }

    /// 等待执行进入终态；id 未知时返回 None
    pub async fn wait(&self, id: &str) -> Option<BackgroundExecution> {
        let mut rx = {
            let records = self.inner.records.read().await;
            records.get(id)?.status_tx.subscribe()
        };
        // 发送端随记录一起被清理时，按当前快照返回
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        self.get(id).await
    }

    pub async fn get(&self, id: &str) -> Option<BackgroundExecution> {
        self.inner
            .records
            .read()
            .await
            .get(id)
            .map(|r| r.execution.clone())
    }

    pub async fn status(&self) -> ExecutorStatus {
        let records = self.inner.records.read().await;
        let mut status = ExecutorStatus {
            throttled: self.is_throttled(),
            ..ExecutorStatus::default()
        };
        for record in records.values() {
            match record.execution.status {
                ExecutionStatus::Queued => status.queued += 1,
                ExecutionStatus::Running => status.running += 1,
                ExecutionStatus::Completed => status.completed += 1,
                ExecutionStatus::Failed => status.failed += 1,
                ExecutionStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// 清理结束时间早于 max_age 的终态执行，返回清理数量
    pub async fn cleanup_finished(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - max_age;
        let mut records = self.inner.records.write().await;
        let before = records.len();
        records.retain(|_, r| {
            let expired = r.execution.finished_at.is_some_and(|t| t <= cutoff);
            !(r.execution.is_finished() && expired)
        });
        before - records.len()
    }
}

fn take_callback(record: &mut ExecutionRecord) -> Option<Callback> {
    match record.callback.get_mut() {
        Ok(callback) => callback.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    let mut throttle_rx = inner.throttle_tx.subscribe();
    loop {
        // 节流期间不出队
        loop {
            let throttled = *throttle_rx.borrow_and_update();
            if !throttled {
                break;
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                changed = throttle_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            permit = Arc::clone(&inner.semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        // 等待许可期间可能进入节流
        let throttled = *inner.throttle_tx.borrow();
        if throttled {
            continue;
        }

        match next_queued(&inner).await {
            Some(id) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(run_execution(inner, id, permit));
            }
            None => {
                drop(permit);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wakeup.notified() => {}
                    _ = throttle_rx.changed() => {}
                }
            }
        }
    }
}

/// 出队下一个仍处于 queued 的执行（已取消的直接丢弃）
async fn next_queued(inner: &Inner) -> Option<ExecutionId> {
    loop {
        let id = inner.queue.lock().await.pop()?;
        let mut records = inner.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            if record.execution.status == ExecutionStatus::Queued {
                record.execution.status = ExecutionStatus::Running;
                record.execution.started_at = Some(Utc::now());
                record.status_tx.send_replace(ExecutionStatus::Running);
                return Some(id);
            }
        }
    }
}

async fn run_execution(inner: Arc<Inner>, id: ExecutionId, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let (role, task, options, cancel, progress_tx) = {
        let records = inner.records.read().await;
        let Some(record) = records.get(&id) else {
            return;
        };
        (
            record.execution.role.clone(),
            record.execution.task.clone(),
            record.execution.options.clone(),
            record.cancel.clone(),
            record.progress_tx.clone(),
        )
    };

    let started = Instant::now();
    let ticker_stop = CancellationToken::new();
    if let Some(progress) = progress_tx {
        spawn_progress_ticker(
            Arc::clone(&inner),
            id.clone(),
            progress,
            Duration::from_millis(inner.config.progress_interval_ms),
            ticker_stop.clone(),
        );
    }

    let outcome = tokio::select! {
        result = inner.channel.invoke(&role, &task, options) => Some(result),
        _ = cancel.cancelled() => None,
    };
    ticker_stop.cancel();

    let Some(result) = outcome else {
        tracing::debug!("Execution {} cancelled while running, result discarded", id);
        return;
    };
    finish_execution(&inner, &id, result, started.elapsed()).await;
}

async fn finish_execution(inner: &Inner, id: &str, result: InvocationResult, elapsed: Duration) {
    let (status, watched, callback) = {
        let mut records = inner.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return;
        };
        // 等待结果期间被取消
        if record.execution.status.is_terminal() {
            return;
        }
        let status = if result.success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        record.execution.status = status;
        record.execution.finished_at = Some(Utc::now());
        record.execution.duration_ms = elapsed.as_millis() as u64;
        record.execution.error = result.error.clone();
        record.execution.result = Some(result.clone());
        let watched = record.progress_tx.is_some();
        if let Some(progress) = &record.progress_tx {
            record.execution.progress = 100;
            progress.send_replace(100);
        }
        record.status_tx.send_replace(status);
        (status, watched, take_callback(record))
    };

    if status == ExecutionStatus::Completed {
        tracing::debug!("Background execution {} completed", id);
    } else {
        tracing::warn!("Background execution {} failed: {}", id, result.error_message());
    }
    if watched {
        inner.events.publish(Event::ExecutionProgress {
            execution_id: id.to_string(),
            progress: 100,
        });
    }
    inner.events.publish(Event::ExecutionFinished {
        execution_id: id.to_string(),
        status: status.as_str().to_string(),
    });

    if let Some(callback) = callback {
        if result.success {
            callback(Ok(result.payload));
        } else {
            callback(Err(result.error_message()));
        }
    }
}

/// 运行期间每个间隔推进一次进度（上限 95，完成时置 100）
fn spawn_progress_ticker(
    inner: Arc<Inner>,
    id: ExecutionId,
    progress: watch::Sender<u8>,
    interval: Duration,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mut next = 0;
            let advanced = progress.send_if_modified(|current| {
                if *current >= 95 {
                    return false;
                }
                *current = (*current + ((95 - *current) / 4).max(1)).min(95);
                next = *current;
                true
            });
            if !advanced {
                continue;
            }
            if let Some(record) = inner.records.write().await.get_mut(&id) {
                if record.execution.status != ExecutionStatus::Running {
                    break;
                }
                record.execution.progress = next;
            }
            inner.events.publish(Event::ExecutionProgress {
                execution_id: id.clone(),
                progress: next,
            });
        }
    });
}

fn aggregate(outcomes: Vec<RoleOutcome>, comparator: &Comparator) -> AggregationReport {
    let total = outcomes.len();
    let successful_payloads: Vec<&Value> = outcomes
        .iter()
        .filter(|o| o.status == ExecutionStatus::Completed)
        .filter_map(|o| o.result.as_ref().map(|r| &r.payload))
        .collect();
    let successful = successful_payloads.len();
    let failed = total - successful;
    let total_duration_ms: u64 = outcomes.iter().map(|o| o.duration_ms).sum();

    let consistent = match successful_payloads.split_first() {
        Some((first, rest)) => rest.iter().all(|other| comparator(first, other)),
        None => true,
    };

    AggregationReport {
        total,
        successful,
        failed,
        success_rate: if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        },
        total_duration_ms,
        average_duration_ms: if total == 0 {
            0.0
        } else {
            total_duration_ms as f64 / total as f64
        },
        consistent,
        outcomes,
    }
}
