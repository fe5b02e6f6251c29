//! 编排事件：供外部展示层订阅（阶段迁移、阻塞、决策、预览、执行进度、升级等）
//!
//! 所有组件共享一个 `EventBus`（有界 broadcast 通道）。发布永不阻塞：没有订阅者或订阅者滞后时事件直接丢弃，
//! 核心逻辑不等待展示。订阅者按 `Topic` 集合过滤。
//!
//! 编排器自身的控制路径（阶段进入、阻塞）不能丢事件，使用 `subscribe_reliable`：
//! 每个可靠订阅独占一个无界 mpsc 队列，不与展示层共享环形缓冲区。

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// 事件主题（有限集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    PhaseCompleted,
    PhaseEntered,
    PhaseBlocked,
    PhaseUnblocked,
    ArtifactsInvalidated,
    DecisionRequested,
    DecisionNotification,
    ApprovalRequired,
    PreviewShown,
    DecisionResolved,
    CollaborationStarted,
    CollaborationFinished,
    ConflictEscalated,
    HandoffCompleted,
    ExecutionQueued,
    ExecutionProgress,
    ExecutionFinished,
    ResourceThrottled,
    Escalation,
}

/// 单个事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PhaseCompleted {
        phase: String,
    },
    PhaseEntered {
        phase: String,
        required_roles: Vec<String>,
        reason: String,
    },
    PhaseBlocked {
        phase: String,
        reason: String,
        details: Value,
    },
    PhaseUnblocked {
        phase: String,
        reason: String,
        resolved_by: String,
    },
    /// 回滚后下游产物失效（仅信号，不删除）
    ArtifactsInvalidated {
        rollback_to: String,
        phases: Vec<String>,
        artifacts: Vec<String>,
    },
    DecisionRequested {
        decision_id: String,
        role: String,
        action: String,
        confidence: f64,
        level: String,
    },
    DecisionNotification {
        decision_id: String,
        role: String,
        action: String,
        stage: String,
    },
    ApprovalRequired {
        decision_id: String,
        role: String,
        action: String,
        confidence: f64,
    },
    PreviewShown {
        decision_id: String,
        preview: Value,
        delay_ms: u64,
    },
    DecisionResolved {
        decision_id: String,
        status: String,
    },
    CollaborationStarted {
        collaboration_id: String,
        mode: String,
        participants: Vec<String>,
    },
    CollaborationFinished {
        collaboration_id: String,
        mode: String,
        success: bool,
    },
    ConflictEscalated {
        issue: String,
        candidates: Vec<String>,
        reason: String,
    },
    HandoffCompleted {
        handoff_id: String,
        from: String,
        to: String,
    },
    ExecutionQueued {
        execution_id: String,
        role: String,
        priority: String,
    },
    ExecutionProgress {
        execution_id: String,
        progress: u8,
    },
    ExecutionFinished {
        execution_id: String,
        status: String,
    },
    ResourceThrottled {
        throttled: bool,
        cpu_percent: f64,
        memory_percent: f64,
    },
    /// 交由外部处理的升级信号（恢复失败、冲突无法自动裁决等）
    Escalation {
        issue: String,
        step: String,
        reason: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::PhaseCompleted { .. } => Topic::PhaseCompleted,
            Event::PhaseEntered { .. } => Topic::PhaseEntered,
            Event::PhaseBlocked { .. } => Topic::PhaseBlocked,
            Event::PhaseUnblocked { .. } => Topic::PhaseUnblocked,
            Event::ArtifactsInvalidated { .. } => Topic::ArtifactsInvalidated,
            Event::DecisionRequested { .. } => Topic::DecisionRequested,
            Event::DecisionNotification { .. } => Topic::DecisionNotification,
            Event::ApprovalRequired { .. } => Topic::ApprovalRequired,
            Event::PreviewShown { .. } => Topic::PreviewShown,
            Event::DecisionResolved { .. } => Topic::DecisionResolved,
            Event::CollaborationStarted { .. } => Topic::CollaborationStarted,
            Event::CollaborationFinished { .. } => Topic::CollaborationFinished,
            Event::ConflictEscalated { .. } => Topic::ConflictEscalated,
            Event::HandoffCompleted { .. } => Topic::HandoffCompleted,
            Event::ExecutionQueued { .. } => Topic::ExecutionQueued,
            Event::ExecutionProgress { .. } => Topic::ExecutionProgress,
            Event::ExecutionFinished { .. } => Topic::ExecutionFinished,
            Event::ResourceThrottled { .. } => Topic::ResourceThrottled,
            Event::Escalation { .. } => Topic::Escalation,
        }
    }
}

#[derive(Debug)]
struct ReliableSink {
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<Event>,
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    reliable: Arc<Mutex<Vec<ReliableSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            reliable: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(topic = ?event.topic(), "event published");
        if let Ok(mut sinks) = self.reliable.lock() {
            sinks.retain(|sink| !sink.tx.is_closed());
            for sink in sinks.iter().filter(|s| s.topics.contains(&event.topic())) {
                let _ = sink.tx.send(event.clone());
            }
        }
        // 无订阅者时 send 返回 Err，忽略
        let _ = self.tx.send(event);
    }

    /// 不丢事件的订阅（无界队列，仅用于控制路径，订阅者须持续消费）
    pub fn subscribe_reliable(&self, topics: &[Topic]) -> ReliableSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut sinks) = self.reliable.lock() {
            sinks.push(ReliableSink {
                topics: topics.to_vec(),
                tx,
            });
        }
        ReliableSubscription { rx }
    }

    /// 订阅指定主题
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
        }
    }

    /// 订阅全部主题
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: Vec::new(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 主题过滤后的订阅端
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    /// 为空表示全部主题
    topics: Vec<Topic>,
}

impl Subscription {
    fn accepts(&self, event: &Event) -> bool {
        self.topics.is_empty() || self.topics.contains(&event.topic())
    }

    /// 等待下一个匹配事件；总线关闭时返回 None
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event subscriber lagged, {} events dropped", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞读取下一个匹配事件
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// 取出当前已到达的全部匹配事件
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// 可靠订阅端；drop 后下次发布时自动注销
pub struct ReliableSubscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl ReliableSubscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
