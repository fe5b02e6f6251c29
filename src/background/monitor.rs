//! 资源监控
//!
//! 周期采样 CPU / 内存使用率，任一超过阈值即进入节流状态（暂停出队新任务，不取消进行中的任务），
//! 回落到阈值以下后解除。状态变化通过 watch 通道通知调度器，并发布 `ResourceThrottled` 事件。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBus};

/// 一次采样（百分比）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// 资源采样器
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Linux 下读取 /proc/loadavg 与 /proc/meminfo；读不到时报告 0
#[derive(Debug, Default)]
pub struct ProcSampler;

impl ProcSampler {
    fn cpu_percent() -> Option<f64> {
        let text = std::fs::read_to_string("/proc/loadavg").ok()?;
        let load: f64 = text.split_whitespace().next()?.parse().ok()?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Some((load / cpus * 100.0).min(100.0))
    }

    fn memory_percent() -> Option<f64> {
        let text = std::fs::read_to_string("/proc/meminfo").ok()?;
        let field = |name: &str| -> Option<f64> {
            text.lines()
                .find(|l| l.starts_with(name))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some((total - available) / total * 100.0)
    }
}

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: Self::cpu_percent().unwrap_or(0.0),
            memory_percent: Self::memory_percent().unwrap_or(0.0),
        }
    }
}

/// 固定读数（可在运行时修改），用于测试与无 /proc 的环境
#[derive(Debug, Clone, Default)]
pub struct StaticSampler {
    usage: Arc<Mutex<ResourceUsage>>,
}

impl StaticSampler {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Arc::new(Mutex::new(usage)),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        if let Ok(mut current) = self.usage.lock() {
            *current = usage;
        }
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> ResourceUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }
}

pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    cpu_threshold: f64,
    memory_threshold: f64,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(
        sampler: Arc<dyn ResourceSampler>,
        cpu_threshold: f64,
        memory_threshold: f64,
        interval: Duration,
    ) -> Self {
        Self {
            sampler,
            cpu_threshold,
            memory_threshold,
            interval,
        }
    }

    pub fn exceeds(&self, usage: &ResourceUsage) -> bool {
        usage.cpu_percent > self.cpu_threshold || usage.memory_percent > self.memory_threshold
    }

    /// 启动采样循环，直到 token 被取消
    pub fn spawn(
        self,
        throttle: watch::Sender<bool>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let usage = self.sampler.sample();
                let throttled = self.exceeds(&usage);
                let changed = throttle.send_if_modified(|current| {
                    if *current != throttled {
                        *current = throttled;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    if throttled {
                        tracing::warn!(
                            "Resource pressure (cpu {:.1}%, mem {:.1}%), pausing background dispatch",
                            usage.cpu_percent,
                            usage.memory_percent
                        );
                    } else {
                        tracing::info!("Resource pressure relieved, resuming background dispatch");
                    }
                    events.publish(Event::ResourceThrottled {
                        throttled,
                        cpu_percent: usage.cpu_percent,
                        memory_percent: usage.memory_percent,
                    });
                }
            }
            tracing::debug!("Resource monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;

    #[test]
    fn test_threshold_evaluation() {
        let monitor = ResourceMonitor::new(
            Arc::new(StaticSampler::default()),
            80.0,
            85.0,
            Duration::from_millis(10),
        );
        assert!(!monitor.exceeds(&ResourceUsage { cpu_percent: 80.0, memory_percent: 85.0 }));
        assert!(monitor.exceeds(&ResourceUsage { cpu_percent: 80.1, memory_percent: 10.0 }));
        assert!(monitor.exceeds(&ResourceUsage { cpu_percent: 5.0, memory_percent: 90.0 }));
    }

    #[test]
    fn test_proc_sampler_in_range() {
        let usage = ProcSampler.sample();
        assert!((0.0..=100.0).contains(&usage.cpu_percent));
        assert!((0.0..=100.0).contains(&usage.memory_percent));
    }

    #[tokio::test]
    async fn test_monitor_toggles_throttle() {
        let sampler = StaticSampler::new(ResourceUsage { cpu_percent: 95.0, memory_percent: 10.0 });
        let monitor = ResourceMonitor::new(Arc::new(sampler.clone()), 80.0, 85.0, Duration::from_millis(5));
        let (tx, mut rx) = watch::channel(false);
        let bus = EventBus::default();
        let mut events = bus.subscribe(&[Topic::ResourceThrottled]);
        let token = CancellationToken::new();
        let handle = monitor.spawn(tx, bus, token.clone());

        rx.wait_for(|t| *t).await.unwrap();
        sampler.set(ResourceUsage { cpu_percent: 10.0, memory_percent: 10.0 });
        rx.wait_for(|t| !*t).await.unwrap();

        token.cancel();
        handle.await.unwrap();
        assert_eq!(events.drain().len(), 2);
    }
}
