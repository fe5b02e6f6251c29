//! 有界决策历史：超过容量时淘汰最旧条目，同时为后续置信度计算提供成功率

use std::collections::VecDeque;

use crate::decision::types::{Decision, DecisionStatus};

#[derive(Debug, Clone)]
pub struct DecisionHistory {
    entries: VecDeque<Decision>,
    capacity: usize,
    /// 无可用样本时的成功率
    prior: f64,
}

impl DecisionHistory {
    pub fn new(capacity: usize, prior: f64) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            prior,
        }
    }

    pub fn push(&mut self, decision: Decision) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(decision);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Decision> {
        self.entries.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Decision> {
        self.entries.iter().find(|d| d.id == id)
    }

    /// 同 (role, action) 已有结论的决策中成功的比例；被拒绝视为失败
    pub fn success_rate(&self, role: &str, action: &str) -> f64 {
        self.rate(|d| d.role == role && d.action == action)
    }

    /// 角色整体准确率
    pub fn role_accuracy(&self, role: &str) -> f64 {
        self.rate(|d| d.role == role)
    }

    fn rate<F>(&self, filter: F) -> f64
    where
        F: Fn(&Decision) -> bool,
    {
        let (total, ok) = self
            .entries
            .iter()
            .filter(|d| d.status != DecisionStatus::Pending && filter(d))
            .fold((0usize, 0usize), |(total, ok), d| {
                (total + 1, ok + usize::from(d.succeeded()))
            });
        if total == 0 {
            self.prior
        } else {
            ok as f64 / total as f64
        }
    }
}
