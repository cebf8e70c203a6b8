use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::RotationPolicy;

/// 字符串轮换器（用于 User-Agent 与上游代理分配）
#[derive(Debug)]
pub struct Rotator {
    items: Vec<String>,
    policy: RotationPolicy,
    cursor: AtomicUsize,
}

impl Rotator {
    pub fn new(items: Vec<String>, policy: RotationPolicy) -> Self {
        Self {
            items,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// 取下一个值；列表为空时返回 None
    pub fn next(&self) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let idx = match self.policy {
            RotationPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.items.len()
            }
            RotationPolicy::Random => rand::thread_rng().gen_range(0..self.items.len()),
        };
        Some(self.items[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for Rotator {
    fn default() -> Self {
        Self::new(Vec::new(), RotationPolicy::default())
    }
}
