/// 速率限制器模块
///
/// 使用 token bucket 算法按目标域名限速，防止对单个站点发起过多请求
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;

/// 按域名分键的速率限制器
pub struct RateLimiter {
    inner: Arc<DefaultKeyedRateLimiter<String>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// 创建新的速率限制器（为 0 的配置值按 1 处理，配置验证会提前拒绝它们）
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            inner: Arc::new(GovernorLimiter::keyed(quota)),
            config,
        }
    }

    /// 尝试为域名获取一个令牌（非阻塞）
    /// 返回 Ok(()) 如果允许请求，否则返回 Err(Duration) 表示需要等待的时间
    pub fn check(&self, domain: &str) -> Result<(), Duration> {
        match self.inner.check_key(&domain.to_string()) {
            Ok(_) => Ok(()),
            Err(not_until) => Err(not_until.wait_time_from(DefaultClock::default().now())),
        }
    }

    /// 清理已经回满令牌的域名状态
    pub fn retain_recent(&self) {
        self.inner.retain_recent();
    }

    /// 正在跟踪的域名数量
    pub fn tracked_domains(&self) -> usize {
        self.inner.len()
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
        }
    }
}
