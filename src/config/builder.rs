use anyhow::Result;
use std::path::PathBuf;

use super::{
    validator::ConfigValidator, ProxyConfig, RateLimitConfig, RotationPolicy, SelectionPolicy,
    SizeLimitConfig, TimeoutConfig, UpstreamScheme,
};

/// ProxyConfig Builder
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// 创建新的 Builder（以默认配置为起点）
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// 设置绑定端口
    pub fn bind_port(mut self, port: u16) -> Self {
        self.config.bind_port = port;
        self
    }

    /// 设置证书与私钥路径
    pub fn certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.cert_path = Some(cert.into());
        self.config.key_path = Some(key.into());
        self
    }

    /// 设置自动生成证书的 Common Name
    pub fn common_name(mut self, name: impl Into<String>) -> Self {
        self.config.common_name = name.into();
        self
    }

    /// 设置上游代理列表并启用代理转发
    pub fn proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.proxies = proxies.into_iter().map(Into::into).collect();
        self.config.use_proxy = !self.config.proxies.is_empty();
        self
    }

    /// 设置是否通过上游代理转发
    pub fn use_proxy(mut self, enabled: bool) -> Self {
        self.config.use_proxy = enabled;
        self
    }

    /// 设置是否收集 Cookie
    pub fn collect_cookie(mut self, enabled: bool) -> Self {
        self.config.collect_cookie = enabled;
        self
    }

    /// 设置 User-Agent 轮换列表
    pub fn user_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.user_agents = agents.into_iter().map(Into::into).collect();
        self
    }

    /// 设置轮换策略
    pub fn rotation(mut self, policy: RotationPolicy) -> Self {
        self.config.rotation = policy;
        self
    }

    /// 设置选择策略
    pub fn selection(mut self, policy: SelectionPolicy) -> Self {
        self.config.selection = policy;
        self
    }

    /// 设置每个域名的身份池大小
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// 设置淘汰阈值
    pub fn evict_after_failures(mut self, failures: u32) -> Self {
        self.config.evict_after_failures = failures;
        self
    }

    /// 设置上游协议
    pub fn upstream_scheme(mut self, scheme: UpstreamScheme) -> Self {
        self.config.upstream_scheme = scheme;
        self
    }

    /// 设置是否跳过上游证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.config.skip_verify = skip;
        self
    }

    /// 设置最大并发连接数
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// 设置超时配置
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// 设置请求大小限制
    pub fn size_limits(mut self, limits: SizeLimitConfig) -> Self {
        self.config.size_limits = limits;
        self
    }

    /// 设置每个域名的速率限制
    pub fn rate_limit(mut self, limit: RateLimitConfig) -> Self {
        self.config.rate_limit = Some(limit);
        self
    }

    /// 构建 ProxyConfig 并验证
    pub fn build(self) -> Result<ProxyConfig> {
        ConfigValidator::validate_proxy_config(&self.config)?;
        Ok(self.config)
    }
}
