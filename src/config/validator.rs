use anyhow::{bail, Context, Result};
use tracing::warn;

use super::{ProxyConfig, RateLimitConfig, SizeLimitConfig, TimeoutConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证上游代理 URL
    pub fn validate_proxy_url(proxy: &str) -> Result<()> {
        let url = url::Url::parse(proxy)
            .with_context(|| format!("Invalid upstream proxy URL: '{}'", proxy))?;
        match url.scheme() {
            "http" | "https" | "socks5" | "socks5h" => {}
            other => bail!(
                "Unsupported upstream proxy scheme '{}' in '{}' (expected http, https, socks5 or socks5h)",
                other,
                proxy
            ),
        }
        if url.host_str().is_none() {
            bail!("Upstream proxy URL '{}' has no host", proxy);
        }
        Ok(())
    }

    /// 验证代理配置
    pub fn validate_proxy_config(config: &ProxyConfig) -> Result<()> {
        // 验证监听地址
        Self::validate_address(&config.bind_addr, "Proxy bind_addr")?;

        // 验证证书配置
        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        if config.common_name.trim().is_empty() {
            bail!("common_name cannot be empty");
        }

        // 验证上游代理列表
        if config.use_proxy && config.proxies.is_empty() {
            bail!("use_proxy is enabled but the proxies list is empty");
        }
        for proxy in &config.proxies {
            Self::validate_proxy_url(proxy)?;
        }
        if !config.use_proxy && !config.proxies.is_empty() {
            warn!(
                "{} upstream proxies configured but use_proxy is disabled, requests go direct",
                config.proxies.len()
            );
        }

        if config.user_agents.iter().any(|ua| ua.trim().is_empty()) {
            bail!("user_agents cannot contain empty entries");
        }

        if config.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }

        if config.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        Self::validate_timeout_config(&config.timeouts)?;
        Self::validate_size_limit_config(&config.size_limits)?;

        // 验证速率限制配置
        if let Some(ref rate_limit) = config.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }

        Ok(())
    }

    /// 验证超时配置
    pub fn validate_timeout_config(config: &TimeoutConfig) -> Result<()> {
        if config.connect_ms == 0 {
            bail!("timeouts.connect_ms must be greater than 0");
        }
        if config.read_ms == 0 {
            bail!("timeouts.read_ms must be greater than 0");
        }
        if config.client_idle_ms == 0 {
            bail!("timeouts.client_idle_ms must be greater than 0");
        }
        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }

    /// 验证请求大小限制配置
    pub fn validate_size_limit_config(config: &SizeLimitConfig) -> Result<()> {
        if config.max_header_size == 0 {
            bail!("size_limits.max_header_size must be greater than 0");
        }
        if config.max_body_size == 0 {
            bail!("size_limits.max_body_size must be greater than 0");
        }
        // 建议值检查
        if config.max_body_size > 100 * 1024 * 1024 {
            warn!(
                "size_limits.max_body_size is very large ({} bytes = {} MB), \
                 request bodies are buffered in memory",
                config.max_body_size,
                config.max_body_size / (1024 * 1024)
            );
        }
        Ok(())
    }
}
