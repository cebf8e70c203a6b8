// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::ProxyConfigBuilder;
pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 轮换策略（用户代理与上游代理分配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPolicy {
    /// 按顺序轮流分配
    #[default]
    RoundRobin,
    /// 随机分配
    Random,
}

/// 身份选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// 使用次数最少者优先，相同次数时最早创建者优先
    #[default]
    LeastUsed,
    /// 随机选择
    Random,
}

/// 转发到目标站点时使用的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    #[default]
    Https,
}

impl fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamScheme::Http => write!(f, "http"),
            UpstreamScheme::Https => write!(f, "https"),
        }
    }
}

/// 超时配置（毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// 出站连接超时
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// 出站响应读取超时
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    /// 入站连接空闲超时
    #[serde(default = "default_client_idle_ms")]
    pub client_idle_ms: u64,
}

fn default_connect_ms() -> u64 {
    10_000
}

fn default_read_ms() -> u64 {
    30_000
}

fn default_client_idle_ms() -> u64 {
    60_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            read_ms: default_read_ms(),
            client_idle_ms: default_client_idle_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn client_idle(&self) -> Duration {
        Duration::from_millis(self.client_idle_ms)
    }
}

/// 入站请求大小限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeLimitConfig {
    /// 最大 HTTP 请求头大小（字节）
    pub max_header_size: usize,
    /// 最大请求体大小（字节）
    pub max_body_size: usize,
}

impl Default for SizeLimitConfig {
    fn default() -> Self {
        Self {
            max_header_size: 16 * 1024,       // 16KB
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// 每个目标域名的速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许转发的请求数
    pub requests_per_second: u32,
    /// 突发容量
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_size: 20,
        }
    }
}

/// 代理服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 监听地址
    pub bind_addr: String,
    /// 监听端口
    pub bind_port: u16,
    /// TLS 证书路径（与 key_path 同时省略时启动时自动生成自签名证书）
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 自动生成证书时使用的 Common Name
    #[serde(default = "default_common_name")]
    pub common_name: String,
    /// 自动生成证书时使用的 SubjectAltName
    #[serde(default)]
    pub alt_names: Vec<String>,
    /// 是否通过上游代理列表转发
    #[serde(default)]
    pub use_proxy: bool,
    /// 是否收集响应中的 Cookie 并合并到身份的 Cookie 罐
    #[serde(default = "default_true")]
    pub collect_cookie: bool,
    /// 上游代理列表（如 "http://10.0.0.1:8080", "socks5://10.0.0.2:1080"）
    #[serde(default)]
    pub proxies: Vec<String>,
    /// User-Agent 轮换列表（为空时保留客户端自带的 User-Agent）
    #[serde(default)]
    pub user_agents: Vec<String>,
    /// 用户代理与上游代理的轮换策略
    #[serde(default)]
    pub rotation: RotationPolicy,
    /// 身份选择策略
    #[serde(default)]
    pub selection: SelectionPolicy,
    /// 每个域名的身份池最大数量
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// 连续转发失败多少次后淘汰身份（0 表示从不淘汰）
    #[serde(default = "default_evict_after_failures")]
    pub evict_after_failures: u32,
    /// 请求未携带协议时转发使用的协议
    #[serde(default)]
    pub upstream_scheme: UpstreamScheme,
    /// 是否跳过上游证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// 最大并发入站连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 超时配置
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// 请求大小限制配置
    #[serde(default)]
    pub size_limits: SizeLimitConfig,
    /// 每个域名的速率限制（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_common_name() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> usize {
    1
}

fn default_evict_after_failures() -> u32 {
    3
}

fn default_max_connections() -> usize {
    1000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 8443,
            cert_path: None,
            key_path: None,
            common_name: default_common_name(),
            alt_names: Vec::new(),
            use_proxy: false,
            collect_cookie: true,
            proxies: Vec::new(),
            user_agents: Vec::new(),
            rotation: RotationPolicy::default(),
            selection: SelectionPolicy::default(),
            pool_size: default_pool_size(),
            evict_after_failures: default_evict_after_failures(),
            upstream_scheme: UpstreamScheme::default(),
            skip_verify: false,
            max_connections: default_max_connections(),
            timeouts: TimeoutConfig::default(),
            size_limits: SizeLimitConfig::default(),
            rate_limit: None,
        }
    }
}

impl ProxyConfig {
    /// 创建 Builder
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_proxy_config(self)
    }

    /// 监听地址（host:port）
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    /// 证书的 SubjectAltName 列表（确保包含 Common Name）
    pub fn certificate_names(&self) -> Vec<String> {
        let mut names = self.alt_names.clone();
        if !names.iter().any(|n| n == &self.common_name) {
            names.push(self.common_name.clone());
        }
        names
    }
}

/// 应用配置
pub struct AppConfig;

impl AppConfig {
    /// 从 TOML 字符串解析代理配置（`[proxy]` 表）
    pub fn parse_proxy_config(content: &str) -> anyhow::Result<ProxyConfig> {
        #[derive(Deserialize)]
        struct ProxyConfigWrapper {
            proxy: ProxyConfig,
        }

        let wrapper: ProxyConfigWrapper =
            toml::from_str(content).context("Failed to parse proxy configuration")?;
        wrapper
            .proxy
            .validate()
            .context("Proxy configuration validation failed")?;
        Ok(wrapper.proxy)
    }

    /// 从文件加载代理配置
    pub fn load_proxy_config(path: &str) -> anyhow::Result<ProxyConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::parse_proxy_config(&content)
    }
}
