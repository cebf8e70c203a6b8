/// HTTPS Proxy 库入口
///
/// 将核心模块导出为库，方便嵌入（注册钩子、替换转发客户端）和测试
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod message;
pub mod rate_limiter;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use crate::core::{CoreDependencies, ProxyCore, RequestState};
pub use config::{AppConfig, ProxyConfig};
pub use error::{ProxyError, Result};
pub use hooks::{AfterResponse, BeforeRequest, HookDecision, HookPipeline};
pub use identity::{Identity, IdentityStore};
pub use message::{ProxyRequest, ProxyResponse};
pub use rate_limiter::RateLimiter;
pub use server::{run_server, ProxyServer};
pub use stats::{ProxyStats, StatsTracker};
pub use tls::{Certificate, CertificateProvider};
pub use transport::{HttpTransportClient, OutboundRequest, TransportClient};
