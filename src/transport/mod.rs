mod http_client;

pub use http_client::HttpTransportClient;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::fmt;
use url::Url;

use crate::error::Result;
use crate::message::ProxyResponse;

/// 出站请求
///
/// 由 ProxyCore 在选定身份后构造：头部已经注入身份的 Cookie 与 User-Agent，
/// 逐跳头部已被移除
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// 上游代理 URL，None 表示直连
    pub proxy: Option<String>,
}

impl OutboundRequest {
    /// 日志中使用的目标描述
    pub fn target(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or(""), port),
            None => self.url.host_str().unwrap_or("").to_string(),
        }
    }

    /// 路由描述（直连或经由代理）
    pub fn route(&self) -> Route<'_> {
        Route(self.proxy.as_deref())
    }
}

/// 出站路由（用于日志）
pub struct Route<'a>(Option<&'a str>);

impl fmt::Display for Route<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(proxy) => write!(f, "via {}", proxy),
            None => write!(f, "direct"),
        }
    }
}

/// 出站传输接口
///
/// 失败必须映射为 `ProxyError::Forward`（超时使用 `forward_timeout`）
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 发送请求并返回完整缓冲的响应
    async fn send(&self, request: OutboundRequest) -> Result<ProxyResponse>;
}
