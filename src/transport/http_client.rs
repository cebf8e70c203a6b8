use async_trait::async_trait;
use http::header;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::{OutboundRequest, Route, TransportClient};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::message::{strip_hop_by_hop, ProxyResponse};

/// 直连时客户端缓存使用的键
const DIRECT_KEY: &str = "";

/// 基于 reqwest 的出站传输
///
/// 每个上游代理（以及直连）各自缓存一个 `reqwest::Client`，复用其连接池。
/// 不跟随重定向，不保存 Cookie（Cookie 由身份池管理）
pub struct HttpTransportClient {
    connect_timeout: Duration,
    read_timeout: Duration,
    skip_verify: bool,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpTransportClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, skip_verify: bool) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            skip_verify,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.timeouts.connect(),
            config.timeouts.read(),
            config.skip_verify,
        )
    }

    fn build_client(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(self.skip_verify);

        builder = match proxy {
            Some(url) => builder.proxy(reqwest::Proxy::all(url).map_err(|e| {
                ProxyError::config_error(format!("Invalid upstream proxy '{}': {}", url, e))
            })?),
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| ProxyError::config_error(format!("Failed to build HTTP client: {}", e)))
    }

    /// 获取（或创建）对应路由的客户端
    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        let key = proxy.unwrap_or(DIRECT_KEY);
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(key) {
            return Ok(client.clone());
        }
        let client = self.build_client(proxy)?;
        clients.insert(key.to_string(), client.clone());
        Ok(client)
    }
}

fn map_error(target: &str, err: reqwest::Error) -> ProxyError {
    let reason = std::error::Error::source(&err)
        .map(|source| format!("{}: {}", err, source))
        .unwrap_or_else(|| err.to_string());
    if err.is_timeout() {
        ProxyError::forward_timeout(target, reason)
    } else {
        ProxyError::forward(target, reason)
    }
}

#[async_trait]
impl TransportClient for HttpTransportClient {
    async fn send(&self, request: OutboundRequest) -> Result<ProxyResponse> {
        let target = request.target();
        let client = self.client_for(request.proxy.as_deref())?;

        let mut headers = request.headers;
        headers.remove(header::HOST);

        debug!(
            "Forwarding {} {} ({})",
            request.method,
            request.url,
            Route(request.proxy.as_deref())
        );

        let response = client
            .request(request.method, request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| map_error(&target, e))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_error(&target, e))?;

        strip_hop_by_hop(&mut headers);
        trace!("Received {} ({} bytes) from {}", status, body.len(), target);

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
