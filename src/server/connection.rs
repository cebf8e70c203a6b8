use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::core::ProxyCore;
use crate::error::{ProxyError, Result};
use crate::message::{HttpLimits, ProxyRequest, ProxyResponse};

/// hyper 读缓冲区允许的最小上限
const MIN_READ_BUFFER: usize = 8 * 1024;

/// 单个入站连接的处理参数
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub limits: HttpLimits,
    /// 等待下一个请求头（以及 TLS 握手）的最长时间
    pub idle_timeout: Duration,
}

/// 处理中的请求；客户端断开时 hyper 丢弃处理 future，此时记为取消
struct InFlight {
    core: Arc<ProxyCore>,
    peer: SocketAddr,
    finished: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Client {} disconnected before the response was ready",
                self.peer
            );
            self.core.record_cancelled();
        }
    }
}

async fn handle_request(
    request: Request<Incoming>,
    peer: SocketAddr,
    core: Arc<ProxyCore>,
    limits: HttpLimits,
) -> Response<Full<Bytes>> {
    let request = match ProxyRequest::from_http(request, limits).await {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejecting request from {}: {}", peer, e);
            // 请求体可能未读完，连接不再复用
            return ProxyResponse::from_error(&e)
                .with_header("Connection", "close")
                .into_http();
        }
    };

    let mut in_flight = InFlight {
        core: Arc::clone(&core),
        peer,
        finished: false,
    };
    let response = core.handle(request).await;
    in_flight.finished = true;
    response.into_http()
}

/// 在已完成 TLS 终止的流上处理 HTTP/1.1 请求（支持 keep-alive 与流水线）
///
/// 请求解析失败时由 hyper 回复 400/431 并关闭连接
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    core: Arc<ProxyCore>,
    settings: ConnectionSettings,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let limits = settings.limits;

    let service = service_fn(move |req: Request<Incoming>| {
        let core = Arc::clone(&core);
        async move { Ok::<_, Infallible>(handle_request(req, peer, core, limits).await) }
    });

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.idle_timeout)
        .max_buf_size(limits.max_header_size.max(MIN_READ_BUFFER))
        .title_case_headers(true)
        .keep_alive(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| ProxyError::Other(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::core::CoreDependencies;
    use crate::hooks::HookPipeline;
    use crate::transport::{OutboundRequest, TransportClient};
    use async_trait::async_trait;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct CountingTransport {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl TransportClient for CountingTransport {
        async fn send(&self, _request: OutboundRequest) -> Result<ProxyResponse> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(ProxyResponse::text(StatusCode::OK, "ok"))
        }
    }

    fn settings(max_body_size: usize) -> ConnectionSettings {
        ConnectionSettings {
            limits: HttpLimits {
                max_header_size: 8 * 1024,
                max_body_size,
            },
            idle_timeout: Duration::from_secs(5),
        }
    }

    /// 在内存管道上跑一条连接，写入原始字节并读取全部回复
    async fn exchange(raw: &[u8], settings: ConnectionSettings) -> (String, usize) {
        let transport = Arc::new(CountingTransport::default());
        let config = ProxyConfig::default();
        let deps = CoreDependencies::from_config(&config).with_transport(transport.clone());
        let core = Arc::new(ProxyCore::with_dependencies(
            Arc::new(config),
            HookPipeline::empty(),
            deps,
        ));

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let task = tokio::spawn(serve_connection(server, peer, core, settings));

        client.write_all(raw).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .expect("connection did not close")
            .unwrap();
        let _ = task.await.unwrap();

        (
            String::from_utf8_lossy(&response).into_owned(),
            transport.sent.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn test_chunk_size_overflow_gets_400() {
        // 块大小超出 64 位整数范围
        let raw = b"POST / HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\n10000000000000000\r\nXYZ";
        let (response, sent) = exchange(raw, settings(1024)).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_oversized_chunk_gets_413() {
        let raw = b"POST / HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\n5\r\nworld\r\n";
        let (response, sent) = exchange(raw, settings(8)).await;
        assert!(response.starts_with("HTTP/1.1 413"), "{}", response);
        assert!(response.contains("Connection: close"), "{}", response);
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_chunked_body_is_forwarded() {
        let raw = b"POST / HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
5\r\nhello\r\n0\r\n\r\n";
        let (response, sent) = exchange(raw, settings(1024)).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("ok"), "{}", response);
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_unparseable_request_gets_400() {
        let (response, sent) = exchange(b"NOT A REQUEST\r\n\r\n", settings(1024)).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert_eq!(sent, 0);
    }
}
