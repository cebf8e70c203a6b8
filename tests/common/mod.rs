#![allow(dead_code)]
//! Common utilities for integration tests

use async_trait::async_trait;
use http::StatusCode;
use https_proxy::config::ProxyConfig;
use https_proxy::error::{ProxyError, Result};
use https_proxy::hooks::HookPipeline;
use https_proxy::transport::{OutboundRequest, TransportClient};
use https_proxy::{Certificate, CertificateProvider, CoreDependencies, ProxyCore, ProxyResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// RSA key generation is slow; every test in a binary shares one certificate
pub fn test_certificate() -> &'static Certificate {
    static CERT: OnceLock<Certificate> = OnceLock::new();
    CERT.get_or_init(|| {
        CertificateProvider::new("localhost", vec!["127.0.0.1".to_string()])
            .generate()
            .expect("Failed to generate test certificate")
    })
}

/// In-memory transport: records every outbound request and replays scripted results
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<OutboundRequest>>,
    script: Mutex<VecDeque<Result<ProxyResponse>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next result; once the queue is empty every request gets 200 "ok"
    pub fn push(&self, result: Result<ProxyResponse>) {
        self.script.lock().push_back(result);
    }

    pub fn push_response(&self, response: ProxyResponse) {
        self.push(Ok(response));
    }

    pub fn push_timeout(&self, target: &str) {
        self.push(Err(ProxyError::forward_timeout(target, "connect timed out")));
    }

    pub fn push_failure(&self, target: &str) {
        self.push(Err(ProxyError::forward(target, "connection refused")));
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Cookie header of the n-th outbound request
    pub fn cookie_of(&self, n: usize) -> Option<String> {
        self.requests.lock().get(n).and_then(|r| {
            r.headers
                .get(http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ProxyResponse> {
        self.requests.lock().push(request);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(ProxyResponse::text(StatusCode::OK, "ok")))
    }
}

/// Build a core whose outbound side is the given mock
pub fn core_with_mock(
    config: ProxyConfig,
    hooks: HookPipeline,
    transport: Arc<MockTransport>,
) -> ProxyCore {
    let deps = CoreDependencies::from_config(&config).with_transport(transport);
    ProxyCore::with_dependencies(Arc::new(config), hooks, deps)
}

/// TLS connector that trusts only the test certificate
pub fn tls_connector(certificate: &Certificate) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(
            certificate.cert_der.clone(),
        ))
        .expect("Failed to add test certificate to root store");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("Failed to set protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Open a TLS connection to the proxy (SNI "localhost")
pub async fn connect_tls(addr: SocketAddr) -> TlsStream<TcpStream> {
    let connector = tls_connector(test_certificate());
    let tcp = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to proxy");
    let server_name = rustls::pki_types::ServerName::try_from("localhost")
        .expect("Invalid server name");
    connector
        .connect(server_name, tcp)
        .await
        .expect("TLS handshake failed")
}

/// Send one raw request with `Connection: close` semantics and read until EOF
pub async fn tls_roundtrip(addr: SocketAddr, raw_request: &str) -> String {
    let mut stream = connect_tls(addr).await;
    stream
        .write_all(raw_request.as_bytes())
        .await
        .expect("Failed to write request");
    let mut response = Vec::new();
    // 服务端发送 close_notify 前可能直接关闭，读错误时使用已读取的数据
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// Plain HTTP upstream on an ephemeral port
///
/// Echoes the request line, Cookie and User-Agent in the body. `/login` also sets
/// `sid=1`; `/slow` waits two seconds before answering.
pub async fn start_upstream() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream");
    let addr = listener.local_addr().expect("Failed to get upstream addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf).into_owned();
                let request_line = head.lines().next().unwrap_or_default().to_string();
                let header = |name: &str| {
                    head.lines()
                        .find_map(|line| {
                            let (k, v) = line.split_once(':')?;
                            k.trim()
                                .eq_ignore_ascii_case(name)
                                .then(|| v.trim().to_string())
                        })
                        .unwrap_or_default()
                };

                if request_line.contains(" /slow ") {
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }

                let body = format!(
                    "line={}\ncookie={}\nuser-agent={}\n",
                    request_line,
                    header("cookie"),
                    header("user-agent")
                );
                let set_cookie = if request_line.contains(" /login ") {
                    "Set-Cookie: sid=1; Path=/\r\n"
                } else {
                    ""
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    set_cookie,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}
