mod connection;

pub use connection::{serve_connection, ConnectionSettings};

use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::core::ProxyCore;
use crate::error::Result;
use crate::hooks::HookPipeline;
use crate::tls::{self, Certificate};

/// 速率限制状态的清理间隔
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// TLS 终止的代理服务器
pub struct ProxyServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    core: Arc<ProxyCore>,
    settings: ConnectionSettings,
    connection_limit: usize,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// 绑定监听地址并准备 TLS
    pub async fn bind(
        config: &ProxyConfig,
        certificate: &Certificate,
        core: Arc<ProxyCore>,
    ) -> Result<Self> {
        let server_config = certificate.server_config()?;
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(server_config),
            core,
            settings: ConnectionSettings {
                limits: config.size_limits.clone().into(),
                idle_timeout: config.timeouts.client_idle(),
            },
            connection_limit: config.max_connections,
            local_addr,
        })
    }

    /// 实际监听的地址（端口为 0 时由系统分配）
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    /// 运行直到收到 Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// 运行直到 `shutdown` 完成；接受循环不会等待连接处理
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("HTTPS proxy listening on {}", self.local_addr);

        // 创建信号量限制并发连接数
        let connection_limiter = Arc::new(Semaphore::new(self.connection_limit));
        info!("Maximum concurrent connections: {}", self.connection_limit);

        // 定期清理速率限制状态
        let cleanup = self.core.rate_limiter().cloned().map(|limiter| {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(RATE_LIMIT_CLEANUP_INTERVAL).await;
                    limiter.retain_recent();
                }
            })
        });

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    let (stream, peer) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }

                    // 尝试获取连接许可
                    let permit = match connection_limiter.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                "Connection limit reached ({}), rejecting connection from {}",
                                self.connection_limit, peer
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    debug!("Accepted connection from {}", peer);

                    let acceptor = self.acceptor.clone();
                    let core = Arc::clone(&self.core);
                    let settings = self.settings;

                    tokio::spawn(async move {
                        // 持有 permit 直到任务结束，自动释放
                        let _permit = permit;

                        let handshake = timeout(settings.idle_timeout, acceptor.accept(stream));
                        let tls_stream = match handshake.await {
                            Ok(Ok(tls_stream)) => tls_stream,
                            Ok(Err(e)) => {
                                debug!("TLS handshake with {} failed: {}", peer, e);
                                return;
                            }
                            Err(_) => {
                                debug!("TLS handshake with {} timed out", peer);
                                return;
                            }
                        };

                        if let Err(e) = serve_connection(tls_stream, peer, core, settings).await {
                            debug!("Connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping server...");
                    break;
                }
            }
        }

        if let Some(handle) = cleanup {
            handle.abort();
        }

        info!("Server stopped gracefully");
        Ok(())
    }
}

/// 运行代理服务器直到 Ctrl+C
///
/// 证书准备失败或监听失败时记录错误并返回，由调用方以非零状态退出
pub async fn run_server(config: ProxyConfig, hooks: HookPipeline) -> anyhow::Result<()> {
    let config = Arc::new(config);
    info!("Starting HTTPS proxy on {}", config.listen_addr());

    let certificate = tls::load_or_generate(&config).map_err(|e| {
        error!("Failed to prepare TLS certificate: {}", e);
        e
    })?;

    let core = Arc::new(ProxyCore::new(Arc::clone(&config), hooks));
    let server = ProxyServer::bind(&config, &certificate, core)
        .await
        .map_err(|e| {
            error!("Failed to bind {}: {}", config.listen_addr(), e);
            e
        })
        .with_context(|| format!("Failed to start proxy on {}", config.listen_addr()))?;

    info!("Waiting for client connections... (Press Ctrl+C to stop)");
    server.run().await?;
    Ok(())
}
