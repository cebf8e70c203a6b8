/// End-to-end tests: TLS client -> proxy -> local plain HTTP upstream
mod common;

use common::{connect_tls, get_available_port, start_upstream, test_certificate, tls_roundtrip};
use https_proxy::config::{ProxyConfig, UpstreamScheme};
use https_proxy::hooks::{HookDecision, HookPipeline};
use https_proxy::{ProxyCore, ProxyRequest, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::sleep;

struct RunningProxy {
    addr: SocketAddr,
    core: Arc<ProxyCore>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningProxy {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

fn test_config() -> ProxyConfig {
    ProxyConfig {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: 0,
        user_agents: vec!["UA-E2E/1.0".to_string()],
        upstream_scheme: UpstreamScheme::Http,
        ..Default::default()
    }
}

async fn start_proxy(config: ProxyConfig, hooks: HookPipeline) -> RunningProxy {
    let core = Arc::new(ProxyCore::new(Arc::new(config.clone()), hooks));
    let server = ProxyServer::bind(&config, test_certificate(), Arc::clone(&core))
        .await
        .expect("Failed to bind proxy");
    let addr = server.local_addr();

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = server
            .run_until(async {
                let _ = rx.await;
            })
            .await;
    });

    RunningProxy {
        addr,
        core,
        shutdown: Some(tx),
        handle,
    }
}

fn request(path: &str, upstream: SocketAddr) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: curl/8.0\r\nConnection: close\r\n\r\n",
        path, upstream
    )
}

#[tokio::test]
async fn test_cookie_session_over_tls() {
    let upstream = start_upstream().await;
    let proxy = start_proxy(test_config(), HookPipeline::empty()).await;

    let login = tls_roundtrip(proxy.addr, &request("/login", upstream)).await;
    assert!(login.starts_with("HTTP/1.1 200 OK"), "{}", login);
    assert!(login.contains("Set-Cookie: sid=1; Path=/"), "{}", login);
    assert!(login.contains("user-agent=UA-E2E/1.0"), "{}", login);

    let account = tls_roundtrip(proxy.addr, &request("/account", upstream)).await;
    assert!(account.starts_with("HTTP/1.1 200 OK"), "{}", account);
    assert!(account.contains("cookie=sid=1\n"), "{}", account);
    assert!(account.contains("line=GET /account HTTP/1.1"), "{}", account);

    let pool = proxy.core.store().snapshot("127.0.0.1");
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].use_count, 2);

    let stats = proxy.core.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.replied, 2);

    proxy.stop().await;
}

#[tokio::test]
async fn test_keep_alive_pipelined_requests() {
    let upstream = start_upstream().await;
    let proxy = start_proxy(test_config(), HookPipeline::empty()).await;

    let mut stream = connect_tls(proxy.addr).await;
    let pipelined = format!(
        "GET /one HTTP/1.1\r\nHost: {0}\r\n\r\nGET /two HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
        upstream
    );
    stream.write_all(pipelined.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);

    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2, "{}", response);
    let one = response.find("line=GET /one").unwrap();
    let two = response.find("line=GET /two").unwrap();
    assert!(one < two);

    proxy.stop().await;
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let proxy = start_proxy(test_config(), HookPipeline::empty()).await;

    let response = tls_roundtrip(proxy.addr, "NOT A REQUEST\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    let no_host = tls_roundtrip(proxy.addr, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(no_host.starts_with("HTTP/1.1 400"), "{}", no_host);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_gets_502() {
    let dead = SocketAddr::from(([127, 0, 0, 1], get_available_port()));
    let proxy = start_proxy(test_config(), HookPipeline::empty()).await;

    let response = tls_roundtrip(proxy.addr, &request("/", dead)).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert_eq!(proxy.core.stats().forward_errors, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_blocking_hook_over_tls() {
    let upstream = start_upstream().await;
    let hooks = HookPipeline::builder()
        .before("block", |req: &mut ProxyRequest| -> HookDecision {
            if req.path() == "/blocked" {
                HookDecision::Stop
            } else {
                HookDecision::Continue
            }
        })
        .build();
    let proxy = start_proxy(test_config(), hooks).await;

    let response = tls_roundtrip(proxy.addr, &request("/blocked", upstream)).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{}", response);
    assert!(proxy.core.store().is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_cancels_request() {
    let upstream = start_upstream().await;
    let proxy = start_proxy(test_config(), HookPipeline::empty()).await;

    let mut stream = connect_tls(proxy.addr).await;
    stream
        .write_all(request("/slow", upstream).as_bytes())
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    drop(stream);

    let mut cancelled = 0;
    for _ in 0..50 {
        cancelled = proxy.core.stats().cancelled;
        if cancelled > 0 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(cancelled, 1);

    // 请求被丢弃，身份没有被回写
    let pool = proxy.core.store().snapshot("127.0.0.1");
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].use_count, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let proxy = start_proxy(test_config(), HookPipeline::empty()).await;
    let addr = proxy.addr;
    proxy.stop().await;

    sleep(Duration::from_millis(100)).await;
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
