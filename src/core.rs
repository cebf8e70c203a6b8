/// 请求处理状态机
///
/// Received → PreHook → IdentitySelected → Forwarding → PostHook → Replied，
/// 任一非终止状态都可以进入 Aborted。所有请求级错误都在这里转换为响应，
/// `handle` 本身不会返回错误
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::hooks::{HookDecision, HookPipeline};
use crate::identity::{Identity, IdentityStore};
use crate::message::{strip_hop_by_hop, ProxyRequest, ProxyResponse};
use crate::rate_limiter::RateLimiter;
use crate::stats::{ProxyStats, StatsTracker};
use crate::transport::{HttpTransportClient, OutboundRequest, TransportClient};

/// 请求生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    PreHook,
    IdentitySelected,
    Forwarding,
    PostHook,
    Replied,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Replied | RequestState::Aborted)
    }

    /// 是否允许从当前状态转移到 `next`
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Received, PreHook)
            | (PreHook, IdentitySelected)
            | (IdentitySelected, Forwarding)
            | (Forwarding, PostHook)
            | (PostHook, Replied) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::PreHook => "pre-hook",
            RequestState::IdentitySelected => "identity-selected",
            RequestState::Forwarding => "forwarding",
            RequestState::PostHook => "post-hook",
            RequestState::Replied => "replied",
            RequestState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// 单个请求的处理上下文
struct RequestContext {
    id: u64,
    state: RequestState,
}

impl RequestContext {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: RequestState::Received,
        }
    }

    fn transition(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        trace!("request #{}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }
}

/// ProxyCore 依赖（用于依赖注入）
pub struct CoreDependencies {
    pub store: Arc<IdentityStore>,
    pub transport: Arc<dyn TransportClient>,
    pub rate_limiter: Option<RateLimiter>,
    pub stats: StatsTracker,
}

impl CoreDependencies {
    /// 根据配置创建默认依赖
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            store: Arc::new(IdentityStore::from_config(config)),
            transport: Arc::new(HttpTransportClient::from_config(config)),
            rate_limiter: config.rate_limit.clone().map(RateLimiter::new),
            stats: StatsTracker::new(),
        }
    }

    /// 替换出站传输（测试中使用内存实现）
    pub fn with_transport(mut self, transport: Arc<dyn TransportClient>) -> Self {
        self.transport = transport;
        self
    }
}

/// 请求处理核心
pub struct ProxyCore {
    config: Arc<ProxyConfig>,
    hooks: HookPipeline,
    store: Arc<IdentityStore>,
    transport: Arc<dyn TransportClient>,
    rate_limiter: Option<RateLimiter>,
    stats: StatsTracker,
    next_id: AtomicU64,
}

impl ProxyCore {
    /// 从配置创建（使用默认依赖）
    pub fn new(config: Arc<ProxyConfig>, hooks: HookPipeline) -> Self {
        let deps = CoreDependencies::from_config(&config);
        Self::with_dependencies(config, hooks, deps)
    }

    /// 从配置和依赖创建
    pub fn with_dependencies(
        config: Arc<ProxyConfig>,
        hooks: HookPipeline,
        deps: CoreDependencies,
    ) -> Self {
        Self {
            config,
            hooks,
            store: deps.store,
            transport: deps.transport,
            rate_limiter: deps.rate_limiter,
            stats: deps.stats,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Arc<ProxyConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats.get_stats()
    }

    /// 客户端在响应前断开，处理中的请求被丢弃
    pub fn record_cancelled(&self) {
        self.stats.request_cancelled();
        self.stats.request_aborted();
    }

    /// 处理一个请求，总是返回要发给客户端的响应
    pub async fn handle(&self, mut request: ProxyRequest) -> ProxyResponse {
        let mut ctx = RequestContext::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stats.request_received();
        debug!("request #{}: {} {}", ctx.id, request.method, request.uri);

        if let Err(e) = check_request(&request) {
            return self.abort(&mut ctx, &e);
        }

        ctx.transition(RequestState::PreHook);
        let (decision, errors) = self.hooks.run_before(&mut request);
        self.stats.add_hook_errors(errors.len());
        match decision {
            HookDecision::Continue => {}
            HookDecision::Stop => {
                let resp =
                    ProxyResponse::text(StatusCode::FORBIDDEN, "Request blocked by proxy\n");
                return self.abort_with(&mut ctx, resp);
            }
            HookDecision::Respond(resp) => return self.abort_with(&mut ctx, resp),
        }

        // 钩子可能改写了目标
        let domain = match request.host() {
            Some(domain) => domain,
            None => {
                let err = ProxyError::malformed("request has no host after pre-hooks");
                return self.abort(&mut ctx, &err);
            }
        };

        if let Some(limiter) = &self.rate_limiter {
            if let Err(wait) = limiter.check(&domain) {
                warn!(
                    "request #{}: rate limit exceeded for {} (retry after {:?})",
                    ctx.id, domain, wait
                );
                let retry_after = wait.as_secs_f64().ceil().max(1.0) as u64;
                let resp = ProxyResponse::text(
                    StatusCode::TOO_MANY_REQUESTS,
                    format!("Rate limit exceeded for {}\n", domain),
                )
                .with_header("Retry-After", &retry_after.to_string());
                return self.abort_with(&mut ctx, resp);
            }
        }

        ctx.transition(RequestState::IdentitySelected);
        let identity = self.store.select(&domain);
        debug!(
            "request #{}: {} using session {} (uses: {})",
            ctx.id, domain, identity.session_id, identity.use_count
        );
        let outbound = match self.build_outbound(&request, &identity) {
            Ok(outbound) => outbound,
            Err(e) => return self.abort(&mut ctx, &e),
        };

        ctx.transition(RequestState::Forwarding);
        let mut response = match self.transport.send(outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "request #{}: forwarding to {} failed (session {}): {}",
                    ctx.id, domain, identity.session_id, e
                );
                self.forward_failed(&domain, &identity);
                return self.abort(&mut ctx, &e);
            }
        };

        ctx.transition(RequestState::PostHook);
        let errors = self.hooks.run_after(&mut response, &request);
        self.stats.add_hook_errors(errors.len());

        let cookies = response.set_cookies();
        self.store
            .update(&domain, &identity.session_id, &cookies, &identity.proxy_ref);

        ctx.transition(RequestState::Replied);
        self.stats.request_replied();
        debug!(
            "request #{}: {} replied {}",
            ctx.id, domain, response.status
        );
        response
    }

    fn abort(&self, ctx: &mut RequestContext, err: &ProxyError) -> ProxyResponse {
        debug!("request #{}: aborted in {}: {}", ctx.id, ctx.state, err);
        self.abort_with(ctx, ProxyResponse::from_error(err))
    }

    fn abort_with(&self, ctx: &mut RequestContext, response: ProxyResponse) -> ProxyResponse {
        ctx.transition(RequestState::Aborted);
        self.stats.request_aborted();
        response
    }

    /// 记录失败，达到阈值时淘汰身份
    fn forward_failed(&self, domain: &str, identity: &Identity) {
        self.stats.forward_error();

        let threshold = self.config.evict_after_failures;
        let failures = self.store.record_failure(domain, &identity.session_id);
        if threshold > 0 && failures >= threshold {
            if let Some(evicted) = self.store.evict(domain, &identity.session_id) {
                self.stats.identity_evicted();
                warn!(
                    "Evicted identity {} for {} after {} consecutive failures (proxy: {})",
                    evicted.session_id,
                    domain,
                    failures,
                    if evicted.is_direct() {
                        "direct"
                    } else {
                        evicted.proxy_ref.as_str()
                    }
                );
            }
        }
    }

    /// 出站 URL：绝对形式直接使用，否则由上游协议、Host 与路径拼接
    fn target_url(&self, request: &ProxyRequest) -> Result<Url> {
        let raw = match request.uri.scheme_str() {
            Some("http") | Some("https") => request.uri.to_string(),
            Some(other) => {
                return Err(ProxyError::malformed(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
            None => {
                let authority = request
                    .authority()
                    .ok_or_else(|| ProxyError::malformed("missing Host header"))?;
                format!(
                    "{}://{}{}",
                    self.config.upstream_scheme,
                    authority,
                    request.path_and_query()
                )
            }
        };
        Url::parse(&raw)
            .map_err(|e| ProxyError::malformed(format!("invalid target URL '{}': {}", raw, e)))
    }

    /// 把身份注入出站请求
    fn build_outbound(
        &self,
        request: &ProxyRequest,
        identity: &Identity,
    ) -> Result<OutboundRequest> {
        let url = self.target_url(request)?;

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        if !identity.user_agent.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&identity.user_agent) {
                headers.insert(header::USER_AGENT, value);
            }
        }

        if self.store.policy().collect_cookie {
            headers.remove(header::COOKIE);
            if let Some(value) = identity
                .cookie_header()
                .and_then(|c| HeaderValue::from_str(&c).ok())
            {
                headers.insert(header::COOKIE, value);
            }
        }

        Ok(OutboundRequest {
            method: request.method.clone(),
            url,
            headers,
            body: request.body.clone(),
            proxy: (!identity.is_direct()).then(|| identity.proxy_ref.clone()),
        })
    }
}

/// Received 阶段的检查：拒绝 CONNECT 与缺少目标主机的请求
fn check_request(request: &ProxyRequest) -> Result<()> {
    if request.method == Method::CONNECT {
        return Err(ProxyError::malformed("CONNECT tunnelling is not supported"));
    }
    if request.host().is_none() {
        return Err(ProxyError::malformed("missing Host header"));
    }
    Ok(())
}
