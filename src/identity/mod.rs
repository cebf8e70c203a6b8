/// 身份池模块
///
/// 为每个目标域名维护一组合成的客户端身份（Cookie 罐、User-Agent、上游代理、
/// 会话 ID、使用次数）。域名映射表只用于查找/创建每个域名的池，
/// 所有池内操作只持有该域名自己的互斥锁，不同域名之间互不阻塞
pub mod cookie;
mod rotation;

pub use rotation::Rotator;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ProxyConfig, SelectionPolicy};

/// 一个合成的客户端身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// `name=value` 形式的 Cookie 罐，按名称后写者胜
    pub cookies: Vec<String>,
    /// 创建时确定，之后不变
    pub user_agent: String,
    /// 上游代理 URL，空字符串表示直连
    pub proxy_ref: String,
    /// 在所属域名的池内唯一
    pub session_id: String,
    pub use_count: u64,
    /// 连续转发失败次数
    pub failures: u32,
}

impl Identity {
    pub fn new(
        session_id: impl Into<String>,
        user_agent: impl Into<String>,
        proxy_ref: impl Into<String>,
    ) -> Self {
        Self {
            cookies: Vec::new(),
            user_agent: user_agent.into(),
            proxy_ref: proxy_ref.into(),
            session_id: session_id.into(),
            use_count: 0,
            failures: 0,
        }
    }

    /// 是否直连（未分配上游代理）
    pub fn is_direct(&self) -> bool {
        self.proxy_ref.is_empty()
    }

    /// 由 Cookie 罐生成的 Cookie 请求头
    pub fn cookie_header(&self) -> Option<String> {
        cookie::cookie_header(&self.cookies)
    }
}

/// 单个域名的身份池（插入顺序即创建顺序）
#[derive(Debug, Default)]
struct DomainPool {
    identities: Vec<Identity>,
}

impl DomainPool {
    fn find_mut(&mut self, session_id: &str) -> Option<&mut Identity> {
        self.identities
            .iter_mut()
            .find(|i| i.session_id == session_id)
    }

    fn contains(&self, session_id: &str) -> bool {
        self.identities.iter().any(|i| i.session_id == session_id)
    }

    /// 使用次数最少者；相同次数时取最早插入者
    fn least_used(&self) -> Option<usize> {
        self.identities
            .iter()
            .enumerate()
            .min_by_key(|(idx, i)| (i.use_count, *idx))
            .map(|(idx, _)| idx)
    }
}

/// 身份创建与选择策略
#[derive(Debug)]
pub struct IdentityPolicy {
    /// 每个域名池的最大身份数
    pub pool_size: usize,
    /// 更新时是否合并 Cookie
    pub collect_cookie: bool,
    pub selection: SelectionPolicy,
    pub user_agents: Rotator,
    /// None 表示所有身份直连
    pub proxies: Option<Rotator>,
}

impl IdentityPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            collect_cookie: config.collect_cookie,
            selection: config.selection,
            user_agents: Rotator::new(config.user_agents.clone(), config.rotation),
            proxies: config
                .use_proxy
                .then(|| Rotator::new(config.proxies.clone(), config.rotation)),
        }
    }
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            pool_size: 1,
            collect_cookie: true,
            selection: SelectionPolicy::default(),
            user_agents: Rotator::default(),
            proxies: None,
        }
    }
}

/// 规范化域名：去掉端口与结尾的点，转为小写
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    let host = domain
        .parse::<http::uri::Authority>()
        .map(|a| a.host().to_string())
        .unwrap_or_else(|_| domain.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// 按域名分片的身份存储
#[derive(Debug, Default)]
pub struct IdentityStore {
    pools: RwLock<HashMap<String, Arc<Mutex<DomainPool>>>>,
    policy: IdentityPolicy,
}

impl IdentityStore {
    pub fn new(policy: IdentityPolicy) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(IdentityPolicy::from_config(config))
    }

    pub fn policy(&self) -> &IdentityPolicy {
        &self.policy
    }

    /// 获取或创建域名的池
    fn pool_for(&self, domain: &str) -> Arc<Mutex<DomainPool>> {
        if let Some(pool) = self.pools.read().get(domain) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(domain.to_string()).or_default())
    }

    fn existing_pool(&self, domain: &str) -> Option<Arc<Mutex<DomainPool>>> {
        self.pools.read().get(domain).cloned()
    }

    fn should_grow(&self, pool: &DomainPool) -> bool {
        pool.identities.is_empty()
            || (pool.identities.len() < self.policy.pool_size
                && pool.identities.iter().all(|i| i.use_count > 0))
    }

    fn create_identity(&self, pool: &DomainPool) -> Identity {
        let mut session_id = uuid::Uuid::new_v4().to_string();
        while pool.contains(&session_id) {
            session_id = uuid::Uuid::new_v4().to_string();
        }
        let user_agent = self.policy.user_agents.next().unwrap_or_default();
        let proxy_ref = self
            .policy
            .proxies
            .as_ref()
            .and_then(Rotator::next)
            .unwrap_or_default();
        Identity::new(session_id, user_agent, proxy_ref)
    }

    /// 为下一次请求选择身份（返回副本）
    ///
    /// 池为空，或池未满且所有身份都已被使用过时，创建新身份
    pub fn select(&self, domain: &str) -> Identity {
        let domain = normalize_domain(domain);
        let pool = self.pool_for(&domain);
        let mut pool = pool.lock();

        if self.should_grow(&pool) {
            let identity = self.create_identity(&pool);
            debug!(
                "Created identity {} for {} (proxy: {}, pool size: {})",
                identity.session_id,
                domain,
                if identity.is_direct() {
                    "direct"
                } else {
                    identity.proxy_ref.as_str()
                },
                pool.identities.len() + 1
            );
            pool.identities.push(identity.clone());
            return identity;
        }

        let idx = match self.policy.selection {
            SelectionPolicy::LeastUsed => pool.least_used().unwrap_or(0),
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..pool.identities.len()),
        };
        pool.identities[idx].clone()
    }

    /// 请求成功后回写身份
    ///
    /// 开启 Cookie 收集时合并 `new_cookies`（Set-Cookie 值）；总是增加使用次数、
    /// 清零失败计数，并记录非空的 `proxy_used`。身份不存在时不做任何事
    pub fn update(
        &self,
        domain: &str,
        session_id: &str,
        new_cookies: &[String],
        proxy_used: &str,
    ) -> bool {
        let domain = normalize_domain(domain);
        let Some(pool) = self.existing_pool(&domain) else {
            debug!("Ignoring update for unknown domain {}", domain);
            return false;
        };
        let mut pool = pool.lock();
        let Some(identity) = pool.find_mut(session_id) else {
            debug!(
                "Ignoring update for unknown session {} on {}",
                session_id, domain
            );
            return false;
        };

        if self.policy.collect_cookie {
            cookie::merge(&mut identity.cookies, new_cookies);
        }
        identity.use_count += 1;
        identity.failures = 0;
        if !proxy_used.is_empty() {
            identity.proxy_ref = proxy_used.to_string();
        }
        true
    }

    /// 移除身份，返回被移除者
    pub fn evict(&self, domain: &str, session_id: &str) -> Option<Identity> {
        let domain = normalize_domain(domain);
        let pool = self.existing_pool(&domain)?;
        let mut pool = pool.lock();
        let idx = pool
            .identities
            .iter()
            .position(|i| i.session_id == session_id)?;
        let identity = pool.identities.remove(idx);
        info!(
            "Evicted identity {} from {} after {} uses ({} failures)",
            identity.session_id, domain, identity.use_count, identity.failures
        );
        Some(identity)
    }

    /// 记录一次转发失败，返回该身份当前的连续失败次数（身份不存在时为 0）
    pub fn record_failure(&self, domain: &str, session_id: &str) -> u32 {
        let domain = normalize_domain(domain);
        let Some(pool) = self.existing_pool(&domain) else {
            return 0;
        };
        let mut pool = pool.lock();
        match pool.find_mut(session_id) {
            Some(identity) => {
                identity.failures += 1;
                identity.failures
            }
            None => {
                debug!(
                    "Ignoring failure for unknown session {} on {}",
                    session_id, domain
                );
                0
            }
        }
    }

    /// 向池中预置身份；会话 ID 冲突时拒绝
    pub fn insert(&self, domain: &str, identity: Identity) -> bool {
        let domain = normalize_domain(domain);
        let pool = self.pool_for(&domain);
        let mut pool = pool.lock();
        if pool.contains(&identity.session_id) {
            return false;
        }
        pool.identities.push(identity);
        true
    }

    /// 域名池的快照（按插入顺序）
    pub fn snapshot(&self, domain: &str) -> Vec<Identity> {
        let domain = normalize_domain(domain);
        self.existing_pool(&domain)
            .map(|pool| pool.lock().identities.clone())
            .unwrap_or_default()
    }

    /// 已知的域名（排序）
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.pools.read().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// 已知域名数量
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationPolicy;

    fn policy(pool_size: usize) -> IdentityPolicy {
        IdentityPolicy {
            pool_size,
            ..IdentityPolicy::default()
        }
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("A.Test"), "a.test");
        assert_eq!(normalize_domain("a.test:8443"), "a.test");
        assert_eq!(normalize_domain("Example.COM."), "example.com");
        assert_eq!(normalize_domain("[::1]:443"), "[::1]");
    }

    #[test]
    fn test_select_creates_lazily() {
        let store = IdentityStore::default();
        assert!(store.is_empty());

        let first = store.select("example.com");
        let second = store.select("EXAMPLE.com:443");
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(store.snapshot("example.com").len(), 1);
        assert_eq!(store.domains(), vec!["example.com".to_string()]);
        assert!(first.is_direct());
        assert_eq!(first.use_count, 0);
    }

    #[test]
    fn test_pool_grows_only_after_use() {
        let store = IdentityStore::new(policy(3));
        let a = store.select("d.test");
        // 未更新前继续选中同一个身份
        assert_eq!(store.select("d.test").session_id, a.session_id);

        assert!(store.update("d.test", &a.session_id, &[], ""));
        let b = store.select("d.test");
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(store.snapshot("d.test").len(), 2);
    }

    #[test]
    fn test_least_used_tie_break() {
        let store = IdentityStore::new(policy(2));
        store.insert("t.test", Identity::new("s1", "", ""));
        store.insert("t.test", Identity::new("s2", "", ""));
        assert!(!store.insert("t.test", Identity::new("s1", "", "")));

        assert_eq!(store.select("t.test").session_id, "s1");
        store.update("t.test", "s1", &[], "");
        assert_eq!(store.select("t.test").session_id, "s2");
        store.update("t.test", "s2", &[], "");
        assert_eq!(store.select("t.test").session_id, "s1");
    }

    #[test]
    fn test_rotation_assignment() {
        let store = IdentityStore::new(IdentityPolicy {
            pool_size: 2,
            user_agents: Rotator::new(
                vec!["ua-1".into(), "ua-2".into()],
                RotationPolicy::RoundRobin,
            ),
            proxies: Some(Rotator::new(
                vec!["http://p1:8080".into(), "http://p2:8080".into()],
                RotationPolicy::RoundRobin,
            )),
            ..IdentityPolicy::default()
        });

        let a = store.select("r.test");
        store.update("r.test", &a.session_id, &[], "");
        let b = store.select("r.test");
        assert_eq!((a.user_agent.as_str(), a.proxy_ref.as_str()), ("ua-1", "http://p1:8080"));
        assert_eq!((b.user_agent.as_str(), b.proxy_ref.as_str()), ("ua-2", "http://p2:8080"));
    }

    #[test]
    fn test_update_without_cookie_collection() {
        let store = IdentityStore::new(IdentityPolicy {
            collect_cookie: false,
            ..IdentityPolicy::default()
        });
        let id = store.select("c.test");
        assert!(store.update("c.test", &id.session_id, &["sid=1".to_string()], "http://p:1"));

        let snap = store.snapshot("c.test");
        assert!(snap[0].cookies.is_empty());
        assert_eq!(snap[0].use_count, 1);
        assert_eq!(snap[0].proxy_ref, "http://p:1");
    }

    #[test]
    fn test_unknown_session_is_noop() {
        let store = IdentityStore::default();
        assert!(!store.update("none.test", "missing", &[], ""));
        // 更新不会创建域名池
        assert!(store.is_empty());

        store.select("x.test");
        assert!(!store.update("x.test", "missing", &[], ""));
        assert_eq!(store.record_failure("x.test", "missing"), 0);
        assert!(store.evict("x.test", "missing").is_none());
    }

    #[test]
    fn test_failures_and_evict() {
        let store = IdentityStore::default();
        let id = store.select("f.test");
        assert_eq!(store.record_failure("f.test", &id.session_id), 1);
        assert_eq!(store.record_failure("f.test", &id.session_id), 2);

        store.update("f.test", &id.session_id, &[], "");
        assert_eq!(store.snapshot("f.test")[0].failures, 0);

        let evicted = store.evict("f.test", &id.session_id).unwrap();
        assert_eq!(evicted.session_id, id.session_id);
        assert!(store.snapshot("f.test").is_empty());

        // 被淘汰后再次选择会创建新身份
        assert_ne!(store.select("f.test").session_id, id.session_id);
    }

    #[test]
    fn test_identity_serde() {
        let mut id = Identity::new("s", "ua", "");
        id.cookies.push("sid=1".into());
        let json = serde_json::to_string(&id).unwrap();
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.cookie_header().as_deref(), Some("sid=1"));
    }

    #[test]
    fn test_locked_pool_does_not_block_other_domains() {
        let store = Arc::new(IdentityStore::default());
        store.select("a.test");

        let held = store.pool_for("a.test");
        let _guard = held.lock();

        let (tx, rx) = std::sync::mpsc::channel();
        let other = Arc::clone(&store);
        std::thread::spawn(move || {
            let b = other.select("b.test");
            let c = other.select("c.test");
            let _ = tx.send((b.session_id, c.session_id));
        });

        let (b, c) = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("selection on another domain was blocked");
        assert_ne!(b, c);
        assert_eq!(store.len(), 3);
    }
}
