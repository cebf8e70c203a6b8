/// 拦截钩子模块
///
/// 嵌入方在启动时注册两组有序回调：转发前的 `before_request` 与返回前的
/// `after_response`。注册完成后列表不可变，回调可能在多个连接任务中并发调用，
/// 因此必须是 `Send + Sync`
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::message::{ProxyRequest, ProxyResponse};

/// 转发前钩子的决定
#[derive(Debug, Clone)]
pub enum HookDecision {
    /// 继续处理
    Continue,
    /// 停止处理，向客户端返回本地生成的 403
    Stop,
    /// 停止处理，返回钩子提供的响应
    Respond(ProxyResponse),
}

impl HookDecision {
    pub fn is_continue(&self) -> bool {
        matches!(self, HookDecision::Continue)
    }
}

/// 转发前钩子（可修改请求）
pub trait BeforeRequest: Send + Sync {
    fn before_request(&self, request: &mut ProxyRequest) -> HookDecision;
}

impl<F> BeforeRequest for F
where
    F: Fn(&mut ProxyRequest) -> HookDecision + Send + Sync,
{
    fn before_request(&self, request: &mut ProxyRequest) -> HookDecision {
        self(request)
    }
}

/// 返回前钩子（可修改响应），返回的错误只会被记录
pub trait AfterResponse: Send + Sync {
    fn after_response(
        &self,
        response: &mut ProxyResponse,
        request: &ProxyRequest,
    ) -> anyhow::Result<()>;
}

impl<F> AfterResponse for F
where
    F: Fn(&mut ProxyResponse, &ProxyRequest) -> anyhow::Result<()> + Send + Sync,
{
    fn after_response(
        &self,
        response: &mut ProxyResponse,
        request: &ProxyRequest,
    ) -> anyhow::Result<()> {
        self(response, request)
    }
}

struct Named<T: ?Sized> {
    name: String,
    hook: Box<T>,
}

/// 有序的钩子列表
#[derive(Clone, Default)]
pub struct HookPipeline {
    before: Arc<Vec<Named<dyn BeforeRequest>>>,
    after: Arc<Vec<Named<dyn AfterResponse>>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("before", &self.before_names())
            .field("after", &self.after_names())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

impl HookPipeline {
    pub fn builder() -> HookPipelineBuilder {
        HookPipelineBuilder::default()
    }

    /// 不含任何钩子的流水线
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn before_names(&self) -> Vec<&str> {
        self.before.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn after_names(&self) -> Vec<&str> {
        self.after.iter().map(|h| h.name.as_str()).collect()
    }

    /// 按注册顺序执行转发前钩子，遇到第一个非 Continue 的决定即停止
    ///
    /// panic 的钩子被记为错误并视为 Continue
    pub fn run_before(&self, request: &mut ProxyRequest) -> (HookDecision, Vec<ProxyError>) {
        let mut errors = Vec::new();
        for entry in self.before.iter() {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| entry.hook.before_request(request)));
            match result {
                Ok(HookDecision::Continue) => {}
                Ok(decision) => {
                    debug!("Hook '{}' stopped request to {}", entry.name, request.uri);
                    return (decision, errors);
                }
                Err(payload) => {
                    let err = ProxyError::hook(&entry.name, panic_message(payload));
                    warn!("{}", err);
                    errors.push(err);
                }
            }
        }
        (HookDecision::Continue, errors)
    }

    /// 按注册顺序执行返回前钩子；错误与 panic 被记录后忽略
    pub fn run_after(
        &self,
        response: &mut ProxyResponse,
        request: &ProxyRequest,
    ) -> Vec<ProxyError> {
        let mut errors = Vec::new();
        for entry in self.after.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                entry.hook.after_response(response, request)
            }));
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => ProxyError::hook(&entry.name, e.to_string()),
                Err(payload) => ProxyError::hook(&entry.name, panic_message(payload)),
            };
            warn!("{}", err);
            errors.push(err);
        }
        errors
    }
}

/// HookPipeline 构建器
#[derive(Default)]
pub struct HookPipelineBuilder {
    before: Vec<Named<dyn BeforeRequest>>,
    after: Vec<Named<dyn AfterResponse>>,
}

impl HookPipelineBuilder {
    /// 追加转发前钩子
    pub fn before(
        mut self,
        name: impl Into<String>,
        hook: impl BeforeRequest + 'static,
    ) -> Self {
        self.before.push(Named {
            name: name.into(),
            hook: Box::new(hook),
        });
        self
    }

    /// 追加返回前钩子
    pub fn after(
        mut self,
        name: impl Into<String>,
        hook: impl AfterResponse + 'static,
    ) -> Self {
        self.after.push(Named {
            name: name.into(),
            hook: Box::new(hook),
        });
        self
    }

    pub fn build(self) -> HookPipeline {
        HookPipeline {
            before: Arc::new(self.before),
            after: Arc::new(self.after),
        }
    }
}
