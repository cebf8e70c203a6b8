/// HTTP/1.1 消息模块
///
/// 代理核心使用的请求/响应类型。连接上的帧解析由 hyper 完成，
/// 这里负责在 hyper 消息与完整缓冲的代理消息之间转换，并执行大小限制
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::Authority;
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;

use crate::config::SizeLimitConfig;
use crate::error::{ProxyError, Result};

/// 逐跳头部，不会在代理两端之间传递
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// 移除逐跳头部（包括 Connection 头中列出的头部）
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// 入站 HTTP 请求
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    /// 创建空请求体的请求
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// 添加请求头（非法的头部名或值会被忽略）
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// 设置请求体
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 目标 authority：优先取绝对形式 URI 中的 authority，否则取 Host 头
    pub fn authority(&self) -> Option<Authority> {
        if let Some(authority) = self.uri.authority() {
            return Some(authority.clone());
        }
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse::<Authority>().ok())
    }

    /// 规范化后的目标域名（小写，去掉端口和结尾的点）
    pub fn host(&self) -> Option<String> {
        let authority = self.authority()?;
        let host = authority
            .host()
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    /// 读取完整请求体，将 hyper 请求转换为代理请求
    ///
    /// 请求头总长度超限返回 431 对应的错误，请求体超限返回 413 对应的错误，
    /// 请求体帧错误（非法 chunk 等）视为格式错误
    pub async fn from_http<B>(request: Request<B>, limits: HttpLimits) -> Result<Self>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();

        let header_size: usize = parts
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 4)
            .sum();
        if header_size > limits.max_header_size {
            return Err(ProxyError::RequestTooLarge {
                what: "header",
                limit: limits.max_header_size,
            });
        }

        let too_large = ProxyError::RequestTooLarge {
            what: "body",
            limit: limits.max_body_size,
        };
        // Content-Length 已超限时不再读取请求体
        if body.size_hint().lower() > limits.max_body_size as u64 {
            return Err(too_large);
        }

        let body = match Limited::new(body, limits.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => return Err(too_large),
            Err(e) => return Err(ProxyError::malformed(format!("invalid request body: {}", e))),
        };

        let mut headers = parts.headers;
        // 请求体已完整缓冲，帧信息由出站侧重新生成
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONTENT_LENGTH);

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers,
            body,
        })
    }

    /// 请求路径（不含查询字符串）
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// 请求路径与查询字符串
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// 返回给客户端的 HTTP 响应
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    /// 创建空响应
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// 创建纯文本响应
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp.body = Bytes::from(message.into());
        resp
    }

    /// 将请求级错误转换为本地合成的响应
    pub fn from_error(err: &ProxyError) -> Self {
        let status = err.status_code();
        let reason = status.canonical_reason().unwrap_or("Error");
        Self::text(status, format!("{}: {}\n", reason, err))
    }

    /// 添加响应头（非法的头部名或值会被忽略）
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// 设置响应体
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 转换为 hyper 响应，Content-Length 由 hyper 根据响应体生成
    pub fn into_http(self) -> Response<Full<Bytes>> {
        let mut headers = self.headers;
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove("keep-alive");

        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }

    /// 所有 Set-Cookie 头的值
    pub fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

/// 入站请求的大小限制
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        SizeLimitConfig::default().into()
    }
}

impl From<SizeLimitConfig> for HttpLimits {
    fn from(config: SizeLimitConfig) -> Self {
        Self {
            max_header_size: config.max_header_size,
            max_body_size: config.max_body_size,
        }
    }
}
