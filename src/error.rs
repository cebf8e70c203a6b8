/// 自定义错误类型
///
/// 使用 thiserror 定义代理的错误分类：启动期致命错误与请求级错误分开，
/// 请求级错误在 ProxyCore 边界被转换为发回客户端的响应
use http::StatusCode;
use std::io;
use thiserror::Error;

/// HTTPS 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 证书生成失败（启动期致命错误）
    #[error("Certificate generation failed: {0}")]
    CertGen(String),

    /// 请求格式错误（缺少 Host、无法解析等）
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// 请求头或请求体超过限制
    #[error("Request too large: {what} exceeds {limit} bytes")]
    RequestTooLarge { what: &'static str, limit: usize },

    /// 转发失败（连接、超时、TLS 握手、上游代理）
    #[error("Failed to forward request to {target}: {reason}")]
    Forward {
        target: String,
        reason: String,
        timed_out: bool,
    },

    /// Hook 执行失败（仅记录日志，不会返回给客户端）
    #[error("Hook '{hook}' failed: {reason}")]
    Hook { hook: String, reason: String },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建证书生成错误
    pub fn cert_gen(msg: impl Into<String>) -> Self {
        Self::CertGen(msg.into())
    }

    /// 创建请求格式错误
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    /// 创建转发错误
    pub fn forward(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Forward {
            target: target.into(),
            reason: reason.into(),
            timed_out: false,
        }
    }

    /// 创建转发超时错误
    pub fn forward_timeout(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Forward {
            target: target.into(),
            reason: reason.into(),
            timed_out: true,
        }
    }

    /// 创建 Hook 错误
    pub fn hook(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 检查是否为请求格式错误
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedRequest(_))
    }

    /// 检查是否为转发错误
    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Forward { .. })
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Forward { timed_out: true, .. })
    }

    /// 检查是否为 Hook 错误
    pub fn is_hook(&self) -> bool {
        matches!(self, Self::Hook { .. })
    }

    /// 请求级错误对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::RequestTooLarge { what: "header", .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Self::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Forward {
                timed_out: true, ..
            } => StatusCode::GATEWAY_TIMEOUT,
            Self::Forward { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_error() {
        let err = ProxyError::malformed("missing Host header");
        assert!(err.is_malformed());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Malformed request: missing Host header");
    }

    #[test]
    fn test_forward_errors() {
        let err = ProxyError::forward("a.test", "connection refused");
        assert!(err.is_forward());
        assert!(!err.is_timeout());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("a.test"));

        let err = ProxyError::forward_timeout("a.test", "connect timed out");
        assert!(err.is_forward());
        assert!(err.is_timeout());
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_size_limit_status() {
        let header = ProxyError::RequestTooLarge {
            what: "header",
            limit: 8192,
        };
        let body = ProxyError::RequestTooLarge {
            what: "body",
            limit: 1024,
        };
        assert_eq!(
            header.status_code(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(body.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.to_string(), "Request too large: body exceeds 1024 bytes");
    }

    #[test]
    fn test_error_is_checks() {
        let hook_err = ProxyError::hook("audit", "panicked");
        let cert_err = ProxyError::cert_gen("entropy");

        assert!(hook_err.is_hook());
        assert!(!hook_err.is_forward());
        assert!(!cert_err.is_malformed());
        assert_eq!(
            cert_err.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(hook_err.to_string(), "Hook 'audit' failed: panicked");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: ProxyError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
