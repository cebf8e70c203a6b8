/// TLS 证书模块
///
/// 启动时生成（或从文件加载）一次自签名证书，之后只读，
/// 通过 `Arc<rustls::ServerConfig>` 共享给所有连接
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// RSA 密钥长度
pub const RSA_KEY_BITS: usize = 2048;

/// 证书有效期（10 年）
pub const CERT_VALIDITY_DAYS: i64 = 3650;

/// 证书主体中的组织名
pub const ORGANIZATION: &str = "https-proxy";

/// 自签名证书与私钥
#[derive(Clone)]
pub struct Certificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
    /// 从文件加载时未知
    pub not_before: Option<OffsetDateTime>,
    pub not_after: Option<OffsetDateTime>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_der_len", &self.cert_der.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl Certificate {
    /// 从 PEM 文件加载证书与私钥
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            ProxyError::config_error(format!("Failed to read cert file {:?}: {}", cert_path, e))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            ProxyError::config_error(format!("Failed to read key file {:?}: {}", key_path, e))
        })?;
        Self::from_pem(cert_pem, key_pem)
    }

    /// 从 PEM 字符串构造（校验证书与私钥可解析）
    pub fn from_pem(cert_pem: String, key_pem: String) -> Result<Self> {
        let certs = parse_certs(&cert_pem)?;
        let cert_der = certs
            .first()
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| ProxyError::config_error("No certificate found in PEM"))?;
        parse_key(&key_pem)?;

        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
            not_before: None,
            not_after: None,
        })
    }

    /// 构建入站 TLS 配置（ALPN 固定为 http/1.1）
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let certs = parse_certs(&self.cert_pem)?;
        let key = parse_key(&self.key_pem)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::config_error(format!("TLS protocol setup failed: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::config_error(format!("Invalid certificate/key: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// 写出 PEM 文件（私钥文件权限为 0600）
    pub fn write_pem_files(&self, cert_out: &Path, key_out: &Path) -> Result<()> {
        std::fs::write(cert_out, &self.cert_pem)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(key_out)?;
        file.write_all(self.key_pem.as_bytes())?;
        Ok(())
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::config_error(format!("Failed to parse certificates: {}", e)))
}

fn parse_key(pem: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ProxyError::config_error(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| ProxyError::config_error("No private key found"))
}

/// 自签名证书生成器
#[derive(Debug, Clone)]
pub struct CertificateProvider {
    common_name: String,
    alt_names: Vec<String>,
}

impl CertificateProvider {
    /// `alt_names` 为空时仅使用 Common Name 作为 SAN
    pub fn new(common_name: impl Into<String>, alt_names: Vec<String>) -> Self {
        let common_name = common_name.into();
        let mut alt_names = alt_names;
        if !alt_names.iter().any(|n| n == &common_name) {
            alt_names.push(common_name.clone());
        }
        Self {
            common_name,
            alt_names,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.common_name.clone(), config.certificate_names())
    }

    pub fn subject_alt_names(&self) -> &[String] {
        &self.alt_names
    }

    /// 生成 RSA-2048 自签名证书
    pub fn generate(&self) -> Result<Certificate> {
        debug!(
            "Generating {}-bit RSA key for CN={}",
            RSA_KEY_BITS, self.common_name
        );
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .map_err(|e| ProxyError::cert_gen(format!("RSA key generation failed: {}", e)))?;
        let key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProxyError::cert_gen(format!("Private key encoding failed: {}", e)))?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::cert_gen(format!("Private key import failed: {}", e)))?;

        let mut params = CertificateParams::new(self.alt_names.clone())
            .map_err(|e| ProxyError::cert_gen(format!("Invalid subject alt name: {}", e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // 128 位随机序列号，最高位清零保证 DER INTEGER 为正数
        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let now = OffsetDateTime::now_utc();
        let not_after = now + Duration::days(CERT_VALIDITY_DAYS);
        params.not_before = now;
        params.not_after = not_after;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::cert_gen(format!("Certificate signing failed: {}", e)))?;

        Ok(Certificate {
            cert_pem: cert.pem(),
            key_pem: key_pem.as_str().to_string(),
            cert_der: cert.der().to_vec(),
            not_before: Some(now),
            not_after: Some(not_after),
        })
    }
}

/// 加载配置中的证书，未配置时生成自签名证书
pub fn load_or_generate(config: &ProxyConfig) -> Result<Certificate> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            let certificate = Certificate::from_pem_files(cert, key)?;
            info!("Loaded TLS certificate from {:?}", cert);
            Ok(certificate)
        }
        (None, None) => {
            let provider = CertificateProvider::from_config(config);
            let certificate = provider.generate()?;
            info!(
                "Generated self-signed certificate for {:?} (valid until {})",
                provider.subject_alt_names(),
                certificate
                    .not_after
                    .map(|t| t.date().to_string())
                    .unwrap_or_default()
            );
            Ok(certificate)
        }
        _ => Err(ProxyError::config_error(
            "cert_path and key_path must both be set, or both omitted to auto-generate",
        )),
    }
}
