use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, ProxyConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户可读（o+r = 0o004）
    if mode & 0o004 != 0 {
        warn!(
            "⚠️  SECURITY WARNING: Config file '{}' is readable by others (permissions: {:o})\n\
             This file may contain upstream proxy credentials.\n\
             RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 去掉代理 URL 中的密码
fn redact_proxy(proxy: &str) -> String {
    match url::Url::parse(proxy) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => proxy.to_string(),
    }
}

/// 收集非致命的配置问题
fn collect_warnings(config: &ProxyConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if let (Some(cert), Some(key)) = (&config.cert_path, &config.key_path) {
        if !cert.exists() {
            warnings.push(format!("Certificate file not found: {:?}", cert));
        }
        if !key.exists() {
            warnings.push(format!("Key file not found: {:?}", key));
        }
    }
    if !config.use_proxy && !config.proxies.is_empty() {
        warnings.push(format!(
            "{} upstream proxies configured but use_proxy is false; requests go direct",
            config.proxies.len()
        ));
    }
    if config.user_agents.is_empty() {
        warnings.push(
            "user_agents is empty; the client's User-Agent is passed through".to_string(),
        );
    }
    if config.skip_verify {
        warnings.push("skip_verify is enabled; upstream certificates are not verified".to_string());
    }

    warnings
}

fn config_details(config: &ProxyConfig) -> serde_json::Value {
    let mut details = serde_json::json!({
        "listen": config.listen_addr(),
        "use_proxy": config.use_proxy,
        "proxies": config.proxies.iter().map(|p| redact_proxy(p)).collect::<Vec<_>>(),
        "user_agents_count": config.user_agents.len(),
        "collect_cookie": config.collect_cookie,
        "rotation": config.rotation,
        "selection": config.selection,
        "pool_size": config.pool_size,
        "evict_after_failures": config.evict_after_failures,
        "upstream_scheme": config.upstream_scheme,
        "max_connections": config.max_connections,
        "rate_limit": config.rate_limit,
    });

    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            details["cert_path"] = serde_json::json!(cert);
            details["key_path"] = serde_json::json!(key);
        }
        _ => {
            details["cert_mode"] = serde_json::json!("auto-generate");
            details["certificate_names"] = serde_json::json!(config.certificate_names());
        }
    }

    details
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let config = match AppConfig::load_proxy_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure the [proxy] section has bind_addr and bind_port");
                println!("  3. Set both cert_path and key_path, or omit both to auto-generate");
                println!("  4. Upstream proxies must be http://, https://, socks5:// or socks5h:// URLs");
                println!("  5. use_proxy = true requires a non-empty proxies list");
            }
            return Err(e);
        }
    };

    let warnings = collect_warnings(&config);

    if format == "json" {
        let result = CheckResult {
            valid: true,
            warnings,
            error: None,
            details: config_details(&config),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("✓ Listen address: {}", config.listen_addr());
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            println!("✓ Certificate path: {:?}", cert);
            println!("✓ Key path: {:?}", key);
        }
        _ => println!(
            "✓ Certificate/Key: will be auto-generated at runtime ({})",
            config.certificate_names().join(", ")
        ),
    }
    println!(
        "✓ Upstream proxies: {} ({})",
        config.proxies.len(),
        if config.use_proxy { "enabled" } else { "disabled" }
    );
    for (idx, proxy) in config.proxies.iter().enumerate() {
        println!("  Proxy #{}: {}", idx + 1, redact_proxy(proxy));
    }
    println!("✓ User agents: {}", config.user_agents.len());
    println!(
        "✓ Identity pool: {} per domain, evict after {} failures",
        config.pool_size, config.evict_after_failures
    );
    println!("✓ Cookie collection: {}", config.collect_cookie);
    if let Some(ref rate_limit) = config.rate_limit {
        println!(
            "✓ Rate limit: {} req/s per domain (burst {})",
            rate_limit.requests_per_second, rate_limit.burst_size
        );
    }
    for warning in &warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Proxy configuration is valid!");

    Ok(())
}
