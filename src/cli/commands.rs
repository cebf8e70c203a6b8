use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::hooks::HookPipeline;
use crate::server;

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// Run the HTTPS proxy
async fn run_proxy(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading proxy configuration from: {}", config_path);
    let proxy_config = AppConfig::load_proxy_config(&config_path)?;

    // 命令行运行时没有嵌入方提供的钩子
    server::run_server(proxy_config, HookPipeline::empty()).await
}
