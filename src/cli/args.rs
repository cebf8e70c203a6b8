use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "https-proxy")]
#[command(author, version, about = "TLS-terminating HTTP proxy with per-domain identity rotation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v: info, -vv: debug, -vvv: trace；设置 RUST_LOG 时以其为准）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理服务器
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置文件
    Template {
        /// 输出文件路径（省略时打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书与私钥
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem", value_name = "PATH")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem", value_name = "PATH")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
