//! bleconn CLI
//!
//! - `demo`: 进程内回环演示，一个服务端和若干客户端
//! - `scan` / `serve` / `probe`: 经 BlueZ 操作真实适配器（需要 `bluez` feature）
//! - `config`: 查看和修改配置文件

mod demo;
#[cfg(feature = "bluez")]
mod platform;

use anyhow::Result;
use bleconn_core::{LogLevel, Settings};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bleconn", version, about = "BLE GATT 连接工具")]
struct Cli {
    /// 日志级别，覆盖配置文件中的设置
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 回环演示：服务端每秒推送时钟，客户端订阅并打印
    Demo {
        /// 运行时长 (秒)
        #[arg(short, long, default_value = "5")]
        seconds: u64,
        /// 客户端数量
        #[arg(short, long, default_value = "2")]
        clients: u8,
    },
    /// 扫描附近设备
    #[cfg(feature = "bluez")]
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// 只报告广播该服务 UUID 的设备
        #[arg(long)]
        service: Option<uuid::Uuid>,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 广播并提供演示 GATT 服务，直到 Ctrl-C
    #[cfg(feature = "bluez")]
    Serve,
    /// 连接设备，列出服务并读取指定特征
    #[cfg(feature = "bluez")]
    Probe {
        /// 设备地址
        address: String,
        /// 要读取的特征 UUID
        #[arg(short, long)]
        read: Vec<uuid::Uuid>,
    },
    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前配置
    Show,
    /// 打印配置文件路径
    Path,
    /// 设置广播使用的设备名称
    SetName { name: String },
    /// 设置默认日志级别
    SetLogLevel { level: LogLevel },
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（bleconn-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load();
    init_logging(cli.log_level.unwrap_or(settings.log_level));

    match cli.command {
        Commands::Demo { seconds, clients } => {
            demo::run(&settings, seconds, clients).await?;
        }
        #[cfg(feature = "bluez")]
        Commands::Scan {
            timeout,
            service,
            json,
        } => {
            platform::scan(&settings, timeout, service, json).await?;
        }
        #[cfg(feature = "bluez")]
        Commands::Serve => {
            platform::serve(&settings).await?;
        }
        #[cfg(feature = "bluez")]
        Commands::Probe { address, read } => {
            platform::probe(&settings, &address, &read).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{settings:#?}");
            }
            ConfigAction::Path => {
                println!("{}", Settings::config_path().display());
            }
            ConfigAction::SetName { name } => {
                settings.device_name = name;
                settings.save()?;
                println!("device_name = {}", settings.device_name);
            }
            ConfigAction::SetLogLevel { level } => {
                settings.log_level = level;
                settings.save()?;
                println!("log_level = {}", settings.log_level);
            }
        },
    }

    Ok(())
}
