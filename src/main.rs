//! Hive - Rust 智能体编排核心
//!
//! 入口：初始化日志、加载配置、构建 Supervisor，在 stdin/stdout 上服务宿主命令直到关闭。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::ShutdownManager;
use hive::{host, observability, SupervisorBuilder};

/// 关闭时等待运行结束的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let supervisor = SupervisorBuilder::new(config)
        .build()
        .await
        .context("Failed to build supervisor")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    host::serve(stdin, tokio::io::stdout(), supervisor, shutdown, DRAIN_TIMEOUT)
        .await
        .context("Host channel failed")?;

    tracing::info!("hive exited");
    Ok(())
}
