use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use ingest_core::AppConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::Application;
use shutdown::{wait_for_shutdown_signal, ShutdownManager};

fn cli() -> Command {
    Command::new("ingest-watchdog")
        .version(env!("CARGO_PKG_VERSION"))
        .about("批量文件入库流水线处理监督器")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认路径查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，缺省时使用配置文件中的设置")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(Command::new("run").about("持续运行监督器直到收到关闭信号（默认）"))
        .subcommand(Command::new("check").about("执行一次完整健康检查并输出告警"))
        .subcommand(Command::new("status").about("输出上传队列状态"))
        .subcommand(Command::new("ping").about("探测数据库往返耗时"))
        .subcommand(Command::new("pause").about("暂停自动恢复，由运维人员手动接管"))
        .subcommand(Command::new("resume").about("恢复自动处理"))
        .subcommand(
            Command::new("rebuild-cache")
                .about("请求重建缓存分区")
                .arg(
                    Arg::new("partition")
                        .short('p')
                        .long("partition")
                        .value_name("YEAR")
                        .help("分区键（四位年份）")
                        .required(true),
                )
                .arg(
                    Arg::new("requested-by")
                        .long("requested-by")
                        .value_name("NAME")
                        .help("请求人")
                        .default_value("cli"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.observability.log_level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    let app = Application::new(config).await?;

    match matches.subcommand() {
        None | Some(("run", _)) => run(app).await,
        Some(("check", _)) => {
            let alerts = app.check().await;
            print_json(&alerts)?;
            app.close().await;
            Ok(())
        }
        Some(("status", _)) => {
            print_json(&app.status().await)?;
            app.close().await;
            Ok(())
        }
        Some(("ping", _)) => {
            let elapsed = app.ping().await?;
            println!("数据库连接正常，耗时 {} ms", elapsed.as_millis());
            app.close().await;
            Ok(())
        }
        Some(("pause", _)) => {
            app.set_paused(true).await?;
            app.close().await;
            Ok(())
        }
        Some(("resume", _)) => {
            app.set_paused(false).await?;
            app.close().await;
            Ok(())
        }
        Some(("rebuild-cache", sub)) => rebuild_cache(app, sub).await,
        Some((other, _)) => Err(anyhow::anyhow!("不支持的子命令: {other}")),
    }
}

async fn run(app: Application) -> Result<()> {
    info!("启动处理监督器");

    let shutdown_manager = ShutdownManager::new();
    let app = Arc::new(app);
    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("监督器运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("监督器已优雅关闭"),
        Ok(Err(e)) => error!("监督器关闭时发生错误: {e}"),
        Err(_) => warn!("监督器关闭超时，强制退出"),
    }

    Ok(())
}

async fn rebuild_cache(app: Application, matches: &ArgMatches) -> Result<()> {
    let partition = matches
        .get_one::<String>("partition")
        .context("缺少分区键")?;
    let requested_by = matches
        .get_one::<String>("requested-by")
        .map(String::as_str)
        .unwrap_or("cli");

    let (result, job) = app.rebuild_cache(partition, requested_by).await?;
    print_json(&result)?;
    if let Some(job) = job {
        print_json(&job)?;
    }
    app.close().await;

    if result.success {
        Ok(())
    } else {
        Err(anyhow::anyhow!(result.message))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("序列化输出失败")?;
    println!("{text}");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_rebuild_cache_arguments() {
        let matches = cli()
            .try_get_matches_from(["ingest-watchdog", "rebuild-cache", "-p", "2024"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "rebuild-cache");
        assert_eq!(sub.get_one::<String>("partition").unwrap(), "2024");
        assert_eq!(sub.get_one::<String>("requested-by").unwrap(), "cli");

        assert!(cli()
            .try_get_matches_from(["ingest-watchdog", "rebuild-cache"])
            .is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let matches = cli()
            .try_get_matches_from(["ingest-watchdog", "check", "--log-format", "json"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("log-format").unwrap(), "json");
    }
}
