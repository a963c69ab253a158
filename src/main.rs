use anyhow::{Context, Result};
use clap::Parser;
use download_engine::{
    config::AppConfig,
    downloader::{
        AddOptions, Download, DownloadManager, HoldReason, HttpSource, ManagerConfig, Priority,
        SegmentSource, SourceDescriptor, SourceRouter, TaskStatus,
    },
    events::{DownloadEvent, EventBus, DEFAULT_EVENT_CAPACITY},
    logging,
    persistence::{DownloadDb, RecordStore},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "download-engine", version, about = "多任务分段下载引擎")]
struct Cli {
    /// 要下载的 URL（可多个）
    urls: Vec<String>,

    /// 配置文件路径
    #[arg(short = 'c', long = "config", default_value = "config/app.toml")]
    config: String,

    /// 下载目录（覆盖配置文件）
    #[arg(short = 'd', long = "dir")]
    download_dir: Option<PathBuf>,

    /// 新任务的优先级: low / normal / high
    #[arg(short = 'p', long = "priority", default_value = "normal", value_parser = parse_priority)]
    priority: Priority,

    /// 最大同时下载数（覆盖配置文件）
    #[arg(short = 'j', long = "jobs")]
    max_concurrent: Option<usize>,

    /// 全局下载限速 (KB/s，0 表示不限)
    #[arg(long = "limit")]
    limit_kbps: Option<u64>,

    /// 列出已保存的任务后退出
    #[arg(long = "list")]
    list: bool,

    /// 以 JSON 输出事件
    #[arg(long = "json")]
    json: bool,
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    Priority::parse(value).ok_or_else(|| format!("未知优先级: {}", value))
}

/// 所有任务都不会再有进展（自动重试另行判断）
fn settled(downloads: &[Download]) -> bool {
    downloads.iter().all(|d| match d.status {
        TaskStatus::Queued => d.hold.is_some(),
        TaskStatus::Downloading | TaskStatus::Checking | TaskStatus::Seeding => false,
        _ => true,
    })
}

fn print_event(event: &DownloadEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }
    match event {
        DownloadEvent::Created { task_id, save_path, .. } => {
            println!("[{}] 已添加 -> {}", short_id(task_id), save_path)
        }
        DownloadEvent::Progress {
            task_id,
            progress,
            download_speed,
            eta_secs,
            ..
        } => println!(
            "[{}] {:>6.2}%  {:>8.1} KB/s  剩余 {}",
            short_id(task_id),
            progress,
            *download_speed as f64 / 1024.0,
            eta_secs.map_or_else(|| "-".to_string(), |s| format!("{}s", s))
        ),
        DownloadEvent::StatusChanged {
            task_id,
            old_status,
            new_status,
            error,
        } => match error {
            Some(error) => println!("[{}] {} -> {}: {}", short_id(task_id), old_status, new_status, error),
            None => println!("[{}] {} -> {}", short_id(task_id), old_status, new_status),
        },
        DownloadEvent::ScheduledAction { task_id, action } => {
            println!("[{}] 计划窗口: {}", short_id(task_id), action.as_str())
        }
        DownloadEvent::Removed { task_id } => println!("[{}] 已删除", short_id(task_id)),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    if let Some(dir) = cli.download_dir {
        config.download.download_dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()
                .context("无法获取当前目录")?
                .join(dir)
        };
    }
    if let Some(max) = cli.max_concurrent {
        config.download.max_concurrent_downloads = max;
    }
    if let Some(limit) = cli.limit_kbps {
        config.download.max_download_speed = limit * 1024;
    }
    config.validate()?;

    let _log_guard = logging::init_logging(&config.log);
    config.download.ensure_download_dir_exists()?;

    if let Some(parent) = config.persistence.db_path.parent() {
        std::fs::create_dir_all(parent).context("无法创建数据库目录")?;
    }
    let db = DownloadDb::new(&config.persistence.db_path)?;
    let store = Arc::new(RecordStore::new(db));
    store.recover()?;

    if cli.list {
        for download in store.snapshots().await {
            println!(
                "{}  {:<11}  {:>6.2}%  {}",
                download.id,
                download.status.as_str(),
                download.progress(),
                download.save_path.display()
            );
        }
        return Ok(());
    }

    if !config.persistence.auto_recover_tasks {
        // 恢复出的任务等待手动开始
        for (_, handle) in store.handles() {
            let mut download = handle.lock().await;
            if download.status == TaskStatus::Queued && download.hold.is_none() {
                download.hold = Some(HoldReason::Manual);
                store.save(&download)?;
            }
        }
    }

    let http: Arc<dyn SegmentSource> = Arc::new(HttpSource::new(Duration::from_secs(
        config.download.request_timeout_secs,
    ))?);
    let fetcher: Arc<dyn SegmentSource> = Arc::new(SourceRouter::new(http));
    let manager = DownloadManager::new(
        ManagerConfig::from(&config),
        store,
        fetcher,
        EventBus::new(DEFAULT_EVENT_CAPACITY),
    );

    let mut events = manager.subscribe();
    manager.start();

    for url in cli.urls {
        let options = AddOptions {
            priority: cli.priority,
            ..Default::default()
        };
        let id = manager.add(SourceDescriptor::url(url.clone()), options).await?;
        info!("已添加任务: id={}, url={}", id, url);
    }

    let mut check = tokio::time::interval(Duration::from_secs(1));
    // 首次检查推迟一个周期，让恢复出的自动重试先完成安排
    check.reset();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event, cli.json),
                Err(RecvError::Lagged(n)) => warn!("事件消费过慢，丢弃了 {} 条事件", n),
                Err(RecvError::Closed) => break,
            },
            _ = check.tick() => {
                if !manager.has_pending_retries() && settled(&manager.list().await) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到中断信号，正在退出");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
