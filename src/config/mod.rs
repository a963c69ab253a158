// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 计划窗口配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录（绝对路径）
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 最大同时下载数
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// 全局下载限速 (bytes/s，0 表示不限)
    #[serde(default)]
    pub max_download_speed: u64,
    /// 全局上传限速 (bytes/s，0 表示不限)
    #[serde(default)]
    pub max_upload_speed: u64,
    /// 普通下载的分片数
    #[serde(default = "default_segments")]
    pub default_segments: usize,
    /// 单个任务的最大分片线程数
    #[serde(default = "default_max_workers_per_download")]
    pub max_workers_per_download: usize,
    /// 单个分片的最大尝试次数
    #[serde(default = "default_max_segment_attempts")]
    pub max_segment_attempts: u32,
    /// 任务级最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 添加后是否自动开始
    #[serde(default = "default_auto_start_downloads")]
    pub auto_start_downloads: bool,
    /// 重试退避基数（毫秒）
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// 重试退避上限（毫秒）
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// 带宽重算间隔（毫秒）
    #[serde(default = "default_bandwidth_tick_ms")]
    pub bandwidth_tick_ms: u64,
    /// 准入检查间隔（毫秒）
    #[serde(default = "default_admission_interval_ms")]
    pub admission_interval_ms: u64,
    /// HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_download_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("downloads")
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_segments() -> usize {
    4
}

fn default_max_workers_per_download() -> usize {
    4
}

fn default_max_segment_attempts() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_auto_start_downloads() -> bool {
    true
}

fn default_retry_backoff_base_ms() -> u64 {
    2_000
}

fn default_retry_backoff_max_ms() -> u64 {
    300_000
}

fn default_bandwidth_tick_ms() -> u64 {
    100
}

fn default_admission_interval_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_download_speed: 0,
            max_upload_speed: 0,
            default_segments: default_segments(),
            max_workers_per_download: default_max_workers_per_download(),
            max_segment_attempts: default_max_segment_attempts(),
            max_retries: default_max_retries(),
            auto_start_downloads: default_auto_start_downloads(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            bandwidth_tick_ms: default_bandwidth_tick_ms(),
            admission_interval_ms: default_admission_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    /// 验证下载路径是否为绝对路径
    pub fn validate_download_dir(&self) -> Result<()> {
        if !self.download_dir.is_absolute() {
            anyhow::bail!(
                "下载目录必须是绝对路径，当前值: {:?}\n\
                 Windows 示例: D:\\Downloads\n\
                 Linux 示例: /home/user/downloads",
                self.download_dir
            );
        }

        tracing::debug!("✓ 路径格式验证通过（绝对路径）: {:?}", self.download_dir);
        Ok(())
    }

    /// 确保下载目录存在（不存在则自动创建）
    pub fn ensure_download_dir_exists(&self) -> Result<()> {
        self.validate_download_dir()?;
        std::fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("无法创建下载目录: {:?}", self.download_dir))?;

        tracing::info!("下载目录已准备就绪: {:?}", self.download_dir);
        Ok(())
    }

    /// 校验数值参数
    pub fn validate(&self) -> Result<()> {
        self.validate_download_dir()?;
        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads 至少为 1");
        }
        if self.default_segments == 0 || self.max_workers_per_download == 0 {
            anyhow::bail!("default_segments 和 max_workers_per_download 至少为 1");
        }
        if self.max_segment_attempts == 0 {
            anyhow::bail!("max_segment_attempts 至少为 1");
        }
        if self.bandwidth_tick_ms == 0 || self.admission_interval_ms == 0 {
            anyhow::bail!("bandwidth_tick_ms 和 admission_interval_ms 必须大于 0");
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            anyhow::bail!(
                "retry_backoff_base_ms ({}) 不能大于 retry_backoff_max_ms ({})",
                self.retry_backoff_base_ms,
                self.retry_backoff_max_ms
            );
        }
        Ok(())
    }
}

/// 计划窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 是否启用计划窗口循环
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// 检查间隔（秒）
    #[serde(default = "default_scheduler_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_tick_interval_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_scheduler_tick_interval_secs(),
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// 启动时是否自动恢复任务
    #[serde(default = "default_auto_recover_tasks")]
    pub auto_recover_tasks: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data").join("downloads.db")
}

fn default_auto_recover_tasks() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            auto_recover_tasks: default_auto_recover_tasks(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.download.validate()?;
        if self.scheduler.enabled && self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("scheduler.tick_interval_secs 必须大于 0");
        }
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
