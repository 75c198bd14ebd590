use crate::informer::WatchOptions;
use crate::matcher::MatcherOptions;
use std::path::PathBuf;
use std::time::Duration;

/// 调度器配置 - 启动时一次性读取
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | /var/lib/scheduler | 工作目录 (数据库、日志) |
/// | LOG_LEVEL | info | 日志级别 |
/// | LOG_DIR | - | 日志目录，设置后按天滚动写文件 |
/// | MATCH_WORKERS | 20 | 匹配工作者数量 |
/// | INIT_CONCURRENCY | 10 | 同时创建的初始化任务数 |
/// | INIT_JOB_RETRIES | 3 | 初始化任务创建尝试次数 |
/// | INIT_JOB_RETRY_SECS | 1 | 初始化任务创建重试间隔(秒) |
/// | JOB_POLL_INTERVAL_SECS | 10 | 任务状态轮询间隔(秒) |
/// | JOB_POLL_TIMEOUT_SECS | 7200 | 任务超时(秒) |
/// | DISK_CHECK_ENABLED | true | 是否启用磁盘检查 |
/// | DISK_CHECK_RETRIES | 3 | 磁盘检查尝试次数 |
/// | DISK_CHECK_RETRY_SECS | 180 | 磁盘检查重试间隔(秒) |
/// | WATCH_RETRIES | 4 | 变更订阅重试次数 |
/// | WATCH_RETRY_MS | 500 | 变更订阅重试间隔(毫秒) |
/// | LOCK_TTL_SECS | 30 | 锁过期时间(秒) |
/// | JOURNAL_COMPACT_SECS | 300 | 变更日志清理间隔(秒) |
/// | AUTOMATION_API_URL | http://localhost:8001 | 自动化任务服务地址 |
/// | INVENTORY_API_URL | http://localhost:8002 | 资产库存服务地址 |
/// | NOTIFY_API_URL | http://localhost:8003 | 通知服务地址 |
/// | HTTP_TIMEOUT_SECS | 30 | 外部接口请求超时(秒) |
///
/// # 示例
///
/// ```ignore
/// WORK_DIR=/data/scheduler MATCH_WORKERS=8 cargo run
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录，存放数据库文件
    pub work_dir: String,
    pub log_level: String,
    /// 日志目录，未设置时只输出到控制台
    pub log_dir: Option<String>,

    // === 匹配流水线 ===
    pub match_workers: usize,
    pub init_concurrency: usize,
    pub init_job_retries: u32,
    pub init_job_retry_secs: u64,
    pub job_poll_interval_secs: u64,
    pub job_poll_timeout_secs: u64,
    pub disk_check_enabled: bool,
    pub disk_check_retries: u32,
    pub disk_check_retry_secs: u64,

    // === 变更订阅 ===
    pub watch_retries: u32,
    pub watch_retry_ms: u64,

    /// 订单锁过期时间 (秒)
    pub lock_ttl_secs: u64,
    /// 变更日志清理间隔 (秒)
    pub journal_compact_secs: u64,

    // === 外部服务 ===
    pub automation_api_url: String,
    pub inventory_api_url: String,
    pub notify_api_url: String,
    pub http_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置或无法解析，使用默认值
    pub fn from_env() -> Self {
        Self {
            work_dir: std::env::var("WORK_DIR").unwrap_or_else(|_| "/var/lib/scheduler".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_dir: std::env::var("LOG_DIR").ok().filter(|d| !d.is_empty()),

            match_workers: env_or("MATCH_WORKERS", 20),
            init_concurrency: env_or("INIT_CONCURRENCY", 10),
            init_job_retries: env_or("INIT_JOB_RETRIES", 3),
            init_job_retry_secs: env_or("INIT_JOB_RETRY_SECS", 1),
            job_poll_interval_secs: env_or("JOB_POLL_INTERVAL_SECS", 10),
            job_poll_timeout_secs: env_or("JOB_POLL_TIMEOUT_SECS", 7200),
            disk_check_enabled: env_or("DISK_CHECK_ENABLED", true),
            disk_check_retries: env_or("DISK_CHECK_RETRIES", 3),
            disk_check_retry_secs: env_or("DISK_CHECK_RETRY_SECS", 180),

            watch_retries: env_or("WATCH_RETRIES", 4),
            watch_retry_ms: env_or("WATCH_RETRY_MS", 500),

            lock_ttl_secs: env_or("LOCK_TTL_SECS", 30),
            journal_compact_secs: env_or("JOURNAL_COMPACT_SECS", 300),

            automation_api_url: std::env::var("AUTOMATION_API_URL")
                .unwrap_or_else(|_| "http://localhost:8001".into()),
            inventory_api_url: std::env::var("INVENTORY_API_URL")
                .unwrap_or_else(|_| "http://localhost:8002".into()),
            notify_api_url: std::env::var("NOTIFY_API_URL")
                .unwrap_or_else(|_| "http://localhost:8003".into()),
            http_timeout_secs: env_or("HTTP_TIMEOUT_SECS", 30),
        }
    }

    /// 使用自定义值覆盖部分配置
    ///
    /// 常用于测试场景
    pub fn with_overrides(work_dir: impl Into<String>, match_workers: usize) -> Self {
        let mut config = Self::from_env();
        config.work_dir = work_dir.into();
        config.match_workers = match_workers;
        config
    }

    /// 数据库文件路径
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("scheduler.redb")
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// 变更日志清理间隔，最少 1 秒
    pub fn journal_compact_interval(&self) -> Duration {
        Duration::from_secs(self.journal_compact_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// 匹配流水线参数
    pub fn matcher_options(&self) -> MatcherOptions {
        MatcherOptions {
            workers: self.match_workers.max(1),
            init_concurrency: self.init_concurrency.max(1),
            init_job_retries: self.init_job_retries,
            init_job_retry_interval: Duration::from_secs(self.init_job_retry_secs),
            job_poll_interval: Duration::from_secs(self.job_poll_interval_secs),
            job_poll_timeout: Duration::from_secs(self.job_poll_timeout_secs),
            disk_check_enabled: self.disk_check_enabled,
            disk_check_retries: self.disk_check_retries,
            disk_check_retry_interval: Duration::from_secs(self.disk_check_retry_secs),
        }
    }

    /// 变更订阅重试参数
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            retries: self.watch_retries,
            retry_interval: Duration::from_millis(self.watch_retry_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
