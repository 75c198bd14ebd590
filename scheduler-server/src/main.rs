use anyhow::Context;
use scheduler_server::{BackgroundTasks, Config, SchedulerState, init_logger_with_file};
use std::time::Duration;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 设置环境 (dotenv, 日志)
    let _ = dotenv::dotenv();
    let config = Config::from_env();
    init_logger_with_file(Some(&config.log_level), None, config.log_dir.as_deref());

    tracing::info!(work_dir = %config.work_dir, workers = config.match_workers, "Scheduler starting...");

    // 2. 初始化状态
    let state = SchedulerState::initialize(&config).context("failed to initialize scheduler state")?;

    // 3. 启动后台任务 (informer 列举失败视为致命错误)
    let mut tasks = BackgroundTasks::new();
    if let Err(e) = state.start_background_tasks(&mut tasks).await {
        tasks.shutdown().await;
        return Err(anyhow::Error::new(e).context("failed to start background tasks"));
    }

    // 4. 等待 Ctrl-C 或任务异常退出
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    health.tick().await;
    let failed = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down");
                break 0;
            }
            _ = health.tick() => {
                let failed = tasks.check_health();
                if failed > 0 {
                    break failed;
                }
            }
        }
    };

    tasks.shutdown().await;
    if failed > 0 {
        anyhow::bail!("{failed} background task(s) stopped unexpectedly");
    }
    tracing::info!("Scheduler stopped");
    Ok(())
}
