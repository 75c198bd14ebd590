//! Automation job helpers shared by the init and disk-check stages

use crate::clients::{AutomationApi, CreateJobRequest, InventoryApi, JobHandle};
use shared::{AppError, AppResult, ErrorCode};
use std::time::Duration;
use tokio::time::Instant;

/// Host id and current business of a device, looked up by IP
pub(crate) async fn resolve_host_biz(inventory: &dyn InventoryApi, ip: &str) -> AppResult<(u64, i64)> {
    let host_id = inventory.host_id_by_ip(ip).await?;
    let biz_ids = inventory.biz_ids_by_host(host_id).await?;
    let biz_id = biz_ids.first().copied().ok_or_else(|| {
        AppError::with_message(ErrorCode::HostNotFound, format!("host {host_id} has no business"))
            .with_detail("ip", ip)
    })?;
    Ok((host_id, biz_id))
}

/// Create a job, up to `attempts` tries with a fixed pause in between
pub(crate) async fn create_job_with_retry(
    api: &dyn AutomationApi,
    request: &CreateJobRequest,
    attempts: u32,
    interval: Duration,
) -> AppResult<JobHandle> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match api.create_job(request).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                tracing::warn!(
                    ip = %request.ip,
                    template = ?request.template,
                    attempt,
                    attempts,
                    error = %e,
                    "Failed to create job"
                );
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::remote("job creation failed")))
}

/// Poll a job until it reaches a final state or `timeout` elapses
///
/// Status lookup errors are logged and polling continues. A timeout too large
/// to represent as a deadline means no deadline.
pub(crate) async fn wait_for_job(
    api: &dyn AutomationApi,
    job_id: &str,
    biz_id: i64,
    poll_interval: Duration,
    timeout: Duration,
) -> AppResult<()> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match api.job_status(job_id, biz_id).await {
            Ok(state) if state.is_success() => return Ok(()),
            Ok(state) if state.is_final() => {
                return Err(AppError::with_message(
                    ErrorCode::JobFailed,
                    format!("job {job_id} ended in {state:?}"),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to query job status");
            }
        }

        let next_poll = Instant::now().checked_add(poll_interval);
        if let Some(deadline) = deadline
            && next_poll.is_none_or(|next| next > deadline)
        {
            return Err(AppError::with_message(
                ErrorCode::JobTimeout,
                format!("job {job_id} did not finish within {}s", timeout.as_secs()),
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
