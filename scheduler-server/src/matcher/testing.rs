//! In-memory collaborators for tests and dry runs
//!
//! Scriptable fakes of the automation, inventory and notification APIs, and a
//! harness that wires them with an in-memory store.

use super::{Matcher, MatcherDeps, MatcherOptions};
use crate::clients::{
    AutomationApi, CreateJobRequest, InventoryApi, JobHandle, JobState, JobTemplate, NotifyApi,
    NotifyResult,
};
use crate::store::RedbStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{AppError, AppResult, ErrorCode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// ========== Automation ==========

#[derive(Default)]
struct AutomationState {
    next_job: u64,
    /// Remaining create failures per IP
    create_failures: HashMap<String, u32>,
    /// Remaining failed disk-check jobs per IP
    disk_failures: HashMap<String, u32>,
    /// Final state of init jobs per IP (default Finished)
    init_states: HashMap<String, JobState>,
    jobs: HashMap<String, JobState>,
    create_calls: HashMap<String, u32>,
    requests: Vec<CreateJobRequest>,
}

#[derive(Default)]
pub struct MockAutomation {
    state: Mutex<AutomationState>,
}

impl MockAutomation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` job creations for `ip`
    pub fn fail_creates(&self, ip: &str, times: u32) {
        self.state.lock().create_failures.insert(ip.to_string(), times);
    }

    /// Make the next `times` disk-check jobs for `ip` end in Failed
    pub fn fail_disk_checks(&self, ip: &str, times: u32) {
        self.state.lock().disk_failures.insert(ip.to_string(), times);
    }

    /// State every init job for `ip` reports
    pub fn set_final_state(&self, ip: &str, state: JobState) {
        self.state.lock().init_states.insert(ip.to_string(), state);
    }

    pub fn create_calls(&self, ip: &str) -> u32 {
        self.state.lock().create_calls.get(ip).copied().unwrap_or(0)
    }

    /// Successfully created jobs of one template
    pub fn jobs_created(&self, template: JobTemplate) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.template == template)
            .count()
    }
}

#[async_trait]
impl AutomationApi for MockAutomation {
    async fn create_job(&self, request: &CreateJobRequest) -> AppResult<JobHandle> {
        let mut state = self.state.lock();
        *state.create_calls.entry(request.ip.clone()).or_insert(0) += 1;

        if let Some(remaining) = state.create_failures.get_mut(&request.ip)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(AppError::remote(format!("create job for {} rejected", request.ip)));
        }

        let job_state = match request.template {
            JobTemplate::Init => state
                .init_states
                .get(&request.ip)
                .copied()
                .unwrap_or(JobState::Finished),
            JobTemplate::DiskCheck => match state.disk_failures.get_mut(&request.ip) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    JobState::Failed
                }
                _ => JobState::Finished,
            },
        };

        state.next_job += 1;
        let job_id = format!("job-{}", state.next_job);
        state.jobs.insert(job_id.clone(), job_state);
        state.requests.push(request.clone());
        Ok(JobHandle {
            job_url: format!("https://automation.local/jobs/{job_id}"),
            job_id,
        })
    }

    async fn job_status(&self, job_id: &str, _biz_id: i64) -> AppResult<JobState> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .copied()
            .ok_or_else(|| AppError::not_found(format!("job {job_id}")))
    }
}

// ========== Inventory ==========

#[derive(Debug, Clone)]
struct MockHost {
    host_id: u64,
    ip: String,
    asset_id: String,
    biz_id: i64,
    operator: String,
    bak_operator: String,
}

#[derive(Default)]
struct InventoryState {
    hosts: Vec<MockHost>,
    failing_transfers: HashSet<u64>,
    biz_names: HashMap<i64, String>,
    transfers: u32,
}

#[derive(Default)]
pub struct MockInventory {
    state: Mutex<InventoryState>,
}

impl MockInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, ip: &str, asset_id: &str, host_id: u64, biz_id: i64) {
        self.state.lock().hosts.push(MockHost {
            host_id,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
            biz_id,
            operator: String::new(),
            bak_operator: String::new(),
        });
    }

    /// Reject every transfer of the host at `ip`
    pub fn fail_transfers(&self, ip: &str) {
        let mut state = self.state.lock();
        if let Some(host_id) = state.hosts.iter().find(|h| h.ip == ip).map(|h| h.host_id) {
            state.failing_transfers.insert(host_id);
        }
    }

    pub fn set_biz_name(&self, biz_id: i64, name: &str) {
        self.state.lock().biz_names.insert(biz_id, name.to_string());
    }

    /// Current business of the host at `ip`
    pub fn host_biz(&self, ip: &str) -> Option<i64> {
        self.state.lock().hosts.iter().find(|h| h.ip == ip).map(|h| h.biz_id)
    }

    /// `(operator, bak_operator)` of the host at `ip`
    pub fn host_operator(&self, ip: &str) -> Option<(String, String)> {
        self.state
            .lock()
            .hosts
            .iter()
            .find(|h| h.ip == ip)
            .map(|h| (h.operator.clone(), h.bak_operator.clone()))
    }

    pub fn transfer_count(&self) -> u32 {
        self.state.lock().transfers
    }

    fn with_host<T>(&self, host_id: u64, f: impl FnOnce(&mut MockHost) -> T) -> AppResult<T> {
        let mut state = self.state.lock();
        state
            .hosts
            .iter_mut()
            .find(|h| h.host_id == host_id)
            .map(f)
            .ok_or_else(|| host_not_found(&host_id.to_string()))
    }
}

fn host_not_found(what: &str) -> AppError {
    AppError::with_message(ErrorCode::HostNotFound, format!("host {what} not found"))
}

#[async_trait]
impl InventoryApi for MockInventory {
    async fn host_id_by_ip(&self, ip: &str) -> AppResult<u64> {
        self.state
            .lock()
            .hosts
            .iter()
            .find(|h| h.ip == ip)
            .map(|h| h.host_id)
            .ok_or_else(|| host_not_found(ip))
    }

    async fn host_id_by_asset(&self, asset_id: &str) -> AppResult<u64> {
        self.state
            .lock()
            .hosts
            .iter()
            .find(|h| h.asset_id == asset_id)
            .map(|h| h.host_id)
            .ok_or_else(|| host_not_found(asset_id))
    }

    async fn biz_ids_by_host(&self, host_id: u64) -> AppResult<Vec<i64>> {
        self.with_host(host_id, |h| vec![h.biz_id])
    }

    async fn transfer_host(&self, host_id: u64, from_biz: i64, to_biz: i64) -> AppResult<()> {
        if self.state.lock().failing_transfers.contains(&host_id) {
            return Err(AppError::remote(format!("transfer of host {host_id} rejected")));
        }
        self.with_host(host_id, |h| {
            if h.biz_id != from_biz {
                return Err(AppError::remote(format!(
                    "host {host_id} is in biz {}, not {from_biz}",
                    h.biz_id
                )));
            }
            h.biz_id = to_biz;
            Ok(())
        })??;
        self.state.lock().transfers += 1;
        Ok(())
    }

    async fn update_host_operator(
        &self,
        host_id: u64,
        operator: &str,
        bak_operator: &str,
    ) -> AppResult<()> {
        self.with_host(host_id, |h| {
            h.operator = operator.to_string();
            h.bak_operator = bak_operator.to_string();
        })
    }

    async fn biz_name(&self, biz_id: i64) -> AppResult<String> {
        self.state
            .lock()
            .biz_names
            .get(&biz_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("biz {biz_id}")))
    }
}

// ========== Notification ==========

#[derive(Default)]
struct NotifyState {
    sent: Vec<(String, String)>,
    failing_users: HashSet<String>,
}

#[derive(Default)]
pub struct MockNotify {
    state: Mutex<NotifyState>,
}

impl MockNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `user` fail
    pub fn fail_for(&self, user: &str) {
        self.state.lock().failing_users.insert(user.to_string());
    }

    pub fn recover(&self, user: &str) {
        self.state.lock().failing_users.remove(user);
    }

    /// `(user, content)` of every delivered message
    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl NotifyApi for MockNotify {
    async fn send(&self, user: &str, content: &str) -> AppResult<NotifyResult> {
        let mut state = self.state.lock();
        if state.failing_users.contains(user) {
            return Err(AppError::with_message(
                ErrorCode::NotifyFailed,
                format!("send to {user} failed"),
            ));
        }
        state.sent.push((user.to_string(), content.to_string()));
        Ok(NotifyResult {
            code: 0,
            message: "ok".to_string(),
        })
    }
}

// ========== Harness ==========

/// Options with millisecond waits so pipeline tests run fast
pub fn fast_options() -> MatcherOptions {
    MatcherOptions {
        workers: 2,
        init_concurrency: 10,
        init_job_retries: 3,
        init_job_retry_interval: Duration::from_millis(1),
        job_poll_interval: Duration::from_millis(1),
        job_poll_timeout: Duration::from_millis(200),
        disk_check_enabled: true,
        disk_check_retries: 3,
        disk_check_retry_interval: Duration::from_millis(1),
    }
}

/// In-memory store plus mocks, wired into a matcher
pub struct Harness {
    pub store: Arc<RedbStore>,
    pub automation: Arc<MockAutomation>,
    pub inventory: Arc<MockInventory>,
    pub notify: Arc<MockNotify>,
    pub matcher: Arc<Matcher>,
}

impl Harness {
    pub fn new(options: MatcherOptions) -> AppResult<Self> {
        let store = Arc::new(RedbStore::open_in_memory()?);
        let automation = Arc::new(MockAutomation::new());
        let inventory = Arc::new(MockInventory::new());
        let notify = Arc::new(MockNotify::new());
        let deps = MatcherDeps {
            store: store.clone(),
            automation: automation.clone(),
            inventory: inventory.clone(),
            notify: notify.clone(),
        };
        Ok(Self {
            store,
            automation,
            inventory,
            notify,
            matcher: Arc::new(Matcher::new(deps, options)),
        })
    }

    pub fn deps(&self) -> MatcherDeps {
        self.matcher.deps().clone()
    }
}
