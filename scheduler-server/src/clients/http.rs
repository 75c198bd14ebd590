//! HTTP clients for the automation, inventory and notification APIs
//!
//! All three speak JSON and wrap payloads in the same envelope:
//!
//! ```json
//! { "code": 0, "message": "ok", "data": { ... } }
//! ```
//!
//! A non-2xx status or a non-zero `code` is a remote error.

use super::{
    AutomationApi, CreateJobRequest, InventoryApi, JobHandle, JobState, NotifyApi, NotifyResult,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{AppError, AppResult};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self, what: &str) -> AppResult<T> {
        if self.code != 0 {
            return Err(AppError::remote(format!("{what}: {}", self.message))
                .with_detail("remote_code", self.code));
        }
        self.data
            .ok_or_else(|| AppError::remote(format!("{what}: response without data")))
    }

    fn into_unit(self, what: &str) -> AppResult<()> {
        if self.code != 0 {
            return Err(AppError::remote(format!("{what}: {}", self.message))
                .with_detail("remote_code", self.code));
        }
        Ok(())
    }
}

/// Base URL + shared `reqwest` client
#[derive(Debug, Clone)]
struct HttpBase {
    client: Client,
    base_url: String,
}

impl HttpBase {
    fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> AppResult<Envelope<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| AppError::with_message(shared::ErrorCode::NetworkError, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::remote(format!("HTTP {status}: {text}")));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::remote(format!("Invalid response body: {e}")))
    }
}

// ========== Automation ==========

#[derive(Debug, Clone)]
pub struct AutomationClient {
    http: HttpBase,
}

impl AutomationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: HttpBase::new(base_url, timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct JobStatusData {
    state: JobState,
}

#[async_trait]
impl AutomationApi for AutomationClient {
    async fn create_job(&self, request: &CreateJobRequest) -> AppResult<JobHandle> {
        let req = self.http.client.post(self.http.url("/api/jobs")).json(request);
        self.http.send::<JobHandle>(req).await?.into_data("create job")
    }

    async fn job_status(&self, job_id: &str, biz_id: i64) -> AppResult<JobState> {
        let req = self
            .http
            .client
            .get(self.http.url(&format!("/api/jobs/{job_id}")))
            .query(&[("biz_id", biz_id)]);
        let data = self.http.send::<JobStatusData>(req).await?.into_data("job status")?;
        Ok(data.state)
    }
}

// ========== Inventory ==========

#[derive(Debug, Clone)]
pub struct InventoryClient {
    http: HttpBase,
}

impl InventoryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: HttpBase::new(base_url, timeout)?,
        })
    }

    async fn find_host(&self, field: &str, value: &str) -> AppResult<u64> {
        let req = self
            .http
            .client
            .get(self.http.url("/api/hosts"))
            .query(&[(field, value)]);
        let hosts = self.http.send::<Vec<HostData>>(req).await?.into_data("search host")?;
        hosts.first().map(|h| h.host_id).ok_or_else(|| {
            AppError::with_message(
                shared::ErrorCode::HostNotFound,
                format!("no host with {field} {value}"),
            )
        })
    }
}

#[derive(Deserialize)]
struct HostData {
    host_id: u64,
}

#[derive(Debug, Deserialize)]
struct HostBizData {
    biz_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct BizData {
    biz_name: String,
}

#[derive(Serialize)]
struct TransferBody {
    from_biz: i64,
    to_biz: i64,
}

#[derive(Serialize)]
struct OperatorBody<'a> {
    operator: &'a str,
    bak_operator: &'a str,
}

#[async_trait]
impl InventoryApi for InventoryClient {
    async fn host_id_by_ip(&self, ip: &str) -> AppResult<u64> {
        self.find_host("ip", ip).await
    }

    async fn host_id_by_asset(&self, asset_id: &str) -> AppResult<u64> {
        self.find_host("asset_id", asset_id).await
    }

    async fn biz_ids_by_host(&self, host_id: u64) -> AppResult<Vec<i64>> {
        let req = self
            .http
            .client
            .get(self.http.url(&format!("/api/hosts/{host_id}/biz")));
        let data = self.http.send::<HostBizData>(req).await?.into_data("host business")?;
        Ok(data.biz_ids)
    }

    async fn transfer_host(&self, host_id: u64, from_biz: i64, to_biz: i64) -> AppResult<()> {
        let req = self
            .http
            .client
            .post(self.http.url(&format!("/api/hosts/{host_id}/transfer")))
            .json(&TransferBody { from_biz, to_biz });
        self.http
            .send::<serde_json::Value>(req)
            .await?
            .into_unit("transfer host")
    }

    async fn update_host_operator(
        &self,
        host_id: u64,
        operator: &str,
        bak_operator: &str,
    ) -> AppResult<()> {
        let req = self
            .http
            .client
            .put(self.http.url(&format!("/api/hosts/{host_id}/operator")))
            .json(&OperatorBody {
                operator,
                bak_operator,
            });
        self.http
            .send::<serde_json::Value>(req)
            .await?
            .into_unit("update host operator")
    }

    async fn biz_name(&self, biz_id: i64) -> AppResult<String> {
        let req = self.http.client.get(self.http.url(&format!("/api/biz/{biz_id}")));
        let data = self.http.send::<BizData>(req).await?.into_data("search business")?;
        Ok(data.biz_name)
    }
}

// ========== Notification ==========

#[derive(Debug, Clone)]
pub struct NotifyClient {
    http: HttpBase,
}

impl NotifyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: HttpBase::new(base_url, timeout)?,
        })
    }
}

#[derive(Serialize)]
struct MessageBody<'a> {
    receiver: &'a str,
    content: &'a str,
}

#[async_trait]
impl NotifyApi for NotifyClient {
    async fn send(&self, user: &str, content: &str) -> AppResult<NotifyResult> {
        let req = self
            .http
            .client
            .post(self.http.url("/api/messages"))
            .json(&MessageBody {
                receiver: user,
                content,
            });
        // The envelope's own code/message is the result pair
        let envelope = self.http.send::<serde_json::Value>(req).await?;
        Ok(NotifyResult {
            code: envelope.code,
            message: envelope.message,
        })
    }
}
