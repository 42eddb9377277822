//! Google Cloud Tasks REST client (`tasks.create`).

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};
use taskgate_core::{
    CreatedTask, DispatchRequest, QueueError, RetryPolicy, RpcCode, TaskQueueClient,
};
use tokio::sync::Mutex;

pub const DEFAULT_API_BASE_URL: &str = "https://cloudtasks.googleapis.com";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// OAuth access tokens for the Cloud Tasks API.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct StaticAccessToken(String);

impl StaticAccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticAccessToken")
            .field(&"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AccessTokenSource for StaticAccessToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Default service account token from the GCE/Cloud Run metadata server, cached until shortly
/// before it expires.
pub struct MetadataServerToken {
    http: reqwest::Client,
    url: String,
    cached: Mutex<Option<(String, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: u64,
}

impl MetadataServerToken {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            url: METADATA_TOKEN_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl AccessTokenSource for MetadataServerToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, valid_until)) = cached.as_ref() {
            if Instant::now() < *valid_until {
                return Ok(token.clone());
            }
        }

        let res = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("request metadata server token")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("metadata server token request failed: {status} {body}");
        }
        let token: MetadataTokenResponse =
            res.json().await.context("decode metadata server token")?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    task: CloudTask,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloudTask {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    http_request: HttpRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_time: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest {
    url: String,
    http_method: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oidc_token: Option<OidcToken>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl From<&DispatchRequest> for CreateTaskRequest {
    fn from(request: &DispatchRequest) -> Self {
        Self {
            task: CloudTask {
                name: request.name.clone(),
                http_request: HttpRequest {
                    url: request.url.clone(),
                    http_method: "POST",
                    headers: request.headers.clone(),
                    body: request
                        .body
                        .as_ref()
                        .map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
                    oidc_token: request.signing.as_ref().map(|s| OidcToken {
                        service_account_email: s.service_account_email.clone(),
                        audience: s.audience.clone(),
                    }),
                },
                schedule_time: request
                    .schedule_at
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)),
            },
        }
    }
}

pub struct CloudTasksClient {
    http: reqwest::Client,
    api_base_url: String,
    token: Arc<dyn AccessTokenSource>,
}

impl std::fmt::Debug for CloudTasksClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudTasksClient")
            .field("api_base_url", &self.api_base_url)
            .field("token", &"<AccessTokenSource>")
            .finish()
    }
}

impl CloudTasksClient {
    pub fn new(token: Arc<dyn AccessTokenSource>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token,
        })
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn create_once(
        &self,
        queue_path: &str,
        payload: &CreateTaskRequest,
    ) -> Result<CreatedTask, QueueError> {
        let token = self
            .token
            .access_token()
            .await
            .map_err(|err| QueueError::new(RpcCode::Unauthenticated, err))?;

        let url = format!("{}/v2/{}/tasks", self.api_base_url, queue_path);
        let res = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if status.is_success() {
            let task: TaskResponse = res.json().await.map_err(|err| {
                QueueError::new(
                    RpcCode::Unknown,
                    anyhow::Error::from(err).context("decode created task"),
                )
            })?;
            return Ok(CreatedTask { name: task.name });
        }

        let body = res.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &body))
    }
}

fn transport_error(err: reqwest::Error) -> QueueError {
    let code = if err.is_timeout() {
        RpcCode::DeadlineExceeded
    } else if err.is_connect() {
        RpcCode::Unavailable
    } else {
        RpcCode::Unknown
    };
    QueueError::new(code, anyhow::Error::from(err).context("cloud tasks request"))
}

fn api_error(status: u16, body: &str) -> QueueError {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => {
            let code = parsed
                .error
                .status
                .as_deref()
                .and_then(RpcCode::from_status_name)
                .unwrap_or_else(|| RpcCode::from_http_status(status));
            QueueError::msg(code, parsed.error.message)
        }
        Err(_) => QueueError::msg(
            RpcCode::from_http_status(status),
            format!("http {status}: {body}"),
        ),
    }
}

#[async_trait]
impl TaskQueueClient for CloudTasksClient {
    async fn create_task(
        &self,
        request: &DispatchRequest,
        retry: &RetryPolicy,
    ) -> Result<CreatedTask, QueueError> {
        let payload = CreateTaskRequest::from(request);
        let started = Instant::now();
        let mut retries: u32 = 0;

        loop {
            let err = match self.create_once(&request.queue_path, &payload).await {
                Ok(task) => return Ok(task),
                Err(err) => err,
            };
            if !retry.is_retryable(err.code) {
                return Err(err);
            }

            retries += 1;
            let delay = retry.delay_for_retry(retries);
            if started.elapsed() + delay > retry.total_timeout() {
                return Err(err);
            }

            tracing::warn!(
                event = "dispatch.cloud_tasks.retry",
                queue_path = %request.queue_path,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying task creation"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
