//! Delivery endpoint for push tasks.
//!
//! The queue service POSTs each task to a URL matching the configured route pattern. The request
//! runs through the stage pipeline (logging, exception containment, body parsing, authentication,
//! single-flight mutex and, when enabled, transaction markers) before the application handler, and
//! the resulting code is mapped to the HTTP status that tells the queue whether to retry.

use crate::config::DeliveryConfig;
use crate::context::TaskContext;
use crate::controller::{Controller, HandlerRegistry};
use crate::pipeline::{Pipeline, Stage};
use crate::stages::{
    AuthenticationStage, BodyParsingStage, ExceptionContainmentStage, LoggingStage,
    MutexSingleFlightStage, TransactionMarkerStage,
};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use taskgate_core::{
    lite::{
        jwt::{Hs256TokenAuthority, Hs256TokenConfig},
        markers::{PgTransactionMarkers, MIGRATOR},
        mutex::InMemoryMutex,
        pgmutex::PgAdvisoryMutex,
    },
    StatusMapper, TaskMutex, TaskTypeRegistry, TokenVerifier, TransactionMarkerRepository,
};

pub mod config;
pub mod context;
pub mod controller;
pub mod handlers;
pub mod oidc;
pub mod pipeline;
pub mod stages;

const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";
const DEV_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Collaborators the default pipeline is assembled from.
pub struct PipelineParts {
    pub registry: Arc<TaskTypeRegistry>,
    pub mapper: Arc<StatusMapper>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub mutex: Arc<dyn TaskMutex>,
    pub mutex_timeout: Duration,
    pub markers: Option<Arc<dyn TransactionMarkerRepository>>,
}

/// Logging, exception containment, body parsing, authentication and single-flight, plus the
/// transaction marker check when a marker store is given.
pub fn default_pipeline(parts: PipelineParts) -> Pipeline {
    let mut stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(LoggingStage::new(parts.mapper)),
        Arc::new(ExceptionContainmentStage),
        Arc::new(BodyParsingStage),
        Arc::new(AuthenticationStage::new(parts.registry, parts.verifier)),
        Arc::new(MutexSingleFlightStage::new(parts.mutex, parts.mutex_timeout)),
    ];
    if let Some(markers) = parts.markers {
        stages.push(Arc::new(TransactionMarkerStage::new(markers)));
    }
    Pipeline::new(stages)
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: DeliveryConfig,
    pub controller: Arc<Controller>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cfg", &self.cfg)
            .field("controller", &self.controller)
            .finish()
    }
}

pub fn load_task_types(cfg: &DeliveryConfig) -> anyhow::Result<TaskTypeRegistry> {
    TaskTypeRegistry::from_yaml_file(&cfg.task_types_path).context("load task types")
}

pub fn load_status_mapper(cfg: &DeliveryConfig) -> anyhow::Result<StatusMapper> {
    match &cfg.result_map_path {
        Some(path) => StatusMapper::from_yaml_file(path).context("load result map"),
        None => Ok(StatusMapper::with_defaults()),
    }
}

/// Wire verifier, mutex and marker store from config around the given handlers.
///
/// With `dev_token_secret` set, push tokens are HS256 tokens minted by [`Hs256TokenAuthority`];
/// otherwise they are verified against the JWKS endpoint.
pub async fn build_state(
    cfg: DeliveryConfig,
    registry: Arc<TaskTypeRegistry>,
    mapper: Arc<StatusMapper>,
    handlers: Arc<dyn HandlerRegistry>,
) -> anyhow::Result<AppState> {
    let verifier: Arc<dyn TokenVerifier> = match &cfg.dev_token_secret {
        Some(secret) => Arc::new(
            Hs256TokenAuthority::from_config(Hs256TokenConfig {
                issuer: cfg.oidc_token_issuer.clone(),
                current_kid: cfg.dev_token_kid.clone(),
                current_secret: secret.clone(),
                next_kid: None,
                next_secret: None,
                ttl: DEV_TOKEN_TTL,
            })
            .context("init dev token authority")?,
        ),
        None => Arc::new(oidc::OidcTokenVerifier::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("build jwks http client")?,
            cfg.oidc_jwks_url.clone(),
            cfg.oidc_token_issuer.clone(),
            Duration::from_secs(cfg.oidc_jwks_cache_ttl_secs),
        )),
    };

    let (mutex, markers): (Arc<dyn TaskMutex>, Option<Arc<dyn TransactionMarkerRepository>>) =
        match &cfg.state_database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("connect state db")?;
                MIGRATOR
                    .run(&pool)
                    .await
                    .context("migrate state db")?;
                let markers: Option<Arc<dyn TransactionMarkerRepository>> =
                    if cfg.transaction_markers_enabled {
                        Some(Arc::new(PgTransactionMarkers::new(pool.clone())))
                    } else {
                        None
                    };
                let mutex: Arc<dyn TaskMutex> = Arc::new(PgAdvisoryMutex::new(pool));
                (mutex, markers)
            }
            None => {
                if cfg.transaction_markers_enabled {
                    anyhow::bail!("transaction markers require STATE_DATABASE_URL");
                }
                let mutex: Arc<dyn TaskMutex> = Arc::new(InMemoryMutex::new());
                (mutex, None)
            }
        };

    let pipeline = default_pipeline(PipelineParts {
        registry,
        mapper: mapper.clone(),
        verifier,
        mutex,
        mutex_timeout: Duration::from_millis(cfg.task_mutex_timeout_ms),
        markers,
    });
    let controller = Controller::new(&cfg.task_route_pattern, pipeline, handlers, mapper)
        .context("init controller")?;

    Ok(AppState {
        cfg,
        controller: Arc::new(controller),
    })
}

pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new().fallback(deliver).with_state(state)
}

async fn deliver(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let task_type = state.controller.route(uri.path()).map_err(|err| {
        tracing::warn!(
            event = "delivery.route.unmatched",
            path = %uri.path(),
            error = %err,
            "request path is not a task route"
        );
        ApiError::not_found("not a task route")
    })?;

    let full_url = external_url(&state.cfg, &headers, &uri)?;
    let ctx = TaskContext::new(method, full_url, headers, body, task_type);

    let response = state.controller.handle(ctx).await.map_err(|err| {
        tracing::error!(
            event = "delivery.task.unmapped_result",
            error = %err,
            "task result has no status mapping"
        );
        ApiError::internal("task result has no status mapping")
    })?;

    let status = StatusCode::from_u16(response.http_status).map_err(|err| {
        tracing::error!(
            event = "delivery.task.invalid_status",
            http_status = response.http_status,
            error = %err,
            "mapped status is not a valid HTTP status"
        );
        ApiError::internal("invalid mapped status")
    })?;
    let body = Json(json!({
        "code": response.result.code(),
        "message": response.result.message(),
        "status": response.label,
    }));
    Ok((status, body).into_response())
}

/// The URL the queue called, which is also the audience its token was minted for.
fn external_url(cfg: &DeliveryConfig, headers: &HeaderMap, uri: &Uri) -> Result<String, ApiError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    if let Some(base) = &cfg.public_base_url {
        return Ok(format!("{}{path_and_query}", base.trim_end_matches('/')));
    }

    let scheme = headers
        .get(FORWARDED_PROTO_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .ok_or_else(|| ApiError::bad_request("missing host header"))?;
    Ok(format!("{scheme}://{host}{path_and_query}"))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal(message: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use clap::Parser;

    fn cfg(args: &[&str]) -> DeliveryConfig {
        let mut argv = vec!["taskgate-delivery"];
        argv.extend_from_slice(args);
        DeliveryConfig::parse_from(argv)
    }

    #[test]
    fn external_url_prefers_public_base_url() {
        let cfg = cfg(&["--public-base-url", "https://app.example.com/"]);
        let uri: Uri = "/_do_task/send-invoice?id=15".parse().unwrap();
        let url = external_url(&cfg, &HeaderMap::new(), &uri).unwrap();
        assert_eq!(url, "https://app.example.com/_do_task/send-invoice?id=15");
    }

    #[test]
    fn external_url_from_forwarded_headers() {
        let cfg = cfg(&[]);
        let uri: Uri = "/_do_task/send-invoice?id=15".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("app.example.com"));
        headers.insert(FORWARDED_PROTO_HEADER, HeaderValue::from_static("https, http"));
        let url = external_url(&cfg, &headers, &uri).unwrap();
        assert_eq!(url, "https://app.example.com/_do_task/send-invoice?id=15");

        headers.remove(FORWARDED_PROTO_HEADER);
        let url = external_url(&cfg, &headers, &uri).unwrap();
        assert_eq!(url, "http://app.example.com/_do_task/send-invoice?id=15");
    }

    #[test]
    fn external_url_needs_a_host() {
        let cfg = cfg(&[]);
        let uri: Uri = "/_do_task/send-invoice".parse().unwrap();
        let err = external_url(&cfg, &HeaderMap::new(), &uri).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
