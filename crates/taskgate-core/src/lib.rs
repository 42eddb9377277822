//! Shared core abstractions for taskgate.
//!
//! This crate defines the contracts shared by the dispatch client and the delivery server: task
//! identity (dedup ids and throttled schedules), dispatch options, per-task-type configuration,
//! result codes and their status mapping, and the collaborator traits for the queue client, token
//! verification, named mutexes and transaction markers.
//!
//! # API notes
//! `taskgate-core` is an internal crate (`publish = false`). Its public API uses a few third-party
//! types (`chrono::DateTime<Utc>`, `serde_json::Value`, `uuid::Uuid`) as part of the contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};
use uuid::Uuid;

pub mod identity;
pub mod lite;
pub mod marker;
pub mod options;
pub mod result;
pub mod status;
pub mod task_type;

pub use identity::{build_dedup_id, build_throttled_schedule, hash_seed, task_name, TaskIdentity};
pub use options::{DispatchOptions, DispatchOptionsBuilder, TaskBody};
pub use result::ResultCode;
pub use status::{LogSeverity, MappedStatus, StatusMapper};
pub use task_type::{RetryPolicy, TaskSigner, TaskTypeConfig, TaskTypeRegistry};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wiring or option misuse: unknown task type, invalid option combination, missing route
    /// capture group, unmapped result code. Never retried.
    Configuration,
    /// The queue service refused or failed to create a task.
    TaskCreationFailed,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Configuration,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn task_creation_failed(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::TaskCreationFailed,
            inner: cause.context(message.into()),
        }
    }

    pub fn with_kind(kind: ErrorKind, inner: anyhow::Error) -> Self {
        Self { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_configuration(&self) -> bool {
        self.kind == ErrorKind::Configuration
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            inner: value,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            inner: anyhow::Error::from(value),
        }
    }
}

/// Canonical gRPC status codes as reported by the queue service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RpcCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Parses the `status` string of a Google API error body (e.g. `ALREADY_EXISTS`).
    pub fn from_status_name(name: &str) -> Option<Self> {
        let code = match name {
            "CANCELLED" => Self::Cancelled,
            "UNKNOWN" => Self::Unknown,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "NOT_FOUND" => Self::NotFound,
            "ALREADY_EXISTS" => Self::AlreadyExists,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "ABORTED" => Self::Aborted,
            "OUT_OF_RANGE" => Self::OutOfRange,
            "UNIMPLEMENTED" => Self::Unimplemented,
            "INTERNAL" => Self::Internal,
            "UNAVAILABLE" => Self::Unavailable,
            "DATA_LOSS" => Self::DataLoss,
            "UNAUTHENTICATED" => Self::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }

    /// Best-effort mapping used when an HTTP error response carries no status name.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            429 => Self::ResourceExhausted,
            499 => Self::Cancelled,
            501 => Self::Unimplemented,
            503 => Self::Unavailable,
            504 => Self::DeadlineExceeded,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`TaskQueueClient`].
#[derive(Debug)]
pub struct QueueError {
    pub code: RpcCode,
    inner: anyhow::Error,
}

impl QueueError {
    pub fn new(code: RpcCode, inner: anyhow::Error) -> Self {
        Self { code, inner }
    }

    pub fn msg(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == RpcCode::AlreadyExists
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.inner)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// OIDC token the queue service should mint and attach when pushing the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningDescriptor {
    pub service_account_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

/// Fully resolved outbound task, ready to hand to a [`TaskQueueClient`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRequest {
    pub task_type: String,
    pub queue_path: String,
    /// `{queue_path}/tasks/{id}` when a dedup id was derived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing: Option<SigningDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTask {
    /// Full task name as stored by the queue service.
    pub name: String,
}

#[async_trait]
pub trait TaskQueueClient: Send + Sync {
    /// Submit a task, retrying transport failures according to `retry`.
    async fn create_task(
        &self,
        request: &DispatchRequest,
        retry: &RetryPolicy,
    ) -> std::result::Result<CreatedTask, QueueError>;
}

/// Claims carried by a queue-minted OIDC token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConstraints {
    /// Exact external URL (including query string) the token must have been minted for.
    pub audience: String,
    /// Service account the token must have been issued to.
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub email: Option<String>,
    pub subject: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailureKind {
    Malformed,
    Expired,
    InvalidSignature,
    UnknownKey,
    AudienceMismatch,
    IssuerMismatch,
    EmailMismatch,
    KeyFetchFailed,
}

impl TokenFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "MalformedToken",
            Self::Expired => "ExpiredToken",
            Self::InvalidSignature => "InvalidSignature",
            Self::UnknownKey => "UnknownSigningKey",
            Self::AudienceMismatch => "AudienceMismatch",
            Self::IssuerMismatch => "IssuerMismatch",
            Self::EmailMismatch => "EmailMismatch",
            Self::KeyFetchFailed => "KeyFetchFailed",
        }
    }

    pub fn from_jwt_error(err: &jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
        match err.kind() {
            JwtErrorKind::ExpiredSignature => Self::Expired,
            JwtErrorKind::InvalidSignature => Self::InvalidSignature,
            JwtErrorKind::InvalidAudience => Self::AudienceMismatch,
            JwtErrorKind::InvalidIssuer => Self::IssuerMismatch,
            _ => Self::Malformed,
        }
    }
}

#[derive(Debug)]
pub struct TokenFailure {
    pub kind: TokenFailureKind,
    inner: anyhow::Error,
}

impl TokenFailure {
    pub fn new(kind: TokenFailureKind, inner: anyhow::Error) -> Self {
        Self { kind, inner }
    }

    pub fn msg(kind: TokenFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn from_jwt(err: jsonwebtoken::errors::Error) -> Self {
        Self {
            kind: TokenFailureKind::from_jwt_error(&err),
            inner: anyhow::Error::from(err),
        }
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for TokenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for TokenFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token's signature, expiry, audience and signer email.
    async fn verify(
        &self,
        token: &str,
        constraints: &TokenConstraints,
    ) -> std::result::Result<VerifiedToken, TokenFailure>;
}

#[derive(Debug)]
pub enum MutexError {
    TimedOut { name: String, waited: Duration },
    Backend(anyhow::Error),
}

impl fmt::Display for MutexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { name, waited } => write!(
                f,
                "timed out after {}ms waiting for lock `{name}`",
                waited.as_millis()
            ),
            Self::Backend(err) => write!(f, "mutex backend failed: {err}"),
        }
    }
}

impl std::error::Error for MutexError {}

/// A held named lock. Dropping the lease without calling `release` still frees the lock.
#[async_trait]
pub trait MutexLease: Send {
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TaskMutex: Send + Sync {
    /// Acquire `name`, waiting at most `timeout`.
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> std::result::Result<Box<dyn MutexLease>, MutexError>;
}

#[async_trait]
pub trait TransactionMarkerRepository: Send + Sync {
    /// Whether the marker written by the dispatching transaction is visible (i.e. committed).
    async fn exists(&self, marker: Uuid) -> anyhow::Result<bool>;
}
