use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};
use uuid::Uuid;

pub mod codes {
    pub const SUCCESS: &str = "success";
    pub const DUPLICATE_DELIVERY: &str = "duplicateDelivery";
    pub const CANNOT_BE_VALID: &str = "cannotBeValid";
    pub const BAD_HTTP_METHOD: &str = "badHttpMethod";
    pub const AUTH_NOT_PROVIDED: &str = "authNotProvided";
    pub const AUTH_INVALID: &str = "authInvalid";
    pub const AUTH_EXPIRED: &str = "authExpired";
    pub const HANDLER_NOT_FOUND: &str = "handlerNotFound";
    pub const MUTEX_TIMEOUT: &str = "mutexTimeout";
    pub const UNCAUGHT_EXCEPTION: &str = "uncaughtException";
    pub const NOT_YET_VISIBLE: &str = "notYetVisible";
    pub const TRANSACTION_EXPIRED: &str = "transactionExpired";
}

/// Outcome of one pipeline run: a code looked up in the status table, a human message and
/// structured log context.
#[derive(Clone)]
pub struct ResultCode {
    code: String,
    message: String,
    context: BTreeMap<String, Value>,
    error: Option<Arc<anyhow::Error>>,
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = self.error.as_ref().map(|err| format!("{err:#}"));
        f.debug_struct("ResultCode")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .field("error", &error)
            .finish()
    }
}

impl ResultCode {
    /// Result with an application-defined code. The code must be registered with the
    /// `StatusMapper` before a handler returns it.
    pub fn custom(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            error: None,
        }
    }

    pub fn success() -> Self {
        Self::custom(codes::SUCCESS, "ok")
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self::custom(codes::SUCCESS, message)
    }

    pub fn duplicate_delivery(message: impl Into<String>) -> Self {
        Self::custom(codes::DUPLICATE_DELIVERY, message)
    }

    pub fn cannot_be_valid(message: impl Into<String>) -> Self {
        Self::custom(codes::CANNOT_BE_VALID, message)
    }

    pub fn bad_http_method(method: &str) -> Self {
        Self::custom(codes::BAD_HTTP_METHOD, format!("`{method}` not accepted"))
    }

    pub fn auth_not_provided(message: impl Into<String>) -> Self {
        Self::custom(codes::AUTH_NOT_PROVIDED, message)
    }

    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::custom(codes::AUTH_INVALID, message)
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::custom(codes::AUTH_EXPIRED, message)
    }

    pub fn handler_not_found(task_type: &str) -> Self {
        Self::custom(
            codes::HANDLER_NOT_FOUND,
            format!("no handler registered for task type `{task_type}`"),
        )
        .with_context("task_type", task_type)
    }

    pub fn mutex_timeout(failure: impl fmt::Display) -> Self {
        Self::custom(codes::MUTEX_TIMEOUT, format!("Mutex failed: {failure}"))
    }

    /// `kind` names the fault class (e.g. `panic`) since Rust errors carry no class name.
    pub fn uncaught_exception(kind: &str, err: anyhow::Error) -> Self {
        Self::custom(codes::UNCAUGHT_EXCEPTION, format!("[{kind}] {err}")).with_error(err)
    }

    pub fn not_yet_visible(marker: Uuid, expiry: DateTime<Utc>) -> Self {
        Self::custom(codes::NOT_YET_VISIBLE, "transaction not ready")
            .with_context("uuid", marker)
            .with_context("expiry", crate::marker::format_expiry(expiry))
    }

    pub fn transaction_expired(marker: Uuid, expiry: DateTime<Utc>) -> Self {
        Self::custom(codes::TRANSACTION_EXPIRED, "transaction rolled back")
            .with_context("uuid", marker)
            .with_context("expiry", crate::marker::format_expiry(expiry))
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_error(mut self, err: anyhow::Error) -> Self {
        self.error = Some(Arc::new(err));
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::SUCCESS
    }
}
