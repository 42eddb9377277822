use crate::pipeline::TaskFault;
use axum::{
    body::Bytes,
    http::{HeaderMap, Method},
};
use chrono::{DateTime, Utc};
use serde_json::Value;

pub const QUEUE_NAME_HEADER: &str = "X-CloudTasks-QueueName";
pub const TASK_NAME_HEADER: &str = "X-CloudTasks-TaskName";
pub const RETRY_COUNT_HEADER: &str = "X-CloudTasks-TaskRetryCount";
pub const EXECUTION_COUNT_HEADER: &str = "X-CloudTasks-TaskExecutionCount";
pub const PREVIOUS_RESPONSE_HEADER: &str = "X-CloudTasks-TaskPreviousResponse";
pub const RETRY_REASON_HEADER: &str = "X-CloudTasks-TaskRetryReason";
pub const ETA_HEADER: &str = "X-CloudTasks-TaskETA";

/// One inbound delivery as it moves through the pipeline.
///
/// The raw body is kept as received; body parsing only adds [`TaskContext::json_body`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    method: Method,
    full_url: String,
    headers: HeaderMap,
    body: Bytes,
    task_type: String,
    json_body: Option<Value>,
    caller_email: Option<String>,
}

impl TaskContext {
    /// `full_url` is the external URL the queue called, including the query string.
    pub fn new(
        method: Method,
        full_url: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            method,
            full_url: full_url.into(),
            headers,
            body,
            task_type: task_type.into(),
            json_body: None,
            caller_email: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn full_url(&self) -> &str {
        &self.full_url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn json_body(&self) -> Option<&Value> {
        self.json_body.as_ref()
    }

    pub fn set_json_body(&mut self, value: Value) {
        self.json_body = Some(value);
    }

    pub fn caller_email(&self) -> Option<&str> {
        self.caller_email.as_deref()
    }

    /// Record the authenticated caller. Can only happen once per delivery.
    pub fn set_caller_email(&mut self, email: impl Into<String>) -> anyhow::Result<()> {
        if self.caller_email.is_some() {
            anyhow::bail!("caller email already set for this task");
        }
        self.caller_email = Some(email.into());
        Ok(())
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.non_empty_header(QUEUE_NAME_HEADER)
    }

    pub fn task_name(&self) -> Option<&str> {
        self.non_empty_header(TASK_NAME_HEADER)
    }

    pub fn retry_count(&self) -> u32 {
        self.count_header(RETRY_COUNT_HEADER)
    }

    pub fn execution_count(&self) -> u32 {
        self.count_header(EXECUTION_COUNT_HEADER)
    }

    pub fn previous_response(&self) -> Option<&str> {
        self.non_empty_header(PREVIOUS_RESPONSE_HEADER)
    }

    pub fn retry_reason(&self) -> Option<&str> {
        self.non_empty_header(RETRY_REASON_HEADER)
    }

    /// Originally scheduled time, from fractional unix seconds.
    pub fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.non_empty_header(ETA_HEADER)
            .and_then(parse_fractional_seconds)
    }

    pub fn optional_query_param(&self, name: &str) -> Option<String> {
        query_pairs(&self.full_url)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn require_query_param(&self, name: &str) -> Result<String, TaskFault> {
        match self.optional_query_param(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(TaskFault::CannotBeValid(format!(
                "Required param `{name}` missing from task URL"
            ))),
        }
    }

    fn non_empty_header(&self, name: &str) -> Option<&str> {
        self.header(name).filter(|v| !v.is_empty())
    }

    fn count_header(&self, name: &str) -> u32 {
        self.header(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

fn query_pairs(url: &str) -> impl Iterator<Item = (String, String)> + '_ {
    let query = url
        .split_once('?')
        .map(|(_, q)| q.split('#').next().unwrap_or(""))
        .unwrap_or("");
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn parse_fractional_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let (secs, frac) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: i64 = secs.parse().ok()?;
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut micros = frac.chars().take(6).collect::<String>();
    while micros.len() < 6 {
        micros.push('0');
    }
    let micros: i64 = micros.parse().ok()?;
    DateTime::<Utc>::from_timestamp_micros(secs.checked_mul(1_000_000)?.checked_add(micros)?)
}
