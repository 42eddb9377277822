//! Per-task-type configuration, loaded once at startup.
//!
//! ```yaml
//! _default:
//!   signer_email: tasks@my-project.iam.gserviceaccount.com
//!   handler_url: https://app.example.com/_do_task/{TASK_TYPE}
//!   queue: { project: my-project, location: europe-west1, name: default }
//! send-invoice:
//!   queue: { name: invoices }
//! ```
//!
//! `_default` is deep-merged under every other entry when the registry is built.

use crate::{Error, ErrorKind, Result, RpcCode};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::{collections::BTreeMap, path::Path, time::Duration};

pub const ANONYMOUS_SIGNER: &str = "anonymous";
pub const DEFAULT_SECTION: &str = "_default";
pub const TASK_TYPE_PLACEHOLDER: &str = "{TASK_TYPE}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSigner {
    /// Tasks are pushed without an OIDC token.
    Anonymous,
    ServiceAccount(String),
}

impl TaskSigner {
    fn from_config(email: String) -> Self {
        if email == ANONYMOUS_SIGNER {
            Self::Anonymous
        } else {
            Self::ServiceAccount(email)
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::ServiceAccount(email) => Some(email),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCoordinates {
    pub project: String,
    pub location: String,
    pub name: String,
}

impl QueueCoordinates {
    pub fn queue_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project, self.location, self.name
        )
    }
}

/// Transport retry policy for task creation calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub initial_retry_delay_ms: u64,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Give up once this much time has passed since the first attempt.
    pub total_timeout_ms: u64,
    pub retryable_codes: Vec<RpcCode>,
    pub retries_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 100,
            retry_delay_multiplier: 1.3,
            max_retry_delay_ms: 10_000,
            total_timeout_ms: 20_000,
            retryable_codes: vec![RpcCode::DeadlineExceeded, RpcCode::Unavailable],
            retries_enabled: true,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            retries_enabled: false,
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, code: RpcCode) -> bool {
        self.retries_enabled && self.retryable_codes.contains(&code)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let millis = (self.initial_retry_delay_ms as f64)
            * self.retry_delay_multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_retry_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskTypeConfig {
    pub task_type: String,
    pub handler_url: String,
    pub signer: TaskSigner,
    pub custom_token_audience: Option<String>,
    pub queue: QueueCoordinates,
    pub create_retry: RetryPolicy,
}

impl TaskTypeConfig {
    pub fn queue_path(&self) -> String {
        self.queue.queue_path()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTaskTypeConfig {
    handler_url: String,
    signer_email: String,
    #[serde(default)]
    custom_token_audience: Option<String>,
    queue: QueueCoordinates,
    #[serde(default)]
    create_retry_settings: RetryPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct TaskTypeRegistry {
    types: BTreeMap<String, TaskTypeConfig>,
}

impl TaskTypeRegistry {
    pub fn new(configs: impl IntoIterator<Item = TaskTypeConfig>) -> Self {
        Self {
            types: configs
                .into_iter()
                .map(|cfg| (cfg.task_type.clone(), cfg))
                .collect(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let doc: BTreeMap<String, YamlValue> = serde_yaml::from_str(yaml)
            .context("parse task types yaml")
            .map_err(configuration)?;

        let defaults = doc
            .get(DEFAULT_SECTION)
            .cloned()
            .unwrap_or(YamlValue::Mapping(Default::default()));

        let mut types = BTreeMap::new();
        for (task_type, value) in &doc {
            if task_type == DEFAULT_SECTION {
                continue;
            }
            let mut merged = defaults.clone();
            if !value.is_null() {
                deep_merge(&mut merged, value.clone());
            }

            let raw: RawTaskTypeConfig = serde_yaml::from_value(merged)
                .with_context(|| format!("invalid config for task type `{task_type}`"))
                .map_err(configuration)?;

            types.insert(task_type.clone(), from_raw(task_type, raw)?);
        }

        Ok(Self { types })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read task types from {}", path.display()))
            .map_err(configuration)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn get(&self, task_type: &str) -> Result<&TaskTypeConfig> {
        if task_type == DEFAULT_SECTION {
            return Err(Error::configuration(
                "cannot directly access the _default task config",
            ));
        }
        self.types
            .get(task_type)
            .ok_or_else(|| Error::configuration(format!("no task type `{task_type}` is defined")))
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.types.contains_key(task_type)
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

fn configuration(err: anyhow::Error) -> Error {
    Error::with_kind(ErrorKind::Configuration, err)
}

fn from_raw(task_type: &str, raw: RawTaskTypeConfig) -> Result<TaskTypeConfig> {
    if raw.handler_url.is_empty() {
        return Err(Error::configuration(format!(
            "task type `{task_type}` has an empty handler_url"
        )));
    }
    if raw.create_retry_settings.retry_delay_multiplier < 1.0 {
        return Err(Error::configuration(format!(
            "task type `{task_type}` retry_delay_multiplier must be >= 1.0"
        )));
    }

    Ok(TaskTypeConfig {
        task_type: task_type.to_string(),
        handler_url: raw.handler_url.replace(TASK_TYPE_PLACEHOLDER, task_type),
        signer: TaskSigner::from_config(raw.signer_email),
        custom_token_audience: raw.custom_token_audience,
        queue: raw.queue,
        create_retry: raw.create_retry_settings,
    })
}

/// Mappings merge key by key; anything else (scalars, sequences) in `overlay` replaces `base`.
fn deep_merge(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base), YamlValue::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
