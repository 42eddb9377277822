//! Result code to HTTP status and log severity mapping.
//!
//! The queue service retries any non-2xx response, so codes that must not be retried
//! (`cannotBeValid`, `duplicateDelivery`) map to custom 2xx statuses.

use crate::result::{codes, ResultCode};
use crate::{Error, ErrorKind, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }

    /// `tracing` has five levels; everything from `error` upwards collapses to ERROR and the
    /// original severity is kept as a field.
    pub fn tracing_level(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info | Self::Notice => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error | Self::Critical | Self::Alert | Self::Emergency => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMapping {
    pub http_status: u16,
    pub severity: LogSeverity,
}

/// Deployment override for one code. Overriding a core code may set either field; a new code
/// must set both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusOverride {
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub loglevel: Option<LogSeverity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedStatus {
    pub http_status: u16,
    pub label: String,
    pub severity: LogSeverity,
}

#[derive(Debug, Clone)]
pub struct StatusMapper {
    table: BTreeMap<String, StatusMapping>,
}

impl Default for StatusMapper {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StatusMapper {
    pub fn with_defaults() -> Self {
        use LogSeverity::{Critical, Emergency, Info, Notice, Warning};
        let defaults = [
            (codes::SUCCESS, 200, Info),
            (codes::DUPLICATE_DELIVERY, 296, Warning),
            (codes::TRANSACTION_EXPIRED, 297, Warning),
            (codes::CANNOT_BE_VALID, 299, Critical),
            (codes::BAD_HTTP_METHOD, 400, Warning),
            (codes::AUTH_NOT_PROVIDED, 401, Warning),
            (codes::AUTH_INVALID, 403, LogSeverity::Error),
            (codes::AUTH_EXPIRED, 403, LogSeverity::Error),
            (codes::HANDLER_NOT_FOUND, 404, Warning),
            (codes::MUTEX_TIMEOUT, 409, Warning),
            (codes::NOT_YET_VISIBLE, 425, Notice),
            (codes::UNCAUGHT_EXCEPTION, 500, Emergency),
        ];
        Self {
            table: defaults
                .into_iter()
                .map(|(code, http_status, severity)| {
                    (
                        code.to_string(),
                        StatusMapping {
                            http_status,
                            severity,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Defaults merged with `overrides`, once.
    pub fn new(overrides: impl IntoIterator<Item = (String, StatusOverride)>) -> Result<Self> {
        let mut mapper = Self::with_defaults();
        for (code, patch) in overrides {
            let merged = match mapper.table.get(&code) {
                Some(existing) => StatusMapping {
                    http_status: patch.http_status.unwrap_or(existing.http_status),
                    severity: patch.loglevel.unwrap_or(existing.severity),
                },
                None => match (patch.http_status, patch.loglevel) {
                    (Some(http_status), Some(severity)) => StatusMapping {
                        http_status,
                        severity,
                    },
                    _ => {
                        return Err(Error::configuration(format!(
                            "result code `{code}` needs both http_status and loglevel"
                        )));
                    }
                },
            };
            if !(200..=599).contains(&merged.http_status) {
                return Err(Error::configuration(format!(
                    "result code `{code}` maps to unusable http status {}",
                    merged.http_status
                )));
            }
            mapper.table.insert(code, merged);
        }
        Ok(mapper)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let overrides: BTreeMap<String, StatusOverride> = serde_yaml::from_str(yaml)
            .context("parse result map yaml")
            .map_err(|err| Error::with_kind(ErrorKind::Configuration, err))?;
        Self::new(overrides)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read result map from {}", path.display()))
            .map_err(|err| Error::with_kind(ErrorKind::Configuration, err))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn lookup(&self, code: &str) -> Result<StatusMapping> {
        self.table.get(code).copied().ok_or_else(|| {
            Error::configuration(format!(
                "no response mapping defined for task result code `{code}`"
            ))
        })
    }

    pub fn resolve(&self, result: &ResultCode) -> Result<MappedStatus> {
        let mapping = self.lookup(result.code())?;
        Ok(MappedStatus {
            http_status: mapping.http_status,
            label: status_label(result.code()),
            severity: mapping.severity,
        })
    }

    pub fn severity(&self, result: &ResultCode) -> Result<LogSeverity> {
        Ok(self.lookup(result.code())?.severity)
    }
}

/// HTTP status label: the code with its first letter upper-cased.
pub fn status_label(code: &str) -> String {
    let mut chars = code.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
