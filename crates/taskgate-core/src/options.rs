use crate::{marker::TransactionMarker, Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};

pub const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum TaskBody {
    Empty,
    Raw(String),
    /// Serialized as JSON with a default `application/json` content type.
    Json(Value),
    /// Serialized with bracket notation (`child[key]=value`) as
    /// `application/x-www-form-urlencoded`.
    Form(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub interval: Duration,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dedup {
    None,
    Id(String),
    Seed {
        seed: String,
        throttle: Option<Throttle>,
    },
}

/// Per-call dispatch intent. Only constructible through [`DispatchOptionsBuilder::build`], so an
/// existing value always satisfies the option invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    body: TaskBody,
    headers: BTreeMap<String, String>,
    query: Vec<(String, String)>,
    schedule_at: Option<DateTime<Utc>>,
    dedup: Dedup,
    throw_on_duplicate: bool,
    custom_handler_url: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            body: TaskBody::Empty,
            headers: BTreeMap::new(),
            query: Vec::new(),
            schedule_at: None,
            dedup: Dedup::None,
            throw_on_duplicate: true,
            custom_handler_url: None,
        }
    }
}

impl DispatchOptions {
    pub fn builder() -> DispatchOptionsBuilder {
        DispatchOptionsBuilder::default()
    }

    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn schedule_at(&self) -> Option<DateTime<Utc>> {
        self.schedule_at
    }

    pub fn dedup(&self) -> &Dedup {
        &self.dedup
    }

    pub fn throw_on_duplicate(&self) -> bool {
        self.throw_on_duplicate
    }

    pub fn custom_handler_url(&self) -> Option<&str> {
        self.custom_handler_url.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptionsBuilder {
    raw_body: Option<String>,
    json_body: Option<Value>,
    form_body: Option<Value>,
    headers: BTreeMap<String, String>,
    query: Vec<(String, String)>,
    schedule_at: Option<DateTime<Utc>>,
    dedup_id: Option<String>,
    dedup_seed: Option<String>,
    throttle_interval: Option<Duration>,
    throttle_delay: Option<Duration>,
    throw_on_duplicate: Option<bool>,
    custom_handler_url: Option<String>,
}

impl DispatchOptionsBuilder {
    pub fn raw_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    pub fn json_body(mut self, body: Value) -> Self {
        self.json_body = Some(body);
        self
    }

    pub fn form_body(mut self, body: Value) -> Self {
        self.form_body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    /// Use `id` verbatim as the task id.
    pub fn dedup_id(mut self, id: impl Into<String>) -> Self {
        self.dedup_id = Some(id.into());
        self
    }

    /// Derive the task id from the SHA-256 of `seed`.
    pub fn dedup_seed(mut self, seed: impl Into<String>) -> Self {
        self.dedup_seed = Some(seed.into());
        self
    }

    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = Some(interval);
        self
    }

    pub fn throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = Some(delay);
        self
    }

    pub fn throw_on_duplicate(mut self, throw: bool) -> Self {
        self.throw_on_duplicate = Some(throw);
        self
    }

    /// Send to this URL instead of the task type's configured handler URL.
    pub fn custom_handler_url(mut self, url: impl Into<String>) -> Self {
        self.custom_handler_url = Some(url.into());
        self
    }

    /// Add the headers the delivery side uses to wait for the dispatching transaction to commit.
    pub fn transaction_marker(mut self, marker: &TransactionMarker) -> Self {
        for (name, value) in marker.headers() {
            self.headers.insert(name.to_string(), value);
        }
        self
    }

    pub fn build(self) -> Result<DispatchOptions> {
        if self.dedup_id.is_some() && self.dedup_seed.is_some() {
            return Err(Error::configuration(
                "cannot specify both an explicit dedup id and a dedup seed",
            ));
        }
        if self.json_body.is_some() && self.form_body.is_some() {
            return Err(Error::configuration(
                "cannot specify both a json body and a form body",
            ));
        }
        if self.raw_body.is_some() && (self.json_body.is_some() || self.form_body.is_some()) {
            return Err(Error::configuration(
                "cannot combine a raw body with a structured body",
            ));
        }
        if self.throttle_delay.is_some() && self.throttle_interval.is_none() {
            return Err(Error::configuration(
                "throttle delay requires a throttle interval",
            ));
        }
        if self.throttle_interval.is_some() {
            if self.dedup_seed.is_none() {
                return Err(Error::configuration(
                    "throttle interval requires a dedup seed",
                ));
            }
            if self.schedule_at.is_some() {
                return Err(Error::configuration(
                    "cannot combine a schedule time with a throttle interval",
                ));
            }
        }

        let throttle = match self.throttle_interval {
            Some(interval) if interval.is_zero() => {
                return Err(Error::configuration("throttle interval must be positive"));
            }
            Some(interval) => Some(Throttle {
                interval,
                delay: self.throttle_delay.unwrap_or(DEFAULT_THROTTLE_DELAY),
            }),
            None => None,
        };

        let dedup = match (self.dedup_id, self.dedup_seed) {
            (Some(id), _) if id.is_empty() => {
                return Err(Error::configuration("dedup id must not be empty"));
            }
            (Some(id), _) => Dedup::Id(id),
            (None, Some(seed)) => Dedup::Seed { seed, throttle },
            (None, None) => Dedup::None,
        };

        let body = match (self.raw_body, self.json_body, self.form_body) {
            (Some(raw), _, _) => TaskBody::Raw(raw),
            (None, Some(json), _) => TaskBody::Json(json),
            (None, None, Some(form)) => TaskBody::Form(form),
            (None, None, None) => TaskBody::Empty,
        };

        Ok(DispatchOptions {
            body,
            headers: self.headers,
            query: self.query,
            schedule_at: self.schedule_at,
            dedup,
            throw_on_duplicate: self.throw_on_duplicate.unwrap_or(true),
            custom_handler_url: self.custom_handler_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn expect_configuration_error(builder: DispatchOptionsBuilder, needle: &str) {
        let err = builder.build().expect_err("options should be rejected");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(
            err.to_string().contains(needle),
            "expected `{needle}` in `{err}`"
        );
    }

    #[test]
    fn defaults_are_empty_and_throw_on_duplicate() {
        let opts = DispatchOptions::builder().build().expect("build");
        assert_eq!(opts.body(), &TaskBody::Empty);
        assert_eq!(opts.dedup(), &Dedup::None);
        assert!(opts.throw_on_duplicate());
        assert!(opts.headers().is_empty());
        assert!(opts.query().is_empty());
        assert_eq!(opts.schedule_at(), None);
    }

    #[test]
    fn throttle_delay_defaults_to_sixty_seconds() {
        let opts = DispatchOptions::builder()
            .dedup_seed("order-42")
            .throttle_interval(Duration::from_secs(300))
            .build()
            .expect("build");
        assert_eq!(
            opts.dedup(),
            &Dedup::Seed {
                seed: "order-42".to_string(),
                throttle: Some(Throttle {
                    interval: Duration::from_secs(300),
                    delay: Duration::from_secs(60),
                }),
            }
        );
    }

    #[test]
    fn rejects_explicit_id_with_seed() {
        expect_configuration_error(
            DispatchOptions::builder().dedup_id("abc").dedup_seed("abc"),
            "both an explicit dedup id and a dedup seed",
        );
    }

    #[test]
    fn rejects_throttle_without_seed() {
        expect_configuration_error(
            DispatchOptions::builder().throttle_interval(Duration::from_secs(60)),
            "throttle interval requires a dedup seed",
        );
        expect_configuration_error(
            DispatchOptions::builder()
                .dedup_id("abc")
                .throttle_interval(Duration::from_secs(60)),
            "throttle interval requires a dedup seed",
        );
    }

    #[test]
    fn rejects_schedule_with_throttle() {
        let at = Utc.with_ymd_and_hms(2020, 12, 7, 11, 0, 0).unwrap();
        expect_configuration_error(
            DispatchOptions::builder()
                .dedup_seed("abc")
                .throttle_interval(Duration::from_secs(60))
                .schedule_at(at),
            "schedule time with a throttle interval",
        );
    }

    #[test]
    fn rejects_throttle_delay_without_interval() {
        expect_configuration_error(
            DispatchOptions::builder()
                .dedup_seed("abc")
                .throttle_delay(Duration::from_secs(30)),
            "throttle delay requires a throttle interval",
        );
    }

    #[test]
    fn rejects_json_and_form_together() {
        expect_configuration_error(
            DispatchOptions::builder()
                .json_body(json!({"a": 1}))
                .form_body(json!({"a": 1})),
            "both a json body and a form body",
        );
    }

    #[test]
    fn rejects_raw_with_structured_body() {
        expect_configuration_error(
            DispatchOptions::builder()
                .raw_body("hello")
                .json_body(json!({"a": 1})),
            "raw body",
        );
    }

    #[test]
    fn rejects_zero_throttle_interval() {
        expect_configuration_error(
            DispatchOptions::builder()
                .dedup_seed("abc")
                .throttle_interval(Duration::ZERO),
            "must be positive",
        );
    }

    #[test]
    fn transaction_marker_adds_both_headers() {
        let expires = Utc.with_ymd_and_hms(2020, 12, 7, 11, 30, 0).unwrap();
        let marker = TransactionMarker::new(uuid::Uuid::nil(), expires);
        let opts = DispatchOptions::builder()
            .header("X-Other", "1")
            .transaction_marker(&marker)
            .build()
            .expect("build");
        assert_eq!(
            opts.headers().get("X-Transaction").map(String::as_str),
            Some("00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(
            opts.headers().get("X-Transaction-Expire").map(String::as_str),
            Some("2020-12-07 11:30:00")
        );
        assert_eq!(opts.headers().get("X-Other").map(String::as_str), Some("1"));
    }
}
