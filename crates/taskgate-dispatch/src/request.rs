use crate::encoding::{append_query, encode_form, encode_query};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use taskgate_core::{
    identity::resolve_identity, task_name, DispatchOptions, DispatchRequest, Result,
    SigningDescriptor, TaskBody, TaskSigner, TaskTypeConfig, TaskTypeRegistry,
};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// Turns a task type and [`DispatchOptions`] into the canonical outbound request.
///
/// Pure apart from the registry lookup; the caller supplies `now`.
#[derive(Debug, Clone)]
pub struct DispatchRequestBuilder {
    registry: Arc<TaskTypeRegistry>,
}

impl DispatchRequestBuilder {
    pub fn new(registry: Arc<TaskTypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TaskTypeRegistry {
        &self.registry
    }

    pub fn build(
        &self,
        task_type: &str,
        options: &DispatchOptions,
        now: DateTime<Utc>,
    ) -> Result<DispatchRequest> {
        let config = self.registry.get(task_type)?;
        build_request(config, options, now)
    }
}

pub fn build_request(
    config: &TaskTypeConfig,
    options: &DispatchOptions,
    now: DateTime<Utc>,
) -> Result<DispatchRequest> {
    let identity = resolve_identity(options, now)?;
    let queue_path = config.queue_path();

    let base_url = options
        .custom_handler_url()
        .unwrap_or(config.handler_url.as_str());
    let url = append_query(base_url, &encode_query(options.query()));

    let mut headers = options.headers().clone();
    let body = match options.body() {
        TaskBody::Empty => None,
        TaskBody::Raw(raw) if raw.is_empty() => None,
        TaskBody::Raw(raw) => Some(raw.clone().into_bytes()),
        TaskBody::Json(value) => {
            default_content_type(&mut headers, CONTENT_TYPE_JSON);
            Some(serde_json::to_vec(value).context("encode json task body")?)
        }
        TaskBody::Form(value) => {
            default_content_type(&mut headers, CONTENT_TYPE_FORM);
            Some(encode_form(value)?.into_bytes())
        }
    };

    let signing = match &config.signer {
        TaskSigner::Anonymous => None,
        TaskSigner::ServiceAccount(email) => Some(SigningDescriptor {
            service_account_email: email.clone(),
            audience: config.custom_token_audience.clone(),
        }),
    };

    Ok(DispatchRequest {
        task_type: config.task_type.clone(),
        name: identity
            .dedup_id
            .as_deref()
            .map(|id| task_name(&queue_path, id)),
        queue_path,
        url,
        headers,
        body,
        signing,
        schedule_at: options.schedule_at().or(identity.schedule_at),
    })
}

fn default_content_type(headers: &mut BTreeMap<String, String>, value: &str) {
    let present = headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("content-type"));
    if !present {
        headers.insert("Content-Type".to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    const TASK_TYPES: &str = r#"
_default:
  signer_email: tasks@my-project.iam.gserviceaccount.com
  handler_url: https://app.example.com/_do_task/{TASK_TYPE}
  queue: { project: my-project, location: europe-west1, name: default }
send-invoice: {}
public-ping:
  signer_email: anonymous
  handler_url: https://app.example.com/ping?from=queue
custom-audience:
  custom_token_audience: https://app.example.com
"#;

    fn builder() -> DispatchRequestBuilder {
        let registry = TaskTypeRegistry::from_yaml_str(TASK_TYPES).expect("registry");
        DispatchRequestBuilder::new(Arc::new(registry))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 12, 7, 11, 3, 30).unwrap()
    }

    #[test]
    fn json_body_gets_content_type_and_signing() {
        let options = DispatchOptions::builder()
            .json_body(json!({"foo": "bar"}))
            .build()
            .unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();

        assert_eq!(request.url, "https://app.example.com/_do_task/send-invoice");
        assert_eq!(
            request.queue_path,
            "projects/my-project/locations/europe-west1/queues/default"
        );
        assert_eq!(request.body.as_deref(), Some(br#"{"foo":"bar"}"#.as_slice()));
        assert_eq!(
            request.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(
            request.signing,
            Some(SigningDescriptor {
                service_account_email: "tasks@my-project.iam.gserviceaccount.com".to_string(),
                audience: None,
            })
        );
        assert_eq!(request.name, None);
        assert_eq!(request.schedule_at, None);
    }

    #[test]
    fn caller_content_type_wins_case_insensitively() {
        let options = DispatchOptions::builder()
            .json_body(json!({"foo": "bar"}))
            .header("content-type", "application/vnd.custom+json")
            .build()
            .unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();
        assert_eq!(request.headers.len(), 1);
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/vnd.custom+json")
        );
    }

    #[test]
    fn form_body_is_bracket_encoded() {
        let options = DispatchOptions::builder()
            .form_body(json!({"foo": "bar", "child": {"any": "thing"}}))
            .build()
            .unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();
        assert_eq!(
            request.body.as_deref(),
            Some(b"child%5Bany%5D=thing&foo=bar".as_slice())
        );
        assert_eq!(
            request.headers.get("Content-Type").map(String::as_str),
            Some(CONTENT_TYPE_FORM)
        );
    }

    #[test]
    fn raw_body_has_no_default_content_type() {
        let options = DispatchOptions::builder().raw_body("hello").build().unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();
        assert_eq!(request.body.as_deref(), Some(b"hello".as_slice()));
        assert!(request.headers.is_empty());
    }

    #[test]
    fn query_is_appended_to_configured_or_custom_url() {
        let options = DispatchOptions::builder()
            .query_param("id", "15")
            .build()
            .unwrap();
        let request = builder().build("public-ping", &options, now()).unwrap();
        assert_eq!(request.url, "https://app.example.com/ping?from=queue&id=15");
        assert_eq!(request.signing, None);

        let options = DispatchOptions::builder()
            .custom_handler_url("https://other.example.com/hook")
            .query_param("id", "15")
            .build()
            .unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();
        assert_eq!(request.url, "https://other.example.com/hook?id=15");
    }

    #[test]
    fn custom_audience_is_carried() {
        let options = DispatchOptions::builder().build().unwrap();
        let request = builder().build("custom-audience", &options, now()).unwrap();
        assert_eq!(
            request.signing.and_then(|s| s.audience).as_deref(),
            Some("https://app.example.com")
        );
    }

    #[test]
    fn throttle_sets_schedule_and_deterministic_name() {
        let options = DispatchOptions::builder()
            .dedup_seed("order-42")
            .throttle_interval(Duration::from_secs(300))
            .build()
            .unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();
        assert_eq!(
            request.schedule_at,
            Some(Utc.with_ymd_and_hms(2020, 12, 7, 11, 6, 0).unwrap())
        );
        assert_eq!(
            request.name.as_deref(),
            Some(
                "projects/my-project/locations/europe-west1/queues/default/tasks/\
                 d2c93e2989473033cd0378de5b96b3b0e9da4b013cf9d86a4997b69be7177b98"
            )
        );
    }

    #[test]
    fn explicit_schedule_is_passed_through() {
        let at = Utc.with_ymd_and_hms(2020, 12, 8, 9, 0, 0).unwrap();
        let options = DispatchOptions::builder()
            .schedule_at(at)
            .dedup_id("invoice-15")
            .build()
            .unwrap();
        let request = builder().build("send-invoice", &options, now()).unwrap();
        assert_eq!(request.schedule_at, Some(at));
        assert_eq!(
            request.name.as_deref(),
            Some("projects/my-project/locations/europe-west1/queues/default/tasks/invoice-15")
        );
    }

    #[test]
    fn unknown_task_type_is_configuration_error() {
        let options = DispatchOptions::builder().build().unwrap();
        let err = builder().build("nope", &options, now()).unwrap_err();
        assert!(err.is_configuration());
    }
}
