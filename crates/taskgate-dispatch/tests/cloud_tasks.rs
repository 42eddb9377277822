use anyhow::Context;
use mockito::Matcher;
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use taskgate_core::{DispatchRequest, RetryPolicy, RpcCode, TaskQueueClient};
use taskgate_dispatch::cloud_tasks::{
    AccessTokenSource, CloudTasksClient, MetadataServerToken, StaticAccessToken,
};

const QUEUE: &str = "projects/p/locations/l/queues/q";

fn request(name: Option<&str>) -> DispatchRequest {
    DispatchRequest {
        task_type: "send-invoice".to_string(),
        queue_path: QUEUE.to_string(),
        name: name.map(str::to_string),
        url: "https://app.example.com/_do_task/send-invoice".to_string(),
        headers: BTreeMap::new(),
        body: None,
        signing: None,
        schedule_at: None,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_retry_delay_ms: 1,
        max_retry_delay_ms: 5,
        total_timeout_ms: 2_000,
        ..RetryPolicy::default()
    }
}

fn client(server: &mockito::ServerGuard) -> anyhow::Result<CloudTasksClient> {
    Ok(
        CloudTasksClient::new(Arc::new(StaticAccessToken::new("test-token")))?
            .with_api_base_url(server.url()),
    )
}

#[tokio::test]
async fn posts_task_with_bearer_token() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", format!("/v2/{QUEUE}/tasks").as_str())
        .match_header("authorization", "Bearer test-token")
        .match_body(Matcher::PartialJson(json!({
            "task": {
                "name": format!("{QUEUE}/tasks/abc"),
                "httpRequest": {
                    "url": "https://app.example.com/_do_task/send-invoice",
                    "httpMethod": "POST"
                }
            }
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"name": format!("{QUEUE}/tasks/abc")}).to_string())
        .create_async()
        .await;

    let created = client(&server)?
        .create_task(&request(Some(&format!("{QUEUE}/tasks/abc"))), &fast_retry())
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))
        .context("create task")?;

    anyhow::ensure!(created.name == format!("{QUEUE}/tasks/abc"));
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn already_exists_is_reported_without_retry() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", format!("/v2/{QUEUE}/tasks").as_str())
        .with_status(409)
        .with_body(
            json!({"error": {"code": 409, "message": "Requested entity already exists", "status": "ALREADY_EXISTS"}})
                .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let err = client(&server)?
        .create_task(&request(Some(&format!("{QUEUE}/tasks/abc"))), &fast_retry())
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected already exists"))?;

    anyhow::ensure!(err.code == RpcCode::AlreadyExists, "got {err}");
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn unavailable_is_retried_until_success() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("POST", format!("/v2/{QUEUE}/tasks").as_str())
        .with_status(503)
        .with_body(
            json!({"error": {"code": 503, "message": "try again", "status": "UNAVAILABLE"}})
                .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    // Two failures, then mockito falls through to the next matching mock.
    let ok = server
        .mock("POST", format!("/v2/{QUEUE}/tasks").as_str())
        .with_status(200)
        .with_body(json!({"name": format!("{QUEUE}/tasks/generated")}).to_string())
        .create_async()
        .await;

    let created = client(&server)?
        .create_task(&request(None), &fast_retry())
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    anyhow::ensure!(created.name.ends_with("/tasks/generated"));
    failing.assert_async().await;
    ok.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn retries_disabled_fails_fast() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", format!("/v2/{QUEUE}/tasks").as_str())
        .with_status(503)
        .with_body("unavailable")
        .expect(1)
        .create_async()
        .await;

    let err = client(&server)?
        .create_task(&request(None), &RetryPolicy::disabled())
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;

    anyhow::ensure!(err.code == RpcCode::Unavailable, "got {err}");
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn metadata_token_is_fetched_once_and_cached() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let metadata = server
        .mock("GET", "/token")
        .match_header("metadata-flavor", "Google")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"access_token": "meta-token", "expires_in": 3600}).to_string())
        .expect(1)
        .create_async()
        .await;
    let tasks = server
        .mock("POST", format!("/v2/{QUEUE}/tasks").as_str())
        .match_header("authorization", "Bearer meta-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"name": format!("{QUEUE}/tasks/abc")}).to_string())
        .expect(2)
        .create_async()
        .await;

    let source = Arc::new(
        MetadataServerToken::new(reqwest::Client::new())
            .with_url(format!("{}/token", server.url())),
    );
    anyhow::ensure!(source.access_token().await? == "meta-token");

    let client = CloudTasksClient::new(source)?.with_api_base_url(server.url());
    for _ in 0..2 {
        client
            .create_task(&request(None), &fast_retry())
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))
            .context("create task")?;
    }

    metadata.assert_async().await;
    tasks.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn metadata_server_failure_is_an_error() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/token")
        .with_status(500)
        .with_body("metadata unavailable")
        .create_async()
        .await;

    let source = MetadataServerToken::new(reqwest::Client::new())
        .with_url(format!("{}/token", server.url()));
    let err = source.access_token().await.unwrap_err();
    anyhow::ensure!(err.to_string().contains("500"), "got {err}");
    mock.assert_async().await;
    Ok(())
}
