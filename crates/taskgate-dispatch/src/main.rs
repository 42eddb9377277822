use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use taskgate_core::{marker::TransactionMarker, DispatchOptions, TaskTypeRegistry};
use taskgate_dispatch::{
    cloud_tasks::{
        AccessTokenSource, CloudTasksClient, MetadataServerToken, StaticAccessToken,
        DEFAULT_API_BASE_URL,
    },
    DispatchRequestBuilder, TaskCreator,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskgate-dispatch")]
#[command(about = "Create push tasks from the command line", long_about = None)]
struct Cli {
    /// Task type definitions (YAML).
    #[arg(long, env = "TASK_TYPES_PATH", default_value = "task_types.yaml", global = true)]
    task_types: PathBuf,

    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Subcommand, Debug)]
enum CommandKind {
    /// Submit a task to the queue service.
    Create {
        #[command(flatten)]
        task: TaskArgs,

        /// OAuth access token; falls back to the metadata server when unset.
        #[arg(long, env = "CLOUD_TASKS_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,

        #[arg(long, env = "CLOUD_TASKS_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
        api_base_url: String,
    },

    /// Print the request that `create` would submit, without contacting the queue.
    Plan {
        #[command(flatten)]
        task: TaskArgs,
    },
}

#[derive(Args, Debug)]
struct TaskArgs {
    task_type: String,

    #[arg(long, conflicts_with_all = ["form_body", "raw_body"])]
    json_body: Option<String>,

    #[arg(long, conflicts_with = "raw_body")]
    form_body: Option<String>,

    #[arg(long)]
    raw_body: Option<String>,

    /// `Name=value`; repeatable.
    #[arg(long = "header", value_parser = parse_pair)]
    headers: Vec<(String, String)>,

    /// `name=value` appended to the handler URL; repeatable.
    #[arg(long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,

    /// RFC 3339 timestamp.
    #[arg(long)]
    schedule_at: Option<DateTime<Utc>>,

    #[arg(long)]
    dedup_id: Option<String>,

    #[arg(long)]
    dedup_seed: Option<String>,

    #[arg(long)]
    throttle_interval_secs: Option<u64>,

    #[arg(long)]
    throttle_delay_secs: Option<u64>,

    /// Treat an existing task with the same name as success.
    #[arg(long)]
    allow_duplicate: bool,

    #[arg(long)]
    handler_url: Option<String>,

    /// Attach a freshly generated transaction marker valid for this many seconds.
    #[arg(long)]
    transaction_marker_ttl_secs: Option<i64>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got `{s}`")),
    }
}

impl TaskArgs {
    fn options(&self, now: DateTime<Utc>) -> anyhow::Result<DispatchOptions> {
        let mut builder = DispatchOptions::builder();
        if let Some(json) = &self.json_body {
            builder = builder.json_body(serde_json::from_str(json).context("parse --json-body")?);
        }
        if let Some(form) = &self.form_body {
            builder = builder.form_body(serde_json::from_str(form).context("parse --form-body")?);
        }
        if let Some(raw) = &self.raw_body {
            builder = builder.raw_body(raw.clone());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        for (name, value) in &self.query {
            builder = builder.query_param(name.clone(), value.clone());
        }
        if let Some(at) = self.schedule_at {
            builder = builder.schedule_at(at);
        }
        if let Some(id) = &self.dedup_id {
            builder = builder.dedup_id(id.clone());
        }
        if let Some(seed) = &self.dedup_seed {
            builder = builder.dedup_seed(seed.clone());
        }
        if let Some(secs) = self.throttle_interval_secs {
            builder = builder.throttle_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.throttle_delay_secs {
            builder = builder.throttle_delay(Duration::from_secs(secs));
        }
        if let Some(url) = &self.handler_url {
            builder = builder.custom_handler_url(url.clone());
        }
        if let Some(ttl) = self.transaction_marker_ttl_secs {
            let ttl = chrono::Duration::try_seconds(ttl)
                .ok_or_else(|| anyhow::anyhow!("--transaction-marker-ttl-secs is out of range"))?;
            let marker = TransactionMarker::generate(now, ttl)?;
            builder = builder.transaction_marker(&marker);
        }
        Ok(builder.throw_on_duplicate(!self.allow_duplicate).build()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,taskgate_dispatch=debug")),
        )
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(
        TaskTypeRegistry::from_yaml_file(&cli.task_types).context("load task types")?,
    );
    let now = Utc::now();

    match cli.command {
        CommandKind::Create {
            task,
            access_token,
            api_base_url,
        } => {
            let token: Arc<dyn AccessTokenSource> = match access_token {
                Some(token) => Arc::new(StaticAccessToken::new(token)),
                None => Arc::new(MetadataServerToken::new(reqwest::Client::new())),
            };
            let client = CloudTasksClient::new(token)?.with_api_base_url(api_base_url);
            let creator = TaskCreator::new(registry, Arc::new(client));

            let handle = creator
                .create_at(&task.task_type, task.options(now)?, now)
                .await?;
            println!(
                "task_name={} deduplicated={}",
                handle.name, handle.deduplicated
            );
        }
        CommandKind::Plan { task } => {
            let request = DispatchRequestBuilder::new(registry).build(
                &task.task_type,
                &task.options(now)?,
                now,
            )?;
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
    }
    Ok(())
}
