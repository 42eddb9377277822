use crate::context::TaskContext;
use crate::pipeline::{Next, Stage, TaskOutcome};
use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use taskgate_core::ResultCode;

/// Decodes `application/json` bodies onto the context. Other content types pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyParsingStage;

#[async_trait]
impl Stage for BodyParsingStage {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
        if is_json(ctx) {
            match serde_json::from_slice(ctx.body()) {
                Ok(value) => ctx.set_json_body(value),
                Err(err) => {
                    return Ok(ResultCode::cannot_be_valid("Could not decode JSON body")
                        .with_error(anyhow::Error::from(err)));
                }
            }
        }
        next.run(ctx).await
    }
}

fn is_json(ctx: &TaskContext) -> bool {
    ctx.header(CONTENT_TYPE.as_str())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}
