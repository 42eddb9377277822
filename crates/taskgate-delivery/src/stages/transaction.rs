use crate::context::TaskContext;
use crate::pipeline::{Next, Stage, TaskFault, TaskOutcome};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use taskgate_core::{
    marker::{parse_expiry, TRANSACTION_EXPIRE_HEADER, TRANSACTION_MARKER_HEADER},
    ResultCode, TransactionMarkerRepository,
};
use uuid::Uuid;

/// Holds back tasks whose dispatching transaction has not committed yet.
///
/// Tasks without an `X-Transaction` header pass straight through.
pub struct TransactionMarkerStage {
    markers: Arc<dyn TransactionMarkerRepository>,
}

impl std::fmt::Debug for TransactionMarkerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMarkerStage")
            .field("markers", &"<TransactionMarkerRepository>")
            .finish()
    }
}

impl TransactionMarkerStage {
    pub fn new(markers: Arc<dyn TransactionMarkerRepository>) -> Self {
        Self { markers }
    }
}

#[async_trait]
impl Stage for TransactionMarkerStage {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
        let Some(raw_marker) = ctx.header(TRANSACTION_MARKER_HEADER) else {
            return next.run(ctx).await;
        };
        let Ok(marker) = Uuid::parse_str(raw_marker.trim()) else {
            return Ok(ResultCode::cannot_be_valid(format!(
                "`{TRANSACTION_MARKER_HEADER}` is not a uuid: `{raw_marker}`"
            )));
        };

        let visible = self
            .markers
            .exists(marker)
            .await
            .map_err(|err| TaskFault::Unexpected(err.context("look up transaction marker")))?;
        if visible {
            return next.run(ctx).await;
        }

        let Some(expiry) = ctx.header(TRANSACTION_EXPIRE_HEADER).and_then(parse_expiry) else {
            return Ok(ResultCode::cannot_be_valid(format!(
                "`{TRANSACTION_EXPIRE_HEADER}` missing or malformed for transaction {marker}"
            )));
        };
        if Utc::now() < expiry {
            Ok(ResultCode::not_yet_visible(marker, expiry))
        } else {
            Ok(ResultCode::transaction_expired(marker, expiry))
        }
    }
}
