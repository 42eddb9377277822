use crate::TransactionMarkerRepository;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// Schema for [`PgTransactionMarkers`].
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionMarkers {
    markers: Arc<Mutex<HashSet<Uuid>>>,
}

impl InMemoryTransactionMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, marker: Uuid) {
        match self.markers.lock() {
            Ok(mut markers) => markers.insert(marker),
            Err(poisoned) => poisoned.into_inner().insert(marker),
        };
    }
}

#[async_trait]
impl TransactionMarkerRepository for InMemoryTransactionMarkers {
    async fn exists(&self, marker: Uuid) -> anyhow::Result<bool> {
        let markers = self
            .markers
            .lock()
            .map_err(|_| anyhow::anyhow!("transaction marker set poisoned"))?;
        Ok(markers.contains(&marker))
    }
}

/// Markers stored in `taskgate.transaction_markers (marker_id uuid primary key, created_at
/// timestamptz not null default now())`.
#[derive(Debug, Clone)]
pub struct PgTransactionMarkers {
    pool: PgPool,
}

impl PgTransactionMarkers {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write `marker` through `executor`, normally the application's open transaction so the
    /// marker only becomes visible when that transaction commits.
    pub async fn record<'e>(executor: impl PgExecutor<'e>, marker: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO taskgate.transaction_markers (marker_id)
            VALUES ($1)
            ON CONFLICT (marker_id) DO NOTHING
            "#,
        )
        .bind(marker)
        .execute(executor)
        .await
        .context("insert transaction marker")?;

        Ok(())
    }

    /// Remove markers older than `max_age`; markers are only read until their expiry passes.
    pub async fn prune_older_than(&self, max_age: chrono::Duration) -> anyhow::Result<u64> {
        let cutoff = chrono::Utc::now() - max_age;
        let res = sqlx::query(
            r#"
            DELETE FROM taskgate.transaction_markers
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("prune transaction markers")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl TransactionMarkerRepository for PgTransactionMarkers {
    async fn exists(&self, marker: Uuid) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
              SELECT 1 FROM taskgate.transaction_markers WHERE marker_id = $1
            )
            "#,
        )
        .bind(marker)
        .fetch_one(&self.pool)
        .await
        .context("query transaction marker")?;

        Ok(exists)
    }
}
