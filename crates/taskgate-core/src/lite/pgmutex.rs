use crate::{MutexError, MutexLease, TaskMutex};
use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{pool::PoolConnection, PgPool, Postgres};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Named locks on Postgres session-level advisory locks, shared by every process that talks to
/// the same database.
///
/// A lease pins one pooled connection for as long as the lock is held.
#[derive(Debug, Clone)]
pub struct PgAdvisoryMutex {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgAdvisoryMutex {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Advisory lock key for a lock name: the first 8 bytes of its SHA-256.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[async_trait]
impl TaskMutex for PgAdvisoryMutex {
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn MutexLease>, MutexError> {
        let deadline = Instant::now() + timeout;
        let key = advisory_key(name);

        let mut conn = tokio::time::timeout_at(deadline, self.pool.acquire())
            .await
            .map_err(|_| MutexError::TimedOut {
                name: name.to_string(),
                waited: timeout,
            })?
            .context("acquire connection for advisory lock")
            .map_err(MutexError::Backend)?;

        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await
                .with_context(|| format!("pg_try_advisory_lock for {name}"))
                .map_err(MutexError::Backend)?;

            if locked {
                return Ok(Box::new(PgAdvisoryLease {
                    conn: Some(conn),
                    key,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MutexError::TimedOut {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

struct PgAdvisoryLease {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl Drop for PgAdvisoryLease {
    fn drop(&mut self) {
        // Not released explicitly (e.g. the holder panicked): close the session instead of
        // returning a connection that still holds the lock to the pool.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl MutexLease for PgAdvisoryLease {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let mut lease = self;
        let Some(mut conn) = lease.conn.take() else {
            return Ok(());
        };
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lease.key)
            .fetch_one(&mut *conn)
            .await;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                drop(conn.detach());
                anyhow::bail!("advisory lock {} was not held", lease.key)
            }
            Err(err) => {
                drop(conn.detach());
                Err(anyhow::Error::from(err).context("pg_advisory_unlock"))
            }
        }
    }
}
