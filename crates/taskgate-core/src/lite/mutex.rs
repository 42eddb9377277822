use crate::{MutexError, MutexLease, TaskMutex};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

/// Process-local named locks. Only serializes deliveries that land on the same process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMutex {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl Inner {
    fn try_lock(&self, name: &str) -> bool {
        match self.held.lock() {
            Ok(mut held) => held.insert(name.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(name.to_string()),
        }
    }

    fn unlock(&self, name: &str) {
        match self.held.lock() {
            Ok(mut held) => held.remove(name),
            Err(poisoned) => poisoned.into_inner().remove(name),
        };
        self.released.notify_waiters();
    }
}

impl InMemoryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        match self.inner.held.lock() {
            Ok(held) => held.contains(name),
            Err(poisoned) => poisoned.into_inner().contains(name),
        }
    }
}

#[async_trait]
impl TaskMutex for InMemoryMutex {
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn MutexLease>, MutexError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a release between the check and the wait is
            // not missed.
            let released = self.inner.released.notified();
            if self.inner.try_lock(name) {
                return Ok(Box::new(InMemoryLease {
                    inner: self.inner.clone(),
                    name: name.to_string(),
                }));
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(MutexError::TimedOut {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
        }
    }
}

struct InMemoryLease {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        self.inner.unlock(&self.name);
    }
}

#[async_trait]
impl MutexLease for InMemoryLease {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        drop(self);
        Ok(())
    }
}
