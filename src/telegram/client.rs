//! Metadata facade over the injected message store
//!
//! Wraps every lookup in the retry loop so transient upstream failures
//! (flood waits, dropped requests) never reach the HTTP layer.

use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::locator::ResourceIdentity;
use crate::telegram::retry::ExponentialBackoff;
use crate::telegram::{BotProfile, FileHandle, MessageStore, UpstreamError};

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Retrying access to message metadata
#[derive(Clone)]
pub struct TelegramBackend {
    store: Arc<dyn MessageStore>,
    retry_attempts: u32,
    retry_base_delay_ms: u64,
}

impl TelegramBackend {
    /// Create a new backend over `store`
    pub fn new(store: Arc<dyn MessageStore>, config: &TelegramConfig) -> Self {
        TelegramBackend {
            store,
            retry_attempts: config.retry_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
        }
    }

    /// Resolve the file attached to a message
    pub async fn resolve_file(&self, identity: &ResourceIdentity) -> Result<FileHandle> {
        let handle = self
            .with_retry("resolve_file", || self.store.resolve_file(identity))
            .await?;

        debug!(
            "Resolved {} to {} ({} bytes, partition {})",
            identity, handle.file_name, handle.size, handle.partition
        );
        Ok(handle)
    }

    /// Delete a message
    pub async fn delete_message(&self, identity: &ResourceIdentity) -> Result<()> {
        self.with_retry("delete_message", || self.store.delete_message(identity))
            .await?;

        debug!("Deleted {}", identity);
        Ok(())
    }

    /// Profile of the serving account
    pub async fn describe_self(&self) -> Result<BotProfile> {
        self.with_retry("describe_self", || self.store.describe_self())
            .await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let mut backoff = ExponentialBackoff::new(self.retry_base_delay_ms, self.retry_attempts);

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if let Some(delay) = backoff.next_delay() {
                        warn!("{} failed, retrying in {:?}: {}", op, delay, e);
                        tokio::time::sleep(delay).await;
                    } else {
                        error!("{} failed after max retries: {}", op, e);
                        return Err(Error::Upstream(e));
                    }
                }
                Err(e) => return Err(Error::Upstream(e)),
            }
        }
    }
}
