//! Transfer engine
//!
//! Turns a remote file handle plus a byte window into an ordered byte
//! stream. Each stream is backed by a download session: a spawned task that
//! leases connections from the pool, keeps several chunk requests in flight
//! and hands chunks to the stream in offset order.

mod plan;
mod session;

pub use plan::{ChunkLayout, ChunkPlan, ChunkRequest};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::telegram::{ConnectionPool, FileHandle};
use session::DownloadSession;

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Transfer tuning
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub layout: ChunkLayout,
    /// Requests in flight per connection
    pub pipeline_depth: usize,
    /// Connections one session may hold
    pub connections_per_session: usize,
    /// Cap on in-flight plus buffered chunks per session
    pub max_buffered_chunks: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Timeout for a single chunk request
    pub chunk_timeout: Duration,
}

impl From<&TransferConfig> for TransferSettings {
    fn from(config: &TransferConfig) -> Self {
        TransferSettings {
            layout: ChunkLayout::from(config),
            pipeline_depth: config.pipeline_depth,
            connections_per_session: config.connections_per_session,
            max_buffered_chunks: config.max_buffered_chunks,
            retry_attempts: config.retry_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
            chunk_timeout: config.chunk_timeout(),
        }
    }
}

/// Opens byte streams over pooled connections
pub struct TransferEngine {
    pool: Arc<ConnectionPool>,
    settings: Arc<TransferSettings>,
}

impl TransferEngine {
    pub fn new(pool: Arc<ConnectionPool>, settings: TransferSettings) -> Self {
        TransferEngine {
            pool,
            settings: Arc::new(settings),
        }
    }

    /// The pool sessions lease connections from
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Stream bytes `[offset, limit)` of `handle`
    ///
    /// Requires `offset < limit <= handle.size`. Nothing is fetched until the
    /// stream is polled for the first time after the session task starts;
    /// dropping the stream cancels the session.
    pub fn open_stream(&self, handle: FileHandle, offset: u64, limit: u64) -> Result<ByteStream> {
        if offset >= limit || limit > handle.size {
            return Err(Error::InvalidRange {
                offset,
                limit,
                size: handle.size,
            });
        }
        if self.pool.is_closed() {
            return Err(Error::PoolClosed);
        }

        let plan = ChunkPlan::new(offset, limit, self.settings.layout);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);

        let session = DownloadSession::new(
            self.pool.clone(),
            self.settings.clone(),
            handle,
            plan,
            cancel.clone(),
            tx,
        );
        debug!(
            session = %session.id(),
            offset,
            limit,
            "Opening download stream"
        );
        tokio::spawn(session.run());

        Ok(ByteStream {
            rx,
            remaining: limit - offset,
            finished: false,
            _cancel: cancel.drop_guard(),
        })
    }
}

/// Ordered bytes of one download
///
/// Yields exactly the requested number of bytes, or an error. Once it has
/// ended it keeps returning `None`.
pub struct ByteStream {
    rx: mpsc::Receiver<Result<Bytes>>,
    remaining: u64,
    finished: bool,
    _cancel: DropGuard,
}

impl ByteStream {
    /// Bytes not yet yielded
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let item = match self.rx.poll_recv(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };

        match item {
            Some(Ok(bytes)) => {
                self.remaining = self.remaining.saturating_sub(bytes.len() as u64);
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.finished = true;
                if self.remaining > 0 {
                    let missing = self.remaining;
                    Poll::Ready(Some(Err(Error::Internal(format!(
                        "download ended {} bytes short",
                        missing
                    )))))
                } else {
                    Poll::Ready(None)
                }
            }
        }
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("remaining", &self.remaining)
            .field("finished", &self.finished)
            .finish()
    }
}
