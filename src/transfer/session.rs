//! Download sessions
//!
//! A session owns the connections it leased for one byte stream. It keeps up
//! to `pipeline_depth` requests in flight per connection, parks completed
//! chunks until every earlier chunk has been handed over, and stops
//! dispatching while in-flight plus parked chunks reach the buffer cap.
//! Everything it holds is released when the task ends, however it ends.

use super::plan::{ChunkPlan, ChunkRequest};
use super::TransferSettings;
use crate::error::{Error, Result};
use crate::telegram::{
    ConnectionPool, ExponentialBackoff, FileHandle, PartitionConnection, PooledConnection,
    UpstreamError,
};

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A leased connection and its in-flight request count
struct Lane {
    lease: PooledConnection,
    conn: Arc<dyn PartitionConnection>,
    in_flight: usize,
}

impl Lane {
    fn new(lease: PooledConnection) -> Self {
        let conn = lease.handle();
        Lane {
            lease,
            conn,
            in_flight: 0,
        }
    }
}

/// Outcome of one chunk request
struct Completion {
    lane: usize,
    index: usize,
    result: std::result::Result<Bytes, UpstreamError>,
}

pub(super) struct DownloadSession {
    id: Uuid,
    pool: Arc<ConnectionPool>,
    settings: Arc<TransferSettings>,
    handle: FileHandle,
    plan: ChunkPlan,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Bytes>>,
}

impl DownloadSession {
    pub(super) fn new(
        pool: Arc<ConnectionPool>,
        settings: Arc<TransferSettings>,
        handle: FileHandle,
        plan: ChunkPlan,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<Bytes>>,
    ) -> Self {
        DownloadSession {
            id: Uuid::new_v4(),
            pool,
            settings,
            handle,
            plan,
            cancel,
            tx,
        }
    }

    pub(super) fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session to completion
    pub(super) async fn run(self) {
        match self.drive().await {
            Ok(delivered) => {
                debug!(session = %self.id, bytes = delivered, "Download finished");
            }
            Err(Error::Cancelled) => {
                debug!(session = %self.id, "Download cancelled");
            }
            Err(e) => {
                warn!(session = %self.id, file = %self.handle.file_name, "Download failed: {}", e);
                // The consumer may already be gone
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn drive(&self) -> Result<u64> {
        let total = self.plan.len();
        let mut lanes = self.lease_lanes(total).await?;
        debug!(
            session = %self.id,
            chunks = total,
            connections = lanes.len(),
            partition = self.handle.partition,
            "Download started"
        );

        let mut in_flight = FuturesUnordered::new();
        let mut parked: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut next_dispatch = 0;
        let mut next_deliver = 0;
        let mut delivered = 0u64;

        while next_deliver < total {
            while next_dispatch < total
                && in_flight.len() + parked.len() < self.settings.max_buffered_chunks
            {
                let Some(lane) = self.pick_lane(&lanes) else { break };
                let Some(request) = self.plan.get(next_dispatch) else { break };

                lanes[lane].in_flight += 1;
                in_flight.push(self.fetch(lane, lanes[lane].conn.clone(), request));
                next_dispatch += 1;
            }

            let deliverable = parked.contains_key(&next_deliver);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(Error::Cancelled),

                permit = self.tx.reserve(), if deliverable => {
                    let permit = permit.map_err(|_| Error::Cancelled)?;
                    if let Some(bytes) = parked.remove(&next_deliver) {
                        delivered += bytes.len() as u64;
                        permit.send(Ok(bytes));
                    }
                    next_deliver += 1;
                }

                Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                    let lane = &mut lanes[done.lane];
                    lane.in_flight -= 1;

                    match done.result {
                        Ok(bytes) => {
                            parked.insert(done.index, bytes);
                        }
                        Err(e) => {
                            if e.is_retryable() {
                                lane.lease.mark_broken();
                            }
                            return Err(Error::Upstream(e));
                        }
                    }
                }
            }
        }

        Ok(delivered)
    }

    /// One connection that may wait, plus extras only if free right now
    async fn lease_lanes(&self, total: usize) -> Result<Vec<Lane>> {
        let partition = self.handle.partition;
        let depth = self.settings.pipeline_depth.max(1);
        let wanted = self
            .settings
            .connections_per_session
            .min(total.div_ceil(depth))
            .min(self.settings.max_buffered_chunks.div_ceil(depth))
            .max(1);

        let first = self.pool.acquire(partition, &self.cancel).await?;
        let mut lanes = vec![Lane::new(first)];

        while lanes.len() < wanted {
            let extra = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                extra = self.pool.try_acquire(partition) => extra,
            };

            match extra {
                Ok(Some(lease)) => lanes.push(Lane::new(lease)),
                Ok(None) => break,
                Err(e) => {
                    debug!(session = %self.id, "Not widening download: {}", e);
                    break;
                }
            }
        }

        Ok(lanes)
    }

    /// Least busy connection with room in its pipeline
    fn pick_lane(&self, lanes: &[Lane]) -> Option<usize> {
        lanes
            .iter()
            .enumerate()
            .filter(|(_, lane)| lane.in_flight < self.settings.pipeline_depth)
            .min_by_key(|(_, lane)| lane.in_flight)
            .map(|(i, _)| i)
    }

    /// Fetch and trim one chunk, retrying transient failures
    async fn fetch(
        &self,
        lane: usize,
        conn: Arc<dyn PartitionConnection>,
        request: ChunkRequest,
    ) -> Completion {
        let mut backoff = ExponentialBackoff::new(
            self.settings.retry_base_delay_ms,
            self.settings.retry_attempts,
        );

        loop {
            let result = self.fetch_once(conn.as_ref(), &request).await;

            match result {
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            session = %self.id,
                            chunk = request.index,
                            "Chunk failed, retrying in {:?}: {}",
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Completion {
                            lane,
                            index: request.index,
                            result: Err(e),
                        }
                    }
                },
                result => {
                    return Completion {
                        lane,
                        index: request.index,
                        result,
                    }
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        conn: &dyn PartitionConnection,
        request: &ChunkRequest,
    ) -> std::result::Result<Bytes, UpstreamError> {
        let fetch = conn.fetch_chunk(&self.handle.location, request.offset, request.length);

        let data = match tokio::time::timeout(self.settings.chunk_timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(UpstreamError::Transient(format!(
                    "chunk at {} timed out after {:?}",
                    request.offset, self.settings.chunk_timeout
                )))
            }
        };

        let got = data.len();
        request.trim(data).ok_or_else(|| {
            UpstreamError::Transient(format!(
                "short chunk at {}: got {} bytes, need {}",
                request.offset,
                got,
                request.skip + request.take
            ))
        })
    }
}
