//! In-memory message store and protocol client for tests
//!
//! Holds files in memory, enforces the upstream chunking rules on every
//! fetch and counts what the code under test asked for.

use crate::locator::ResourceIdentity;
use crate::telegram::{
    BotProfile, ExportedAuthorization, FileHandle, LocationKind, MessageStore,
    PartitionConnection, PartitionId, ProtocolClient, RemoteLocation, UpstreamError,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Partition the fake session is logged in to
pub const HOME_PARTITION: PartitionId = 2;

const BLOCK_SIZE: u64 = 4 * 1024;
const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

struct StoredFile {
    handle: FileHandle,
    data: Bytes,
}

#[derive(Default)]
struct Faults {
    resolves: VecDeque<UpstreamError>,
    fetches: VecDeque<UpstreamError>,
    connects: VecDeque<UpstreamError>,
    deletes: VecDeque<UpstreamError>,
}

/// State shared between the backend and the connections it opened
#[derive(Default)]
struct Shared {
    files: Mutex<HashMap<ResourceIdentity, StoredFile>>,
    faults: Mutex<Faults>,
    fetch_delay: Mutex<Option<Duration>>,
    connects: Mutex<Vec<PartitionId>>,
    resolves: AtomicUsize,
    fetches: AtomicUsize,
    exports: AtomicUsize,
    closes: AtomicUsize,
    active_fetches: AtomicUsize,
    peak_fetches: AtomicUsize,
}

/// Fake upstream holding files in memory
#[derive(Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBackend::default())
    }

    /// Store `data` as the file of message `identity`
    pub fn add_file(
        &self,
        identity: ResourceIdentity,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
        partition: PartitionId,
    ) -> FileHandle {
        let handle = FileHandle {
            location: RemoteLocation {
                kind: LocationKind::Document,
                id: identity.message_id ^ (identity.chat_id << 20),
                access_hash: identity.chat_id,
                file_reference: Bytes::from_static(b"ref"),
                thumb_size: None,
            },
            size: data.len() as u64,
            mime_type: mime_type.to_string(),
            file_name: name.to_string(),
            partition,
        };

        self.shared.files.lock().insert(
            identity,
            StoredFile {
                handle: handle.clone(),
                data: Bytes::from(data),
            },
        );
        handle
    }

    /// Whether the message still exists
    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.shared.files.lock().contains_key(identity)
    }

    pub fn fail_next_resolves(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.shared.faults.lock().resolves.extend(errors);
    }

    pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.shared.faults.lock().fetches.extend(errors);
    }

    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.shared.faults.lock().connects.extend(errors);
    }

    pub fn fail_next_deletes(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.shared.faults.lock().deletes.extend(errors);
    }

    /// Delay every chunk fetch by `delay`
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.shared.fetch_delay.lock() = Some(delay);
    }

    pub fn resolves(&self) -> usize {
        self.shared.resolves.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    pub fn exports(&self) -> usize {
        self.shared.exports.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.lock().len()
    }

    pub fn connects_to(&self, partition: PartitionId) -> usize {
        self.shared
            .connects
            .lock()
            .iter()
            .filter(|p| **p == partition)
            .count()
    }

    /// Largest number of fetches that were running at once
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.shared.peak_fetches.load(Ordering::SeqCst)
    }

    /// Fetches still running
    pub fn active_fetches(&self) -> usize {
        self.shared.active_fetches.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn read(&self, location: &RemoteLocation, offset: u64, length: u32) -> Result<Bytes, UpstreamError> {
        let length = u64::from(length);
        if offset % BLOCK_SIZE != 0 {
            return Err(UpstreamError::Fatal(format!("LIMIT_INVALID offset {}", offset)));
        }
        if !length.is_power_of_two() || length < BLOCK_SIZE || length > MAX_CHUNK_SIZE {
            return Err(UpstreamError::Fatal(format!("LIMIT_INVALID length {}", length)));
        }
        if offset / MAX_CHUNK_SIZE != (offset + length - 1) / MAX_CHUNK_SIZE {
            return Err(UpstreamError::Fatal("LIMIT_INVALID crosses 1MB".to_string()));
        }

        let files = self.files.lock();
        let file = files
            .values()
            .find(|f| f.handle.location == *location)
            .ok_or_else(|| UpstreamError::Fatal("FILE_REFERENCE_EXPIRED".to_string()))?;

        let size = file.data.len() as u64;
        let start = offset.min(size);
        let end = (offset + length).min(size);
        Ok(file.data.slice(start as usize..end as usize))
    }
}

/// Decrements the running-fetch gauge when a fetch ends or is dropped
struct ActiveFetch<'a>(&'a Shared);

impl<'a> ActiveFetch<'a> {
    fn start(shared: &'a Shared) -> Self {
        let active = shared.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_fetches.fetch_max(active, Ordering::SeqCst);
        ActiveFetch(shared)
    }
}

impl Drop for ActiveFetch<'_> {
    fn drop(&mut self) {
        self.0.active_fetches.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn resolve_file(&self, identity: &ResourceIdentity) -> Result<FileHandle, UpstreamError> {
        self.shared.resolves.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.shared.faults.lock().resolves.pop_front() {
            return Err(err);
        }

        self.shared
            .files
            .lock()
            .get(identity)
            .map(|f| f.handle.clone())
            .ok_or(UpstreamError::NotFound)
    }

    async fn delete_message(&self, identity: &ResourceIdentity) -> Result<(), UpstreamError> {
        if let Some(err) = self.shared.faults.lock().deletes.pop_front() {
            return Err(err);
        }

        // Deleting a missing message is not an error upstream either
        self.shared.files.lock().remove(identity);
        Ok(())
    }

    async fn describe_self(&self) -> Result<BotProfile, UpstreamError> {
        Ok(BotProfile {
            username: "file_stream_bot".to_string(),
            display_name: "File Stream".to_string(),
        })
    }
}

#[async_trait]
impl ProtocolClient for MemoryBackend {
    fn home_partition(&self) -> PartitionId {
        HOME_PARTITION
    }

    async fn export_authorization(
        &self,
        partition: PartitionId,
    ) -> Result<ExportedAuthorization, UpstreamError> {
        self.shared.exports.fetch_add(1, Ordering::SeqCst);
        Ok(ExportedAuthorization {
            id: i64::from(partition),
            bytes: Bytes::from_static(b"exported"),
        })
    }

    async fn connect(
        &self,
        partition: PartitionId,
        authorization: Option<ExportedAuthorization>,
    ) -> Result<Arc<dyn PartitionConnection>, UpstreamError> {
        if let Some(err) = self.shared.faults.lock().connects.pop_front() {
            return Err(err);
        }
        if partition != HOME_PARTITION && authorization.is_none() {
            return Err(UpstreamError::Fatal("AUTH_KEY_UNREGISTERED".to_string()));
        }

        self.shared.connects.lock().push(partition);
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl PartitionConnection for MemoryConnection {
    async fn fetch_chunk(
        &self,
        location: &RemoteLocation,
        offset: u64,
        length: u32,
    ) -> Result<Bytes, UpstreamError> {
        self.shared.fetches.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveFetch::start(&self.shared);

        let delay = *self.shared.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.shared.faults.lock().fetches.pop_front() {
            return Err(err);
        }

        self.shared.read(location, offset, length)
    }

    fn close(&self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Deterministic test payload where byte `i` differs from its neighbours
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
