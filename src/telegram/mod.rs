//! Telegram backend module
//!
//! Everything the server needs from the chat network, expressed as ports:
//! - `MessageStore`: message metadata lookups and deletion
//! - `ProtocolClient`: opening authorized connections to storage partitions
//! - `PartitionConnection`: fetching aligned chunks of a remote file
//!
//! The embedding application implements these on top of its MTProto client.
//! This module adds the retrying metadata facade and the connection pool.

mod client;
pub mod pool;
mod retry;

pub use client::TelegramBackend;
pub use pool::{ConnectionPool, PoolSettings, PooledConnection};
pub use retry::ExponentialBackoff;

use crate::locator::ResourceIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Storage partition ("datacenter") identifier
pub type PartitionId = i32;

/// What kind of media a location points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationKind {
    Document,
    Photo,
}

/// Upstream address of a file's bytes
///
/// Opaque to the transfer engine, handed back verbatim to `fetch_chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub kind: LocationKind,
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Bytes,
    /// Photo size variant, unused for documents
    pub thumb_size: Option<String>,
}

/// Everything needed to serve a message's file
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub location: RemoteLocation,
    /// Total size in bytes
    pub size: u64,
    pub mime_type: String,
    /// Name the file is served under; requests must match it exactly
    pub file_name: String,
    /// Partition holding the bytes
    pub partition: PartitionId,
}

/// Home session authorization exported to another partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedAuthorization {
    pub id: i64,
    pub bytes: Bytes,
}

/// Public identity of the bot account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotProfile {
    pub username: String,
    pub display_name: String,
}

/// Error reported by a collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Message is gone or carries no file
    #[error("message not found")]
    NotFound,

    /// Flood wait, network hiccup, timeout: worth retrying
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Expired file reference, revoked permission and the like
    #[error("upstream failure: {0}")]
    Fatal(String),
}

impl UpstreamError {
    /// Whether the operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

/// Message metadata lookups
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Resolve the file attached to a message
    async fn resolve_file(&self, identity: &ResourceIdentity) -> Result<FileHandle, UpstreamError>;

    /// Delete a message
    async fn delete_message(&self, identity: &ResourceIdentity) -> Result<(), UpstreamError>;

    /// Profile of the account serving files
    async fn describe_self(&self) -> Result<BotProfile, UpstreamError>;
}

/// Opens authorized connections to storage partitions
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Partition the session is logged in to
    fn home_partition(&self) -> PartitionId;

    /// Export the home session's authorization to `partition`
    async fn export_authorization(
        &self,
        partition: PartitionId,
    ) -> Result<ExportedAuthorization, UpstreamError>;

    /// Open a connection to `partition`, importing `authorization` when given
    async fn connect(
        &self,
        partition: PartitionId,
        authorization: Option<ExportedAuthorization>,
    ) -> Result<Arc<dyn PartitionConnection>, UpstreamError>;
}

/// One authorized connection to a storage partition
#[async_trait]
pub trait PartitionConnection: Send + Sync {
    /// Fetch `length` bytes at `offset`
    ///
    /// `offset` must be block aligned and `length` a power of two. Fewer bytes
    /// are returned only at the end of the file.
    async fn fetch_chunk(
        &self,
        location: &RemoteLocation,
        offset: u64,
        length: u32,
    ) -> Result<Bytes, UpstreamError>;

    /// Close the connection
    fn close(&self);
}
