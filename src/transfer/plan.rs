//! Chunk planning
//!
//! The upstream only serves chunks whose offset is a multiple of the block
//! size and whose length is a power of two no larger than 1MB, and a chunk
//! may not cross a 1MB boundary. A byte window is therefore covered with
//! chunks aligned to the configured chunk size, and the first and last
//! chunk are trimmed to the window after they arrive.

use crate::config::TransferConfig;
use bytes::Bytes;

/// Chunk size constraints, all powers of two
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Alignment of every chunk offset, and the smallest chunk length
    pub block_size: u64,
    /// Length of every chunk but the last
    pub chunk_size: u64,
    /// Largest chunk the upstream accepts
    pub max_chunk_size: u64,
}

impl From<&TransferConfig> for ChunkLayout {
    fn from(config: &TransferConfig) -> Self {
        ChunkLayout {
            block_size: u64::from(config.block_size),
            chunk_size: u64::from(config.chunk_size),
            max_chunk_size: u64::from(config.max_chunk_size),
        }
    }
}

/// One upstream request plus the part of its result that is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Position in the plan; bytes are delivered in index order
    pub index: usize,
    /// Aligned upstream offset
    pub offset: u64,
    /// Power-of-two upstream length
    pub length: u32,
    /// Bytes dropped from the front of the result
    pub skip: usize,
    /// Bytes kept after `skip`
    pub take: usize,
}

impl ChunkRequest {
    /// Cut the kept window out of a fetched chunk
    ///
    /// Returns `None` if the chunk is too short to cover the window.
    pub fn trim(&self, data: Bytes) -> Option<Bytes> {
        let end = self.skip + self.take;
        if data.len() < end {
            return None;
        }
        Some(data.slice(self.skip..end))
    }
}

/// Chunk requests covering the byte window `[offset, limit)`
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    layout: ChunkLayout,
    offset: u64,
    limit: u64,
    first_start: u64,
    count: usize,
}

impl ChunkPlan {
    /// Plan a non-empty window; `offset < limit` is the caller's to check
    pub fn new(offset: u64, limit: u64, layout: ChunkLayout) -> Self {
        let first_start = offset - offset % layout.chunk_size;
        let span = limit.saturating_sub(first_start);
        let count = span.div_ceil(layout.chunk_size) as usize;

        ChunkPlan {
            layout,
            offset,
            limit,
            first_start,
            count,
        }
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes the plan delivers
    pub fn total_bytes(&self) -> u64 {
        self.limit - self.offset
    }

    /// Request for chunk `index`
    pub fn get(&self, index: usize) -> Option<ChunkRequest> {
        if index >= self.count {
            return None;
        }

        let chunk_size = self.layout.chunk_size;
        let start = self.first_start + index as u64 * chunk_size;
        let length = if index + 1 < self.count {
            chunk_size
        } else {
            (self.limit - start)
                .next_power_of_two()
                .clamp(self.layout.block_size, chunk_size)
        };

        let keep_from = start.max(self.offset);
        let keep_to = (start + length).min(self.limit);

        Some(ChunkRequest {
            index,
            offset: start,
            length: length as u32,
            skip: (keep_from - start) as usize,
            take: (keep_to - keep_from) as usize,
        })
    }

    /// All requests in delivery order
    pub fn iter(&self) -> impl Iterator<Item = ChunkRequest> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }
}
