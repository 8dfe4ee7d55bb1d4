//! Range header handling
//!
//! Only the single-range forms are understood: `bytes=a-`, `bytes=a-b` and
//! `bytes=-n`. Anything else is ignored and the whole file is served.

use crate::error::{Error, Result};

/// A parsed `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable header
    Full,
    /// `bytes=start-`
    From(u64),
    /// `bytes=start-end`, end inclusive
    Bounded(u64, u64),
    /// `bytes=-len`
    Suffix(u64),
}

/// Byte window to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    /// Exclusive end
    pub limit: u64,
    /// Whether this is a partial (206) response
    pub partial: bool,
}

impl Window {
    pub fn len(&self) -> u64 {
        self.limit - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.limit == self.offset
    }

    /// `Content-Range` value for a partial response
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.offset, self.limit.saturating_sub(1), size)
    }
}

/// Parse a `Range` header value
pub fn parse_range(header: Option<&str>) -> ByteRange {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }

    let Some((start, end)) = spec.trim().split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (false, true) => start.parse().map(ByteRange::From).unwrap_or(ByteRange::Full),
        (false, false) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end => ByteRange::Bounded(start, end),
            _ => ByteRange::Full,
        },
        (true, false) => end.parse().map(ByteRange::Suffix).unwrap_or(ByteRange::Full),
        (true, true) => ByteRange::Full,
    }
}

impl ByteRange {
    /// Resolve against a file of `size` bytes
    pub fn resolve(self, size: u64) -> Result<Window> {
        let (offset, limit) = match self {
            ByteRange::Full => {
                return Ok(Window {
                    offset: 0,
                    limit: size,
                    partial: false,
                })
            }
            ByteRange::From(start) => (start, size),
            ByteRange::Bounded(start, end) => (start, end.saturating_add(1).min(size)),
            ByteRange::Suffix(len) => {
                if len == 0 {
                    return Err(Error::RangeNotSatisfiable { size });
                }
                (size.saturating_sub(len), size)
            }
        };

        if offset >= size {
            return Err(Error::RangeNotSatisfiable { size });
        }

        Ok(Window {
            offset,
            limit,
            partial: true,
        })
    }
}
