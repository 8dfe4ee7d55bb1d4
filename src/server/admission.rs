//! Per-client admission control
//!
//! Counts in-flight downloads per client IP. A permit is taken before a
//! download stream is opened and gives its slot back when dropped, so the
//! count is restored on every exit path.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// In-flight download counts keyed by client IP
#[derive(Clone)]
pub struct AdmissionCounter {
    counts: Arc<DashMap<IpAddr, usize>>,
    limit: usize,
}

impl AdmissionCounter {
    pub fn new(limit: usize) -> Self {
        AdmissionCounter {
            counts: Arc::new(DashMap::new()),
            limit,
        }
    }

    /// Take a slot for `ip`, or `None` if it already has `limit` downloads
    pub fn try_admit(&self, ip: IpAddr) -> Option<AdmissionPermit> {
        let mut count = self.counts.entry(ip).or_insert(0);
        if *count >= self.limit {
            debug!(client = %ip, in_flight = *count, "Admission rejected");
            return None;
        }
        *count += 1;

        Some(AdmissionPermit {
            counts: self.counts.clone(),
            ip,
        })
    }

    /// Downloads currently in flight for `ip`
    pub fn in_flight(&self, ip: IpAddr) -> usize {
        self.counts.get(&ip).map(|c| *c).unwrap_or(0)
    }

    /// Clients with at least one download in flight
    pub fn active_clients(&self) -> usize {
        self.counts.iter().filter(|c| *c.value() > 0).count()
    }
}

/// One admitted download
#[derive(Debug)]
pub struct AdmissionPermit {
    counts: Arc<DashMap<IpAddr, usize>>,
    ip: IpAddr,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(&self.ip, |_, count| *count == 0);
    }
}
