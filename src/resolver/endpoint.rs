//! Cached resolution for the pinned primary server

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Minimum interval between IP rotations. The core's transports may dial the
/// primary server many times in parallel; if every failure rotated, the
/// index would cycle past the one working address within milliseconds.
const ROTATE_INTERVAL: Duration = Duration::from_secs(5);

/// A resolved `host:port` with an ordered address list and a rotating
/// selection cursor.
///
/// Replaced wholesale on re-resolution; only the cursor mutates in place.
/// `current_ip` and `rotate` are linearizable under the internal lock.
#[derive(Debug)]
pub struct ResolvedEndpoint {
    domain: String,
    ips: Vec<IpAddr>,
    port: u16,
    last_resolved_at: Instant,
    rotation: Mutex<Rotation>,
}

#[derive(Debug)]
struct Rotation {
    ip_index: usize,
    /// `None` until the first rotation, so a fresh endpoint may rotate
    /// immediately after a failed first dial.
    last_rotated_at: Option<Instant>,
}

impl ResolvedEndpoint {
    /// `ips` must be non-empty.
    pub(crate) fn new(domain: impl Into<String>, ips: Vec<IpAddr>, port: u16) -> Self {
        debug_assert!(!ips.is_empty());
        Self {
            domain: domain.into(),
            ips,
            port,
            last_resolved_at: Instant::now(),
            rotation: Mutex::new(Rotation {
                ip_index: 0,
                last_rotated_at: None,
            }),
        }
    }

    /// Hostname this endpoint was resolved from
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Resolved port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Full ordered address list
    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    /// Instant the address list was produced
    pub fn last_resolved_at(&self) -> Instant {
        self.last_resolved_at
    }

    /// Currently selected address.
    pub fn current_ip(&self) -> IpAddr {
        let rotation = self.lock();
        self.ips[rotation.ip_index]
    }

    /// Advance the selection to the next address.
    ///
    /// Silent no-op with a single address, or within [`ROTATE_INTERVAL`] of
    /// the previous advance. Callers treat the underlying dial error as the
    /// outcome either way.
    pub fn rotate(&self) {
        if self.ips.len() <= 1 {
            return;
        }

        let mut rotation = self.lock();
        let now = Instant::now();
        if let Some(last) = rotation.last_rotated_at {
            if now.duration_since(last) < ROTATE_INTERVAL {
                debug!(domain = %self.domain, "rotation throttled");
                return;
            }
        }
        rotation.last_rotated_at = Some(now);
        rotation.ip_index = (rotation.ip_index + 1) % self.ips.len();
        debug!(
            domain = %self.domain,
            ip = %self.ips[rotation.ip_index],
            "switched to next address"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rotation> {
        // no code panics while holding the lock; recover anyway
        self.rotation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
