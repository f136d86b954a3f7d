//! The protected dialer
//!
//! Creates every outbound socket on behalf of the proxy core and routes it
//! around the host's VPN tunnel: each socket is handed to the host's
//! `protect` callback between creation and connect, so the OS excludes its
//! traffic from the tunnel.
//!
//! One destination is special: the **pinned primary server**, the upstream
//! the core talks to. Its resolution is prepared once, cached, and rotated
//! through on dial failures. Every other destination is resolved on demand
//! with no caching.

mod socket;

pub use socket::{DatagramConn, ProtectedConn};

use crate::callback::HostCallbacks;
use crate::resolver::{Resolve, ResolvedEndpoint, ResolverError};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Resolution attempts before the pinned server is declared unreachable.
const PREPARE_MAX_RETRY: u32 = 10;

/// Pause between failed preparation attempts.
const PREPARE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Dialer errors
#[derive(Debug, Error)]
pub enum DialerError {
    #[error("failed to prepare domain {0}")]
    PrepareFailed(String),

    #[error("host refused to protect fd {0}")]
    ProtectFail(RawFd),

    #[error("socket create failed: {0}")]
    SocketCreate(#[source] std::io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

/// Transport protocol of an outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// A destination the proxy core wants to reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub network: Network,
}

impl Destination {
    /// TCP destination
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            network: Network::Tcp,
        }
    }

    /// UDP destination
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            network: Network::Udp,
        }
    }

    /// `host:port` form, matched against the pinned server. IPv6 literals
    /// are bracketed so the port split stays unambiguous.
    pub fn net_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.network {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        };
        write!(f, "{proto}:{}", self.net_addr())
    }
}

/// Preparation state of the pinned primary server.
enum PinPhase {
    /// No `prepare_domain` call yet.
    Unprepared,
    /// Resolution in flight; pinned dials wait for the prepared signal.
    Preparing,
    /// Resolution cached; pinned dials use it.
    Ready(Arc<ResolvedEndpoint>),
    /// Cancelled or retry budget exhausted; pinned dials fail fast.
    Failed,
}

struct Pin {
    server: String,
    prefer_ipv6: bool,
    phase: PinPhase,
    /// Flips to `true` exactly once per preparation cycle; replaced with a
    /// fresh channel when a new cycle begins. Late subscribers observe the
    /// already-fired value.
    prepared_tx: watch::Sender<bool>,
}

/// Dialer that creates protected sockets for the proxy core.
///
/// Shared freely across the core's worker threads; all mutable state sits
/// behind an internal lock. `prepare_domain` itself is not internally
/// serialized — run at most one preparation at a time per dialer.
pub struct ProtectedDialer {
    callbacks: Arc<dyn HostCallbacks>,
    resolver: Arc<dyn Resolve>,
    pin: Mutex<Pin>,
}

impl ProtectedDialer {
    /// Create a dialer over the given host callbacks and resolver.
    pub fn new(callbacks: Arc<dyn HostCallbacks>, resolver: Arc<dyn Resolve>) -> Self {
        let (prepared_tx, _) = watch::channel(false);
        Self {
            callbacks,
            resolver,
            pin: Mutex::new(Pin {
                server: String::new(),
                prefer_ipv6: false,
                phase: PinPhase::Unprepared,
                prepared_tx,
            }),
        }
    }

    /// Resolve and cache the pinned primary server.
    ///
    /// Retries the resolver up to [`PREPARE_MAX_RETRY`] times with
    /// [`PREPARE_RETRY_DELAY`] pauses; `cancel` aborts between attempts.
    /// The prepared signal fires exactly once on every exit path, after
    /// which the dialer is either `Ready` or `Failed`. Calling again with a
    /// new domain starts a fresh cycle.
    pub async fn prepare_domain(
        &self,
        domain: &str,
        mut cancel: broadcast::Receiver<()>,
        prefer_ipv6: bool,
    ) {
        info!(%domain, prefer_ipv6, "preparing primary server");
        {
            let mut pin = self.lock();
            pin.server = domain.to_string();
            pin.prefer_ipv6 = prefer_ipv6;
            pin.phase = PinPhase::Preparing;
            let (tx, _) = watch::channel(false);
            pin.prepared_tx = tx;
        }

        for attempt in 1..=PREPARE_MAX_RETRY {
            eprintln!("DEBUG attempt {attempt} start");
            match self.resolver.lookup(domain, prefer_ipv6).await {
                Ok(endpoint) => {
                    info!(
                        %domain,
                        port = endpoint.port(),
                        ips = ?endpoint.ips(),
                        "primary server prepared"
                    );
                    self.finish_prepare(PinPhase::Ready(Arc::new(endpoint)));
                    return;
                }
                Err(err) => {
                    warn!(%domain, attempt, %err, "primary server resolution failed");
                    tokio::select! {
                        _ = cancel.recv() => {
                            debug!(%domain, "preparation cancelled");
                            self.finish_prepare(PinPhase::Failed);
                            return;
                        }
                        _ = sleep(PREPARE_RETRY_DELAY) => { eprintln!("DEBUG slept"); }
                    }
                }
            }
        }

        warn!(%domain, "preparation retry budget exhausted");
        self.finish_prepare(PinPhase::Failed);
    }

    fn finish_prepare(&self, phase: PinPhase) {
        let mut pin = self.lock();
        // phase is written before the signal fires; observers that see the
        // fired signal see the final phase
        pin.phase = phase;
        let _ = pin.prepared_tx.send(true);
    }

    /// Dial `dest`, returning a protected stream or datagram connection.
    ///
    /// The pinned server uses the cached endpoint, waiting for an in-flight
    /// preparation first (cancel by dropping the future); a failed dial
    /// rotates the endpoint before propagating the error so the core's
    /// retry lands on the next address. Any other destination is resolved
    /// fresh, dials its first address, and never rotates.
    pub async fn dial(&self, dest: &Destination) -> Result<ProtectedConn, DialerError> {
        let is_pinned = {
            let pin = self.lock();
            !pin.server.is_empty() && pin.server == dest.net_addr()
        };
        if is_pinned {
            self.dial_pinned(dest).await
        } else {
            self.dial_fresh(dest).await
        }
    }

    async fn dial_pinned(&self, dest: &Destination) -> Result<ProtectedConn, DialerError> {
        let endpoint = self.pinned_endpoint().await?;
        let target = SocketAddr::new(endpoint.current_ip(), endpoint.port());
        match socket::open_protected(self.callbacks.as_ref(), dest.network, target).await {
            Ok(conn) => {
                debug!(ip = %target.ip(), "using prepared address");
                Ok(conn)
            }
            Err(err) => {
                // the core retries the dial, which lands on the next address
                endpoint.rotate();
                Err(err)
            }
        }
    }

    async fn dial_fresh(&self, dest: &Destination) -> Result<ProtectedConn, DialerError> {
        let prefer_ipv6 = self.lock().prefer_ipv6;
        let endpoint = self.resolver.lookup(&dest.net_addr(), prefer_ipv6).await?;
        // no caching and no rotation for non-pinned destinations
        let target = SocketAddr::new(endpoint.ips()[0], endpoint.port());
        socket::open_protected(self.callbacks.as_ref(), dest.network, target).await
    }

    /// Cached endpoint for the pinned server, waiting out an in-flight
    /// preparation.
    async fn pinned_endpoint(&self) -> Result<Arc<ResolvedEndpoint>, DialerError> {
        let (ready, mut prepared_rx, server) = {
            let pin = self.lock();
            let ready = match &pin.phase {
                PinPhase::Ready(ep) => Some(Arc::clone(ep)),
                _ => None,
            };
            (ready, pin.prepared_tx.subscribe(), pin.server.clone())
        };
        if let Some(endpoint) = ready {
            return Ok(endpoint);
        }

        debug!(%server, "dial pending preparation");
        let _ = prepared_rx.wait_for(|fired| *fired).await;

        let pin = self.lock();
        match &pin.phase {
            PinPhase::Ready(endpoint) => Ok(Arc::clone(endpoint)),
            _ => Err(DialerError::PrepareFailed(pin.server.clone())),
        }
    }

    /// Currently selected address of the pinned server, once prepared.
    /// Hosts use this to exclude the upstream from tunnel routes.
    pub fn pinned_ip(&self) -> Option<IpAddr> {
        match &self.lock().phase {
            PinPhase::Ready(endpoint) => Some(endpoint.current_ip()),
            _ => None,
        }
    }

    /// Whether the pinned server has a usable resolution.
    pub fn is_prepared(&self) -> bool {
        matches!(self.lock().phase, PinPhase::Ready(_))
    }

    /// `host:port` the dialer is pinned to, if a preparation ran.
    pub fn pinned_server(&self) -> Option<String> {
        let pin = self.lock();
        (!pin.server.is_empty()).then(|| pin.server.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Pin> {
        self.pin
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
