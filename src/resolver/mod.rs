//! Address resolution for the protected dialer
//!
//! Wraps the platform's native name service. The proxy core's own DNS runs
//! downstream of the dialer being configured here (and is often routed
//! through it), so resolution for the dialer must never loop back into the
//! core: [`SystemResolver`] always asks the OS.

mod endpoint;

pub use endpoint::ResolvedEndpoint;

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Deadline for a single native lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("bad port: {0}")]
    BadPort(String),

    #[error("resolve failed: {0}")]
    ResolveFailed(String),
}

/// Trait for name resolution backends.
///
/// The dialer only depends on this seam; tests substitute scripted
/// resolvers for the platform one.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve a `host:port` string into an ordered endpoint.
    async fn lookup(
        &self,
        address: &str,
        prefer_ipv6: bool,
    ) -> Result<ResolvedEndpoint, ResolverError>;
}

/// Resolver backed by the platform's native name service.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl SystemResolver {
    /// Create a new system resolver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(
        &self,
        address: &str,
        prefer_ipv6: bool,
    ) -> Result<ResolvedEndpoint, ResolverError> {
        let (host, port) = split_host_port(address)?;

        let addrs = tokio::time::timeout(
            LOOKUP_TIMEOUT,
            tokio::net::lookup_host((host.as_str(), port)),
        )
        .await
        .map_err(|_| ResolverError::ResolveFailed(format!("lookup {host} timed out")))?
        .map_err(|e| ResolverError::ResolveFailed(e.to_string()))?;

        let ips = order_ips(addrs.map(|sa| sa.ip()), prefer_ipv6);
        if ips.is_empty() {
            return Err(ResolverError::ResolveFailed(format!(
                "domain {address} produced no addresses"
            )));
        }

        debug!(%host, port, ?ips, "resolved");
        Ok(ResolvedEndpoint::new(host, ips, port))
    }
}

/// Split a `host:port` or `[v6]:port` string.
///
/// Ports are numeric only: the platform API used here has no service-name
/// database, and every caller passes a numeric port anyway.
pub(crate) fn split_host_port(address: &str) -> Result<(String, u16), ResolverError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ResolverError::BadAddress(address.to_string()))?;

    let host = if let Some(stripped) = host.strip_prefix('[') {
        stripped
            .strip_suffix(']')
            .ok_or_else(|| ResolverError::BadAddress(address.to_string()))?
    } else if host.contains(':') {
        // bare IPv6 literal without brackets: the split point is ambiguous
        return Err(ResolverError::BadAddress(address.to_string()));
    } else {
        host
    };

    if host.is_empty() {
        return Err(ResolverError::BadAddress(address.to_string()));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| ResolverError::BadPort(port.to_string()))?;
    if port == 0 {
        return Err(ResolverError::BadPort(port.to_string()));
    }

    Ok((host.to_string(), port))
}

/// Order resolved addresses by family preference, preserving lookup order
/// within each family. Each address appears exactly once.
pub(crate) fn order_ips<I>(addrs: I, prefer_ipv6: bool) -> Vec<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let addrs: Vec<IpAddr> = addrs.into_iter().collect();
    let v4 = addrs.iter().filter(|ip| ip.is_ipv4());
    let v6 = addrs.iter().filter(|ip| ip.is_ipv6());
    if prefer_ipv6 {
        v6.chain(v4).copied().collect()
    } else {
        v4.chain(v6).copied().collect()
    }
}
