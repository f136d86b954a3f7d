//! Ports for the embedded proxy core
//!
//! The proxy core is consumed as an opaque library. The embedder provides an
//! [`EngineFactory`] that builds core instances from JSON configuration with
//! the [`ProtectedDialer`] installed as the system dialer, so every outbound
//! connection the core makes goes through socket protection. The stats
//! registry is likewise opaque behind [`StatsRegistry`].

use crate::dialer::{Destination, ProtectedDialer};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("core start failed: {0}")]
    StartFailed(String),

    #[error("core close failed: {0}")]
    CoreClose(String),

    #[error("core dial failed: {0}")]
    Dial(String),
}

/// Byte stream returned by [`ProxyEngine::dial`].
pub trait AsyncConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncConn for T {}

/// A running (or startable) proxy core instance.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Start the core's services.
    async fn start(&self) -> Result<(), EngineError>;

    /// Tear the core down, closing every connection it owns.
    async fn close(&self) -> Result<(), EngineError>;

    /// Stats registry, when the configuration enabled one.
    fn stats(&self) -> Option<Arc<dyn StatsRegistry>>;

    /// Dial `dest` through the core's routing. The latency probe uses this
    /// as its transport.
    async fn dial(&self, dest: &Destination) -> Result<Box<dyn AsyncConn>, EngineError>;
}

/// Builds core instances from configuration.
pub trait EngineFactory: Send + Sync {
    /// Build a core from JSON configuration, with `dialer` installed as the
    /// system dialer for every outbound connection.
    fn build(
        &self,
        config_json: &str,
        dialer: Arc<ProtectedDialer>,
    ) -> Result<Arc<dyn ProxyEngine>, EngineError>;

    /// Version string of the embedded core.
    fn core_version(&self) -> String;
}

/// The core's traffic counter registry.
pub trait StatsRegistry: Send + Sync {
    /// Look up a counter by its conventional name; `None` if it was never
    /// created.
    fn counter(&self, name: &str) -> Option<Arc<dyn StatsCounter>>;
}

/// A single atomic traffic counter.
pub trait StatsCounter: Send + Sync {
    /// Replace the value, returning the previous one.
    fn set(&self, value: i64) -> i64;

    /// Read the value without modifying it.
    fn value(&self) -> i64;
}

/// Conventional name of an outbound traffic counter.
///
/// `direction` is `uplink` or `downlink` per the core's convention.
pub fn traffic_counter_name(tag: &str, direction: &str) -> String {
    format!("outbound>>>{tag}>>>traffic>>>{direction}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_names_follow_the_core_convention() {
        assert_eq!(
            traffic_counter_name("proxy", "uplink"),
            "outbound>>>proxy>>>traffic>>>uplink"
        );
        assert_eq!(
            traffic_counter_name("direct", "downlink"),
            "outbound>>>direct>>>traffic>>>downlink"
        );
    }
}
