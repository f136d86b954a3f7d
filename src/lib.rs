//! # Tunnel Bridge
//!
//! An embedded binding that runs an opaque proxy-core engine inside a host
//! process owning a VPN tunnel. The host keeps routing its own traffic
//! through the tunnel; the core's upstream sockets must escape it, or the
//! core would recursively tunnel its own traffic and loop packets back into
//! the VPN.
//!
//! ## Features
//!
//! - **Protected dialing**: every outbound socket the core needs is created
//!   here, handed to the host's `protect` callback, and only then connected
//! - **Pinned primary server**: cached resolution with throttled IP rotation
//!   so parallel dial failures cannot cycle past the one working address
//! - **Lifecycle control**: mutex-serialized start/stop of the core with
//!   status callbacks into the host
//! - **Latency probing**: a single HTTP GET timed through the running core,
//!   or through a stripped-down throwaway core
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Host Application                     │
//! │      (VPN service, callbacks, asset bundle)          │
//! ├─────────────────────────────────────────────────────┤
//! │                 Core Controller                      │
//! │     (start/stop, stats queries, latency probe)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Proxy Core Engine                    │
//! │        (opaque: protocols, routing, stats)           │
//! ├─────────────────────────────────────────────────────┤
//! │                 Protected Dialer                     │
//! │   (resolve, create socket, protect, connect/bind)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod callback;
pub mod controller;
pub mod dialer;
pub mod engine;
pub mod env;
pub mod resolver;

pub use callback::HostCallbacks;
pub use controller::CoreController;
pub use dialer::ProtectedDialer;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library interface version reported to hosts alongside the core's version.
pub const LIB_VERSION: u32 = 1;

/// Human-readable version banner combining the library and core versions.
pub fn version_string(core_version: &str) -> String {
    format!("tunnel-bridge/{VERSION} (lib {LIB_VERSION}) core/{core_version}")
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resolver error: {0}")]
    Resolver(#[from] resolver::ResolverError),

    #[error("Dialer error: {0}")]
    Dialer(#[from] dialer::DialerError),

    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("Controller error: {0}")]
    Controller(#[from] controller::ControllerError),

    #[error("Probe error: {0}")]
    Probe(#[from] controller::ProbeError),

    #[error("Environment error: {0}")]
    Env(#[from] env::EnvError),
}
