//! Host callback port
//!
//! The embedding application implements [`HostCallbacks`] and hands it to the
//! crate at construction time. It is the only channel through which the
//! library reaches back into the host: socket protection, lifecycle
//! notifications, and status reporting.

use std::os::fd::RawFd;

/// Callbacks supplied by the embedding host.
///
/// # Threading contract
///
/// `protect` is invoked from arbitrary worker threads driven by the proxy
/// core, potentially many at once. Implementations must be callable from any
/// thread and must return promptly: a blocking `protect` stalls every dial
/// the core attempts. The lifecycle callbacks (`startup`, `shutdown`,
/// `emit_status`) are only invoked from the controller while it holds its
/// own lock, one at a time.
pub trait HostCallbacks: Send + Sync {
    /// Ask the host's VPN service to mark `fd` so the OS routes its traffic
    /// outside the tunnel. Returns `true` iff the descriptor was marked.
    ///
    /// A socket whose protection was refused is closed without ever being
    /// connected; using it would re-enter the VPN and loop its own packets.
    fn protect(&self, fd: RawFd) -> bool;

    /// Signalled once after the core has started.
    fn startup(&self) -> i32;

    /// Signalled once after the core has shut down.
    fn shutdown(&self) -> i32;

    /// Textual status report, e.g. `(0, "started")`.
    fn emit_status(&self, code: i32, message: &str) -> i32;
}
