//! Core lifecycle controller
//!
//! Single-instance coordinator around the embedded proxy core: serialized
//! start/stop, traffic counter reads, and the latency probe. The controller
//! owns the [`ProtectedDialer`] and hands it to the engine factory so the
//! core dials everything through it.

mod probe;

pub use probe::{measure_outbound_delay, ProbeError};

use crate::callback::HostCallbacks;
use crate::dialer::ProtectedDialer;
use crate::engine::{traffic_counter_name, EngineFactory, ProxyEngine, StatsRegistry};
use crate::resolver::SystemResolver;
use crate::version_string;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Controller errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),
}

/// Pinned upstream recorded for the next start.
#[derive(Clone)]
struct Primary {
    server: String,
    prefer_ipv6: bool,
}

#[derive(Default)]
struct State {
    running: bool,
    engine: Option<Arc<dyn ProxyEngine>>,
    stats: Option<Arc<dyn StatsRegistry>>,
}

/// Lifecycle controller for one embedded core.
///
/// `start` and `stop` are serialized by an internal mutex and idempotent;
/// observers racing them see a consistent running flag. Stopping fires a
/// broadcast that cancels in-flight latency probes and the pinned-server
/// preparation.
pub struct CoreController {
    callbacks: Arc<dyn HostCallbacks>,
    factory: Arc<dyn EngineFactory>,
    dialer: Arc<ProtectedDialer>,
    state: Mutex<State>,
    close_tx: broadcast::Sender<()>,
    primary: std::sync::Mutex<Option<Primary>>,
}

impl CoreController {
    /// Create a controller over the host's callbacks and core factory.
    pub fn new(callbacks: Arc<dyn HostCallbacks>, factory: Arc<dyn EngineFactory>) -> Self {
        let dialer = Arc::new(ProtectedDialer::new(
            Arc::clone(&callbacks),
            Arc::new(SystemResolver::new()),
        ));
        let (close_tx, _) = broadcast::channel(16);
        Self {
            callbacks,
            factory,
            dialer,
            state: Mutex::new(State::default()),
            close_tx,
            primary: std::sync::Mutex::new(None),
        }
    }

    /// The dialer every core built by this controller dials through.
    pub fn dialer(&self) -> Arc<ProtectedDialer> {
        Arc::clone(&self.dialer)
    }

    /// Record the primary server the next [`start`](Self::start) prepares.
    ///
    /// Without it no pinned preparation runs and every destination is
    /// resolved on demand.
    pub fn set_primary_server(&self, server: impl Into<String>, prefer_ipv6: bool) {
        let mut primary = self
            .primary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *primary = Some(Primary {
            server: server.into(),
            prefer_ipv6,
        });
    }

    /// Build and start the core from JSON configuration.
    ///
    /// Idempotent while running. On success the host's `startup` callback is
    /// invoked and `emit_status(0, "started")` is reported; a start failure
    /// leaves the controller stopped.
    pub async fn start(&self, config_json: &str) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        if state.running {
            debug!("core already running");
            return Ok(());
        }

        let engine = self.factory.build(config_json, Arc::clone(&self.dialer))?;
        if let Err(err) = engine.start().await {
            error!(%err, "core failed to start");
            return Err(err.into());
        }

        state.stats = engine.stats();
        state.engine = Some(engine);
        state.running = true;

        let primary = self
            .primary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(primary) = primary {
            let dialer = Arc::clone(&self.dialer);
            let cancel = self.close_tx.subscribe();
            tokio::spawn(async move {
                dialer
                    .prepare_domain(&primary.server, cancel, primary.prefer_ipv6)
                    .await;
            });
        }

        self.callbacks.startup();
        self.callbacks.emit_status(0, "started");
        info!("core started");
        Ok(())
    }

    /// Close the core and notify the host.
    ///
    /// Idempotent while stopped. Fires the close broadcast so probes and
    /// preparation unblock, then reports `emit_status(0, "closed")`.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        if !state.running {
            debug!("core already stopped");
            return Ok(());
        }

        state.running = false;
        state.stats = None;
        let engine = state.engine.take();

        let result = match engine {
            Some(engine) => engine.close().await,
            None => Ok(()),
        };
        drop(state);

        let _ = self.close_tx.send(());
        self.callbacks.shutdown();
        self.callbacks.emit_status(0, "closed");
        info!("core stopped");
        result.map_err(Into::into)
    }

    /// Whether a core is currently running.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Version banner: library version plus the embedded core's.
    pub fn version(&self) -> String {
        version_string(&self.factory.core_version())
    }

    /// Atomically read and reset an outbound traffic counter.
    ///
    /// Returns 0 with no side effects when the core is stopped or the
    /// counter does not exist.
    pub async fn query_stats(&self, tag: &str, direction: &str) -> i64 {
        let stats = self.state.lock().await.stats.clone();
        let Some(stats) = stats else {
            return 0;
        };
        match stats.counter(&traffic_counter_name(tag, direction)) {
            Some(counter) => counter.set(0),
            None => 0,
        }
    }

    /// Measure round-trip latency through the running core.
    ///
    /// Issues one HTTP GET (default target when `url` is empty) over a
    /// connection the core dials. Aborted by [`stop`](Self::stop).
    pub async fn measure_delay(&self, url: &str) -> Result<i64, ProbeError> {
        let engine = self
            .state
            .lock()
            .await
            .engine
            .clone()
            .ok_or_else(|| ProbeError::Failed("core is not running".into()))?;

        let mut close_rx = self.close_tx.subscribe();
        tokio::select! {
            result = probe::measure_engine_delay(engine.as_ref(), url) => result,
            _ = close_rx.recv() => {
                warn!("latency probe aborted by shutdown");
                Err(ProbeError::Failed("aborted by shutdown".into()))
            }
        }
    }
}
