//! Start-up and shutdown choreography of the whole pipeline.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::server::ProtocolServer;
use kyco_event_system::{
    spawn_stage, ChannelKind, ChannelSet, ChannelStats, ConnectionPool, DispatchStats, Event, EventError, Listener,
    ListenerOwner, ListenerRegistry, NAppKind, Producer, StageHandle,
};
use napp_system::{NAppCatalog, NAppManager};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Span};

const STAGE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Created => "created",
            ControllerState::Running => "running",
            ControllerState::Stopping => "stopping",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by [`Controller::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub state: ControllerState,
    pub channels: Vec<ChannelStats>,
    pub dispatch: DispatchStats,
    pub connections: usize,
    pub core_napps: Vec<String>,
    pub napps: Vec<String>,
    /// Events still queued when the stages were joined
    pub dropped_at_stop: usize,
}

/// Owns the channels, registry, connection pool, stage threads and NApps.
pub struct Controller {
    config: ControllerConfig,
    channels: Arc<ChannelSet>,
    registry: Arc<ListenerRegistry>,
    connections: Arc<ConnectionPool>,
    napps: NAppManager,
    server: ProtocolServer,
    stages: Mutex<Vec<StageHandle>>,
    state: Mutex<ControllerState>,
    dropped_at_stop: Mutex<usize>,
    span: Span,
}

impl Controller {
    /// Controller whose NApp entries come from the bundled catalog.
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_catalog(config, NAppCatalog::with_builtins())
    }

    /// Builds every component up front, so events enqueued before `start`
    /// are buffered until the stages run.
    pub fn with_catalog(config: ControllerConfig, catalog: NAppCatalog) -> Self {
        let span = info_span!("controller", bind = %config.bind_address);
        let channels = Arc::new(ChannelSet::new(&config.channels));
        let registry = Arc::new(ListenerRegistry::with_span(info_span!(parent: &span, "registry")));
        let connections = Arc::new(ConnectionPool::new());

        let napps = NAppManager::with_span(
            &config.core_napps_dir,
            &config.napps_dir,
            Arc::new(catalog),
            registry.clone(),
            channels.clone(),
            connections.clone(),
            &span,
        );
        let server = ProtocolServer::new(
            config.server_config(),
            channels.producer(ChannelKind::Raw),
            connections.clone(),
            &span,
        );

        Self {
            config,
            channels,
            registry,
            connections,
            napps,
            server,
            stages: Mutex::new(Vec::new()),
            state: Mutex::new(ControllerState::Created),
            dropped_at_stop: Mutex::new(0),
            span,
        }
    }

    /// Starts the protocol server and the four stages, then loads core NApps
    /// followed by ordinary NApps.
    ///
    /// Stages are running before any NApp is constructed, so events a NApp
    /// emits while loading are dispatched. A NApp that fails to load is
    /// logged and skipped.
    ///
    /// # Returns
    ///
    /// [`ControllerError::InvalidState`] unless the controller is `Created`,
    /// [`ControllerError::Bind`] if the listen address is unavailable (the
    /// controller then stays `Created`).
    pub async fn start(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        if *state != ControllerState::Created {
            return Err(ControllerError::InvalidState {
                operation: "start",
                state: *state,
            });
        }

        info!(parent: &self.span, "Starting controller");

        let local_addr = self.server.start().await?;

        if let Err(e) = self.spawn_stages().await {
            error!(parent: &self.span, "Failed to start dispatch stages: {}", e);
            self.abort_start().await;
            *state = ControllerState::Stopped;
            return Err(e);
        }
        *state = ControllerState::Running;

        for kind in [NAppKind::Core, NAppKind::Ordinary] {
            match self.napps.load_all(kind).await {
                Ok(loaded) => info!(parent: &self.span, kind = %kind, "Loaded NApps: {:?}", loaded),
                Err(e) => error!(parent: &self.span, kind = %kind, "NApp discovery failed: {}", e),
            }
        }

        info!(parent: &self.span, "Controller running on {}", local_addr);
        Ok(())
    }

    async fn spawn_stages(&self) -> Result<(), ControllerError> {
        let mut stages = self.stages.lock().await;
        for kind in ChannelKind::ALL {
            let handle = spawn_stage(self.channels.channel(kind).clone(), self.registry.clone(), &self.span)
                .map_err(|source| ControllerError::StageSpawn { kind, source })?;
            stages.push(handle);
        }
        Ok(())
    }

    /// Tears down a half-started controller: the server and whichever
    /// stages were already spawned. The join error, if any, is logged and
    /// returned so it is not lost behind the spawn error.
    async fn abort_start(&self) -> Option<ControllerError> {
        self.server.stop().await;
        self.channels.send_stop_signal();
        match self.join_stages().await {
            Ok(()) => None,
            Err(join_error) => {
                error!(
                    parent: &self.span,
                    "Stages started before the failure did not stop cleanly: {}", join_error
                );
                Some(join_error)
            }
        }
    }

    /// Stops the server, signals every stage, unloads ordinary then core
    /// NApps and waits for the stages to exit.
    ///
    /// The state lock is released while stopping, so [`Controller::state`]
    /// and [`Controller::stats`] report `Stopping` in the meantime. A second
    /// `stop` issued during that window fails with
    /// [`ControllerError::InvalidState`].
    ///
    /// # Returns
    ///
    /// `Ok(())` once every stage has exited. A stage that outlives the join
    /// timeout yields [`ControllerError::StageJoinTimeout`]; the controller is
    /// `Stopped` either way.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        {
            let mut state = self.state.lock().await;
            if *state != ControllerState::Running {
                return Err(ControllerError::InvalidState {
                    operation: "stop",
                    state: *state,
                });
            }
            *state = ControllerState::Stopping;
        }
        info!(parent: &self.span, "Stopping controller");

        self.server.stop().await;
        self.channels.send_stop_signal();

        self.napps.unload_all(NAppKind::Ordinary).await;
        self.napps.unload_all(NAppKind::Core).await;

        let joined = self.join_stages().await;

        let dropped: usize = ChannelKind::ALL
            .iter()
            .map(|kind| self.channels.channel(*kind).drain_pending())
            .sum();
        if dropped > 0 {
            warn!(parent: &self.span, dropped, "Events left in channels after stop were dropped");
        }
        *self.dropped_at_stop.lock().await = dropped;

        let dispatch = self.registry.stats();
        info!(
            parent: &self.span,
            events = dispatch.events_dispatched,
            invocations = dispatch.listener_invocations,
            failures = dispatch.listener_failures,
            "Controller stopped"
        );

        *self.state.lock().await = ControllerState::Stopped;
        joined
    }

    /// Joins every stage, bounded by the configured join timeout.
    async fn join_stages(&self) -> Result<(), ControllerError> {
        let handles = std::mem::take(&mut *self.stages.lock().await);
        let deadline = Instant::now() + self.config.stage_join_timeout;

        while handles.iter().any(|h| !h.is_finished()) {
            if Instant::now() >= deadline {
                let stuck: Vec<ChannelKind> = handles
                    .iter()
                    .filter(|h| !h.is_finished())
                    .map(StageHandle::kind)
                    .collect();
                error!(parent: &self.span, "Dispatch stages did not stop in time: {:?}", stuck);
                return Err(ControllerError::StageJoinTimeout {
                    timeout: self.config.stage_join_timeout,
                    stuck,
                });
            }
            tokio::time::sleep(STAGE_POLL_INTERVAL).await;
        }

        let mut result = Ok(());
        for handle in handles {
            let kind = handle.kind();
            if handle.join().is_none() {
                error!(parent: &self.span, channel = %kind, "Dispatch stage panicked");
                result = Err(ControllerError::StagePanicked(kind));
            }
        }
        result
    }

    /// Registers a listener owned by the controller itself.
    pub fn register_listener<F>(&self, event_type: impl Into<String>, name: impl Into<String>, callback: F)
    where
        F: Fn(&Event) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.registry
            .register(event_type, Listener::new(name, ListenerOwner::Controller, callback));
    }

    pub fn producer(&self, kind: ChannelKind) -> Producer {
        self.channels.producer(kind)
    }

    pub async fn state(&self) -> ControllerState {
        *self.state.lock().await
    }

    pub async fn stats(&self) -> ControllerStats {
        ControllerStats {
            state: self.state().await,
            channels: self.channels.stats(),
            dispatch: self.registry.stats(),
            connections: self.connections.len(),
            core_napps: self.napps.loaded(NAppKind::Core).await,
            napps: self.napps.loaded(NAppKind::Ordinary).await,
            dropped_at_stop: *self.dropped_at_stop.lock().await,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    pub fn connections(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }

    pub fn napps(&self) -> &NAppManager {
        &self.napps
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Stage threads block on their channel until a sentinel arrives.
        self.channels.send_stop_signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_config(stage_join_timeout: Duration) -> ControllerConfig {
        ControllerConfig {
            bind_address: "127.0.0.1:0".parse().expect("addr"),
            core_napps_dir: "missing/core".into(),
            napps_dir: "missing/apps".into(),
            stage_join_timeout,
            ..ControllerConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_start_reports_stuck_stage() {
        let controller = Controller::new(test_config(Duration::from_millis(100)));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        controller.register_listener("hold", "hold_stage", move |_: &Event| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().map(|rx| rx.recv_timeout(Duration::from_secs(5)));
            Ok(())
        });

        controller.spawn_stages().await.expect("stages spawn");
        controller
            .producer(ChannelKind::Application)
            .put(Event::signal("hold"))
            .expect("enqueue");
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .expect("blocking wait")
            .expect("listener entered");

        let join_error = controller.abort_start().await;
        assert!(matches!(
            join_error,
            Some(ControllerError::StageJoinTimeout { ref stuck, .. }) if stuck == &vec![ChannelKind::Application]
        ));

        let _ = release_tx.send(());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_start_with_idle_stages_is_clean() {
        let controller = Controller::new(test_config(Duration::from_secs(5)));
        controller.spawn_stages().await.expect("stages spawn");

        assert!(controller.abort_start().await.is_none());
        assert!(controller.channels().stop_sent());
    }

    #[test]
    fn test_drop_with_full_bounded_channel_returns() {
        let mut config = test_config(Duration::from_secs(1));
        config.channels = kyco_event_system::ChannelConfig {
            capacity: Some(1),
            put_timeout: Duration::from_millis(20),
        };
        let controller = Controller::new(config);
        controller
            .producer(ChannelKind::Raw)
            .put(Event::signal("buffered"))
            .expect("room for one");

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            drop(controller);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(3))
            .expect("drop does not wait for a consumer");
    }
}
