//! Connection supervisor: owns the bridge subprocesses and the reconnect loop.
//!
//! ```text
//! Disconnected ─device seen / connect()→ Connecting ─verified→ Connected
//! Connected ─device lost / stream closed→ Reconnecting ─retry→ Connecting
//! Connecting ─failed→ Disconnected
//! ```
//!
//! The supervisor runs as a single tokio task. It is the only writer of the
//! [`InputGate`], and every state change is broadcast as a
//! [`ConnectionStatus`] on a watch channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connect_sequence::{self, ActiveLink};
use super::consumer::InputGate;
use super::error::BridgeError;
use super::log_reader::{LinkEvent, ReaderContext};
use super::transport::{BridgeTransport, DeviceInfo};

#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorSettings {
    /// Device presence polling interval
    pub poll_interval: Duration,
    /// Upper bound for one presence probe; a hung probe counts as absent
    pub probe_timeout: Duration,
    /// Upper bound for one complete connect attempt
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// Input stays suppressed this long after connecting
    pub settle_delay: Duration,
    pub reader_join_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub stop_server_on_exit: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(1500),
            connect_timeout: Duration::from_millis(3000),
            max_reconnect_attempts: 2,
            settle_delay: Duration::from_millis(500),
            reader_join_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(3000),
            stop_server_on_exit: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_checked_at: Option<DateTime<Local>>,
    /// Serial of the connected device
    pub device: Option<String>,
    /// Set once the bridge executable cannot be started at all
    pub fatal_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_checked_at: None,
            device: None,
            fatal_error: None,
        }
    }
}

#[derive(Debug)]
enum SupervisorCommand {
    Connect,
}

struct Supervisor {
    transport: Arc<dyn BridgeTransport>,
    settings: SupervisorSettings,
    context: ReaderContext,
    gate: Arc<InputGate>,

    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,

    link: Option<ActiveLink>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    server_started: bool,
}

impl Supervisor {
    fn new(
        transport: Arc<dyn BridgeTransport>,
        settings: SupervisorSettings,
        context: ReaderContext,
        gate: Arc<InputGate>,
        status_tx: watch::Sender<ConnectionStatus>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            transport,
            settings,
            context,
            gate,
            status: ConnectionStatus::default(),
            status_tx,
            link: None,
            generation: 0,
            events_tx,
            server_started: false,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.state != state {
            info!("Connection state: {:?} -> {:?}", self.status.state, state);
            self.status.state = state;
        }
        self.publish();
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SupervisorCommand>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        info!("Connection supervisor started");
        let mut poll = time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Supervisor cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Connect) => self.handle_connect_request().await,
                    None => {
                        debug!("All supervisor handles dropped");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_link_event(event).await,
                _ = poll.tick() => self.poll_device().await,
            }
        }

        self.teardown().await;
        info!("Connection supervisor stopped");
    }

    async fn handle_connect_request(&mut self) {
        if self.status.fatal_error.take().is_some() {
            info!("Explicit connect request, clearing bridge failure");
        }
        if self.status.state == ConnectionState::Connected {
            debug!("Already connected, ignoring connect request");
            self.publish();
            return;
        }
        self.reconnect().await;
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StreamClosed { generation } => {
                let current = self.link.as_ref().map(ActiveLink::generation);
                if current != Some(generation) {
                    debug!("Ignoring close of stale stream {}", generation);
                    return;
                }
                warn!("Log stream {} closed unexpectedly", generation);
                self.enter_reconnecting().await;
                self.reconnect().await;
            }
        }
    }

    /// Check for a ready device; a failed or hung probe counts as absent.
    async fn probe(&mut self) -> Option<DeviceInfo> {
        let result = time::timeout(self.settings.probe_timeout, self.transport.list_devices()).await;
        self.status.last_checked_at = Some(Local::now());

        match result {
            Ok(Ok(devices)) => {
                self.clear_fatal();
                devices.into_iter().find(DeviceInfo::is_ready)
            }
            Ok(Err(e)) => {
                if e.is_fatal() && !self.server_started {
                    self.surface_fatal(&BridgeError::Transport(e));
                } else {
                    debug!("Device probe failed: {}", e);
                }
                None
            }
            Err(_) => {
                warn!(
                    "Device probe timed out after {:?}",
                    self.settings.probe_timeout
                );
                None
            }
        }
    }

    async fn poll_device(&mut self) {
        let device = self.probe().await;
        match (self.status.state, device) {
            (ConnectionState::Connected, None) => {
                warn!("Device no longer present");
                self.enter_reconnecting().await;
                self.reconnect().await;
            }
            (ConnectionState::Connected, Some(_)) => self.publish(),
            (_, Some(device)) => {
                info!("Device {} detected", device.serial);
                self.reconnect().await;
            }
            (_, _) => self.publish(),
        }
    }

    /// Leave `Connected`: gate off, link torn down, state and queues cleared.
    async fn enter_reconnecting(&mut self) {
        self.gate.close();
        self.set_state(ConnectionState::Reconnecting);
        self.close_link().await;

        self.context.store.reset();
        let dropped = self.context.queues.clear_all();
        if dropped > 0 {
            info!("Discarded {} pending actions", dropped);
        }
        self.status.device = None;
        self.publish();
    }

    async fn close_link(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let join_timeout = self.settings.reader_join_timeout;
        if let Err(e) = tokio::task::spawn_blocking(move || link.close(join_timeout)).await {
            warn!("Link teardown task failed: {}", e);
        }
    }

    /// One bounded connect attempt. The attempt counter wraps instead of
    /// giving up.
    async fn reconnect(&mut self) {
        if self.status.reconnect_attempts >= self.settings.max_reconnect_attempts {
            info!(
                "Reached {} reconnect attempts, resetting counter",
                self.settings.max_reconnect_attempts
            );
            self.status.reconnect_attempts = 0;
        }
        self.status.reconnect_attempts += 1;
        self.set_state(ConnectionState::Connecting);

        match self.connect_once().await {
            Ok(link) => {
                self.clear_fatal();
                self.server_started = true;
                self.status.reconnect_attempts = 0;
                self.status.device = Some(link.device().serial.clone());
                self.link = Some(link);
                self.set_state(ConnectionState::Connected);
                self.gate.open(self.settings.settle_delay);
            }
            Err(e) => {
                if e.is_fatal() && !self.server_started {
                    self.surface_fatal(&e);
                } else {
                    warn!(
                        "Connect attempt {} failed: {}",
                        self.status.reconnect_attempts, e
                    );
                }
                // The failed attempt's reader may have written before it was revoked
                self.context.store.reset();
                let dropped = self.context.queues.clear_all();
                if dropped > 0 {
                    debug!("Discarded {} actions from failed attempt", dropped);
                }
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn connect_once(&mut self) -> Result<ActiveLink, BridgeError> {
        self.generation += 1;
        let context = self.context.for_generation();
        let writes = context.write_token();
        let attempt = connect_sequence::connect(
            self.transport.clone(),
            context,
            self.events_tx.clone(),
            self.generation,
        );
        let result = time::timeout(self.settings.connect_timeout, attempt)
            .await
            .map_err(|_| BridgeError::Timeout(self.settings.connect_timeout))
            .and_then(|result| result);
        if result.is_err() {
            writes.revoke();
        }
        result
    }

    /// Report a hard bridge failure. Retries go on; only the first report logs.
    fn surface_fatal(&mut self, err: &BridgeError) {
        if self.status.fatal_error.is_none() {
            error!("Bridge server cannot be started, still retrying: {}", err);
            self.status.fatal_error = Some(err.to_string());
        }
        self.publish();
    }

    fn clear_fatal(&mut self) {
        if self.status.fatal_error.take().is_some() {
            info!("Bridge executable is available again");
        }
    }

    async fn teardown(&mut self) {
        self.gate.close();
        self.close_link().await;
        self.context.store.reset();
        self.context.queues.clear_all();
        self.status.device = None;

        if self.settings.stop_server_on_exit && self.server_started {
            match time::timeout(self.settings.shutdown_timeout, self.transport.stop_server()).await {
                Ok(Ok(())) => debug!("Bridge server stopped on exit"),
                Ok(Err(e)) => warn!("Failed to stop bridge server: {}", e),
                Err(_) => warn!(
                    "Stopping bridge server timed out after {:?}",
                    self.settings.shutdown_timeout
                ),
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Owner side of the supervisor task.
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    status: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl SupervisorHandle {
    pub fn spawn(
        transport: Arc<dyn BridgeTransport>,
        settings: SupervisorSettings,
        context: ReaderContext,
        gate: Arc<InputGate>,
    ) -> Self {
        info!("Spawning connection supervisor with settings: {:?}", settings);

        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let (commands, command_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shutdown_timeout = settings.shutdown_timeout;

        let supervisor = Supervisor::new(transport, settings, context, gate, status_tx, events_tx);
        let task = tokio::spawn(supervisor.run(command_rx, events_rx, cancel.clone()));

        Self {
            commands,
            status,
            cancel,
            task: Some(task),
            shutdown_timeout,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Request a connect attempt now. Also clears a surfaced bridge failure.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.commands
            .send(SupervisorCommand::Connect)
            .await
            .map_err(|e| BridgeError::ChannelError(e.to_string()))
    }

    /// Stop the supervisor and tear the connection down. Safe to call twice.
    pub async fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            debug!("Supervisor already shut down");
            return;
        };

        info!("Shutting down connection supervisor");
        self.cancel.cancel();
        // Teardown itself bounds the server stop, this covers the rest
        match time::timeout(self.shutdown_timeout * 2, task).await {
            Ok(Ok(())) => debug!("Supervisor task joined"),
            Ok(Err(e)) => error!("Supervisor task failed: {}", e),
            Err(_) => warn!("Supervisor did not stop in time"),
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
