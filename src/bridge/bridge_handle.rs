//! DeviceBridge - unified entry point for the device control bridge
//!
//! Builds the shared store, action queues, input gate and dispatcher, spawns
//! the connection supervisor and hands the consumer side back to the caller.
//!
//! ```text
//! Supervisor ─spawns→ LogReader ─[ControlMessage]→ ControlStore / ActionQueues
//!                                                        │
//!                         ConsumerAdapter::tick ←────────┘
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use super::action_queue::ActionQueues;
use super::consumer::{ConsumerAdapter, InputGate};
use super::control_state::{ControlState, DeadzoneSettings};
use super::dispatcher::MainThreadDispatcher;
use super::error::BridgeError;
use super::log_reader::ReaderContext;
use super::store::{ControlStore, FlagTrigger};
use super::supervisor::{ConnectionStatus, SupervisorHandle, SupervisorSettings};
use super::transport::{AdbSettings, AdbTransport, BridgeTransport};

/// Settings for the complete bridge, split up among the components on spawn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BridgeSettings {
    pub adb: AdbSettings,
    pub supervisor: SupervisorSettings,
    pub deadzone: DeadzoneSettings,
    pub flag_trigger: FlagTrigger,
}

/// Handle on a running bridge.
///
/// Dropping it cancels the supervisor; call [`DeviceBridge::shutdown`] for a
/// bounded, awaited teardown.
pub struct DeviceBridge {
    supervisor: SupervisorHandle,
    store: Arc<ControlStore>,
    gate: Arc<InputGate>,
}

impl DeviceBridge {
    /// Spawn the bridge over a real `adb` executable.
    pub fn spawn_adb<C>(
        settings: Option<BridgeSettings>,
    ) -> Result<(Self, ConsumerAdapter<C>), BridgeError> {
        let settings = settings.unwrap_or_default();
        let transport = Arc::new(AdbTransport::new(settings.adb.clone()));
        Self::spawn(Some(settings), transport)
    }

    /// Spawn the bridge over any transport. Must be called inside a tokio
    /// runtime.
    pub fn spawn<C>(
        settings: Option<BridgeSettings>,
        transport: Arc<dyn BridgeTransport>,
    ) -> Result<(Self, ConsumerAdapter<C>), BridgeError> {
        info!("Initializing device bridge with settings: {:?}", settings);
        let settings = settings.unwrap_or_default();

        tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::InitializationError(e.to_string()))?;

        let store = Arc::new(ControlStore::new(settings.deadzone.clone()));
        let queues = Arc::new(ActionQueues::new());
        let gate = Arc::new(InputGate::new());
        let context = ReaderContext::new(store.clone(), queues.clone(), settings.flag_trigger);
        debug!(
            "Deadzone {:?}, flag trigger {:?}",
            settings.deadzone, settings.flag_trigger
        );

        let supervisor =
            SupervisorHandle::spawn(transport, settings.supervisor, context, gate.clone());
        let adapter = ConsumerAdapter::new(
            store.clone(),
            queues,
            gate.clone(),
            MainThreadDispatcher::new(),
        );

        info!("Device bridge initialized successfully");
        Ok((
            Self {
                supervisor,
                store,
                gate,
            },
            adapter,
        ))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.supervisor.subscribe()
    }

    pub fn is_external_input_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Current control state, zeroed while external input is off.
    pub fn control_state(&self) -> ControlState {
        if self.gate.is_open() {
            self.store.snapshot()
        } else {
            ControlState::default()
        }
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.supervisor.connect().await
    }

    pub async fn shutdown(&mut self) {
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::supervisor::ConnectionState;
    use crate::bridge::transport::scripted::ScriptedTransport;
    use crate::protocol::ActionKind;
    use std::time::Duration;

    fn settings() -> BridgeSettings {
        BridgeSettings {
            supervisor: SupervisorSettings {
                poll_interval: Duration::from_millis(20),
                settle_delay: Duration::ZERO,
                shutdown_timeout: Duration::from_millis(500),
                ..SupervisorSettings::default()
            },
            ..BridgeSettings::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[derive(Default)]
    struct Sim {
        returns: usize,
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        let transport = ScriptedTransport::new();
        let result = DeviceBridge::spawn::<Sim>(None, transport);
        assert!(matches!(result, Err(BridgeError::InitializationError(_))));
    }

    #[tokio::test]
    async fn device_input_reaches_consumer() {
        let transport = ScriptedTransport::new();
        transport.set_device_present(true);
        let (mut bridge, mut adapter) =
            DeviceBridge::spawn::<Sim>(Some(settings()), transport.clone()).unwrap();
        adapter.on_action(ActionKind::ReturnToLaunch, |sim, _| sim.returns += 1);

        assert!(eventually(|| bridge.is_external_input_active()).await);
        assert_eq!(bridge.status().state, ConnectionState::Connected);

        transport.feed_line("I/Unity: LEFTJOYSTICK: 0.5,-0.3");
        transport.feed_line("I/Unity: RTLSTATE: True");
        transport.feed_line("I/Unity: RTLSTATE: True");
        assert!(eventually(|| bridge.control_state().yaw == 0.5).await);

        let mut sim = Sim::default();
        let mut state = adapter.tick(&mut sim);
        for _ in 0..100 {
            if sim.returns == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = adapter.tick(&mut sim);
        }
        assert_eq!(sim.returns, 2);
        assert_eq!(state.throttle, -0.3);

        // Losing the device drops back to zeroed input
        transport.set_device_present(false);
        assert!(eventually(|| !bridge.is_external_input_active()).await);
        assert!(adapter.tick(&mut sim).is_zero());

        bridge.shutdown().await;
        bridge.shutdown().await;
    }
}
