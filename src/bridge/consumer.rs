//! Consumer side of the bridge, driven once per simulation frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::action_queue::{ActionEvent, ActionQueues};
use super::control_state::ControlState;
use super::dispatcher::MainThreadDispatcher;
use super::store::ControlStore;
use crate::protocol::ActionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatePhase {
    Closed,
    /// Open, but still inside the post-connect settle window
    Settling,
    Open,
}

/// The `UseExternalInput` switch. Only the supervisor flips it.
#[derive(Debug, Default)]
pub struct InputGate {
    active: AtomicBool,
    settle_until: Mutex<Option<Instant>>,
}

impl InputGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, settle: Duration) {
        *self.settle_until.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Instant::now() + settle);
        self.active.store(true, Ordering::Release);
        info!("External input enabled after {:?} settle", settle);
    }

    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("External input disabled");
        }
    }

    pub fn phase(&self) -> GatePhase {
        if !self.active.load(Ordering::Acquire) {
            return GatePhase::Closed;
        }
        let settle_until = *self.settle_until.lock().unwrap_or_else(PoisonError::into_inner);
        match settle_until {
            Some(until) if Instant::now() < until => GatePhase::Settling,
            _ => GatePhase::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase() == GatePhase::Open
    }
}

pub type ActionHook<C> = Box<dyn FnMut(&mut C, &ActionEvent) + Send>;

/// Per-frame view of the bridge for a single-threaded consumer owning `C`.
pub struct ConsumerAdapter<C> {
    store: Arc<ControlStore>,
    queues: Arc<ActionQueues>,
    gate: Arc<InputGate>,
    dispatcher: MainThreadDispatcher<C>,
    hooks: HashMap<ActionKind, Vec<ActionHook<C>>>,
}

impl<C> ConsumerAdapter<C> {
    pub fn new(
        store: Arc<ControlStore>,
        queues: Arc<ActionQueues>,
        gate: Arc<InputGate>,
        dispatcher: MainThreadDispatcher<C>,
    ) -> Self {
        Self {
            store,
            queues,
            gate,
            dispatcher,
            hooks: HashMap::new(),
        }
    }

    /// Register a callback for one action kind. Several hooks per kind run
    /// in registration order.
    pub fn on_action<F>(&mut self, kind: ActionKind, hook: F)
    where
        F: FnMut(&mut C, &ActionEvent) + Send + 'static,
    {
        self.hooks.entry(kind).or_default().push(Box::new(hook));
    }

    pub fn dispatcher(&self) -> MainThreadDispatcher<C> {
        self.dispatcher.clone()
    }

    pub fn is_external_input_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Current control state, or all zeros while external input is off.
    pub fn control_state(&self) -> ControlState {
        if self.gate.is_open() {
            self.store.snapshot()
        } else {
            ControlState::default()
        }
    }

    /// Run one frame: dispatched work first, then queued actions.
    pub fn tick(&mut self, context: &mut C) -> ControlState {
        self.dispatcher.drain(context);

        if !self.gate.is_open() {
            let dropped = self.queues.clear_all();
            if dropped > 0 {
                debug!("Discarded {} actions while external input is off", dropped);
            }
            return ControlState::default();
        }

        let state = self.store.snapshot();
        for kind in ActionKind::ALL {
            let events = self.queues.queue(kind).drain();
            if events.is_empty() {
                continue;
            }
            let Some(hooks) = self.hooks.get_mut(&kind) else {
                debug!("No hook for {}, dropped {} events", kind, events.len());
                continue;
            };
            for event in &events {
                for hook in hooks.iter_mut() {
                    hook(context, event);
                }
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AxisName, AxisPair, AxisVector, BooleanFlag};

    #[derive(Default)]
    struct Sim {
        calls: Vec<(ActionKind, bool)>,
        notes: Vec<String>,
    }

    struct Fixture {
        store: Arc<ControlStore>,
        queues: Arc<ActionQueues>,
        gate: Arc<InputGate>,
        adapter: ConsumerAdapter<Sim>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ControlStore::default());
        let queues = Arc::new(ActionQueues::new());
        let gate = Arc::new(InputGate::new());
        let mut adapter = ConsumerAdapter::new(
            store.clone(),
            queues.clone(),
            gate.clone(),
            MainThreadDispatcher::new(),
        );
        for kind in ActionKind::ALL {
            adapter.on_action(kind, |sim: &mut Sim, event| {
                sim.calls.push((event.kind, event.value))
            });
        }
        Fixture {
            store,
            queues,
            gate,
            adapter,
        }
    }

    fn press(queues: &ActionQueues, kind: ActionKind) {
        queues.push(ActionEvent::new(kind, true));
    }

    #[test]
    fn closed_gate_returns_zero_state() {
        let mut fx = fixture();
        fx.store.apply_axis(AxisPair {
            name: AxisName::Left,
            value: AxisVector::new(0.9, 0.9),
        });
        press(&fx.queues, ActionKind::Spray);

        let mut sim = Sim::default();
        assert!(fx.adapter.tick(&mut sim).is_zero());
        assert!(sim.calls.is_empty());
        assert_eq!(fx.queues.total_len(), 0);
        assert!(!fx.adapter.is_external_input_active());
        assert!(fx.adapter.control_state().is_zero());
    }

    #[test]
    fn open_gate_returns_snapshot() {
        let mut fx = fixture();
        fx.gate.open(Duration::ZERO);
        fx.store.apply_axis(AxisPair {
            name: AxisName::Left,
            value: AxisVector::new(0.5, -0.3),
        });

        let state = fx.adapter.tick(&mut Sim::default());
        assert_eq!(state.left_axis, AxisVector::new(0.5, -0.3));
        assert!(fx.adapter.is_external_input_active());
    }

    #[test]
    fn bursts_are_delivered_once_per_event() {
        let mut fx = fixture();
        fx.gate.open(Duration::ZERO);
        for _ in 0..3 {
            press(&fx.queues, ActionKind::ReturnToLaunch);
        }

        let mut sim = Sim::default();
        fx.adapter.tick(&mut sim);
        assert_eq!(sim.calls.len(), 3);

        fx.adapter.tick(&mut sim);
        assert_eq!(sim.calls.len(), 3);
    }

    #[test]
    fn kinds_drain_in_fixed_order() {
        let mut fx = fixture();
        fx.gate.open(Duration::ZERO);
        press(&fx.queues, ActionKind::Draw);
        press(&fx.queues, ActionKind::Thermal);
        press(&fx.queues, ActionKind::ReturnToLaunch);

        let mut sim = Sim::default();
        fx.adapter.tick(&mut sim);
        let kinds: Vec<ActionKind> = sim.calls.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::ReturnToLaunch, ActionKind::Thermal, ActionKind::Draw]
        );
    }

    #[test]
    fn settling_discards_input() {
        let mut fx = fixture();
        fx.gate.open(Duration::from_secs(3600));
        assert_eq!(fx.gate.phase(), GatePhase::Settling);

        fx.store.apply_flag(BooleanFlag {
            name: ActionKind::Capture,
            value: true,
        });
        press(&fx.queues, ActionKind::Capture);

        let mut sim = Sim::default();
        assert!(fx.adapter.tick(&mut sim).is_zero());
        assert!(sim.calls.is_empty());
        assert_eq!(fx.queues.total_len(), 0);
    }

    #[test]
    fn dispatcher_runs_before_actions() {
        let mut fx = fixture();
        fx.gate.open(Duration::ZERO);
        press(&fx.queues, ActionKind::Indicator);
        fx.adapter.dispatcher().enqueue(|sim: &mut Sim| {
            sim.notes.push("status".to_string());
            Ok(())
        });

        let mut sim = Sim::default();
        fx.adapter.tick(&mut sim);
        assert_eq!(sim.notes, vec!["status"]);
        assert_eq!(sim.calls, vec![(ActionKind::Indicator, true)]);
    }

    #[test]
    fn dispatcher_still_runs_while_gate_closed() {
        let mut fx = fixture();
        fx.adapter.dispatcher().enqueue(|sim: &mut Sim| {
            sim.notes.push("disconnected".to_string());
            Ok(())
        });

        let mut sim = Sim::default();
        fx.adapter.tick(&mut sim);
        assert_eq!(sim.notes, vec!["disconnected"]);
    }

    #[test]
    fn gate_close_is_idempotent() {
        let gate = InputGate::new();
        assert_eq!(gate.phase(), GatePhase::Closed);
        gate.open(Duration::ZERO);
        assert_eq!(gate.phase(), GatePhase::Open);
        gate.close();
        gate.close();
        assert_eq!(gate.phase(), GatePhase::Closed);
    }
}
