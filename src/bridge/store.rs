//! Thread-safe home of the [`ControlState`].
//!
//! The reader thread is the only writer; the consumer reads value copies.
//! Every mutator holds the write lock for a single field update, so readers
//! never see half of an axis pair.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::control_state::{ControlState, DeadzoneSettings};
use crate::protocol::{AxisName, AxisPair, BooleanFlag, IntSelector, SelectorName};

/// When a received flag value becomes a queued action event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagTrigger {
    /// Only `true` is delivered. `false` just updates the last known value.
    #[default]
    Press,
    /// `true` is delivered, and so is any change of value.
    Change,
}

impl FlagTrigger {
    pub fn delivers(self, previous: bool, value: bool) -> bool {
        match self {
            FlagTrigger::Press => value,
            FlagTrigger::Change => value || value != previous,
        }
    }
}

#[derive(Debug, Default)]
pub struct ControlStore {
    state: RwLock<ControlState>,
    deadzone: DeadzoneSettings,
}

impl ControlStore {
    pub fn new(deadzone: DeadzoneSettings) -> Self {
        Self {
            state: RwLock::new(ControlState::default()),
            deadzone,
        }
    }

    // The state is plain data, so a poisoned lock still holds a usable value
    fn read(&self) -> RwLockReadGuard<'_, ControlState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ControlState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn apply_axis(&self, pair: AxisPair) {
        let mut state = self.write();
        match pair.name {
            AxisName::Left => state.left_axis = pair.value,
            AxisName::Right => state.right_axis = pair.value,
            AxisName::StaticCam => state.static_cam_axis = pair.value,
        }
        state.recompute(&self.deadzone);
    }

    /// Store the new flag value and return the previous one.
    pub fn apply_flag(&self, flag: BooleanFlag) -> bool {
        let mut state = self.write();
        let previous = state.flags.get(flag.name);
        state.flags.set(flag.name, flag.value);
        previous
    }

    pub fn apply_selector(&self, selector: IntSelector) {
        let mut state = self.write();
        match selector.name {
            SelectorName::SelectedCamera => state.selected_camera = selector.value,
        }
    }

    pub fn snapshot(&self) -> ControlState {
        *self.read()
    }

    /// Zero every axis, flag and selector.
    pub fn reset(&self) {
        *self.write() = ControlState::default();
        debug!("Control state reset");
    }

    pub fn deadzone(&self) -> &DeadzoneSettings {
        &self.deadzone
    }
}
