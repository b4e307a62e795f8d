//! Typed control messages produced by the codec.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-dimensional stick or look vector as reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisVector {
    pub x: f32,
    pub y: f32,
}

impl AxisVector {
    pub const ZERO: AxisVector = AxisVector { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Direction of the vector in degrees, normalized to `[0, 360)`.
    pub fn angle_degrees(&self) -> f32 {
        let angle = self.y.atan2(self.x).to_degrees();
        if angle < 0.0 {
            angle + 360.0
        } else {
            angle
        }
    }
}

/// Which analog input an axis pair belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisName {
    Left,
    Right,
    StaticCam,
}

/// Discrete actions the device can request.
///
/// Each kind owns one action queue and one last-known flag value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Spray,
    Draw,
    ReturnToLaunch,
    Automation,
    Capture,
    Indicator,
    Thermal,
}

impl ActionKind {
    /// Fixed drain order used by the consumer.
    pub const ALL: [ActionKind; 7] = [
        ActionKind::ReturnToLaunch,
        ActionKind::Automation,
        ActionKind::Capture,
        ActionKind::Indicator,
        ActionKind::Thermal,
        ActionKind::Spray,
        ActionKind::Draw,
    ];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Spray => write!(f, "Spray"),
            ActionKind::Draw => write!(f, "Draw"),
            ActionKind::ReturnToLaunch => write!(f, "ReturnToLaunch"),
            ActionKind::Automation => write!(f, "Automation"),
            ActionKind::Capture => write!(f, "Capture"),
            ActionKind::Indicator => write!(f, "Indicator"),
            ActionKind::Thermal => write!(f, "Thermal"),
        }
    }
}

/// Integer-valued selectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorName {
    SelectedCamera,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisPair {
    pub name: AxisName,
    pub value: AxisVector,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BooleanFlag {
    pub name: ActionKind,
    pub value: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntSelector {
    pub name: SelectorName,
    pub value: i32,
}

/// One recognized protocol line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlMessage {
    AxisPair(AxisPair),
    BooleanFlag(BooleanFlag),
    IntSelector(IntSelector),
}
