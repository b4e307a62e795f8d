//! Aggregate control state and the angular deadzone remap.
//!
//! Raw stick vectors are kept as received. The processed vectors pass through
//! [`apply_deadzone`], which snaps near-axial input onto the axis while
//! leaving diagonal input untouched:
//!
//! ```text
//!              90°  primary-Y: x *= off_axis_scale
//!               |
//!   180° -------+------- 0°   primary-X: y *= off_axis_scale
//!               |
//!             270°
//! ```
//!
//! Anything outside both bands passes through unscaled.

use serde::{Deserialize, Serialize};

use crate::protocol::{ActionKind, AxisVector};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadzoneSettings {
    /// Vectors at or below this magnitude are zeroed
    pub magnitude: f32,
    /// Half-width of each cardinal band in degrees
    pub angle_deg: f32,
    /// Factor applied to the off-axis component inside a band
    pub off_axis_scale: f32,
}

impl Default for DeadzoneSettings {
    fn default() -> Self {
        Self {
            magnitude: 0.1,
            angle_deg: 30.0,
            off_axis_scale: 0.2,
        }
    }
}

/// Shortest distance between two angles in degrees.
fn angular_distance(a: f32, b: f32) -> f32 {
    let diff = (a - b).abs() % 360.0;
    diff.min(360.0 - diff)
}

/// Remap a raw stick vector through the dead zone and cardinal bands.
pub fn apply_deadzone(raw: AxisVector, settings: &DeadzoneSettings) -> AxisVector {
    if raw.magnitude() <= settings.magnitude {
        return AxisVector::ZERO;
    }

    let angle = raw.angle_degrees();
    let near_y = angular_distance(angle, 90.0) <= settings.angle_deg
        || angular_distance(angle, 270.0) <= settings.angle_deg;
    if near_y {
        return AxisVector::new(raw.x * settings.off_axis_scale, raw.y);
    }

    let near_x = angular_distance(angle, 0.0) <= settings.angle_deg
        || angular_distance(angle, 180.0) <= settings.angle_deg;
    if near_x {
        return AxisVector::new(raw.x, raw.y * settings.off_axis_scale);
    }

    raw
}

/// Last known value of every discrete flag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagStates {
    pub spray: bool,
    pub draw: bool,
    pub return_to_launch: bool,
    pub automation: bool,
    pub capture: bool,
    pub indicator: bool,
    pub thermal: bool,
}

impl FlagStates {
    pub fn get(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Spray => self.spray,
            ActionKind::Draw => self.draw,
            ActionKind::ReturnToLaunch => self.return_to_launch,
            ActionKind::Automation => self.automation,
            ActionKind::Capture => self.capture,
            ActionKind::Indicator => self.indicator,
            ActionKind::Thermal => self.thermal,
        }
    }

    pub fn set(&mut self, kind: ActionKind, value: bool) {
        let slot = match kind {
            ActionKind::Spray => &mut self.spray,
            ActionKind::Draw => &mut self.draw,
            ActionKind::ReturnToLaunch => &mut self.return_to_launch,
            ActionKind::Automation => &mut self.automation,
            ActionKind::Capture => &mut self.capture,
            ActionKind::Indicator => &mut self.indicator,
            ActionKind::Thermal => &mut self.thermal,
        };
        *slot = value;
    }
}

/// Snapshot of everything the device has reported.
///
/// `Default` is the fail-safe all-zero state handed out while external input
/// is inactive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    // Raw vectors as received
    pub left_axis: AxisVector,
    pub right_axis: AxisVector,
    pub static_cam_axis: AxisVector,

    // After deadzone remap
    pub processed_left: AxisVector,
    pub processed_right: AxisVector,

    pub throttle: f32,
    pub yaw: f32,
    pub roll: f32,
    pub pitch: f32,

    pub flags: FlagStates,
    pub selected_camera: i32,
}

impl ControlState {
    /// Recompute processed vectors and derived scalars from the raw vectors.
    pub fn recompute(&mut self, settings: &DeadzoneSettings) {
        self.processed_left = apply_deadzone(self.left_axis, settings);
        self.processed_right = apply_deadzone(self.right_axis, settings);

        self.throttle = self.processed_left.y;
        self.yaw = self.processed_left.x;
        self.roll = self.processed_right.x;
        self.pitch = self.processed_right.y;
    }

    pub fn is_zero(&self) -> bool {
        *self == ControlState::default()
    }
}
