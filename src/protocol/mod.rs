//! Text protocol spoken by the handheld controller app.
//!
//! The app writes one control sample per log line; the desktop side tails the
//! log stream and decodes the lines with [`codec::parse`].

pub mod codec;
pub mod message;

pub use codec::{is_candidate, parse};
pub use message::{
    ActionKind, AxisName, AxisPair, AxisVector, BooleanFlag, ControlMessage, IntSelector,
    SelectorName,
};
