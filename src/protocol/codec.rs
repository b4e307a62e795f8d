//! Line codec for the control protocol embedded in the device log stream.
//!
//! Every protocol line carries one keyword followed by a payload:
//!
//! ```text
//! LEFTJOYSTICK: <f32>,<f32>      RIGHTJOYSTICK: <f32>,<f32>     STATICCAM: <f32>,<f32>
//! SPRAYSTATE: <bool>             DRAWSTATE: <bool>              RTLSTATE: <bool>
//! AUTOMATIONSTATE: <bool>        CAPTURESTATE: <bool>           INDICATORSTATE: <bool>
//! THERMALSTATE: <bool>           SELECTEDCAM: <int>
//! ```
//!
//! The keyword may appear anywhere in the line (log prefixes are ignored).
//! Booleans are case-insensitive. Anything that fails to parse is dropped.

use super::message::{
    ActionKind, AxisName, AxisPair, AxisVector, BooleanFlag, ControlMessage, IntSelector,
    SelectorName,
};

#[derive(Clone, Copy, Debug)]
enum Payload {
    Axis(AxisName),
    Flag(ActionKind),
    Selector(SelectorName),
}

/// Keyword table, checked in order.
const KEYWORDS: [(&str, Payload); 11] = [
    ("LEFTJOYSTICK:", Payload::Axis(AxisName::Left)),
    ("RIGHTJOYSTICK:", Payload::Axis(AxisName::Right)),
    ("STATICCAM:", Payload::Axis(AxisName::StaticCam)),
    ("RTLSTATE:", Payload::Flag(ActionKind::ReturnToLaunch)),
    ("SPRAYSTATE:", Payload::Flag(ActionKind::Spray)),
    ("DRAWSTATE:", Payload::Flag(ActionKind::Draw)),
    ("AUTOMATIONSTATE:", Payload::Flag(ActionKind::Automation)),
    ("CAPTURESTATE:", Payload::Flag(ActionKind::Capture)),
    ("INDICATORSTATE:", Payload::Flag(ActionKind::Indicator)),
    ("THERMALSTATE:", Payload::Flag(ActionKind::Thermal)),
    ("SELECTEDCAM:", Payload::Selector(SelectorName::SelectedCamera)),
];

/// Cheap pre-filter: does the line mention any protocol keyword at all?
///
/// Most log lines are unrelated noise, so callers run this before [`parse`].
#[inline]
pub fn is_candidate(line: &str) -> bool {
    line.contains(':') && KEYWORDS.iter().any(|(keyword, _)| line.contains(keyword))
}

/// Parse a raw log line into a [`ControlMessage`].
///
/// Returns `None` for unrelated lines and for protocol lines whose payload
/// cannot be parsed.
pub fn parse(line: &str) -> Option<ControlMessage> {
    let (payload_kind, payload) = KEYWORDS.iter().find_map(|(keyword, kind)| {
        line.find(keyword)
            .map(|pos| (*kind, &line[pos + keyword.len()..]))
    })?;

    let payload = payload.trim_start();
    match payload_kind {
        Payload::Axis(name) => parse_vector(payload).map(|value| {
            ControlMessage::AxisPair(AxisPair { name, value })
        }),
        Payload::Flag(name) => {
            parse_bool(payload).map(|value| ControlMessage::BooleanFlag(BooleanFlag { name, value }))
        }
        Payload::Selector(name) => parse_int(payload)
            .map(|value| ControlMessage::IntSelector(IntSelector { name, value })),
    }
}

/// `<x>,<y>` where `y` ends at the first whitespace.
fn parse_vector(payload: &str) -> Option<AxisVector> {
    let (x_str, rest) = payload.split_once(',')?;
    let y_str = rest.split_whitespace().next()?;

    let x = parse_finite(x_str.trim())?;
    let y = parse_finite(y_str)?;
    Some(AxisVector::new(x, y))
}

fn parse_finite(value: &str) -> Option<f32> {
    value.parse::<f32>().ok().filter(|v| v.is_finite())
}

fn parse_bool(payload: &str) -> Option<bool> {
    let token_end = payload
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(payload.len());
    let token = &payload[..token_end];

    if token.eq_ignore_ascii_case("true") {
        Some(true)
    } else if token.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn parse_int(payload: &str) -> Option<i32> {
    let token_end = payload
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(payload.len());
    payload[..token_end].parse::<i32>().ok()
}
