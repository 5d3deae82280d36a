//! JSON framing for the ticker socket.
//!
//! Inbound text frames are either a bare array of ticks, an envelope
//! `{"type": "ticks", "data": [...]}`, a single tick object, or a control
//! message (`error`, `message`, `order`). Outbound control messages follow
//! the `{"a": <action>, "v": <value>}` convention.

use serde_json::{Value, json};
use vega_core::error::{Result, VegaError};
use vega_core::types::{RawTick, StreamMode};

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Ticks that decoded cleanly, plus the number of elements that did not.
    Ticks { ticks: Vec<RawTick>, malformed: usize },
    /// Server-side error notice.
    Error(String),
    /// Anything else (order postbacks, broadcast messages).
    Other,
}

/// Decode a text frame.
///
/// Fails only when the frame is not JSON at all; individual malformed ticks
/// are counted in [`Frame::Ticks::malformed`].
pub fn decode_frame(text: &str) -> Result<Frame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| VegaError::Parse(format!("tick frame: {e}")))?;

    match value {
        Value::Array(items) => Ok(decode_ticks(items)),
        Value::Object(ref obj) => match obj.get("type").and_then(Value::as_str) {
            Some("ticks") => match obj.get("data") {
                Some(Value::Array(items)) => Ok(decode_ticks(items.clone())),
                _ => Ok(Frame::Ticks {
                    ticks: Vec::new(),
                    malformed: 1,
                }),
            },
            Some("error") => Ok(Frame::Error(
                obj.get("data")
                    .map(|d| d.as_str().map(str::to_string).unwrap_or_else(|| d.to_string()))
                    .unwrap_or_default(),
            )),
            Some(_) => Ok(Frame::Other),
            None if obj.contains_key("instrument_token") => Ok(decode_ticks(vec![value])),
            None => Ok(Frame::Other),
        },
        _ => Ok(Frame::Other),
    }
}

fn decode_ticks(items: Vec<Value>) -> Frame {
    let mut ticks = Vec::with_capacity(items.len());
    let mut malformed = 0;
    for item in items {
        match serde_json::from_value::<RawTick>(item) {
            Ok(t) => ticks.push(t),
            Err(_) => malformed += 1,
        }
    }
    Frame::Ticks { ticks, malformed }
}

pub fn subscribe_message(tokens: &[u32]) -> String {
    json!({ "a": "subscribe", "v": tokens }).to_string()
}

pub fn unsubscribe_message(tokens: &[u32]) -> String {
    json!({ "a": "unsubscribe", "v": tokens }).to_string()
}

pub fn mode_message(mode: StreamMode, tokens: &[u32]) -> String {
    json!({ "a": "mode", "v": [mode.as_str(), tokens] }).to_string()
}

/// Subscribe plus mode messages for a set of `(token, mode)` pairs, grouped
/// by mode.
pub fn subscription_messages(tokens: &[(u32, StreamMode)]) -> Vec<String> {
    let mut msgs = Vec::new();
    for mode in [StreamMode::Ltp, StreamMode::Quote, StreamMode::Full] {
        let group: Vec<u32> = tokens
            .iter()
            .filter(|(_, m)| *m == mode)
            .map(|(t, _)| *t)
            .collect();
        if group.is_empty() {
            continue;
        }
        msgs.push(subscribe_message(&group));
        msgs.push(mode_message(mode, &group));
    }
    msgs
}
