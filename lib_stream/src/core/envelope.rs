//! # Wire Envelopes
//!
//! Outbound traffic is always an action/payload pair `{"a": .., "p": ..}`.
//! Inbound frames come in several shapes and are classified here, once, so that
//! no other component ever looks at raw JSON:
//!
//! - `{"type": "pong"}` / `{"a": "pong"}` → heartbeat acknowledgement
//! - `{"type": "stream" | "widget_content" | "page_stream" | "table_stream", ..}`
//! - `{"a": <action>, "p": <payload>}` → routed by action name
//! - `{"percent": <0-100>, "operation"?: .., "id"?: ..}` → progress update

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::bounds::{ScrollDirection, ViewportBounds};
use crate::core::errors::{ParseError, TransportError};

/// Action used to request content for a viewport region.
pub const PAGE_STREAM_ACTION: &str = "page.stream";
/// Outbound heartbeat action.
pub const PING_ACTION: &str = "ping";
/// Heartbeat acknowledgement, as either `type` or `a`.
pub const PONG_ACTION: &str = "pong";

/// Outbound `{a, p}` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Dotted action name.
    pub a: String,
    /// Arbitrary JSON payload.
    pub p: Value,
}

impl OutboundEnvelope {
    /// Wraps `payload` under `action`.
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self { a: action.into(), p: payload }
    }

    /// Heartbeat carrying the sender's epoch-millisecond clock.
    pub fn ping(ts_ms: i64) -> Self {
        Self::new(PING_ACTION, json!({ "ts": ts_ms }))
    }

    /// `page.stream` request for one viewport region.
    pub fn page_stream(request: &PageStreamRequest) -> Result<Self, TransportError> {
        let payload =
            serde_json::to_value(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(Self::new(PAGE_STREAM_ACTION, payload))
    }

    /// Action name.
    pub fn action(&self) -> &str {
        &self.a
    }

    /// Serialises to the text frame sent on the wire.
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }
}

/// Viewport as it appears inside a `page.stream` request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestViewport {
    /// Top edge.
    pub top: f64,
    /// Bottom edge.
    pub bottom: f64,
    /// Left edge.
    pub left: f64,
    /// Right edge.
    pub right: f64,
    /// Most recent direction of travel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_direction: Option<ScrollDirection>,
}

impl From<&ViewportBounds> for RequestViewport {
    fn from(bounds: &ViewportBounds) -> Self {
        Self {
            top: bounds.top,
            bottom: bounds.bottom,
            left: bounds.left,
            right: bounds.right,
            scroll_direction: bounds.scroll_direction,
        }
    }
}

/// Payload of a `page.stream` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStreamRequest {
    /// Page being tracked.
    pub page_id: String,
    /// Region of interest.
    pub viewport: RequestViewport,
    /// How far beyond the viewport the server should include content.
    pub preload_buffer: f64,
}

impl PageStreamRequest {
    /// Builds the request for `page_id` at `bounds`.
    pub fn new(page_id: impl Into<String>, bounds: &ViewportBounds, preload_buffer: f64) -> Self {
        Self {
            page_id: page_id.into(),
            viewport: RequestViewport::from(bounds),
            preload_buffer,
        }
    }
}

/// Where outbound envelopes go.
///
/// The transport implements this; the viewport tracker only depends on it.
pub trait OutboundSink: Send + Sync {
    /// Offers one envelope. Implementations drop (and report) rather than buffer.
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), TransportError>;
}

/// Progress update `{percent, operation?, id?, label?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Percentage, expected within 0–100.
    pub percent: f64,
    /// Operation the progress belongs to.
    #[serde(default)]
    pub operation: Option<String>,
    /// Identifier within the operation.
    #[serde(default)]
    pub id: Option<String>,
    /// Human readable label.
    #[serde(default)]
    pub label: Option<String>,
}

/// Generic `type: "stream"` chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Operation the chunk belongs to.
    #[serde(default)]
    pub operation: Option<String>,
    /// Identifier within the operation.
    #[serde(default)]
    pub id: Option<String>,
    /// Chunk body.
    #[serde(default)]
    pub data: Value,
    /// Last chunk of the stream.
    #[serde(default)]
    pub complete: bool,
}

/// `type: "widget_content"` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetContent {
    /// Page the widget lives on, when known.
    #[serde(default)]
    pub page_id: Option<String>,
    /// Widget instance identifier.
    pub widget_id: String,
    /// Content body.
    #[serde(default)]
    pub content: Value,
}

/// `type: "page_stream"` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStreamPayload {
    /// Page the section belongs to.
    pub page_id: String,
    /// Section key string. Absent on completion-only messages.
    #[serde(default)]
    pub viewport_section: Option<String>,
    /// Modules in the section.
    #[serde(default)]
    pub modules: Vec<Value>,
    /// Widgets in the section.
    #[serde(default)]
    pub widgets: Vec<Value>,
    /// Page layout metadata (totals).
    #[serde(default)]
    pub layout: Option<Value>,
    /// Explicit bounds of the section, when the server sends them.
    #[serde(default)]
    pub bounds: Option<ViewportBounds>,
    /// Whole page has been delivered.
    #[serde(default)]
    pub complete: bool,
}

/// `type: "table_stream"` chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStreamChunk {
    /// Table identifier.
    pub table_id: String,
    /// Page the table lives on, when known.
    #[serde(default)]
    pub page_id: Option<String>,
    /// Rows in this chunk.
    #[serde(default)]
    pub rows: Vec<Value>,
    /// Index of the first row of this chunk. Appends when absent.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Total row count, when known.
    #[serde(default)]
    pub total: Option<usize>,
    /// Last chunk of the table.
    #[serde(default)]
    pub complete: bool,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// `{a, p}` pair, routed by action.
    Action {
        /// Dotted action name.
        action: String,
        /// Payload, `Null` when absent.
        payload: Value,
    },
    /// Progress update.
    Progress(ProgressUpdate),
    /// Generic stream chunk.
    Stream(StreamChunk),
    /// Widget content.
    WidgetContent(WidgetContent),
    /// Viewport section response.
    PageStream(PageStreamPayload),
    /// Table rows.
    TableStream(TableStreamChunk),
    /// Heartbeat acknowledgement.
    Pong,
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, kind: &str) -> Result<T, ParseError> {
    serde_json::from_value(value).map_err(|e| ParseError::Json(format!("{kind}: {e}")))
}

impl InboundMessage {
    /// Parses and classifies one text frame.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;
        Self::classify(value)
    }

    /// Classifies an already-parsed frame by shape.
    pub fn classify(value: Value) -> Result<Self, ParseError> {
        let Some(map) = value.as_object() else {
            return Err(ParseError::UnknownShape(truncate(&value)));
        };

        let kind = map.get("type").and_then(Value::as_str).map(str::to_owned);
        let action = map.get("a").and_then(Value::as_str).map(str::to_owned);
        let is_progress = map.contains_key("percent");

        if let Some(kind) = kind {
            return match kind.as_str() {
                PONG_ACTION => Ok(Self::Pong),
                "stream" => decode(value, "stream").map(Self::Stream),
                "widget_content" => decode(value, "widget_content").map(Self::WidgetContent),
                "page_stream" => decode(value, "page_stream").map(Self::PageStream),
                "table_stream" => decode(value, "table_stream").map(Self::TableStream),
                other => Err(ParseError::UnknownShape(format!("type '{other}'"))),
            };
        }

        if let Some(action) = action {
            if action == PONG_ACTION {
                return Ok(Self::Pong);
            }
            let payload = value.get("p").cloned().unwrap_or(Value::Null);
            return Ok(Self::Action { action, payload });
        }

        if is_progress {
            return decode(value, "progress").map(Self::Progress);
        }

        Err(ParseError::UnknownShape(truncate(&value)))
    }
}

fn truncate(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 120 {
        let mut cut = 120;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_is_action_payload_pair() {
        let env = OutboundEnvelope::new("discovery.widget.list", json!({}));
        let text = env.to_json().unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json!({ "a": "discovery.widget.list", "p": {} }));
    }

    #[test]
    fn test_page_stream_request_shape() {
        let bounds = ViewportBounds::new(0.0, 500.0, 0.0, 300.0)
            .with_direction(Some(ScrollDirection::Down));
        let env = OutboundEnvelope::page_stream(&PageStreamRequest::new("home", &bounds, 200.0)).unwrap();

        assert_eq!(env.a, "page.stream");
        assert_eq!(
            env.p,
            json!({
                "page_id": "home",
                "viewport": { "top": 0.0, "bottom": 500.0, "left": 0.0, "right": 300.0, "scrollDirection": "down" },
                "preload_buffer": 200.0
            })
        );
    }

    #[test]
    fn test_request_omits_missing_direction() {
        let bounds = ViewportBounds::new(0.0, 10.0, 0.0, 10.0);
        let env = OutboundEnvelope::page_stream(&PageStreamRequest::new("p", &bounds, 200.0)).unwrap();
        assert!(env.p["viewport"].get("scrollDirection").is_none());
    }

    #[test]
    fn test_classify_heartbeat_variants() {
        assert_eq!(InboundMessage::parse(r#"{"type":"pong"}"#).unwrap(), InboundMessage::Pong);
        assert_eq!(InboundMessage::parse(r#"{"a":"pong"}"#).unwrap(), InboundMessage::Pong);
    }

    #[test]
    fn test_classify_action_without_payload() {
        let msg = InboundMessage::parse(r#"{"a":"discovery.page.list.response"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Action {
                action: "discovery.page.list.response".into(),
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn test_classify_page_stream() {
        let text = r#"{"type":"page_stream","page_id":"home","viewport_section":"0-500_0-300",
                       "modules":[{"id":"m1"}],"widgets":[],"layout":{"totalHeight":4000},"complete":false}"#;
        match InboundMessage::parse(text).unwrap() {
            InboundMessage::PageStream(p) => {
                assert_eq!(p.page_id, "home");
                assert_eq!(p.viewport_section.as_deref(), Some("0-500_0-300"));
                assert_eq!(p.modules.len(), 1);
                assert!(!p.complete);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_progress_with_and_without_keys() {
        match InboundMessage::parse(r#"{"percent":42}"#).unwrap() {
            InboundMessage::Progress(p) => {
                assert_eq!(p.percent, 42.0);
                assert!(p.operation.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        match InboundMessage::parse(r#"{"percent":7.5,"operation":"analyze","id":"p1"}"#).unwrap() {
            InboundMessage::Progress(p) => {
                assert_eq!(p.operation.as_deref(), Some("analyze"));
                assert_eq!(p.id.as_deref(), Some("p1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_type_takes_precedence_over_action() {
        let msg = InboundMessage::parse(r#"{"type":"widget_content","a":"x","widget_id":"w1","content":"hi"}"#).unwrap();
        assert!(matches!(msg, InboundMessage::WidgetContent(ref w) if w.widget_id == "w1"));
    }

    #[test]
    fn test_malformed_and_unknown_frames_are_errors() {
        assert!(matches!(InboundMessage::parse("{not json"), Err(ParseError::Json(_))));
        assert!(matches!(InboundMessage::parse("[1,2]"), Err(ParseError::UnknownShape(_))));
        assert!(matches!(InboundMessage::parse(r#"{"hello":1}"#), Err(ParseError::UnknownShape(_))));
        assert!(matches!(InboundMessage::parse(r#"{"type":"weird"}"#), Err(ParseError::UnknownShape(_))));
        // Known type with a missing required field.
        assert!(matches!(InboundMessage::parse(r#"{"type":"table_stream"}"#), Err(ParseError::Json(_))));
    }
}
