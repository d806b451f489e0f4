//! Client ↔ relay message framing.
//!
//! Text frames carry JSON control messages of the form
//! `{"type": "...", "data": ...}`. Anything that does not decode as one of the
//! known control messages is passed through to the shell as raw text. Binary
//! frames carry upload payloads (client → relay) and download payloads
//! (relay → client).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// A raw message on the client connection, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u32,
    pub rows: u32,
}

impl Geometry {
    pub const fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Apply new terminal geometry to the remote PTY.
    Resize(Geometry),
    /// Keystrokes for the shell.
    Content(String),
    /// Liveness probe; answered with a heartbeat frame.
    Heartbeat,
    /// Fetch a remote file and send it back.
    Download(String),
    /// Announce the file name of the next binary payload.
    Upload(String),
    /// Bytes of the most recently announced upload.
    UploadData(Vec<u8>),
    /// Text that is not a control frame; forwarded to the shell untouched.
    RawFallback(String),
}

#[derive(Deserialize)]
struct ControlEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ClientFrame {
    /// Interpret a wire message. Never fails: malformed text becomes
    /// [`ClientFrame::RawFallback`].
    pub fn decode(message: WireMessage) -> Self {
        match message {
            WireMessage::Binary(bytes) => ClientFrame::UploadData(bytes),
            WireMessage::Text(text) => Self::decode_text(text),
        }
    }

    /// Interpret a text frame, falling back to raw passthrough.
    pub fn decode_text(text: String) -> Self {
        match Self::decode_control(&text) {
            Ok(frame) => frame,
            Err(_) => ClientFrame::RawFallback(text),
        }
    }

    /// Strict decoding of a control frame.
    pub fn decode_control(text: &str) -> RelayResult<Self> {
        let envelope: ControlEnvelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "resize" => Ok(ClientFrame::Resize(serde_json::from_value(envelope.data)?)),
            "content" => Ok(ClientFrame::Content(expect_string(envelope.data, "content")?)),
            "heartbeat" => Ok(ClientFrame::Heartbeat),
            "download" => Ok(ClientFrame::Download(expect_string(envelope.data, "download")?)),
            "upload" => Ok(ClientFrame::Upload(expect_string(envelope.data, "upload")?)),
            other => Err(RelayError::Decode(format!("unknown frame type: {other}"))),
        }
    }
}

fn expect_string(data: Value, kind: &str) -> RelayResult<String> {
    match data {
        Value::String(s) => Ok(s),
        other => Err(RelayError::Decode(format!(
            "{kind} frame expects a string payload, got {other}"
        ))),
    }
}

/// Frames sent from the relay to the client as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Remote shell output.
    Content(String),
    /// A transfer completed.
    Success(String),
    /// A recoverable failure the user should see.
    Error(String),
    /// Name of the file whose bytes follow in the next binary frame.
    File(String),
    /// Heartbeat acknowledgment.
    Heartbeat(String),
}

impl ServerFrame {
    pub fn pong() -> Self {
        ServerFrame::Heartbeat("pong".to_string())
    }

    pub fn to_json(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_wire(self) -> RelayResult<WireMessage> {
        Ok(WireMessage::Text(self.to_json()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_resize() {
        let frame = ClientFrame::decode_text(r#"{"type":"resize","data":{"cols":120,"rows":40}}"#.into());
        assert_eq!(frame, ClientFrame::Resize(Geometry::new(120, 40)));
    }

    #[test]
    fn decodes_content_and_transfers() {
        assert_eq!(
            ClientFrame::decode_text(r#"{"type":"content","data":"ls\r"}"#.into()),
            ClientFrame::Content("ls\r".into())
        );
        assert_eq!(
            ClientFrame::decode_text(r#"{"type":"download","data":"/etc/hosts"}"#.into()),
            ClientFrame::Download("/etc/hosts".into())
        );
        assert_eq!(
            ClientFrame::decode_text(r#"{"type":"upload","data":"notes.txt"}"#.into()),
            ClientFrame::Upload("notes.txt".into())
        );
    }

    #[test]
    fn heartbeat_ignores_payload() {
        assert_eq!(
            ClientFrame::decode_text(r#"{"type":"heartbeat","data":"ping"}"#.into()),
            ClientFrame::Heartbeat
        );
        assert_eq!(
            ClientFrame::decode_text(r#"{"type":"heartbeat"}"#.into()),
            ClientFrame::Heartbeat
        );
    }

    #[test]
    fn plain_text_falls_back_to_raw() {
        assert_eq!(
            ClientFrame::decode_text("l".into()),
            ClientFrame::RawFallback("l".into())
        );
        // Valid JSON that is not an object is still keystrokes.
        assert_eq!(
            ClientFrame::decode_text("1".into()),
            ClientFrame::RawFallback("1".into())
        );
    }

    #[test]
    fn unknown_or_malformed_control_falls_back_to_raw() {
        let unknown = r#"{"type":"reboot","data":""}"#;
        assert_eq!(
            ClientFrame::decode_text(unknown.into()),
            ClientFrame::RawFallback(unknown.into())
        );
        let bad_resize = r#"{"type":"resize","data":"big"}"#;
        assert_eq!(
            ClientFrame::decode_text(bad_resize.into()),
            ClientFrame::RawFallback(bad_resize.into())
        );
        assert!(matches!(
            ClientFrame::decode_control(bad_resize),
            Err(RelayError::Decode(_))
        ));
    }

    #[test]
    fn binary_is_upload_data() {
        assert_eq!(
            ClientFrame::decode(WireMessage::Binary(vec![1, 2, 3])),
            ClientFrame::UploadData(vec![1, 2, 3])
        );
    }

    #[test]
    fn server_frames_use_type_and_data() {
        let json = ServerFrame::Content("$ ".into()).to_json().unwrap();
        assert_eq!(json, r#"{"type":"content","data":"$ "}"#);
        let json = ServerFrame::pong().to_json().unwrap();
        assert_eq!(json, r#"{"type":"heartbeat","data":"pong"}"#);
        let parsed: ServerFrame = serde_json::from_str(r#"{"type":"file","data":"a.txt"}"#).unwrap();
        assert_eq!(parsed, ServerFrame::File("a.txt".into()));
    }
}
