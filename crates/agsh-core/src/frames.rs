//! Control frames multiplexed onto a session stream.
//!
//! A stream connection carries two kinds of WebSocket frames: binary frames
//! are raw terminal bytes in both directions, text frames are JSON control
//! messages. Resize travels client→server; exit travels server→client just
//! before the socket closes.

use serde::{Deserialize, Serialize};

use crate::error::{AgshError, AgshResult};

/// Close code: caller identity missing from the trusted proxy headers.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// Close code: unknown session id, or a session owned by someone else.
pub const CLOSE_NOT_FOUND: u16 = 4004;

/// Close code: the session's process has exited; reconnecting will not help.
pub const CLOSE_EXITED: u16 = 4005;

/// Largest inbound frame accepted on a stream connection.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// A JSON control message carried in a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Client request to change terminal geometry.
    Resize { cols: u16, rows: u16 },
    /// Server notification that the child process terminated.
    Exit { code: Option<i32> },
}

impl ControlFrame {
    /// Parse a control frame from the text payload of a stream message.
    pub fn parse(text: &str) -> AgshResult<Self> {
        serde_json::from_str(text).map_err(|e| AgshError::InvalidFrame(e.to_string()))
    }

    /// Serialize for transmission as a text frame.
    pub fn to_json(&self) -> String {
        // Serialization of these variants cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_round_trip() {
        let frame = ControlFrame::parse(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(
            frame,
            ControlFrame::Resize {
                cols: 120,
                rows: 40
            }
        );
        assert_eq!(
            ControlFrame::parse(&frame.to_json()).unwrap(),
            frame
        );
    }

    #[test]
    fn exit_carries_code() {
        let json = ControlFrame::Exit { code: Some(1) }.to_json();
        assert_eq!(json, r#"{"type":"exit","code":1}"#);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ControlFrame::parse(r#"{"type":"reboot"}"#).is_err());
        assert!(ControlFrame::parse("not json").is_err());
    }
}
