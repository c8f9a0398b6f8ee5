//! Control-plane message envelopes for the terminal and monitor sockets.
//!
//! Terminal data bytes travel as raw binary frames and never pass through
//! these types; only control messages are JSON text frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text frames from a terminal client. Unknown types deserialize to
/// `Unknown` and are ignored rather than treated as fatal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientControl {
    /// Raw input bytes that must be JSON-safe (control sequences).
    Input(String),
    Resize { cols: u16, rows: u16 },
    Ping,
    Close,
    #[serde(other)]
    Unknown,
}

/// Text frames to a terminal client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerControl {
    Connected { session_id: Uuid },
    Pong,
    Error { error: String, message: String },
    Closed,
}

/// Text frames from a monitor client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorClientMessage {
    Ping { ts: i64 },
    #[serde(other)]
    Unknown,
}

/// Text frames to a monitor client. Metric frames themselves are binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorServerMessage {
    Pong {
        ts: i64,
        #[serde(rename = "serverRecvTs")]
        server_recv_ts: i64,
        #[serde(rename = "serverSendTs")]
        server_send_ts: i64,
    },
    Error {
        error: String,
        message: String,
    },
}

/// WebSocket close code for a monitor stream whose target became
/// unreachable, distinct from a normal close.
pub const MONITOR_CLOSE_UNREACHABLE: u16 = 4000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_envelope_parses_wire_shape() {
        let msg: ClientControl =
            serde_json::from_str(r#"{"type":"resize","data":{"cols":120,"rows":40}}"#)
                .expect("parse");
        assert_eq!(msg, ClientControl::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn input_envelope_carries_raw_string() {
        let msg: ClientControl =
            serde_json::from_str(r#"{"type":"input","data":"ls -la\n"}"#).expect("parse");
        assert_eq!(msg, ClientControl::Input("ls -la\n".to_string()));
    }

    #[test]
    fn ping_has_no_data() {
        let msg: ClientControl = serde_json::from_str(r#"{"type":"ping"}"#).expect("parse");
        assert_eq!(msg, ClientControl::Ping);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg: ClientControl =
            serde_json::from_str(r#"{"type":"vibrate","data":{"ms":100}}"#).expect("parse");
        assert_eq!(msg, ClientControl::Unknown);
    }

    #[test]
    fn connected_serializes_with_session_id() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ServerControl::Connected { session_id: id })
            .expect("serialize");
        assert_eq!(json["type"], "connected");
        assert_eq!(json["data"]["session_id"], id.to_string());
    }

    #[test]
    fn pong_and_closed_are_bare_envelopes() {
        assert_eq!(
            serde_json::to_string(&ServerControl::Pong).expect("serialize"),
            r#"{"type":"pong"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerControl::Closed).expect("serialize"),
            r#"{"type":"closed"}"#
        );
    }

    #[test]
    fn error_envelope_has_code_and_message() {
        let json = serde_json::to_value(ServerControl::Error {
            error: "host_key_changed".into(),
            message: "fingerprints differ".into(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["error"], "host_key_changed");
        assert_eq!(json["data"]["message"], "fingerprints differ");
    }

    #[test]
    fn monitor_pong_uses_camel_case_timestamps() {
        let json = serde_json::to_value(MonitorServerMessage::Pong {
            ts: 1,
            server_recv_ts: 2,
            server_send_ts: 3,
        })
        .expect("serialize");
        assert_eq!(json["type"], "pong");
        assert_eq!(json["serverRecvTs"], 2);
        assert_eq!(json["serverSendTs"], 3);
    }

    #[test]
    fn monitor_ping_parses_with_timestamp() {
        let msg: MonitorClientMessage =
            serde_json::from_str(r#"{"type":"ping","ts":1700000000}"#).expect("parse");
        assert_eq!(msg, MonitorClientMessage::Ping { ts: 1_700_000_000 });
    }
}
