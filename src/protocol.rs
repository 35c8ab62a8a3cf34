//! Arbitration wire protocol: newline-delimited JSON messages over a UNIX
//! domain stream socket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "auth_response")]
    AuthResponse { pid: i32, success: bool },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "process_event")]
    ProcessEvent {
        pid: i32,
        command: String,
        app_name: String,
        exec_hash: String,
        parent_pid: i32,
    },
}

pub fn encode(msg: &ServerMessage) -> String {
    // `serde_json::to_string` never fails for these plain-data enums; a
    // failure here would be a programmer error, not a runtime condition.
    let mut line = serde_json::to_string(msg).expect("ServerMessage always serializes");
    line.push('\n');
    line
}

pub fn decode_client_message(line: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ping() {
        assert_eq!(
            decode_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn decodes_auth_response() {
        assert_eq!(
            decode_client_message(r#"{"type":"auth_response","pid":1234,"success":true}"#)
                .unwrap(),
            ClientMessage::AuthResponse {
                pid: 1234,
                success: true
            }
        );
    }

    #[test]
    fn decodes_shutdown() {
        assert_eq!(
            decode_client_message(r#"{"type":"shutdown"}"#).unwrap(),
            ClientMessage::Shutdown
        );
    }

    #[test]
    fn encodes_process_event_with_trailing_newline() {
        let msg = ServerMessage::ProcessEvent {
            pid: 1234,
            command: "/usr/bin/firefox".into(),
            app_name: "firefox".into(),
            exec_hash: "ab".into(),
            parent_pid: 1000,
        };
        let line = encode(&msg);
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"pid\":1234"));
    }

    #[test]
    fn unknown_message_kind_is_an_error() {
        assert!(decode_client_message(r#"{"type":"bogus"}"#).is_err());
    }
}
