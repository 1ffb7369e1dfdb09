use serde::{Deserialize, Serialize};

use crate::form::FormField;
use crate::state::AppState;
use crate::stations::StationRecord;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    AddStation { station: StationRecord },
    UpdateStation { original_url: String, station: StationRecord },
    DeleteStation { url: String },
    /// Extended m3u text; every entry goes through `AddStation` rules.
    ImportPlaylist { content: String },
    PlayUrl { url: String },
    Pause,
    TogglePlayPause,
    Volume { value: i64 },
    ToggleMute,
    OpenAddForm,
    OpenEditForm { url: String },
    UpdateFormField { field: FormField, value: String },
    ResetForm,
    SubmitForm,
    CloseForm,
    SignIn { email: String },
    SignOut,
    GetState,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: AppState,
    },
    State {
        data: AppState,
    },
    Notice {
        message: String,
    },
    Log {
        message: String,
    },
    /// A command from this client was rejected.
    Error {
        message: String,
    },
}

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// What sits at the front of a read buffer.
#[derive(Debug)]
pub enum Frame {
    /// More bytes are needed.
    Incomplete,
    /// One message, spanning the given number of bytes.
    Complete(Message, usize),
    /// A whole frame that is not a message we know; skip the given number
    /// of bytes and carry on.
    Invalid { error: String, consumed: usize },
    /// The length header is above [`MAX_FRAME_LEN`].  The stream cannot be
    /// trusted any more.
    Oversized(usize),
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// 4-byte big-endian length, then the JSON body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = u32::try_from(json.len())?;
        let mut frame = Vec::with_capacity(4 + json.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&json);
        Ok(frame)
    }

    /// Decode one frame from the front of `data`, returning the message and
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        match Self::next_frame(data) {
            Frame::Complete(msg, consumed) => Ok((msg, consumed)),
            Frame::Incomplete => anyhow::bail!("Insufficient data for message"),
            Frame::Invalid { error, .. } => anyhow::bail!("Invalid message: {}", error),
            Frame::Oversized(len) => anyhow::bail!("Frame of {} bytes exceeds limit", len),
        }
    }

    /// Like [`Message::decode`], but tells a short buffer apart from a bad
    /// frame so a reader can skip the latter.
    pub fn next_frame(data: &[u8]) -> Frame {
        let Some(header) = data.get(..4) else {
            return Frame::Incomplete;
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Frame::Oversized(len);
        }
        let Some(body) = data.get(4..4 + len) else {
            return Frame::Incomplete;
        };
        match serde_json::from_slice(body) {
            Ok(msg) => Frame::Complete(msg, 4 + len),
            Err(e) => Frame::Invalid {
                error: e.to_string(),
                consumed: 4 + len,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_decodes() {
        let msg = Message::Command(Command::UpdateStation {
            original_url: "https://old".into(),
            station: StationRecord::new("https://new", "X", ""),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::UpdateStation { original_url, station }) => {
                assert_eq!(original_url, "https://old");
                assert_eq!(station.url, "https://new");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn unit_commands_use_cmd_tag() {
        let json = serde_json::to_string(&Command::TogglePlayPause).unwrap();
        assert_eq!(json, r#"{"cmd":"TogglePlayPause"}"#);
        let field: Command =
            serde_json::from_str(r#"{"cmd":"UpdateFormField","field":"url","value":"https://x"}"#)
                .unwrap();
        assert_eq!(
            field,
            Command::UpdateFormField {
                field: FormField::Url,
                value: "https://x".into()
            }
        );
    }

    #[test]
    fn hello_carries_rev() {
        let state = AppState {
            rev: 42,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(rev, 42);
                assert_eq!(state.rev, 42);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_skippable() {
        let body = br#"{"cmd":"NoSuchCommand"}"#;
        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&Message::Command(Command::Pause).encode().unwrap());

        let Frame::Invalid { consumed, .. } = Message::next_frame(&data) else {
            panic!("expected an invalid frame");
        };
        assert_eq!(consumed, 4 + body.len());
        assert!(matches!(
            Message::next_frame(&data[consumed..]),
            Frame::Complete(Message::Command(Command::Pause), _)
        ));
    }

    #[test]
    fn oversized_header_is_refused_early() {
        let data = u32::MAX.to_be_bytes();
        assert!(matches!(Message::next_frame(&data), Frame::Oversized(_)));
        assert!(matches!(Message::next_frame(&data[..3]), Frame::Incomplete));
    }

    #[test]
    fn partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Pause).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
