//! Wire-level types: the envelope wrapping every control-gateway frame, the
//! events decoded from it, and the handful of REST/voice-gateway payloads
//! the core touches.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

id_type!(GuildId);
id_type!(ChannelId);
id_type!(UserId);

/// The uniform `{op, d, s, t}` envelope wrapping every control-gateway frame.
///
/// `d` is kept as an opaque [`Value`] and re-parsed per opcode, matching
/// the spec's "payload retained as opaque bytes" framing rule.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<i64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// Opcodes consumed or produced on the control gateway.
pub mod control_op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Opcodes consumed or produced on the voice gateway.
pub mod voice_op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
}

/// The two dispatch event-type strings that bootstrap a voice session.
pub const VOICE_STATE_UPDATE_EVENT: &str = "VOICE_STATE_UPDATE";
pub const VOICE_SERVER_UPDATE_EVENT: &str = "VOICE_SERVER_UPDATE";

/// Minimal user info captured from `READY`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
    pub discriminator: String,
    #[serde(default)]
    pub bot: bool,
}

/// One entry of `ReadyInfo.guilds`.
#[derive(Debug, Clone, Deserialize)]
pub struct UnavailableGuild {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: bool,
}

/// State captured on the first `READY` dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyInfo {
    #[serde(rename = "v")]
    pub version: u64,
    pub user: UserInfo,
    #[serde(default)]
    pub private_channels: Vec<Value>,
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    #[serde(default, rename = "_trace")]
    pub trace: Vec<String>,
}

/// The `VOICE_STATE_UPDATE` dispatch payload, as it pertains to this client's
/// own user.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdate {
    pub user_id: UserId,
    pub session_id: String,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

/// The `VOICE_SERVER_UPDATE` dispatch payload.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: GuildId,
    pub endpoint: String,
}

/// The Hello payload (control opcode 10, voice opcode 8).
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The Ready payload on the voice gateway (opcode 2).
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// The Session Description payload on the voice gateway (opcode 4).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

impl Envelope {
    /// Decode a raw JSON value received from the control WebSocket.
    pub fn decode(value: Value) -> Result<Envelope> {
        serde_json::from_value(value).map_err(Error::Json)
    }
}

/// Parse `d` from an already-decoded [`Envelope`] into a concrete type,
/// wrapping failures in [`Error::Decode`].
pub fn parse_payload<T: serde::de::DeserializeOwned>(
    envelope: &Envelope,
    what: &'static str,
) -> Result<T> {
    serde_json::from_value(envelope.d.clone()).map_err(|_| Error::Decode(what, envelope.d.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_dispatch_envelope() {
        let value = json!({ "op": 0, "d": { "hello": "world" }, "s": 12, "t": "MESSAGE_CREATE" });
        let envelope = Envelope::decode(value).unwrap();

        assert_eq!(envelope.op, control_op::DISPATCH);
        assert_eq!(envelope.s, Some(12));
        assert_eq!(envelope.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(envelope.d["hello"], "world");
    }

    #[test]
    fn decodes_envelope_missing_s_and_t() {
        let value = json!({ "op": 11 });
        let envelope = Envelope::decode(value).unwrap();

        assert_eq!(envelope.op, control_op::HEARTBEAT_ACK);
        assert_eq!(envelope.s, None);
        assert_eq!(envelope.t, None);
        assert!(envelope.d.is_null());
    }

    #[test]
    fn parses_ready_fixture() {
        let fixture = json!({
            "op": 0,
            "s": 1,
            "t": "READY",
            "d": {
                "v": 9,
                "user": { "id": "1234", "username": "relay", "discriminator": "0001", "bot": true },
                "private_channels": [],
                "guilds": [ { "id": "5678", "unavailable": true } ],
                "session_id": "abcd1234",
                "_trace": ["[\"gateway-prd\"]"]
            }
        });

        let envelope = Envelope::decode(fixture).unwrap();
        let ready: ReadyInfo = parse_payload(&envelope, "ReadyInfo").unwrap();

        assert_eq!(ready.version, 9);
        assert_eq!(ready.user.id, UserId::from("1234"));
        assert_eq!(ready.session_id, "abcd1234");
        assert_eq!(ready.guilds.len(), 1);
        assert!(ready.guilds[0].unavailable);
    }

    #[test]
    fn parse_payload_wraps_mismatch_in_decode_error() {
        let envelope = Envelope {
            op: control_op::DISPATCH,
            d: json!({ "not": "a ready event" }),
            s: Some(1),
            t: Some("READY".into()),
        };

        match parse_payload::<ReadyInfo>(&envelope, "ReadyInfo") {
            Err(Error::Decode(what, _)) => assert_eq!(what, "ReadyInfo"),
            other => panic!("expected Error::Decode, got {other:?}"),
        }
    }
}
