//! The voice WebSocket handshake: dial, identify, Ready, `SELECT_PROTOCOL`,
//! and the session description carrying the secretbox key.

use futures::StreamExt;
use serde_json::{json, Value};
use websockets::WebSocket;

use crate::io::{send_json, JsonSink, JsonStream, SharedJsonSink};
use crate::model::{parse_payload, voice_op, Envelope, GuildId, SessionDescription, UserId, VoiceReady};
use crate::{Error, Result};

/// The secretbox mode this client offers and expects; the only mode every
/// service implementation is guaranteed to support.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// Build the voice gateway WebSocket URL from the endpoint handed out by
/// `VOICE_SERVER_UPDATE`, which sometimes carries a stray `:80` suffix.
pub fn voice_gateway_url(endpoint: &str) -> String {
    let host = endpoint.trim_end_matches(":80");
    format!("wss://{host}/?v=4")
}

/// Dial the voice WebSocket, wait for Hello, and send Identify (op 0).
/// Returns the shared sink, the receiving stream, and the heartbeat
/// interval the server asked for.
pub async fn dial_and_identify(
    url: &str,
    guild_id: &GuildId,
    user_id: &UserId,
    session_id: &str,
    token: &str,
) -> Result<(SharedJsonSink, JsonStream<Value>, u64)> {
    let ws = WebSocket::connect(url)
        .await
        .map_err(|_| Error::WSDialFailed("voice gateway dial failed"))?;
    let (read, write) = ws.split();
    let mut receiver = JsonStream::<Value>::new(read);
    let mut sender = SharedJsonSink::new(JsonSink::new(write));

    let interval = await_hello(&mut receiver).await?;

    let identify = json! {{
        "op": voice_op::IDENTIFY,
        "d": {
            "server_id": guild_id.0,
            "user_id": user_id.0,
            "session_id": session_id,
            "token": token,
        }
    }};
    send_json(&mut sender, identify).await?;

    Ok((sender, receiver, interval))
}

/// Redial the same voice WebSocket endpoint and send Resume (op 7) instead
/// of a fresh Identify. No UDP re-discovery or `SELECT_PROTOCOL` exchange
/// follows: the caller keeps its existing UDP socket, secret key, and RTP
/// sequence state and only swaps in the new sink/stream pair.
pub async fn resume(
    url: &str,
    guild_id: &GuildId,
    session_id: &str,
    token: &str,
) -> Result<(SharedJsonSink, JsonStream<Value>, u64)> {
    let ws = WebSocket::connect(url)
        .await
        .map_err(|_| Error::WSDialFailed("voice gateway resume dial failed"))?;
    let (read, write) = ws.split();
    let mut receiver = JsonStream::<Value>::new(read);
    let mut sender = SharedJsonSink::new(JsonSink::new(write));

    let interval = await_hello(&mut receiver).await?;

    let resume = json! {{
        "op": voice_op::RESUME,
        "d": {
            "server_id": guild_id.0,
            "session_id": session_id,
            "token": token,
        }
    }};
    send_json(&mut sender, resume).await?;

    Ok((sender, receiver, interval))
}

async fn await_hello(receiver: &mut JsonStream<Value>) -> Result<u64> {
    let value = receiver
        .next()
        .await
        .ok_or(Error::WSDialFailed("voice gateway closed before Hello"))?
        .map_err(Error::from)?;
    let envelope = Envelope::decode(value)?;
    if envelope.op != voice_op::HELLO {
        return Err(Error::Protocol("expected Hello during voice handshake"));
    }
    let hello: crate::model::Hello = parse_payload(&envelope, "Hello")?;
    Ok(hello.heartbeat_interval)
}

/// Read envelopes until the voice Ready (op 2) arrives, ignoring anything
/// else (a heartbeat ack can race it in principle).
pub async fn read_ready(receiver: &mut JsonStream<Value>) -> Result<VoiceReady> {
    loop {
        let value = receiver
            .next()
            .await
            .ok_or(Error::WSDialFailed("voice gateway closed before Ready"))?
            .map_err(Error::from)?;
        let envelope = Envelope::decode(value)?;
        if envelope.op == voice_op::READY {
            return parse_payload(&envelope, "VoiceReady");
        }
    }
}

/// Send `SELECT_PROTOCOL` (op 1) with the externally-visible address/port
/// learned from UDP IP discovery.
pub async fn select_protocol(sender: &mut SharedJsonSink, address: &str, port: u16) -> Result<()> {
    let payload = json! {{
        "op": voice_op::SELECT_PROTOCOL,
        "d": {
            "protocol": "udp",
            "data": {
                "address": address,
                "port": port,
                "mode": ENCRYPTION_MODE,
            }
        }
    }};
    send_json(sender, payload).await
}

/// Read envelopes until the session description (op 4) arrives, yielding
/// the secretbox key.
pub async fn read_session_description(receiver: &mut JsonStream<Value>) -> Result<SessionDescription> {
    loop {
        let value = receiver
            .next()
            .await
            .ok_or(Error::WSDialFailed("voice gateway closed before session description"))?
            .map_err(Error::from)?;
        let envelope = Envelope::decode(value)?;
        if envelope.op == voice_op::SESSION_DESCRIPTION {
            let description: SessionDescription = parse_payload(&envelope, "SessionDescription")?;
            if description.mode != ENCRYPTION_MODE {
                return Err(Error::CryptoKeyingFailed("service selected an unsupported encryption mode"));
            }
            if description.secret_key.len() != 32 {
                return Err(Error::CryptoKeyingFailed("secret key was not 32 bytes"));
            }
            return Ok(description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_stray_port_suffix() {
        assert_eq!(
            voice_gateway_url("rtc-1.example.com:80"),
            "wss://rtc-1.example.com/?v=4"
        );
        assert_eq!(voice_gateway_url("rtc-2.example.com"), "wss://rtc-2.example.com/?v=4");
    }
}
