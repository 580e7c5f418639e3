//! The orchestrator: owns one control gateway and at most one voice
//! session, and is the crate's main entry point.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::gateway::{ControlGateway, IdentifyProperties};
use crate::model::{ChannelId, GuildId, ReadyInfo, UserId};
use crate::voice::{VoiceSession, VoiceState};
use crate::{Error, Result};

/// The top-level handle: one control-gateway connection, plus whichever
/// single voice session is currently connected.
pub struct Client {
    gateway: Arc<ControlGateway>,
    user_id: UserId,
    voice: Mutex<Option<Arc<VoiceSession>>>,
}

impl Client {
    /// Discover the gateway, connect, and identify. Blocks until the first
    /// `READY` dispatch has been received.
    pub async fn connect(
        host: impl Into<String>,
        token: impl Into<String>,
        properties: IdentifyProperties,
    ) -> Result<Arc<Client>> {
        let (gateway, ready): (Arc<ControlGateway>, ReadyInfo) =
            ControlGateway::connect(host, token, properties).await?;

        Ok(Arc::new(Client {
            gateway,
            user_id: ready.user.id,
            voice: Mutex::new(None),
        }))
    }

    /// Register a handler for a dispatch event type (e.g. `"MESSAGE_CREATE"`).
    pub async fn on<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.gateway.on(event_type, handler).await;
    }

    /// Join a voice channel, running the full bootstrap/handshake/UDP
    /// discovery pipeline and returning once media can be sent. Only one
    /// voice session is kept at a time; joining again replaces it.
    pub async fn join_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<VoiceSession>> {
        let mut slot = self.voice.lock().await;
        if let Some(previous) = slot.take() {
            previous.disconnect();
        }

        let session = VoiceSession::connect(
            self.gateway.clone(),
            guild_id,
            channel_id,
            self.user_id.clone(),
        )
        .await?;

        *slot = Some(session.clone());
        Ok(session)
    }

    /// Send one pre-encoded 20ms Opus frame through the active voice
    /// session, if any.
    pub async fn send_opus(&self, frame: Vec<u8>) -> Result<()> {
        match self.voice.lock().await.as_ref() {
            Some(session) => session.send_opus(frame),
            None => Err(Error::Other("no active voice session")),
        }
    }

    /// Toggle speaking state (op 5) on the active voice session, if any.
    /// Must be sent `true` before any `send_opus` call.
    pub async fn speaking(&self, speaking: bool) -> Result<()> {
        match self.voice.lock().await.as_ref() {
            Some(session) => session.speaking(speaking).await,
            None => Err(Error::Other("no active voice session")),
        }
    }

    /// Tear down the active voice session, if any, and clear the slot.
    pub async fn disconnect_voice(&self) {
        if let Some(session) = self.voice.lock().await.take() {
            session.disconnect();
        }
    }

    /// The lifecycle state of the active voice session, if any.
    pub async fn voice_state(&self) -> Option<VoiceState> {
        match self.voice.lock().await.as_ref() {
            Some(session) => Some(session.state().await),
            None => None,
        }
    }
}
