//! The voice session controller: drives bootstrap → WebSocket handshake →
//! UDP discovery → active media through a small state machine, and owns
//! the voice gateway's own heartbeat/resume loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sodiumoxide::crypto::secretbox;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::gateway::ControlGateway;
use crate::io::{send_json, JsonStream, SharedJsonSink};
use crate::model::{
    parse_payload, voice_op, ChannelId, Envelope, GuildId, UserId, VoiceServerUpdate,
    VoiceStateUpdate, VOICE_SERVER_UPDATE_EVENT, VOICE_STATE_UPDATE_EVENT,
};
use crate::voice::handshake;
use crate::voice::media::{discover_ip, MediaSender};
use crate::{Error, Result};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);
const MEDIA_QUEUE_DEPTH: usize = 4;

/// Coarse lifecycle state of a voice session, observable for logging and
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    BootstrapWait,
    WsOpening,
    Identified,
    UdpDiscovering,
    Active,
    Reconnecting,
    Failed,
    /// Torn down cleanly via `disconnect()`.
    Idle,
}

struct Bootstrap {
    state_update: VoiceStateUpdate,
    server_update: VoiceServerUpdate,
}

/// An active (or reconnecting) voice session for one guild.
pub struct VoiceSession {
    state: RwLock<VoiceState>,
    sender: Arc<RwLock<SharedJsonSink>>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    rebind_tx: mpsc::Sender<(UdpSocket, SocketAddr)>,
    ssrc: u32,
    speaking: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl VoiceSession {
    /// Request a voice connection on the control gateway, run the full
    /// handshake, and spawn the background tasks that keep it alive.
    pub async fn connect(
        gateway: Arc<ControlGateway>,
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<Arc<VoiceSession>> {
        gateway.request_voice(&guild_id, &channel_id).await?;
        let bootstrap = recv_bootstrap(&gateway, 2).await?;

        let state = RwLock::new(VoiceState::WsOpening);
        let speaking = Arc::new(AtomicBool::new(false));
        let established = establish(&bootstrap, &user_id, &state, speaking.clone()).await?;
        *state.write().await = VoiceState::Active;

        let (frame_tx, frame_rx) = mpsc::channel(MEDIA_QUEUE_DEPTH);
        let (rebind_tx, rebind_rx) = mpsc::channel(1);
        let shutdown = Arc::new(Notify::new());

        let session = Arc::new(VoiceSession {
            state,
            sender: Arc::new(RwLock::new(established.sender)),
            frame_tx,
            rebind_tx,
            ssrc: established.ssrc,
            speaking,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(established.media.run(frame_rx, rebind_rx, shutdown));
        tokio::spawn(run(
            session.clone(),
            established.receiver,
            established.heartbeat_interval,
            bootstrap.state_update.session_id.clone(),
            bootstrap.server_update.guild_id.clone(),
            bootstrap.server_update.token.clone(),
            handshake::voice_gateway_url(&bootstrap.server_update.endpoint),
            established.remote,
        ));

        Ok(session)
    }

    /// Queue one pre-encoded Opus frame. Drops the frame (rather than
    /// blocking the caller) if the media pacing loop is behind. Fails if
    /// `speaking(true)` hasn't been sent yet.
    pub fn send_opus(&self, frame: Vec<u8>) -> Result<()> {
        if !self.speaking.load(Ordering::SeqCst) {
            return Err(Error::Other("must call speaking(true) before sending audio"));
        }
        self.frame_tx
            .try_send(frame)
            .map_err(|_| Error::Other("voice media channel is backed up, dropping frame"))
    }

    /// Send op 5 (`{speaking, delay: 0, ssrc}`). Must be sent `true` before
    /// the first `send_opus`; the RTP sender also checks this flag and
    /// drops any frame that arrives while it is false.
    pub async fn speaking(&self, speaking: bool) -> Result<()> {
        let frame = serde_json::json! {{
            "op": voice_op::SPEAKING,
            "d": { "speaking": speaking, "delay": 0, "ssrc": self.ssrc }
        }};
        send_json(&mut *self.sender.write().await, frame).await?;
        self.speaking.store(speaking, Ordering::SeqCst);
        Ok(())
    }

    /// Tear down the voice WebSocket and UDP socket and stop the
    /// heartbeat/reader and media tasks. The handle remains valid but
    /// inert afterwards.
    pub fn disconnect(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn state(&self) -> VoiceState {
        *self.state.read().await
    }
}

async fn recv_bootstrap(gateway: &Arc<ControlGateway>, count: usize) -> Result<Bootstrap> {
    let envelopes = gateway.voice_bootstrap.recv(count, BOOTSTRAP_TIMEOUT).await?;

    let mut state_update = None;
    let mut server_update = None;
    for envelope in envelopes {
        match envelope.t.as_deref() {
            Some(t) if t == VOICE_STATE_UPDATE_EVENT => {
                state_update = Some(parse_payload::<VoiceStateUpdate>(&envelope, "VoiceStateUpdate")?);
            }
            Some(t) if t == VOICE_SERVER_UPDATE_EVENT => {
                server_update = Some(parse_payload::<VoiceServerUpdate>(&envelope, "VoiceServerUpdate")?);
            }
            _ => {}
        }
    }

    Ok(Bootstrap {
        state_update: state_update.ok_or(Error::Protocol("voice bootstrap missing VOICE_STATE_UPDATE"))?,
        server_update: server_update.ok_or(Error::Protocol("voice bootstrap missing VOICE_SERVER_UPDATE"))?,
    })
}

struct Established {
    sender: SharedJsonSink,
    receiver: JsonStream<serde_json::Value>,
    heartbeat_interval: u64,
    media: MediaSender,
    remote: SocketAddr,
    ssrc: u32,
}

/// Runs once, on first connect only: dial, Identify, Ready, UDP discovery,
/// `SELECT_PROTOCOL`, session description. A voice *reconnect* never calls
/// this again — see `run()`'s resume path below.
async fn establish(
    bootstrap: &Bootstrap,
    user_id: &UserId,
    state: &RwLock<VoiceState>,
    speaking: Arc<AtomicBool>,
) -> Result<Established> {
    *state.write().await = VoiceState::WsOpening;

    let url = handshake::voice_gateway_url(&bootstrap.server_update.endpoint);
    let (mut sender, mut receiver, interval) = handshake::dial_and_identify(
        &url,
        &bootstrap.server_update.guild_id,
        user_id,
        &bootstrap.state_update.session_id,
        &bootstrap.server_update.token,
    )
    .await?;

    let ready = handshake::read_ready(&mut receiver).await?;
    *state.write().await = VoiceState::Identified;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|_| Error::UDPFailed("could not bind local media socket"))?;
    let remote: SocketAddr = format!("{}:{}", ready.ip, ready.port)
        .parse()
        .map_err(|_| Error::UDPFailed("voice server address was not parseable"))?;
    socket
        .connect(remote)
        .await
        .map_err(|_| Error::UDPFailed("could not connect media socket to voice server"))?;

    *state.write().await = VoiceState::UdpDiscovering;
    let (external_ip, external_port) = discover_ip(&socket, ready.ssrc).await?;
    handshake::select_protocol(&mut sender, &external_ip, external_port).await?;

    let description = handshake::read_session_description(&mut receiver).await?;
    let key = secretbox::Key::from_slice(&description.secret_key)
        .ok_or(Error::CryptoKeyingFailed("secret key had the wrong length"))?;

    let media = MediaSender::new(socket, remote, key, ready.ssrc, speaking);

    Ok(Established {
        sender,
        receiver,
        heartbeat_interval: interval,
        media,
        remote,
        ssrc: ready.ssrc,
    })
}

async fn heartbeat(sender: Arc<RwLock<SharedJsonSink>>, period_ms: u64, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = &mut stop => return,
        }
        let frame = serde_json::json!({ "op": voice_op::HEARTBEAT, "d": 0 });
        if let Err(err) = send_json(&mut *sender.write().await, frame).await {
            warn!(%err, "error sending voice heartbeat");
        }
    }
}

enum ReaderOutcome {
    Closed,
    ReadError,
    LivenessLost,
    Shutdown,
}

/// Open a fresh local UDP socket bound to the same remote address used at
/// `establish()` time, and hand it to the running `MediaSender` task. The
/// secret key and RTP sequence/timestamp state stay inside the
/// `MediaSender` and are untouched by this swap.
async fn rebind_udp(session: &Arc<VoiceSession>, remote: SocketAddr) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|_| Error::UDPFailed("could not bind local media socket for resume"))?;
    socket
        .connect(remote)
        .await
        .map_err(|_| Error::UDPFailed("could not connect media socket to voice server"))?;
    session
        .rebind_tx
        .send((socket, remote))
        .await
        .map_err(|_| Error::Other("voice media task is no longer running"))
}

/// Drives the voice gateway's reader/heartbeat for the life of the
/// session. On heartbeat-ack timeout, a closed connection, or a read error,
/// this resumes rather than re-running the whole handshake: close the old
/// WS, redial the same endpoint, send Resume (op 7) with
/// `{server_id, session_id, token}`, rebind a fresh UDP socket to the same
/// remote address, and re-enter the reader. No fresh Identify, UDP IP
/// discovery, or `SELECT_PROTOCOL`/session-description exchange happens on
/// resume — the secret key and RTP sequencer survive untouched in the
/// running `MediaSender`.
///
/// The 0.75 multiplier below is not a margin we chose: the voice gateway's
/// own Hello interval is the heartbeat *tick* period, and the same
/// 0.75-scaled value doubles as the liveness deadline, matching what the
/// service actually expects.
async fn run(
    session: Arc<VoiceSession>,
    mut receiver: JsonStream<serde_json::Value>,
    mut interval: u64,
    session_id: String,
    guild_id: GuildId,
    token: String,
    url: String,
    remote: SocketAddr,
) {
    loop {
        let period = (interval as f64 * 0.75) as u64;
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(heartbeat(session.sender.clone(), period, stop_rx));

        let mut last_ack = tokio::time::Instant::now();
        let outcome = 'reader: loop {
            tokio::select! {
                _ = session.shutdown.notified() => break 'reader ReaderOutcome::Shutdown,
                next = tokio::time::timeout(Duration::from_millis(period), receiver.next()) => {
                    match next {
                        Err(_) => {}
                        Ok(None) => break 'reader ReaderOutcome::Closed,
                        Ok(Some(Err(_))) => break 'reader ReaderOutcome::ReadError,
                        Ok(Some(Ok(value))) => match Envelope::decode(value) {
                            Err(err) => warn!(%err, guild_id = %guild_id.0, "could not decode voice envelope, ignoring"),
                            Ok(envelope) if envelope.op == voice_op::HEARTBEAT => {
                                last_ack = tokio::time::Instant::now();
                            }
                            Ok(_) => {}
                        },
                    }
                }
            }
            if last_ack.elapsed() > Duration::from_millis(period) {
                break 'reader ReaderOutcome::LivenessLost;
            }
        };
        let _ = stop_tx.send(());

        if matches!(outcome, ReaderOutcome::Shutdown) {
            let _ = session.sender.write().await.close().await;
            *session.state.write().await = VoiceState::Idle;
            return;
        }

        match outcome {
            ReaderOutcome::Closed => debug!(guild_id = %guild_id.0, "voice gateway closed, resuming"),
            ReaderOutcome::ReadError => warn!(guild_id = %guild_id.0, "voice gateway read error, resuming"),
            ReaderOutcome::LivenessLost => warn!(guild_id = %guild_id.0, "voice heartbeat overdue, resuming"),
            ReaderOutcome::Shutdown => unreachable!(),
        }

        *session.state.write().await = VoiceState::Reconnecting;

        let _ = session.sender.write().await.close().await;
        let (new_sender, new_receiver, new_interval) =
            match handshake::resume(&url, &guild_id, &session_id, &token).await {
                Ok(result) => result,
                Err(err) => {
                    error!(%err, guild_id = %guild_id.0, "voice resume failed");
                    *session.state.write().await = VoiceState::Failed;
                    return;
                }
            };

        if let Err(err) = rebind_udp(&session, remote).await {
            error!(%err, guild_id = %guild_id.0, "voice UDP rebind failed after resume");
            *session.state.write().await = VoiceState::Failed;
            return;
        }

        *session.sender.write().await = new_sender;
        receiver = new_receiver;
        interval = new_interval;
        *session.state.write().await = VoiceState::Active;
    }
}
