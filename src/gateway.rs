//! The control (text) gateway: a WebSocket session carrying identify/resume
//! and dispatch, with heartbeat liveness, reconnect, and event routing to
//! both a handler registry and the voice bootstrap channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};
use websockets::WebSocket;

use crate::discovery;
use crate::io::{send_json, JsonSink, JsonStream, SharedJsonSink};
use crate::model::{
    control_op, parse_payload, ChannelId, Envelope, GuildId, ReadyInfo, VOICE_SERVER_UPDATE_EVENT,
    VOICE_STATE_UPDATE_EVENT,
};
use crate::{Error, Result};

/// The `properties` object sent with identify; a free-form user-agent
/// surrogate, passed through as-is.
#[derive(Debug, Clone)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl IdentifyProperties {
    fn to_json(&self) -> Value {
        json! {{
            "os": self.os,
            "browser": self.browser,
            "device": self.device,
        }}
    }
}

/// A registered event handler. Invoked concurrently (spawned per dispatch);
/// must not block the reader.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Bounded, drop-oldest queue holding at most the two voice bootstrap
/// dispatches (`VOICE_STATE_UPDATE`, `VOICE_SERVER_UPDATE`) the control
/// reader has forwarded but the voice handshake hasn't yet consumed.
#[derive(Default)]
pub(crate) struct VoiceBootstrap {
    queue: StdMutex<VecDeque<Envelope>>,
    notify: Notify,
}

const BOOTSTRAP_CAPACITY: usize = 2;

impl VoiceBootstrap {
    fn push(&self, envelope: Envelope) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= BOOTSTRAP_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_waiters();
    }

    fn try_pop(&self) -> Option<Envelope> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Receive `count` envelopes, waiting up to `deadline` total.
    pub(crate) async fn recv(&self, count: usize, deadline: Duration) -> Result<Vec<Envelope>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            if let Some(envelope) = self.try_pop() {
                out.push(envelope);
                continue;
            }
            let remaining = deadline.checked_sub(start.elapsed()).ok_or(Error::BootstrapTimeout)?;
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Err(Error::BootstrapTimeout);
            }
        }
        Ok(out)
    }
}

/// An active control-gateway session.
pub struct ControlGateway {
    token: String,
    properties: IdentifyProperties,
    http: reqwest::Client,
    host: String,
    sequence: Arc<AtomicI64>,
    sender: Arc<RwLock<SharedJsonSink>>,
    handlers: Arc<tokio::sync::Mutex<HashMap<String, Handler>>>,
    pub(crate) voice_bootstrap: Arc<VoiceBootstrap>,
}

impl ControlGateway {
    /// Connect, identify, and spawn the reader/heart tasks. Returns once the
    /// initial handshake (Hello → Identify → Ready) has completed, along
    /// with the Ready payload (the caller needs the user id for voice
    /// identify, even though the gateway itself only keeps the session id).
    pub async fn connect(
        host: impl Into<String>,
        token: impl Into<String>,
        properties: IdentifyProperties,
    ) -> Result<(Arc<ControlGateway>, ReadyInfo)> {
        let host = host.into();
        let token = token.into();
        let http = reqwest::Client::builder()
            .https_only(true)
            .build()
            .map_err(Error::Reqwest)?;

        let url = discovery::fetch_gateway_url(&http, &host).await?;
        let (sender, mut receiver, interval) = dial_and_identify(&url, &token, &properties).await?;

        let ready = read_ready(&mut receiver).await?;
        debug!(session_id = %ready.session_id, "control gateway ready");

        let gateway = Arc::new(ControlGateway {
            token,
            properties,
            http,
            host,
            sequence: Arc::new(AtomicI64::new(0)),
            sender: Arc::new(RwLock::new(sender)),
            handlers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            voice_bootstrap: Arc::new(VoiceBootstrap::default()),
        });

        tokio::spawn(run(
            gateway.clone(),
            receiver,
            interval,
            url,
            ready.session_id.clone(),
        ));

        Ok((gateway, ready))
    }

    /// Register a handler for a dispatch event type. Handlers run
    /// concurrently with the reader and with each other.
    pub async fn on<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .await
            .insert(event_type.into(), Arc::new(handler));
    }

    /// Send op 4 (voice-state-update request) asking the service to begin a
    /// voice session in `channel_id` of `guild_id`.
    pub async fn request_voice(&self, guild_id: &GuildId, channel_id: &ChannelId) -> Result<()> {
        let envelope = json! {{
            "op": control_op::VOICE_STATE_UPDATE,
            "d": {
                "guild_id": guild_id.0,
                "channel_id": channel_id.0,
                "self_mute": false,
                "self_deaf": false,
            }
        }};
        send_json(&mut *self.sender.write().await, envelope).await
    }

    /// The currently stored dispatch sequence, loaded atomically.
    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

async fn read_ready(receiver: &mut JsonStream<Value>) -> Result<ReadyInfo> {
    loop {
        let value = receiver
            .next()
            .await
            .ok_or(Error::WSDialFailed("control gateway closed before Ready"))?
            .map_err(Error::from)?;
        let envelope = Envelope::decode(value)?;
        if envelope.op == control_op::DISPATCH && envelope.t.as_deref() == Some("READY") {
            return parse_payload(&envelope, "ReadyInfo");
        }
    }
}

async fn dial_and_identify(
    url: &str,
    token: &str,
    properties: &IdentifyProperties,
) -> Result<(SharedJsonSink, JsonStream<Value>, u64)> {
    let ws = WebSocket::connect(url)
        .await
        .map_err(|_| Error::WSDialFailed("control gateway dial failed"))?;
    let (read, write) = ws.split();
    let mut receiver = JsonStream::<Value>::new(read);
    let mut sender = SharedJsonSink::new(JsonSink::new(write));

    let interval = await_hello(&mut receiver).await?;

    let identify = json! {{
        "op": control_op::IDENTIFY,
        "d": {
            "token": token,
            "properties": properties.to_json(),
        }
    }};
    send_json(&mut sender, identify).await?;

    Ok((sender, receiver, interval))
}

async fn await_hello(receiver: &mut JsonStream<Value>) -> Result<u64> {
    let value = receiver
        .next()
        .await
        .ok_or(Error::WSDialFailed("control gateway closed before Hello"))?
        .map_err(Error::from)?;
    let envelope = Envelope::decode(value)?;
    if envelope.op != control_op::HELLO {
        return Err(Error::Protocol("expected Hello during handshake"));
    }
    let hello: crate::model::Hello = parse_payload(&envelope, "Hello")?;
    Ok(hello.heartbeat_interval)
}

async fn heartbeat(
    sender: Arc<RwLock<SharedJsonSink>>,
    sequence: Arc<AtomicI64>,
    interval_ms: u64,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = &mut stop => return,
        }
        let seq = sequence.load(Ordering::SeqCst);
        let frame = json! {{ "op": control_op::HEARTBEAT, "d": seq }};
        if let Err(err) = send_json(&mut *sender.write().await, frame).await {
            warn!(%err, "error sending control heartbeat");
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReaderOutcome {
    LivenessLost,
    PeerClosed,
    ReadError,
}

async fn run(
    gateway: Arc<ControlGateway>,
    mut receiver: JsonStream<Value>,
    mut interval: u64,
    mut url: String,
    mut session_id: String,
) {
    let mut seed = None;

    loop {
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(heartbeat(
            gateway.sender.clone(),
            gateway.sequence.clone(),
            interval,
            stop_rx,
        ));

        let outcome = read_loop(&gateway, &mut receiver, interval, &mut session_id, seed.take()).await;
        let _ = stop_tx.send(());

        match outcome {
            ReaderOutcome::PeerClosed => debug!("control gateway closed by peer, reconnecting"),
            ReaderOutcome::ReadError => warn!("control gateway read error, reconnecting"),
            ReaderOutcome::LivenessLost => warn!("control gateway heartbeat ack overdue, reconnecting"),
        }

        match reconnect(&gateway, &url, &session_id).await {
            Ok((new_sender, new_receiver, new_interval, new_url, new_session_id, resumed_seed)) => {
                *gateway.sender.write().await = new_sender;
                receiver = new_receiver;
                interval = new_interval;
                url = new_url;
                session_id = new_session_id;
                seed = resumed_seed;
            }
            Err(err) => {
                let err = if outcome == ReaderOutcome::LivenessLost {
                    Error::LivenessLost
                } else {
                    err
                };
                error!(%err, "control gateway reconnect failed permanently");
                return;
            }
        }
    }
}

/// `seed`, when set, is a frame already consumed from the stream while
/// confirming a resume (so it's processed here rather than lost).
async fn read_loop(
    gateway: &Arc<ControlGateway>,
    receiver: &mut JsonStream<Value>,
    interval: u64,
    session_id: &mut String,
    seed: Option<Value>,
) -> ReaderOutcome {
    let mut last_ack = Instant::now();

    if let Some(value) = seed {
        match Envelope::decode(value) {
            Err(err) => warn!(%err, "could not decode control envelope, ignoring"),
            Ok(envelope) => handle_envelope(gateway, &envelope, session_id, &mut last_ack).await,
        }
    }

    loop {
        let next = tokio::time::timeout(Duration::from_millis(interval), receiver.next()).await;

        match next {
            Err(_) => { /* no frame within a heartbeat period; fall through to liveness check */ }
            Ok(None) => return ReaderOutcome::PeerClosed,
            Ok(Some(Err(_))) => return ReaderOutcome::ReadError,
            Ok(Some(Ok(value))) => match Envelope::decode(value) {
                Err(err) => {
                    // A malformed frame must not kill the session.
                    warn!(%err, "could not decode control envelope, ignoring");
                }
                Ok(envelope) => {
                    handle_envelope(gateway, &envelope, session_id, &mut last_ack).await;
                }
            },
        }

        if last_ack.elapsed() > Duration::from_millis(interval) {
            return ReaderOutcome::LivenessLost;
        }
    }
}

async fn handle_envelope(
    gateway: &Arc<ControlGateway>,
    envelope: &Envelope,
    session_id: &mut String,
    last_ack: &mut Instant,
) {
    match envelope.op {
        control_op::HEARTBEAT_ACK => {
            *last_ack = Instant::now();
        }
        control_op::HEARTBEAT => {
            let seq = gateway.sequence();
            let frame = json! {{ "op": control_op::HEARTBEAT, "d": seq }};
            if let Err(err) = send_json(&mut *gateway.sender.write().await, frame).await {
                warn!(%err, "error replying to heartbeat request");
            }
        }
        control_op::DISPATCH => {
            if let Some(seq) = envelope.s {
                gateway.sequence.store(seq, Ordering::SeqCst);
            }
            let Some(event_type) = envelope.t.clone() else {
                return;
            };

            if event_type == "READY" {
                if let Ok(ready) = parse_payload::<ReadyInfo>(envelope, "ReadyInfo") {
                    *session_id = ready.session_id;
                }
            }

            if event_type == VOICE_STATE_UPDATE_EVENT || event_type == VOICE_SERVER_UPDATE_EVENT {
                gateway.voice_bootstrap.push(envelope.clone());
            }

            let handler = gateway.handlers.lock().await.get(&event_type).cloned();
            if let Some(handler) = handler {
                let data = envelope.d.clone();
                tokio::spawn(async move { handler(data) });
            }
        }
        _ => {}
    }
}

/// A resume attempt that the peer accepted carries the first post-resume
/// frame along as a `seed`, so it reaches `handle_envelope` through the
/// ordinary read loop instead of being silently discarded.
struct Resumed {
    sender: SharedJsonSink,
    receiver: JsonStream<Value>,
    interval: u64,
    url: String,
    session_id: String,
    seed: Value,
}

async fn reconnect(
    gateway: &Arc<ControlGateway>,
    url: &str,
    session_id: &str,
) -> Result<(SharedJsonSink, JsonStream<Value>, u64, String, String, Option<Value>)> {
    for _ in 0..2 {
        if let Ok(resumed) = try_resume(url, &gateway.token, session_id, gateway.sequence()).await {
            return Ok((
                resumed.sender,
                resumed.receiver,
                resumed.interval,
                resumed.url,
                resumed.session_id,
                Some(resumed.seed),
            ));
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }

    let fresh_url = discovery::fetch_gateway_url(&gateway.http, &gateway.host).await?;
    let (sender, mut receiver, interval) =
        dial_and_identify(&fresh_url, &gateway.token, &gateway.properties).await?;
    let ready = read_ready(&mut receiver).await?;
    Ok((sender, receiver, interval, fresh_url, ready.session_id, None))
}

/// Send op 6 Resume and inspect the server's very next frame: a dispatch
/// (op 0) means the resume was accepted and the replay has begun; anything
/// else (most commonly a fresh Hello, i.e. the service never acknowledged
/// the session) means it was implicitly rejected, and the caller should
/// fall back to a fresh identify.
async fn try_resume(url: &str, token: &str, session_id: &str, sequence: i64) -> Result<Resumed> {
    let ws = WebSocket::connect(url)
        .await
        .map_err(|_| Error::WSDialFailed("control gateway resume dial failed"))?;
    let (read, write) = ws.split();
    let mut receiver = JsonStream::<Value>::new(read);
    let mut sender = SharedJsonSink::new(JsonSink::new(write));

    let interval = await_hello(&mut receiver).await?;

    let resume = json! {{
        "op": control_op::RESUME,
        "d": {
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }
    }};
    send_json(&mut sender, resume).await?;

    let value = receiver
        .next()
        .await
        .ok_or(Error::WSDialFailed("control gateway closed before resume reply"))?
        .map_err(Error::from)?;
    let envelope = Envelope::decode(value.clone())?;
    if envelope.op != control_op::DISPATCH {
        return Err(Error::Protocol("resume rejected by peer"));
    }

    Ok(Resumed {
        sender,
        receiver,
        interval,
        url: url.to_owned(),
        session_id: session_id.to_owned(),
        seed: value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(t: &str) -> Envelope {
        Envelope {
            op: control_op::DISPATCH,
            d: json!({}),
            s: Some(1),
            t: Some(t.to_owned()),
        }
    }

    #[test]
    fn voice_bootstrap_drops_oldest_past_capacity() {
        let bootstrap = VoiceBootstrap::default();
        bootstrap.push(envelope("VOICE_STATE_UPDATE"));
        bootstrap.push(envelope("VOICE_SERVER_UPDATE"));
        bootstrap.push(envelope("VOICE_SERVER_UPDATE"));

        let mut queue = bootstrap.queue.lock().unwrap();
        assert_eq!(queue.len(), 2);
        let first = queue.pop_front().unwrap();
        assert_eq!(first.t.as_deref(), Some("VOICE_SERVER_UPDATE"));
    }

    #[tokio::test]
    async fn voice_bootstrap_recv_collects_two_envelopes() {
        let bootstrap = Arc::new(VoiceBootstrap::default());
        bootstrap.push(envelope("VOICE_STATE_UPDATE"));
        bootstrap.push(envelope("VOICE_SERVER_UPDATE"));

        let envelopes = bootstrap.recv(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(envelopes.len(), 2);
    }

    #[tokio::test]
    async fn voice_bootstrap_recv_times_out_when_short() {
        let bootstrap = Arc::new(VoiceBootstrap::default());
        bootstrap.push(envelope("VOICE_STATE_UPDATE"));

        let result = bootstrap.recv(2, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::BootstrapTimeout)));
    }
}
