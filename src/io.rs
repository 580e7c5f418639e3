//! JSON-accepting [Stream]s and [Sink]s, and a writer-mutex substitute shared
//! by both WebSocket gateways.

use std::{
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{ready, FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, oneshot};
use websockets::{Message, WebSocketError, WebSocketReadHalf, WebSocketWriteHalf};

/// JSON-encoded values received from a WebSocket.
#[derive(Debug)]
pub struct JsonStream<T> {
    inner: WebSocketReadHalf,
    _t: PhantomData<T>,
}

impl<T> JsonStream<T> {
    /// Creates a new [`JsonStream`] by wrapping a [`WebSocketReadHalf`].
    pub fn new(read: WebSocketReadHalf) -> Self {
        Self {
            inner: read,
            _t: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Stream for JsonStream<T> {
    type Item = Result<T, JsonStreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let message = match ready!(self.inner.poll_next_unpin(cx)) {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Poll::Ready(Some(Err(JsonStreamError::Ws(err)))),
            None => return Poll::Ready(None),
        };

        Poll::Ready(Some(match message {
            Message::Text(str) => serde_json::from_str(&str).map_err(JsonStreamError::Json),
            Message::Binary(bin) => serde_json::from_slice(&bin).map_err(JsonStreamError::Json),
        }))
    }
}

/// JSON-encoded values sent to a WebSocket peer.
#[derive(Debug)]
pub struct JsonSink {
    inner: WebSocketWriteHalf,
}

impl JsonSink {
    /// Creates a new [`JsonSink`] by wrapping a [`WebSocketWriteHalf`].
    pub fn new(write: WebSocketWriteHalf) -> Self {
        Self { inner: write }
    }
}

impl<T: Serialize> Sink<T> for JsonSink {
    type Error = JsonStreamError;

    fn start_send(mut self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item).map_err(JsonStreamError::Json)?;
        self.inner
            .start_send_unpin(Message::Text(json))
            .map_err(JsonStreamError::Ws)
    }

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready_unpin(cx).map_err(JsonStreamError::Ws)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_flush_unpin(cx).map_err(JsonStreamError::Ws)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_close_unpin(cx).map_err(JsonStreamError::Ws)
    }
}

/// Errors occurring when pulling JSON messages from the WebSocket.
#[derive(Debug)]
pub enum JsonStreamError {
    /// Failed to pull a message from the WebSocket.
    Ws(WebSocketError),
    /// Failed to decode a message as JSON.
    Json(serde_json::Error),
}

impl From<JsonStreamError> for crate::Error {
    fn from(err: JsonStreamError) -> crate::Error {
        match err {
            JsonStreamError::Ws(ws) => crate::Error::WebSocket(ws),
            JsonStreamError::Json(json) => crate::Error::Json(json),
        }
    }
}

/// Share a Sink between many concurrent users, by offloading the actual
/// sending to a spawned task and using channels to communicate between the
/// two. This is the writer-mutex: every call to [`Sink::start_send`] queues
/// exactly one send on the owning task, so sends from different callers
/// never interleave their bytes on the wire.
///
/// # Memory exhaustion
///
/// This implementation uses an unbounded channel to perform communication.
/// It is vulnerable to memory exhaustion if items are enqueued faster than
/// the sink can drain them; this matches the low, bursty send rate of
/// control and voice-signaling frames and is not used for the RTP media
/// path, which writes directly to its own UDP socket.
#[derive(Debug)]
pub struct SharedSink<Si, T>
where
    Si: Sink<T>,
{
    channel: Option<mpsc::UnboundedSender<(T, oneshot::Sender<Result<(), Si::Error>>)>>,
    current: Vec<oneshot::Receiver<Result<(), Si::Error>>>,
}

impl<Si, T> SharedSink<Si, T>
where
    T: Send + 'static,
    Si: Sink<T> + Send + Unpin + 'static,
    Si::Error: Send,
{
    /// Create a shared sink by offloading sending to a spawned task.
    pub fn new(sink: Si) -> Self {
        let (send, mut receive) =
            mpsc::unbounded_channel::<(T, oneshot::Sender<Result<(), Si::Error>>)>();

        tokio::spawn(async move {
            let mut sink = sink;
            while let Some((item, reply)) = receive.recv().await {
                let _ = reply.send(sink.send(item).await);
            }
        });

        Self {
            channel: Some(send),
            current: vec![],
        }
    }
}

impl<Si, T> Sink<T> for SharedSink<Si, T>
where
    Si: Sink<T>,
{
    type Error = SharedSinkError<Si, T>;

    fn start_send(mut self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let (send, receive) = oneshot::channel();

        match self.channel.as_mut() {
            Some(sender) => {
                sender
                    .send((item, send))
                    .map_err(|_| SharedSinkError::SinkClosed)?;
                self.current.push(receive);
            }
            None => return Err(SharedSinkError::SinkClosed),
        }

        Ok(())
    }

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        for send in self.current.iter_mut() {
            match send.poll_unpin(cx) {
                Poll::Ready(Ok(Err(err))) => {
                    return Poll::Ready(Err(SharedSinkError::SinkError(err)))
                }
                Poll::Ready(Err(_)) => return Poll::Ready(Err(SharedSinkError::SinkClosed)),
                Poll::Pending => return Poll::Pending,
                _ => {}
            }
        }
        self.current.clear();
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.channel.take();
        Poll::Ready(Ok(()))
    }
}

impl<Si: Sink<T>, T> Clone for SharedSink<Si, T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            current: vec![],
        }
    }
}

/// Errors that can occur when sending to a [`SharedSink`].
#[derive(Debug)]
pub enum SharedSinkError<Si: Sink<T>, T> {
    /// The sink's owning task has shut down.
    SinkClosed,
    /// The underlying sink returned an error while sending.
    SinkError(Si::Error),
}

/// A convenience alias for the shared JSON sink both gateways write through.
pub type SharedJsonSink = SharedSink<JsonSink, serde_json::Value>;

/// Send one JSON value through a [`SharedJsonSink`], mapping errors to the
/// crate's [`crate::Error`].
pub async fn send_json(sink: &mut SharedJsonSink, value: serde_json::Value) -> crate::Result<()> {
    sink.send(value).await.map_err(|err| match err {
        SharedSinkError::SinkClosed => crate::Error::PeerClosed(None, "writer task closed".into()),
        SharedSinkError::SinkError(JsonStreamError::Ws(ws)) => crate::Error::WebSocket(ws),
        SharedSinkError::SinkError(JsonStreamError::Json(json)) => crate::Error::Json(json),
    })
}
