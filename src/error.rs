use reqwest::Error as ReqwestError;
use serde_json::Error as JsonError;
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt::Display;
use std::io::Error as IoError;
use websockets::WebSocketError;

/// Crate-wide `Result` alias type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Error type surfaced by the gateway and voice transport.
#[derive(Debug)]
pub enum Error {
    /// A `reqwest` crate error.
    Reqwest(ReqwestError),
    /// A `serde_json` crate error.
    Json(JsonError),
    /// A `websockets` crate error.
    WebSocket(WebSocketError),
    /// A `std::io` module error.
    Io(IoError),
    /// A websocket connection was closed by the peer, possibly with a code.
    PeerClosed(Option<u16>, String),
    /// Fetching the gateway URL from the service's discovery endpoint failed.
    DiscoveryURLFetch(&'static str),
    /// Either gateway's WebSocket failed to dial.
    WSDialFailed(&'static str),
    /// The voice bootstrap (state + server update) did not arrive in time.
    BootstrapTimeout,
    /// UDP IP discovery failed: short read, or send/receive error.
    UDPFailed(&'static str),
    /// Session description was malformed or missing the secret key.
    CryptoKeyingFailed(&'static str),
    /// Heartbeat-ack was overdue and the subsequent reconnect also failed.
    LivenessLost,
    /// A JSON decoding error, with a description and the offending value.
    Decode(&'static str, Value),
    /// A generic non-success response from the REST API.
    Status(reqwest::StatusCode, Option<Value>),
    /// A protocol error, with a description.
    Protocol(&'static str),
    /// A miscellaneous error, with a description.
    Other(&'static str),
}

impl Error {
    #[doc(hidden)]
    pub async fn from_response(response: reqwest::Response) -> Error {
        let status = response.status();
        let value = response
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok());
        Error::Status(status, value)
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Io(err)
    }
}

impl From<ReqwestError> for Error {
    fn from(err: ReqwestError) -> Error {
        Error::Reqwest(err)
    }
}

impl From<JsonError> for Error {
    fn from(err: JsonError) -> Error {
        Error::Json(err)
    }
}

impl From<WebSocketError> for Error {
    fn from(err: WebSocketError) -> Error {
        Error::WebSocket(err)
    }
}

impl Display for Error {
    #[allow(deprecated)]
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match *self {
            Error::Reqwest(ref inner) => inner.fmt(f),
            Error::Json(ref inner) => inner.fmt(f),
            Error::WebSocket(ref inner) => inner.fmt(f),
            Error::Io(ref inner) => inner.fmt(f),
            _ => f.write_str(self.description()),
        }
    }
}

impl StdError for Error {
    #[allow(deprecated)]
    fn description(&self) -> &str {
        match *self {
            Error::Reqwest(ref inner) => inner.description(),
            Error::Json(ref inner) => inner.description(),
            Error::WebSocket(ref inner) => inner.description(),
            Error::Io(ref inner) => inner.description(),
            Error::PeerClosed(_, _) => "Connection closed by peer",
            Error::DiscoveryURLFetch(msg) => msg,
            Error::WSDialFailed(msg) => msg,
            Error::BootstrapTimeout => "Voice bootstrap timed out waiting for state/server update",
            Error::UDPFailed(msg) => msg,
            Error::CryptoKeyingFailed(msg) => msg,
            Error::LivenessLost => "Heartbeat ack overdue and reconnect failed",
            Error::Decode(msg, _) | Error::Protocol(msg) | Error::Other(msg) => msg,
            Error::Status(status, _) => status
                .canonical_reason()
                .unwrap_or("Unknown bad HTTP status"),
        }
    }

    fn cause(&self) -> Option<&dyn StdError> {
        match *self {
            Error::Reqwest(ref inner) => Some(inner),
            Error::Json(ref inner) => Some(inner),
            Error::WebSocket(ref inner) => Some(inner),
            Error::Io(ref inner) => Some(inner),
            _ => None,
        }
    }
}

/// Extension trait for checking the status and discarding failed HTTP requests.
pub(crate) trait CheckStatus {
    /// Convert non-success statuses to crate errors, tossing the response.
    async fn check_status(self) -> Result<reqwest::Response>;
}

impl CheckStatus for reqwest::Result<reqwest::Response> {
    async fn check_status(self) -> Result<reqwest::Response> {
        let response = self?;
        if !response.status().is_success() {
            return Err(Error::from_response(response).await);
        }
        Ok(response)
    }
}
