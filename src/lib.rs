//! Async client core for a chat service's real-time gateway and voice
//! transport.
//!
//! The service exposes two WebSocket surfaces: a control gateway carrying
//! identify/resume and event dispatch (`gateway`), and, once a voice
//! channel is joined, a second WebSocket plus a UDP media channel for
//! encrypted, paced audio (`voice`). [`Client`] ties the two together:
//! it owns the control gateway connection and, at most, one active voice
//! session, bootstrapped from the `VOICE_STATE_UPDATE`/`VOICE_SERVER_UPDATE`
//! dispatches the control gateway forwards.
//!
//! Posting to the REST API and parsing the full message/channel/guild
//! model are out of scope here; this crate only carries what's needed to
//! keep the two gateways alive and move audio.

#![warn(missing_docs)]

mod client;
mod discovery;
mod error;
mod gateway;
mod io;
mod model;
mod voice;

pub use client::Client;
pub use error::{Error, Result};
pub use gateway::{ControlGateway, IdentifyProperties};
pub use model::{ChannelId, GuildId, UserId};
pub use voice::{VoiceSession, VoiceState};
