//! The voice transport: WebSocket signaling handshake, UDP media channel,
//! and the session controller tying both to the control gateway's
//! bootstrap dispatches.

pub mod handshake;
pub mod media;
pub mod rtp;
pub mod session;

pub use session::{VoiceSession, VoiceState};
