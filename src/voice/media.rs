//! The UDP media channel: IP discovery, secretbox-sealed RTP packets, and
//! the 20ms pacing loop that turns a stream of Opus frames into packets on
//! the wire at the right cadence.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sodiumoxide::crypto::secretbox;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::voice::rtp::{header_nonce, RtpSequencer, HEADER_LEN};
use crate::{Error, Result};

const DISCOVERY_PACKET_LEN: usize = 70;
const TICK: Duration = Duration::from_millis(20);

/// Perform UDP IP discovery against the voice server: send a 70-byte
/// request carrying our SSRC, and parse the service's reply for the
/// externally-visible IP/port pair to report back via `SELECT_PROTOCOL`.
pub async fn discover_ip(socket: &UdpSocket, ssrc: u32) -> Result<(String, u16)> {
    let mut request = [0u8; DISCOVERY_PACKET_LEN];
    BigEndian::write_u32(&mut request[0..4], ssrc);

    socket
        .send(&request)
        .await
        .map_err(|_| Error::UDPFailed("IP discovery request failed to send"))?;

    let mut response = [0u8; DISCOVERY_PACKET_LEN];
    let read = socket
        .recv(&mut response)
        .await
        .map_err(|_| Error::UDPFailed("IP discovery response failed to receive"))?;
    if read != DISCOVERY_PACKET_LEN {
        return Err(Error::UDPFailed("IP discovery response was the wrong length"));
    }

    let ip_end = response[4..20]
        .iter()
        .position(|&b| b == 0)
        .map(|pos| 4 + pos)
        .unwrap_or(20);
    let ip = String::from_utf8(response[4..ip_end].to_vec())
        .map_err(|_| Error::UDPFailed("IP discovery response IP was not valid UTF-8"))?;
    let port = LittleEndian::read_u16(&response[68..70]);

    Ok((ip, port))
}

/// Owns the UDP socket, the secret key, and the RTP sequence state for one
/// voice session. Consumes 20ms Opus frames from a channel and paces them
/// onto the wire.
pub struct MediaSender {
    socket: UdpSocket,
    remote: SocketAddr,
    key: secretbox::Key,
    sequencer: RtpSequencer,
    speaking: Arc<AtomicBool>,
}

impl MediaSender {
    pub fn new(
        socket: UdpSocket,
        remote: SocketAddr,
        key: secretbox::Key,
        ssrc: u32,
        speaking: Arc<AtomicBool>,
    ) -> Self {
        MediaSender {
            socket,
            remote,
            key,
            sequencer: RtpSequencer::new(ssrc),
            speaking,
        }
    }

    /// Seal and send a single pre-encoded Opus frame, advancing the RTP
    /// sequence/timestamp.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let header = self.sequencer.next_header();
        let nonce = secretbox::Nonce(header_nonce(&header));
        let sealed = secretbox::seal(frame, &nonce, &self.key);

        let mut packet = Vec::with_capacity(HEADER_LEN + sealed.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed);

        self.socket
            .send_to(&packet, self.remote)
            .await
            .map_err(|_| Error::UDPFailed("RTP packet send failed"))?;
        Ok(())
    }

    /// Drive the 20ms pacing loop: on every tick, send whichever Opus frame
    /// is ready without blocking. Ticks with nothing queued are silently
    /// skipped rather than padded with silence. Frames arriving before
    /// `speaking(true)` has been sent are dropped rather than leaked onto
    /// the wire.
    ///
    /// `rebind` carries a fresh socket/remote pair across a voice resume:
    /// the session's secret key and RTP sequence/timestamp survive the swap
    /// untouched, only the UDP socket changes. `shutdown` ends the loop (and
    /// drops the socket) on `disconnect()`.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut rebind: mpsc::Receiver<(UdpSocket, SocketAddr)>,
        shutdown: Arc<Notify>,
    ) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match frames.try_recv() {
                        Ok(frame) if self.speaking.load(Ordering::SeqCst) => {
                            if let Err(err) = self.send_frame(&frame).await {
                                warn!(%err, "dropping RTP packet after send failure");
                            }
                        }
                        Ok(_) | Err(mpsc::error::TryRecvError::Empty) => {}
                        Err(mpsc::error::TryRecvError::Disconnected) => return,
                    }
                }
                rebound = rebind.recv() => {
                    match rebound {
                        Some((socket, remote)) => {
                            self.socket = socket;
                            self.remote = remote;
                        }
                        None => return,
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_request_encodes_ssrc_big_endian() {
        let mut request = [0u8; DISCOVERY_PACKET_LEN];
        request[0..4].copy_from_slice(&0x01020304u32.to_be_bytes());
        assert_eq!(&request[0..4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn parses_discovery_response() {
        let mut response = [0u8; DISCOVERY_PACKET_LEN];
        let ip = b"203.0.113.7";
        response[4..4 + ip.len()].copy_from_slice(ip);
        response[68..70].copy_from_slice(&51000u16.to_le_bytes());

        let ip_end = response[4..20]
            .iter()
            .position(|&b| b == 0)
            .map(|pos| 4 + pos)
            .unwrap_or(20);
        let parsed_ip = String::from_utf8(response[4..ip_end].to_vec()).unwrap();
        let parsed_port = u16::from_le_bytes([response[68], response[69]]);

        assert_eq!(parsed_ip, "203.0.113.7");
        assert_eq!(parsed_port, 51000);
    }
}
