//! RTP packetization: header layout, sequence/timestamp bookkeeping, and the
//! nonce construction used by the secretbox encryption mode.

use byteorder::{BigEndian, ByteOrder};

/// Fixed RTP header size used on the voice media channel (no CSRC, no
/// extension).
pub const HEADER_LEN: usize = 12;

/// secretbox (xsalsa20_poly1305) nonces are always 24 bytes; the "rtp" mode
/// pads the 12-byte header out with zeroes.
pub const NONCE_LEN: usize = 24;

/// Opus frames carry 20ms of 48kHz audio: 960 samples per channel.
pub const SAMPLES_PER_FRAME: u32 = 960;

const RTP_VERSION_FLAGS: u8 = 0x80;
const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// Per-session RTP sequence/timestamp counters. Both wrap on overflow, which
/// is the expected behavior for a stream with no fixed end.
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSequencer {
    /// Start a new sequencer for the SSRC assigned during the voice
    /// handshake. Real services pick arbitrary starting sequence/timestamp
    /// values; starting at zero is a harmless simplification.
    pub fn new(ssrc: u32) -> Self {
        RtpSequencer {
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Build the next 12-byte header and advance sequence/timestamp for the
    /// next call.
    pub fn next_header(&mut self) -> [u8; HEADER_LEN] {
        let header = self.header_for(self.sequence, self.timestamp);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME);
        header
    }

    fn header_for(&self, sequence: u16, timestamp: u32) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = RTP_VERSION_FLAGS;
        header[1] = RTP_PAYLOAD_TYPE;
        BigEndian::write_u16(&mut header[2..4], sequence);
        BigEndian::write_u32(&mut header[4..8], timestamp);
        BigEndian::write_u32(&mut header[8..12], self.ssrc);
        header
    }
}

/// The secretbox nonce for a given RTP header: the header itself, padded
/// with zero bytes to the 24-byte nonce length required by xsalsa20.
pub fn header_nonce(header: &[u8; HEADER_LEN]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..HEADER_LEN].copy_from_slice(header);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_byte_layout() {
        let mut seq = RtpSequencer::new(0xDEADBEEF);
        let header = seq.next_header();

        assert_eq!(header[0], 0x80);
        assert_eq!(header[1], 0x78);
        assert_eq!(&header[2..4], &0u16.to_be_bytes());
        assert_eq!(&header[4..8], &0u32.to_be_bytes());
        assert_eq!(&header[8..12], &0xDEADBEEFu32.to_be_bytes());
    }

    #[test]
    fn sequence_and_timestamp_advance() {
        let mut seq = RtpSequencer::new(1);
        let first = seq.next_header();
        let second = seq.next_header();

        assert_eq!(u16::from_be_bytes([first[2], first[3]]), 0);
        assert_eq!(u16::from_be_bytes([second[2], second[3]]), 1);

        assert_eq!(u32::from_be_bytes([first[4], first[5], first[6], first[7]]), 0);
        assert_eq!(
            u32::from_be_bytes([second[4], second[5], second[6], second[7]]),
            SAMPLES_PER_FRAME
        );
    }

    #[test]
    fn sequence_wraps_at_u16_max() {
        let mut seq = RtpSequencer::new(1);
        seq.sequence = u16::MAX;
        let header = seq.next_header();
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), u16::MAX);
        assert_eq!(seq.sequence, 0);
    }

    #[test]
    fn nonce_is_header_padded_with_zeroes() {
        let mut seq = RtpSequencer::new(42);
        let header = seq.next_header();
        let nonce = header_nonce(&header);

        assert_eq!(&nonce[..HEADER_LEN], &header[..]);
        assert!(nonce[HEADER_LEN..].iter().all(|&b| b == 0));
    }
}
