//! CI-V packet framing.
//!
//! The Icom CI-V (Communication Interface V) protocol uses binary
//! packets on a byte stream; here that stream is the serial UDP
//! tunnel rather than a physical bus.
//!
//! # Packet format
//!
//! ```text
//! 0xFE 0xFE <dst> <src> <cmd> [<sub>] [<data>...] 0xFD
//! ```
//!
//! - Preamble: two `0xFE` bytes
//! - `dst`: target CI-V address (e.g. `0xA4` for the IC-705)
//! - `src`: controller address (typically `0xE0`)
//! - `cmd`: command byte, optional sub-command and data
//! - Terminator: `0xFD`

use bytes::{BufMut, BytesMut};

/// Preamble byte repeated twice at the start of every CI-V packet.
pub const PREAMBLE: u8 = 0xFE;

/// Packet terminator byte.
pub const TERMINATOR: u8 = 0xFD;

/// ACK command byte -- positive acknowledgement from the radio.
pub const ACK: u8 = 0xFB;

/// NAK command byte -- negative acknowledgement from the radio.
pub const NAK: u8 = 0xFA;

/// Shortest valid packet: preamble, dst, src, cmd, terminator.
pub const MIN_PACKET_LEN: usize = 6;

/// Cap on the scan buffer; a stream that never produces a terminator
/// is garbage and gets dropped rather than ballooning memory.
const MAX_BUFFERED: usize = 4096;

/// Encode a CI-V packet ready for transmission.
///
/// # Example
///
/// ```
/// use shacklink_civ::civ::encode_packet;
///
/// // Read-frequency command to an IC-705 (addr 0xA4)
/// let pkt = encode_packet(0xA4, 0xE0, &[0x03]);
/// assert_eq!(pkt, vec![0xFE, 0xFE, 0xA4, 0xE0, 0x03, 0xFD]);
/// ```
pub fn encode_packet(dst: u8, src: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + body.len() + 1);
    buf.put_u8(PREAMBLE);
    buf.put_u8(PREAMBLE);
    buf.put_u8(dst);
    buf.put_u8(src);
    buf.put_slice(body);
    buf.put_u8(TERMINATOR);
    buf.to_vec()
}

/// Extract the next complete CI-V packet from a stream buffer.
///
/// Scans for a preamble, silently discarding any garbage before it,
/// and returns the full packet (framing included) once its terminator
/// has arrived. Incomplete data stays in the buffer for the next call.
pub fn extract_packet(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        // Drop noise before the first preamble.
        let start = buf
            .windows(2)
            .position(|w| w[0] == PREAMBLE && w[1] == PREAMBLE)?;
        if start > 0 {
            buf.drain(..start);
        }

        let term = match buf.iter().skip(2).position(|&b| b == TERMINATOR) {
            Some(rel) => 2 + rel,
            None => {
                if buf.len() > MAX_BUFFERED {
                    buf.clear();
                }
                return None;
            }
        };

        let pkt: Vec<u8> = buf.drain(..=term).collect();
        if pkt.len() >= MIN_PACKET_LEN {
            return Some(pkt);
        }
        // Runt between preamble and terminator: keep scanning.
    }
}

/// `true` when the packet is a bare positive acknowledgement.
pub fn is_ack(pkt: &[u8]) -> bool {
    pkt.len() == MIN_PACKET_LEN && pkt[4] == ACK
}

/// `true` when the packet is a bare negative acknowledgement.
pub fn is_nak(pkt: &[u8]) -> bool {
    pkt.len() == MIN_PACKET_LEN && pkt[4] == NAK
}
