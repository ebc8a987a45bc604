//! Packet encoding/decoding
//!
//! Implements the framed packet envelope shared by every SMOV message.
//!
//! Packet format:
//! - 2 bytes: Magic `"SM"` (0x53 0x4D)
//! - 2 bytes: Payload length (big-endian)
//! - N bytes: Payload (first byte is the opcode)
//! - 4 bytes: CRC32 (of payload only)

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;

use super::{ProtocolError, MAX_PACKET_SIZE};

/// Start-of-frame marker
pub const MAGIC: [u8; 2] = *b"SM";

/// Bytes added around the payload (magic + length + CRC)
pub const OVERHEAD: usize = 2 + 2 + 4;

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet payload
    pub payload: Vec<u8>,
    /// CRC32 of the payload only
    pub crc: u32,
}

impl Packet {
    /// Create a new packet with the given payload
    pub fn new(payload: Vec<u8>) -> Self {
        let crc = calculate_crc(&payload);
        Self { payload, crc }
    }

    /// Decode a packet from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < OVERHEAD || data[0..2] != MAGIC {
            return Err(ProtocolError::InvalidFrame);
        }

        let length = BigEndian::read_u16(&data[2..4]) as usize;
        if length > MAX_PACKET_SIZE {
            return Err(ProtocolError::BufferOverflow);
        }
        if data.len() < OVERHEAD + length {
            return Err(ProtocolError::InvalidFrame);
        }

        let payload = data[4..4 + length].to_vec();
        let received_crc = BigEndian::read_u32(&data[4 + length..4 + length + 4]);
        let expected_crc = calculate_crc(&payload);
        if received_crc != expected_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: expected_crc,
                actual: received_crc,
            });
        }

        Ok(Self {
            payload,
            crc: received_crc,
        })
    }

    /// Encode the packet to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.encoded_size()];
        bytes[0..2].copy_from_slice(&MAGIC);
        BigEndian::write_u16(&mut bytes[2..4], self.payload.len() as u16);
        bytes[4..4 + self.payload.len()].copy_from_slice(&self.payload);
        BigEndian::write_u32(&mut bytes[4 + self.payload.len()..], self.crc);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        OVERHEAD + self.payload.len()
    }

    /// Opcode of the packet (first payload byte)
    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Builder for constructing packets
pub struct PacketBuilder {
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Start a packet with the given opcode
    pub fn new(opcode: u8) -> Self {
        Self {
            payload: vec![opcode],
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a signed 16-bit value (big-endian)
    pub fn i16_be(mut self, value: i16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_i16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the packet
    pub fn build(self) -> Packet {
        Packet::new(self.payload)
    }
}

/// Incremental decoder for a byte stream carrying packets.
///
/// Bytes are pushed as they arrive from the transport; complete packets are
/// pulled out in arrival order. Garbage before a magic marker and frames that
/// fail their CRC are discarded so the decoder resynchronises on the next frame.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: Vec<u8>,
    discarded: usize,
}

impl PacketDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes thrown away while resynchronising
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Bytes buffered but not yet part of a complete packet
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete packet, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A corrupt frame is
    /// reported once as an error and skipped, the next call carries on after it.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        self.skip_to_magic();
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let length = BigEndian::read_u16(&self.buffer[2..4]) as usize;
        if length > MAX_PACKET_SIZE {
            self.drop_front(1);
            return Err(ProtocolError::BufferOverflow);
        }
        if self.buffer.len() < OVERHEAD + length {
            return Ok(None);
        }

        match Packet::from_bytes(&self.buffer[..OVERHEAD + length]) {
            Ok(packet) => {
                self.buffer.drain(..OVERHEAD + length);
                Ok(Some(packet))
            }
            Err(e) => {
                // The magic may have been payload bytes; retry one byte further on
                self.drop_front(1);
                Err(e)
            }
        }
    }

    fn skip_to_magic(&mut self) {
        let start = self
            .buffer
            .windows(2)
            .position(|w| w == MAGIC)
            .unwrap_or_else(|| {
                // Keep a trailing 'S' that may be the first half of the marker
                if self.buffer.last() == Some(&MAGIC[0]) {
                    self.buffer.len() - 1
                } else {
                    self.buffer.len()
                }
            });
        self.drop_front(start);
    }

    fn drop_front(&mut self, n: usize) {
        if n > 0 {
            self.buffer.drain(..n);
            self.discarded += n;
        }
    }
}

/// Calculate CRC32 of the payload
fn calculate_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let original = PacketBuilder::new(0x10).byte(7).i16_be(-23).build();
        let encoded = original.to_bytes();
        assert_eq!(&encoded[0..2], b"SM");
        assert_eq!(encoded.len(), original.encoded_size());

        let decoded = Packet::from_bytes(&encoded).expect("Should decode successfully");
        assert_eq!(original, decoded);
        assert_eq!(decoded.opcode(), Some(0x10));
    }

    #[test]
    fn test_crc_verification() {
        let packet = Packet::new(vec![1, 2, 3, 4, 5]);
        let mut encoded = packet.to_bytes();

        // Corrupt a payload byte
        encoded[5] ^= 0xFF;

        assert!(matches!(
            Packet::from_bytes(&encoded),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut encoded = Packet::new(vec![1]).to_bytes();
        BigEndian::write_u16(&mut encoded[2..4], (MAX_PACKET_SIZE + 1) as u16);
        assert!(matches!(
            Packet::from_bytes(&encoded),
            Err(ProtocolError::BufferOverflow)
        ));
    }

    #[test]
    fn test_decoder_partial_reads() {
        let encoded = PacketBuilder::new(0x90).byte(1).byte(0).build().to_bytes();
        let mut decoder = PacketDecoder::new();

        for chunk in encoded.chunks(3) {
            assert!(decoder.next_packet().unwrap().is_none());
            decoder.push(chunk);
        }

        let packet = decoder.next_packet().unwrap().expect("complete packet");
        assert_eq!(packet.payload, vec![0x90, 1, 0]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_skips_garbage() {
        let mut stream = vec![0x00, 0xFF, b'S', 0x12];
        stream.extend(PacketBuilder::new(0xE0).u16_be(42).build().to_bytes());
        stream.extend(PacketBuilder::new(0x90).byte(3).byte(0).build().to_bytes());

        let mut decoder = PacketDecoder::new();
        decoder.push(&stream);

        let first = decoder.next_packet().unwrap().expect("fault packet");
        assert_eq!(first.opcode(), Some(0xE0));
        let second = decoder.next_packet().unwrap().expect("ack packet");
        assert_eq!(second.opcode(), Some(0x90));
        assert!(decoder.next_packet().unwrap().is_none());
        assert_eq!(decoder.discarded(), 4);
    }

    #[test]
    fn test_decoder_resyncs_after_corruption() {
        let mut bad = PacketBuilder::new(0x90).byte(1).byte(0).build().to_bytes();
        let last = bad.len() - 1;
        bad[last] ^= 0x55;
        let good = PacketBuilder::new(0x90).byte(2).byte(0).build().to_bytes();

        let mut decoder = PacketDecoder::new();
        decoder.push(&bad);
        decoder.push(&good);

        assert!(decoder.next_packet().is_err());
        let mut recovered = None;
        for _ in 0..bad.len() {
            match decoder.next_packet() {
                Ok(Some(p)) => {
                    recovered = Some(p);
                    break;
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert_eq!(recovered.expect("resynced").payload, vec![0x90, 2, 0]);
    }

    #[test]
    fn test_decoder_keeps_split_magic() {
        let encoded = Packet::new(vec![0x11, 9]).to_bytes();
        let mut decoder = PacketDecoder::new();
        decoder.push(&[0x00, encoded[0]]);
        assert!(decoder.next_packet().unwrap().is_none());
        decoder.push(&encoded[1..]);
        assert_eq!(
            decoder.next_packet().unwrap().expect("packet").payload,
            vec![0x11, 9]
        );
    }
}
