//! Packet encoding/decoding
//!
//! Frame format:
//! - 1 byte: sync (`0xD5`)
//! - 1 byte: payload length
//! - N bytes: payload (command code followed by arguments)
//! - 1 byte: CRC-8 (Dallas/Maxim) of the payload only
//!
//! Multi-byte arguments are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_8_MAXIM_DOW};

use super::{commands::is_command_code, ProtocolError, MAX_PAYLOAD_SIZE, SYNC_BYTE};

/// iButton CRC used by the gen3 firmware
pub const PACKET_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

/// Minimum frame size worth transmitting: sync, length, code, checksum
pub const MIN_FRAME_SIZE: usize = 4;

/// Calculate the checksum of a payload
pub fn checksum(payload: &[u8]) -> u8 {
    PACKET_CRC.checksum(payload)
}

/// An encoded frame ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    frame: Vec<u8>,
}

impl Packet {
    /// Frame a payload
    pub fn new(payload: &[u8]) -> Self {
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(SYNC_BYTE);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        frame.push(checksum(payload));
        Self { frame }
    }

    /// Wrap already-framed bytes without validation
    pub fn from_frame(frame: Vec<u8>) -> Self {
        Self { frame }
    }

    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        self.frame.len()
    }

    /// Payload (command code and arguments), without sync, length or checksum
    pub fn payload(&self) -> &[u8] {
        if self.frame.len() < 3 {
            return &[];
        }
        &self.frame[2..self.frame.len() - 1]
    }

    /// Command code, if the frame carries one
    pub fn code(&self) -> Option<u8> {
        self.frame.get(2).copied()
    }

    /// Buffered command (as opposed to an immediate query)
    pub fn is_command(&self) -> bool {
        self.code().map(is_command_code).unwrap_or(false)
    }
}

/// Builder for constructing packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Start a packet with the given command code
    pub fn new(code: u8) -> Self {
        Self {
            payload: vec![code],
        }
    }

    /// Add a single byte
    pub fn add8(mut self, value: u8) -> Self {
        self.payload.push(value);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn add16(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value (little-endian)
    pub fn add32(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a signed 32-bit value (little-endian, two's complement)
    pub fn add_i32(self, value: i32) -> Self {
        self.add32(value as u32)
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Current payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Build the packet, refusing payloads the firmware cannot buffer
    pub fn build(self) -> Result<Packet, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(self.payload.len()));
        }
        Ok(Packet::new(&self.payload))
    }
}

/// Decoder states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Scanning for 0xD5
    AwaitingSync,
    /// Next byte is the payload length
    AwaitingLength,
    /// Payload bytes still to come
    AwaitingPayload {
        /// Bytes left before the CRC
        remaining: usize,
    },
    /// Next byte is the CRC
    AwaitingChecksum,
    /// A frame is ready to take
    Complete,
    /// Bad length or CRC; push a new sync byte to recover
    Faulted,
}

/// Incremental byte-at-a-time frame decoder
///
/// Bytes arrive one at a time from a blocking read; the decoder keeps the
/// partial frame between calls so a corrupted byte is only detected once the
/// checksum arrives.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    state: DecodeState,
    payload: Vec<u8>,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    /// Decoder waiting for a sync byte
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingSync,
            payload: Vec::with_capacity(MAX_PAYLOAD_SIZE),
        }
    }

    /// Current decoder state
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Forget any partial frame
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingSync;
        self.payload.clear();
    }

    /// Feed one byte. Returns `Ok(true)` once a complete, checksum-verified
    /// frame has been received. A checksum mismatch faults the decoder.
    pub fn push(&mut self, byte: u8) -> Result<bool, ProtocolError> {
        match self.state {
            DecodeState::AwaitingSync => {
                if byte == SYNC_BYTE {
                    self.payload.clear();
                    self.state = DecodeState::AwaitingLength;
                }
            }
            DecodeState::AwaitingLength => {
                let len = byte as usize;
                self.state = if len > MAX_PAYLOAD_SIZE {
                    // Not a frame header after all; resynchronise
                    DecodeState::AwaitingSync
                } else if len == 0 {
                    DecodeState::AwaitingChecksum
                } else {
                    DecodeState::AwaitingPayload { remaining: len }
                };
            }
            DecodeState::AwaitingPayload { remaining } => {
                self.payload.push(byte);
                self.state = if remaining == 1 {
                    DecodeState::AwaitingChecksum
                } else {
                    DecodeState::AwaitingPayload {
                        remaining: remaining - 1,
                    }
                };
            }
            DecodeState::AwaitingChecksum => {
                let expected = checksum(&self.payload);
                if byte != expected {
                    self.state = DecodeState::Faulted;
                    return Err(ProtocolError::CrcMismatch {
                        expected,
                        actual: byte,
                    });
                }
                self.state = DecodeState::Complete;
                return Ok(true);
            }
            DecodeState::Complete => return Ok(true),
            DecodeState::Faulted => {}
        }
        Ok(false)
    }

    /// Payload of the completed frame
    pub fn payload(&self) -> Option<&[u8]> {
        match self.state {
            DecodeState::Complete => Some(&self.payload),
            _ => None,
        }
    }

    /// Take the payload of the completed frame and reset for the next one
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        if self.state != DecodeState::Complete {
            return None;
        }
        self.state = DecodeState::AwaitingSync;
        Some(std::mem::take(&mut self.payload))
    }
}
