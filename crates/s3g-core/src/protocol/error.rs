//! Protocol errors

use thiserror::Error;

use crate::version::Version;

/// Errors that can occur while talking to the motherboard
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The serial port could not be opened or driven
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No transport is attached
    #[error("Not connected to motherboard")]
    NotConnected,

    /// The handshake got no usable answer
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Motherboard firmware is below the configured minimum
    #[error("Firmware v{found} is older than the minimum supported v{minimum}")]
    BadFirmwareVersion {
        /// Version the board reported
        found: Version,
        /// Configured minimum
        minimum: Version,
    },

    /// The device accepted the packet but its command queue is full.
    /// Callers issuing buffered commands may back off and resend.
    #[error("Device command buffer is full")]
    BufferFull,

    /// A query was answered with buffer-full. Queries are never buffered, so
    /// this means host and firmware disagree about the packet class.
    #[error("Query {code:#04x} rejected with buffer-full")]
    QueryRejected {
        /// Command code of the rejected query
        code: u8,
    },

    /// A frame too small to carry a command code
    #[error("Packet too short to send ({0} bytes)")]
    PacketTooShort(usize),

    /// Payload longer than a frame can carry
    #[error("Payload of {0} bytes exceeds the maximum packet payload")]
    PayloadTooLarge(usize),

    /// Reply payload ended early
    #[error("Response too short: needed {needed} more bytes")]
    ShortResponse {
        /// Missing byte count
        needed: usize,
    },

    /// Received frame failed its CRC
    #[error("CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch {
        /// CRC computed over the payload
        expected: u8,
        /// CRC byte on the wire
        actual: u8,
    },

    /// The board acknowledged fewer EEPROM bytes than were sent
    #[error("EEPROM write at {offset:#06x} acknowledged {actual} bytes, expected {expected}")]
    EepromAckMismatch {
        /// Start of the failed sub-write
        offset: u16,
        /// Bytes sent
        expected: usize,
        /// Bytes the board reported writing
        actual: usize,
    },

    /// Capture file could not be written
    #[error("Capture file error: {0}")]
    CaptureError(#[source] std::io::Error),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
