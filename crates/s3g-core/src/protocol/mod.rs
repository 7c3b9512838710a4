//! Serial Protocol Communication
//!
//! Implements the Sanguino3G ("gen3") framed binary protocol spoken by
//! RepRap-style motherboards and, through them, by extruder controllers.

mod capture;
pub mod commands;
mod connection;
mod error;
mod packet;
mod response;
pub mod serial;
mod session;
pub mod transport;

pub use capture::CaptureSink;
pub use commands::{MotherboardCommand, ToolCommand};
pub use connection::{Connection, ConnectionState, DeviceInfo, Notice, ToolProbe};
pub use error::ProtocolError;
pub use packet::{
    checksum, DecodeState, Packet, PacketBuilder, PacketDecoder, MIN_FRAME_SIZE, PACKET_CRC,
};
pub use response::{Response, ResponseCode, ResponseReader, SdResponse};
pub use serial::{configure_port, list_ports, open_port, PortInfo};
pub use session::{CancelToken, RetryPolicy, RetryReason, Session, SessionStats};
pub use transport::{SerialTransport, Transport};

/// Frame start marker
pub const SYNC_BYTE: u8 = 0xD5;

/// Largest payload (command code plus arguments) the firmware will buffer
pub const MAX_PAYLOAD_SIZE: usize = 32;

/// Default baud rate for gen3 motherboards
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Attempts made for ordinary commands and queries
pub const DEFAULT_RETRIES: u32 = 5;

/// Host protocol version sent with VERSION and GET_BUILD_NAME (`major * 100 + minor`)
pub const HOST_VERSION: u16 = 40;

/// Read timeout while the link is being established, in milliseconds.
/// An Arduino-class board needs about 2s for its bootloader plus 0.6s to start.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 2600;

/// Wait after opening the port or pulsing reset before the board can answer
pub const RESET_SETTLE_MS: u64 = 2600;
