//! Decoded responses
//!
//! Byte 0 of every response payload is a status code; the rest is
//! command-specific data read with [`ResponseReader`].

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::ProtocolError;

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Unspecified failure
    GenericError,
    /// Success
    Ok,
    /// Device command queue is full; the caller may resend later
    BufferOverflow,
    /// The device saw a corrupted request
    CrcMismatch,
    /// Command not implemented by this firmware
    Unsupported,
    /// Synthesized by the host when no frame arrived; never on the wire
    Timeout,
}

impl ResponseCode {
    /// Map a wire status byte. Unknown codes (including the query-overflow
    /// code 0x84) are reported as a generic error.
    pub fn from_wire(code: u8) -> Self {
        match code {
            0x81 => ResponseCode::Ok,
            0x82 => ResponseCode::BufferOverflow,
            0x83 => ResponseCode::CrcMismatch,
            0x85 => ResponseCode::Unsupported,
            _ => ResponseCode::GenericError,
        }
    }

    /// Wire status byte (the synthesized timeout has none on the wire; 0x7F is
    /// used when one must be written, e.g. by the simulator)
    pub fn to_wire(self) -> u8 {
        match self {
            ResponseCode::GenericError => 0x80,
            ResponseCode::Ok => 0x81,
            ResponseCode::BufferOverflow => 0x82,
            ResponseCode::CrcMismatch => 0x83,
            ResponseCode::Unsupported => 0x85,
            ResponseCode::Timeout => 0x7F,
        }
    }

    /// Human-readable description
    pub fn message(self) -> &'static str {
        match self {
            ResponseCode::GenericError => "generic error",
            ResponseCode::Ok => "ok",
            ResponseCode::BufferOverflow => "buffer overflow",
            ResponseCode::CrcMismatch => "CRC mismatch",
            ResponseCode::Unsupported => "unsupported command",
            ResponseCode::Timeout => "timeout",
        }
    }
}

/// One decoded response, consumed immediately by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    code: ResponseCode,
    data: Vec<u8>,
}

impl Response {
    /// Build from a decoded frame payload (status byte first)
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.split_first() {
            Some((&status, data)) => Self {
                code: ResponseCode::from_wire(status),
                data: data.to_vec(),
            },
            None => Self::timeout(),
        }
    }

    /// No frame arrived (or the exchange was abandoned)
    pub fn timeout() -> Self {
        Self {
            code: ResponseCode::Timeout,
            data: Vec::new(),
        }
    }

    /// Synthetic success used while capturing to a file
    pub fn ok() -> Self {
        Self {
            code: ResponseCode::Ok,
            data: Vec::new(),
        }
    }

    /// Status byte of the reply
    pub fn code(&self) -> ResponseCode {
        self.code
    }

    /// Status was OK
    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    /// No reply arrived
    pub fn is_timeout(&self) -> bool {
        self.code == ResponseCode::Timeout
    }

    /// Data following the status byte
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// No data beyond the status byte
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sequential little-endian reader over the response data
    pub fn reader(&self) -> ResponseReader<'_> {
        ResponseReader {
            cursor: Cursor::new(&self.data),
        }
    }
}

/// Reads typed fields from a response
pub struct ResponseReader<'a> {
    cursor: Cursor<&'a Vec<u8>>,
}

impl ResponseReader<'_> {
    fn short(&self, width: usize) -> ProtocolError {
        let remaining = self.remaining();
        ProtocolError::ShortResponse {
            needed: width.saturating_sub(remaining),
        }
    }

    /// Unread payload bytes
    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    /// Next byte
    pub fn get8(&mut self) -> Result<u8, ProtocolError> {
        self.cursor.read_u8().map_err(|_| self.short(1))
    }

    /// Little-endian u16
    pub fn get16(&mut self) -> Result<u16, ProtocolError> {
        if self.remaining() < 2 {
            return Err(self.short(2));
        }
        Ok(self.cursor.read_u16::<LittleEndian>()?)
    }

    /// Little-endian u32
    pub fn get32(&mut self) -> Result<u32, ProtocolError> {
        if self.remaining() < 4 {
            return Err(self.short(4));
        }
        Ok(self.cursor.read_u32::<LittleEndian>()?)
    }

    /// Little-endian i32
    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.get32()? as i32)
    }

    /// Read a NUL-terminated string (or the rest of the data if unterminated)
    pub fn get_cstring(&mut self) -> String {
        let mut s = String::new();
        while let Ok(b) = self.cursor.read_u8() {
            if b == 0 {
                break;
            }
            s.push(char::from(b));
        }
        s
    }
}

/// SD card operation outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdResponse {
    /// Operation completed
    Success,
    /// No card inserted
    NoCard,
    /// Card did not initialise
    InitFailed,
    /// No usable partition
    PartitionFailed,
    /// Filesystem could not be mounted
    FilesystemFailed,
    /// Root directory could not be opened
    RootDirFailed,
    /// Card is write protected
    Locked,
    /// No such file
    FileNotFound,
    /// Any other failure code
    GenericFailure,
}

impl SdResponse {
    /// Unknown codes map to `GenericFailure`
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => SdResponse::Success,
            1 => SdResponse::NoCard,
            2 => SdResponse::InitFailed,
            3 => SdResponse::PartitionFailed,
            4 => SdResponse::FilesystemFailed,
            5 => SdResponse::RootDirFailed,
            6 => SdResponse::Locked,
            7 => SdResponse::FileNotFound,
            _ => SdResponse::GenericFailure,
        }
    }

    /// True only for `Success`
    pub fn is_success(self) -> bool {
        self == SdResponse::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ResponseCode::from_wire(0x81), ResponseCode::Ok);
        assert_eq!(ResponseCode::from_wire(0x82), ResponseCode::BufferOverflow);
        assert_eq!(ResponseCode::from_wire(0x84), ResponseCode::GenericError);
        assert_eq!(ResponseCode::from_wire(0x00), ResponseCode::GenericError);
    }

    #[test]
    fn test_reader_fields() {
        let response = Response::from_payload(&[0x81, 0x34, 0x12, 1, 0, 0, 0x80, 7]);
        assert!(response.is_ok());
        let mut r = response.reader();
        assert_eq!(r.get16().unwrap(), 0x1234);
        assert_eq!(r.get32().unwrap(), 0x8000_0001);
        assert_eq!(r.remaining(), 1);
        assert!(matches!(r.get16(), Err(ProtocolError::ShortResponse { needed: 1 })));
        assert_eq!(r.get8().unwrap(), 7);
        assert!(r.get8().is_err());
    }

    #[test]
    fn test_cstring() {
        let response = Response::from_payload(&[0x81, b'a', b'b', 0, b'c']);
        let mut r = response.reader();
        assert_eq!(r.get_cstring(), "ab");
        assert_eq!(r.get_cstring(), "c");
        assert_eq!(r.get_cstring(), "");
    }

    #[test]
    fn test_timeout_is_empty() {
        let response = Response::timeout();
        assert!(response.is_timeout());
        assert!(response.is_empty());
        assert_eq!(Response::from_payload(&[]), Response::timeout());
    }

    #[test]
    fn test_sd_codes() {
        assert_eq!(SdResponse::from_code(0), SdResponse::Success);
        assert_eq!(SdResponse::from_code(6), SdResponse::Locked);
        assert_eq!(SdResponse::from_code(7), SdResponse::FileNotFound);
        assert_eq!(SdResponse::from_code(42), SdResponse::GenericFailure);
    }
}
