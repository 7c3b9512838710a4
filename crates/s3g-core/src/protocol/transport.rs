//! Byte-level transport abstraction
//!
//! The session talks to the device only through [`Transport`], so tests can
//! substitute a simulated board for the serial port.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::ProtocolError;

/// How long a single poll blocks while emulating an infinite timeout
const INFINITE_POLL: Duration = Duration::from_millis(1000);

/// How long RTS is held low for a reset pulse
const RESET_PULSE: Duration = Duration::from_millis(100);

/// A half-duplex byte channel to the motherboard
pub trait Transport: Send {
    /// Write a complete frame
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Read one byte. `Ok(None)` means the read timed out or hit EOF.
    fn read_byte(&mut self) -> Result<Option<u8>, ProtocolError>;

    /// Set the read timeout; `None` blocks until a byte arrives
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ProtocolError>;

    /// Discard anything buffered in either direction
    fn clear(&mut self) -> Result<(), ProtocolError>;

    /// Pulse the hardware reset line
    fn pulse_reset(&mut self) -> Result<(), ProtocolError>;
}

/// Serial port implementation of [`Transport`]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    timeout: Option<Duration>,
}

impl SerialTransport {
    /// Wrap an already configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let timeout = Some(port.timeout());
        Self { port, timeout }
    }

    /// Name of the underlying port, if known
    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

fn serial_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::SerialError(e.to_string())
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.port.write_all(bytes).map_err(serial_err)?;
        self.port.flush().map_err(serial_err)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        let mut buf = [0u8; 1];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    if self.timeout.is_some() {
                        return Ok(None);
                    }
                    // Infinite timeout: keep polling
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(serial_err(e)),
            }
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        self.timeout = timeout;
        self.port
            .set_timeout(timeout.unwrap_or(INFINITE_POLL))
            .map_err(serial_err)
    }

    fn clear(&mut self) -> Result<(), ProtocolError> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(serial_err)
    }

    fn pulse_reset(&mut self) -> Result<(), ProtocolError> {
        self.port.write_request_to_send(false).map_err(serial_err)?;
        std::thread::sleep(RESET_PULSE);
        self.port.write_request_to_send(true).map_err(serial_err)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).write(bytes)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        (**self).read_byte()
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        (**self).set_timeout(timeout)
    }

    fn clear(&mut self) -> Result<(), ProtocolError> {
        (**self).clear()
    }

    fn pulse_reset(&mut self) -> Result<(), ProtocolError> {
        (**self).pulse_reset()
    }
}
