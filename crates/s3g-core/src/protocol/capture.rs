//! File capture sink
//!
//! While a capture is open it stands in for the live device: buffered
//! commands are appended (payload only, no sync/length/checksum) and queries
//! are dropped. The resulting file can be replayed from an SD card.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{Packet, ProtocolError};

/// Append-only command recorder
#[derive(Debug)]
pub struct CaptureSink {
    path: PathBuf,
    writer: BufWriter<File>,
    packets: usize,
    bytes: usize,
}

impl CaptureSink {
    /// Create (or truncate) the capture file
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(ProtocolError::CaptureError)?;
        info!(path = %path.display(), "capturing commands to file");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            packets: 0,
            bytes: 0,
        })
    }

    /// Record a packet. Returns whether it was written (queries are skipped).
    pub fn record(&mut self, packet: &Packet) -> Result<bool, ProtocolError> {
        if !packet.is_command() {
            return Ok(false);
        }
        let payload = packet.payload();
        self.writer
            .write_all(payload)
            .map_err(ProtocolError::CaptureError)?;
        self.packets += 1;
        self.bytes += payload.len();
        Ok(true)
    }

    /// File being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of command packets recorded so far
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Flush and close the capture file, returning the number of bytes written
    pub fn finish(mut self) -> Result<usize, ProtocolError> {
        self.writer.flush().map_err(ProtocolError::CaptureError)?;
        info!(
            path = %self.path.display(),
            packets = self.packets,
            bytes = self.bytes,
            "capture closed"
        );
        Ok(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketBuilder;

    #[test]
    fn test_capture_records_commands_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.s3g");
        let mut sink = CaptureSink::create(&path).unwrap();

        let command = PacketBuilder::new(133).add32(500).build().unwrap();
        let query = PacketBuilder::new(0).add16(40).build().unwrap();
        assert!(sink.record(&command).unwrap());
        assert!(!sink.record(&query).unwrap());
        assert_eq!(sink.packets(), 1);
        assert_eq!(sink.finish().unwrap(), 5);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![133, 0xF4, 0x01, 0, 0]);
    }
}
