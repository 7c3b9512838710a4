//! SD card capture and playback (motherboard firmware 1.3 and later)

use tracing::{debug, info, warn};

use super::{Driver, Result};
use crate::protocol::{MotherboardCommand, PacketBuilder, Response, SdResponse};
use crate::version::Feature;

/// SD status byte of a response; a board that did not answer counts as a
/// generic failure
fn sd_status(response: &Response) -> SdResponse {
    if !response.is_ok() {
        return SdResponse::GenericFailure;
    }
    response
        .reader()
        .get8()
        .map(SdResponse::from_code)
        .unwrap_or(SdResponse::GenericFailure)
}

fn with_filename(code: MotherboardCommand, filename: &str) -> PacketBuilder {
    PacketBuilder::new(code.code()).bytes(filename.as_bytes()).add8(0)
}

impl Driver {
    /// Start recording subsequent commands to `filename` on the card
    pub fn begin_capture(&self, filename: &str) -> Result<SdResponse> {
        self.require(Feature::SdCardCapture)?;
        let status = sd_status(&self.query(with_filename(MotherboardCommand::CaptureToFile, filename))?);
        if status.is_success() {
            info!("Capturing to {} on SD card", filename);
        } else {
            warn!("Could not start SD capture to {}: {:?}", filename, status);
        }
        Ok(status)
    }

    /// Stop recording; returns the number of bytes the board wrote
    pub fn end_capture(&self) -> Result<u32> {
        self.require(Feature::SdCardCapture)?;
        let response = self.query(PacketBuilder::new(MotherboardCommand::EndCapture.code()))?;
        if !response.is_ok() {
            return Ok(0);
        }
        let bytes = response.reader().get32().unwrap_or(0);
        info!("SD capture finished: {} bytes", bytes);
        Ok(bytes)
    }

    /// Build from a file on the card
    pub fn playback(&self, filename: &str) -> Result<SdResponse> {
        self.require(Feature::SdCardCapture)?;
        let status = sd_status(&self.query(with_filename(MotherboardCommand::PlaybackCapture, filename))?);
        debug!(filename, ?status, "playback");
        Ok(status)
    }

    /// Names of the files in the card's root directory
    pub fn file_list(&self) -> Result<Vec<String>> {
        self.require(Feature::SdCardCapture)?;
        let mut files = Vec::new();
        let mut restart = true;
        loop {
            let response = self.query(
                PacketBuilder::new(MotherboardCommand::NextFilename.code()).add8(u8::from(restart)),
            )?;
            restart = false;
            if !sd_status(&response).is_success() {
                break;
            }
            let mut reader = response.reader();
            // Skip the status byte already checked above
            let _ = reader.get8();
            let name = reader.get_cstring();
            if name.is_empty() {
                break;
            }
            files.push(name);
        }
        Ok(files)
    }
}
