//! Raw EEPROM access over the session
//!
//! Reads and writes are queries. The motherboard's own EEPROM is addressed
//! with READ_EEPROM/WRITE_EEPROM; a tool board's EEPROM is reached through
//! TOOL_QUERY with the board's address.

use tracing::{debug, error, warn};

use super::codec::{self, plan_chunks};
use super::map::{
    motherboard, CHECK_BYTES, FACTORY_RESET_END, LEGACY_WIPE_END, MOTHERBOARD_WRITE_CHUNK,
    TOOL_WRITE_CHUNK, WIPE_CHUNK,
};
use crate::protocol::{
    MotherboardCommand, PacketBuilder, ProtocolError, Response, RetryPolicy, Session, ToolCommand,
};

/// Whose EEPROM is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromTarget {
    /// Motherboard EEPROM
    Motherboard,
    /// EEPROM of the tool board at this index
    Tool(u8),
}

impl EepromTarget {
    /// Largest write per packet
    pub fn max_chunk(self) -> usize {
        match self {
            EepromTarget::Motherboard => MOTHERBOARD_WRITE_CHUNK,
            EepromTarget::Tool(_) => TOOL_WRITE_CHUNK,
        }
    }

    fn builder(self, motherboard: MotherboardCommand, tool: ToolCommand) -> PacketBuilder {
        match self {
            EepromTarget::Motherboard => PacketBuilder::new(motherboard.code()),
            EepromTarget::Tool(index) => PacketBuilder::new(MotherboardCommand::ToolQuery.code())
                .add8(index)
                .add8(tool.code()),
        }
    }
}

/// Outcome of the legacy schema check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheck {
    /// Check bytes present
    Valid,
    /// Check bytes could not be read; nothing was changed
    Unreadable,
    /// Check bytes were wrong and the region was reinitialised
    Wiped,
}

/// EEPROM of one board
pub struct Eeprom<'a> {
    session: &'a Session,
    target: EepromTarget,
    retries: u32,
}

impl<'a> Eeprom<'a> {
    /// `retries` applies to each sub-request
    pub fn new(session: &'a Session, target: EepromTarget, retries: u32) -> Self {
        Self {
            session,
            target,
            retries,
        }
    }

    /// Which board this accessor talks to
    pub fn target(&self) -> EepromTarget {
        self.target
    }

    fn query(&self, builder: PacketBuilder) -> Result<Response, ProtocolError> {
        self.session
            .run_query(&builder.build()?, RetryPolicy::Logged(self.retries))
    }

    /// Read up to `len` bytes. The board may return fewer; a failed read
    /// returns nothing, which every typed accessor treats as unset.
    pub fn read(&self, offset: u16, len: u8) -> Result<Vec<u8>, ProtocolError> {
        if self.session.is_capturing() {
            return Ok(Vec::new());
        }
        let builder = self
            .target
            .builder(MotherboardCommand::ReadEeprom, ToolCommand::ReadFromEeprom)
            .add16(offset)
            .add8(len);
        let response = self.query(builder)?;
        if !response.is_ok() {
            error!(
                target_board = ?self.target,
                offset,
                "EEPROM read failed: {}",
                response.code().message()
            );
            return Ok(Vec::new());
        }
        let data = response.data();
        Ok(data[..data.len().min(len as usize)].to_vec())
    }

    /// Write `data` at `offset`, split into packets the board can accept.
    /// Every packet must be acknowledged with its own length.
    pub fn write(&self, offset: u16, data: &[u8]) -> Result<(), ProtocolError> {
        if self.session.is_capturing() {
            warn!("EEPROM write at {:#06x} skipped while capturing", offset);
            return Ok(());
        }
        for chunk in plan_chunks(offset, data.len(), self.target.max_chunk()) {
            let bytes = &data[chunk.range.clone()];
            let builder = self
                .target
                .builder(MotherboardCommand::WriteEeprom, ToolCommand::WriteToEeprom)
                .add16(chunk.offset)
                .add8(bytes.len() as u8)
                .bytes(bytes);
            let response = self.query(builder)?;
            let acked = if response.is_ok() {
                response.reader().get8().map(usize::from).unwrap_or(0)
            } else {
                0
            };
            if acked != bytes.len() {
                return Err(ProtocolError::EepromAckMismatch {
                    offset: chunk.offset,
                    expected: bytes.len(),
                    actual: acked,
                });
            }
            debug!(target_board = ?self.target, offset = chunk.offset, len = bytes.len(), "EEPROM write");
        }
        Ok(())
    }

    /// Single byte; `None` if the board did not answer
    pub fn read_u8(&self, offset: u16) -> Result<Option<u8>, ProtocolError> {
        Ok(self.read(offset, 1)?.first().copied())
    }

    /// Little-endian u16; `None` if the board did not answer
    pub fn read_u16(&self, offset: u16) -> Result<Option<u16>, ProtocolError> {
        Ok(codec::read_u16(&self.read(offset, 2)?))
    }

    /// Little-endian u32; `None` if the board did not answer
    pub fn read_u32(&self, offset: u16) -> Result<Option<u32>, ProtocolError> {
        Ok(codec::read_u32(&self.read(offset, 4)?))
    }

    /// 8.8 fixed-point value
    pub fn read_fixed88(&self, offset: u16) -> Result<Option<f64>, ProtocolError> {
        Ok(codec::read_fixed88(&self.read(offset, 2)?))
    }

    /// Little-endian u16 write
    pub fn write_u16(&self, offset: u16, value: u16) -> Result<(), ProtocolError> {
        self.write(offset, &codec::u16_bytes(value))
    }

    /// 32-bit write. The motherboard has a dedicated query for this; tool
    /// boards take the four bytes as an ordinary write.
    pub fn write_u32(&self, offset: u16, value: u32) -> Result<(), ProtocolError> {
        match self.target {
            EepromTarget::Motherboard => {
                if self.session.is_capturing() {
                    return Ok(());
                }
                let builder = PacketBuilder::new(MotherboardCommand::WriteEeprom32.code())
                    .add16(offset)
                    .add32(value);
                let response = self.query(builder)?;
                if !response.is_ok() {
                    warn!(offset, "32-bit EEPROM write failed: {}", response.code().message());
                }
                Ok(())
            }
            EepromTarget::Tool(_) => self.write(offset, &codec::u32_bytes(value)),
        }
    }

    /// Clamped to the 8.8 range before encoding
    pub fn write_fixed88(&self, offset: u16, value: f64) -> Result<(), ProtocolError> {
        self.write(offset, &codec::encode_fixed88(value))
    }

    /// Fill `[start, end)` with `byte`, one wipe block at a time
    pub fn fill(&self, start: u16, end: u16, byte: u8) -> Result<(), ProtocolError> {
        let block = [byte; WIPE_CHUNK];
        for offset in (start..end).step_by(WIPE_CHUNK) {
            let len = WIPE_CHUNK.min((end - offset) as usize);
            self.write(offset, &block[..len])?;
        }
        Ok(())
    }

    /// Erase to the factory state (all `0xFF`)
    pub fn factory_reset(&self) -> Result<(), ProtocolError> {
        warn!(target_board = ?self.target, "resetting EEPROM to factory state");
        self.fill(0, FACTORY_RESET_END, 0xFF)
    }

    /// Verify the check bytes of a 1.x motherboard EEPROM, reinitialising it
    /// to zero if they are wrong. Destroys any stored calibration; never call
    /// this on 2.x firmware, which treats erased `0xFF` bytes as defaults.
    pub fn check_schema(&self) -> Result<SchemaCheck, ProtocolError> {
        let check = self.read(motherboard::CHECK, 2)?;
        if check.len() < 2 {
            return Ok(SchemaCheck::Unreadable);
        }
        if check[..2] == CHECK_BYTES {
            return Ok(SchemaCheck::Valid);
        }

        error!("Cleaning EEPROM to v1.X state");
        let mut first = [0u8; WIPE_CHUNK];
        first[..2].copy_from_slice(&CHECK_BYTES);
        self.write(motherboard::CHECK, &first)?;
        self.fill(WIPE_CHUNK as u16, LEGACY_WIPE_END, 0x00)?;
        Ok(SchemaCheck::Wiped)
    }
}
