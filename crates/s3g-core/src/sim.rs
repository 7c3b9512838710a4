//! Simulated motherboard
//!
//! Answers the protocol from in-memory state so the driver can be exercised
//! without hardware. A [`SimulatedBoard`] is a cheap handle: clone it, hand
//! one clone to the driver as its transport and keep the other to script
//! faults and inspect what was sent.
//!
//! Reads never block. An unanswered request looks like a read timeout
//! straight away, whatever timeout the host configured.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::eeprom::map::{BROADCAST_TOOL, FACTORY_RESET_END};
use crate::eeprom::EepromTarget;
use crate::protocol::commands::is_command_code;
use crate::protocol::{
    MotherboardCommand, Packet, PacketDecoder, ProtocolError, ResponseCode, ToolCommand,
    Transport, CancelToken,
};
use crate::version::Version;

const OK: u8 = 0x81;

/// Size of each simulated EEPROM
const EEPROM_SIZE: usize = FACTORY_RESET_END as usize;

/// Free space reported for the command queue
const BUFFER_CAPACITY: u32 = 512;

/// One EEPROM write as it arrived at the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromWrite {
    /// Board whose EEPROM was addressed (the broadcast address is kept)
    pub target: EepromTarget,
    /// First byte written
    pub offset: u16,
    /// Length field of the request
    pub len: u8,
}

/// Simulated extruder controller
#[derive(Debug, Clone)]
pub struct SimTool {
    /// `None` answers the version query without a version
    pub version: Option<Version>,
    /// Answer to GET_BUILD_NAME
    pub build_name: String,
    /// EEPROM contents, erased to 0xFF
    pub eeprom: Vec<u8>,
    /// Extruder reading, °C
    pub temperature: u16,
    /// Extruder target, °C
    pub setpoint: u16,
    /// Platform reading, °C
    pub platform_temperature: u16,
    /// Platform target, °C
    pub platform_setpoint: u16,
    /// Step period of motors 1 and 2, microseconds
    pub motor_period: [u32; 2],
    /// PWM duty of motors 1 and 2
    pub motor_pwm: [u8; 2],
}

impl SimTool {
    fn new(version: Option<Version>) -> Self {
        Self {
            version,
            build_name: "Extruder".to_string(),
            eeprom: vec![0xFF; EEPROM_SIZE],
            temperature: 22,
            setpoint: 0,
            platform_temperature: 22,
            platform_setpoint: 0,
            motor_period: [0; 2],
            motor_pwm: [0; 2],
        }
    }
}

#[derive(Debug)]
struct SimState {
    version: Version,
    build_name: String,
    eeprom: Vec<u8>,
    tools: BTreeMap<u8, SimTool>,
    position: [i32; 3],
    finished: bool,
    sd_card: bool,
    sd_files: Vec<String>,
    sd_cursor: usize,
    sd_capture: Option<u32>,

    // Faults
    drop_replies: u32,
    awaiting_reset: bool,
    buffer_full: u32,
    corrupt_replies: u32,
    forced_status: BTreeMap<u8, ResponseCode>,
    cancel_on_silence: Option<CancelToken>,

    // Record of what the host did
    requests: Vec<Vec<u8>>,
    eeprom_writes: Vec<EepromWrite>,
    reset_pulses: u32,
    clears: u32,
    writes: u32,
    timeout: Option<Option<Duration>>,

    decoder: PacketDecoder,
    outbox: VecDeque<u8>,
}

/// Handle to a simulated motherboard and its tool boards
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

/// Copy as much of `data` as fits; returns the number of bytes written
fn write_into(memory: &mut [u8], offset: usize, data: &[u8]) -> usize {
    let start = offset.min(memory.len());
    let end = (offset + data.len()).min(memory.len());
    let n = end - start;
    memory[start..end].copy_from_slice(&data[..n]);
    n
}

fn read_from(memory: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let start = offset.min(memory.len());
    let end = (offset + len).min(memory.len());
    memory[start..end].to_vec()
}

fn le16(bytes: &[u8]) -> u16 {
    match bytes {
        [a, b, ..] => u16::from_le_bytes([*a, *b]),
        _ => 0,
    }
}

fn le32(bytes: &[u8]) -> u32 {
    match bytes {
        [a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
        _ => 0,
    }
}

fn cstring(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

fn ok_with(data: &[u8]) -> Vec<u8> {
    let mut reply = vec![OK];
    reply.extend_from_slice(data);
    reply
}

impl SimulatedBoard {
    /// A motherboard running `version` with no tool boards attached
    pub fn new(version: Version) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                version,
                build_name: "Sanguino3G".to_string(),
                eeprom: vec![0xFF; EEPROM_SIZE],
                tools: BTreeMap::new(),
                position: [0; 3],
                finished: true,
                sd_card: true,
                sd_files: Vec::new(),
                sd_cursor: 0,
                sd_capture: None,
                drop_replies: 0,
                awaiting_reset: false,
                buffer_full: 0,
                corrupt_replies: 0,
                forced_status: BTreeMap::new(),
                cancel_on_silence: None,
                requests: Vec::new(),
                eeprom_writes: Vec::new(),
                reset_pulses: 0,
                clears: 0,
                writes: 0,
                timeout: None,
                decoder: PacketDecoder::new(),
                outbox: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a tool board at `index`
    pub fn with_tool(self, index: u8, version: Version) -> Self {
        self.state().tools.insert(index, SimTool::new(Some(version)));
        self
    }

    /// Attach a tool board that answers but reports no firmware version
    pub fn with_unresponsive_tool(self, index: u8) -> Self {
        self.state().tools.insert(index, SimTool::new(None));
        self
    }

    /// Set the motherboard's build name
    pub fn with_build_name(self, name: &str) -> Self {
        self.state().build_name = name.to_string();
        self
    }

    /// Change the firmware version reported from now on
    pub fn set_version(&self, version: Version) {
        self.state().version = version;
    }

    /// Ignore the next `n` requests
    pub fn drop_replies(&self, n: u32) {
        self.state().drop_replies = n;
    }

    /// Ignore every request until the reset line is pulsed
    pub fn require_reset(&self) {
        self.state().awaiting_reset = true;
    }

    /// Answer the next `n` buffered commands with BUFFER_OVERFLOW
    pub fn answer_buffer_full(&self, n: u32) {
        self.state().buffer_full = n;
    }

    /// Corrupt the checksum of the next `n` replies
    pub fn corrupt_replies(&self, n: u32) {
        self.state().corrupt_replies = n;
    }

    /// Answer `code` with UNSUPPORTED
    pub fn mark_unsupported(&self, code: u8) {
        self.answer_with(code, ResponseCode::Unsupported);
    }

    /// Answer every request for `code` with `status` and nothing else
    pub fn answer_with(&self, code: u8, status: ResponseCode) {
        self.state().forced_status.insert(code, status);
    }

    /// Cancel `token` the first time the host reads with nothing to read
    pub fn cancel_on_silence(&self, token: CancelToken) {
        self.state().cancel_on_silence = Some(token);
    }

    /// Answer to IS_FINISHED
    pub fn set_finished(&self, finished: bool) {
        self.state().finished = finished;
    }

    /// Overwrite the step position reported by GET_POSITION
    pub fn set_position(&self, steps: [i32; 3]) {
        self.state().position = steps;
    }

    /// Current step position
    pub fn position(&self) -> [i32; 3] {
        self.state().position
    }

    /// Insert or remove the SD card
    pub fn set_sd_card(&self, present: bool) {
        self.state().sd_card = present;
    }

    /// Put a file on the SD card
    pub fn add_sd_file(&self, name: &str) {
        self.state().sd_files.push(name.to_string());
    }

    /// Extruder temperature reported by a tool board
    pub fn set_tool_temperature(&self, index: u8, celsius: u16) {
        if let Some(tool) = self.state().tools.get_mut(&index) {
            tool.temperature = celsius;
        }
    }

    /// Extruder target reported by a tool board
    pub fn set_tool_setpoint(&self, index: u8, celsius: u16) {
        if let Some(tool) = self.state().tools.get_mut(&index) {
            tool.setpoint = celsius;
        }
    }

    /// Snapshot of a tool board
    pub fn tool(&self, index: u8) -> Option<SimTool> {
        self.state().tools.get(&index).cloned()
    }

    /// Motherboard EEPROM contents
    pub fn eeprom(&self, offset: u16, len: usize) -> Vec<u8> {
        read_from(&self.state().eeprom, offset as usize, len)
    }

    /// Preload motherboard EEPROM without going through the protocol
    pub fn write_eeprom(&self, offset: u16, data: &[u8]) {
        write_into(&mut self.state().eeprom, offset as usize, data);
    }

    /// Tool board EEPROM contents
    pub fn tool_eeprom(&self, index: u8, offset: u16, len: usize) -> Vec<u8> {
        self.state()
            .tools
            .get(&index)
            .map(|t| read_from(&t.eeprom, offset as usize, len))
            .unwrap_or_default()
    }

    /// Preload tool board EEPROM without going through the protocol
    pub fn write_tool_eeprom(&self, index: u8, offset: u16, data: &[u8]) {
        if let Some(tool) = self.state().tools.get_mut(&index) {
            write_into(&mut tool.eeprom, offset as usize, data);
        }
    }

    /// Every request payload decoded so far, answered or not
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state().requests.clone()
    }

    /// Command code of every request
    pub fn request_codes(&self) -> Vec<u8> {
        self.state()
            .requests
            .iter()
            .filter_map(|r| r.first().copied())
            .collect()
    }

    /// EEPROM writes received, in order
    pub fn eeprom_writes(&self) -> Vec<EepromWrite> {
        self.state().eeprom_writes.clone()
    }

    /// Number of reset pulses
    pub fn reset_pulses(&self) -> u32 {
        self.state().reset_pulses
    }

    /// Number of times the host cleared the channel
    pub fn clears(&self) -> u32 {
        self.state().clears
    }

    /// Number of `write` calls made by the host
    pub fn writes(&self) -> u32 {
        self.state().writes
    }

    /// Last timeout the host configured (`None` if never set)
    pub fn timeout(&self) -> Option<Option<Duration>> {
        self.state().timeout
    }

    /// Forget recorded requests and writes
    pub fn clear_log(&self) {
        let mut state = self.state();
        state.requests.clear();
        state.eeprom_writes.clear();
    }
}

impl SimState {
    fn receive(&mut self, payload: Vec<u8>) {
        trace!("sim <- {:02x?}", payload);
        self.requests.push(payload.clone());

        if self.awaiting_reset {
            return;
        }
        if self.drop_replies > 0 {
            self.drop_replies -= 1;
            return;
        }
        let Some(&code) = payload.first() else {
            return;
        };
        if is_command_code(code) && self.buffer_full > 0 {
            self.buffer_full -= 1;
            self.send(vec![ResponseCode::BufferOverflow.to_wire()]);
            return;
        }
        if let Some(status) = self.forced_status.get(&code) {
            self.send(vec![status.to_wire()]);
            return;
        }
        if is_command_code(code) {
            if let Some(bytes) = self.sd_capture.as_mut() {
                *bytes += payload.len() as u32;
            }
        }
        if let Some(reply) = self.answer(code, &payload[1..]) {
            self.send(reply);
        }
    }

    fn send(&mut self, reply: Vec<u8>) {
        trace!("sim -> {:02x?}", reply);
        let mut frame = Packet::new(&reply).as_bytes().to_vec();
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            if let Some(crc) = frame.last_mut() {
                *crc ^= 0x01;
            }
        }
        self.outbox.extend(frame);
    }

    fn answer(&mut self, code: u8, args: &[u8]) -> Option<Vec<u8>> {
        let Some(command) = MotherboardCommand::from_code(code) else {
            return Some(vec![ResponseCode::Unsupported.to_wire()]);
        };
        let reply = match command {
            MotherboardCommand::Version => ok_with(&self.version.to_wire().to_le_bytes()),
            MotherboardCommand::GetBuildName => {
                let mut reply = ok_with(self.build_name.as_bytes());
                reply.push(0);
                reply
            }
            MotherboardCommand::Init
            | MotherboardCommand::ClearBuffer
            | MotherboardCommand::Pause
            | MotherboardCommand::Reset => vec![OK],
            MotherboardCommand::Abort => {
                self.finished = true;
                vec![OK]
            }
            MotherboardCommand::GetBufferSize => ok_with(&BUFFER_CAPACITY.to_le_bytes()),
            MotherboardCommand::GetPosition => {
                let mut reply = vec![OK];
                for axis in self.position {
                    reply.extend_from_slice(&axis.to_le_bytes());
                }
                // Endstop states
                reply.push(0);
                reply
            }
            MotherboardCommand::IsFinished => ok_with(&[u8::from(self.finished)]),
            MotherboardCommand::ReadEeprom => {
                let offset = le16(args) as usize;
                let len = args.get(2).copied().unwrap_or(0) as usize;
                ok_with(&read_from(&self.eeprom, offset, len))
            }
            MotherboardCommand::WriteEeprom => {
                let offset = le16(args);
                let len = args.get(2).copied().unwrap_or(0);
                let data = args.get(3..).unwrap_or(&[]);
                let data = &data[..data.len().min(len as usize)];
                let written = write_into(&mut self.eeprom, offset as usize, data);
                self.eeprom_writes.push(EepromWrite {
                    target: EepromTarget::Motherboard,
                    offset,
                    len,
                });
                vec![OK, written as u8]
            }
            MotherboardCommand::WriteEeprom32 => {
                let offset = le16(args);
                let data = args.get(2..6).unwrap_or(&[]);
                write_into(&mut self.eeprom, offset as usize, data);
                self.eeprom_writes.push(EepromWrite {
                    target: EepromTarget::Motherboard,
                    offset,
                    len: 4,
                });
                vec![OK]
            }
            MotherboardCommand::CaptureToFile => {
                if !self.sd_card {
                    return Some(vec![OK, 1]);
                }
                self.sd_files.push(cstring(args));
                self.sd_capture = Some(0);
                vec![OK, 0]
            }
            MotherboardCommand::EndCapture => {
                let bytes = self.sd_capture.take().unwrap_or(0);
                ok_with(&bytes.to_le_bytes())
            }
            MotherboardCommand::PlaybackCapture => {
                let name = cstring(args);
                match (self.sd_card, self.sd_files.contains(&name)) {
                    (false, _) => vec![OK, 1],
                    (true, false) => vec![OK, 7],
                    (true, true) => vec![OK, 0],
                }
            }
            MotherboardCommand::NextFilename => {
                if !self.sd_card {
                    return Some(vec![OK, 1]);
                }
                if args.first().copied().unwrap_or(0) != 0 {
                    self.sd_cursor = 0;
                }
                let mut reply = vec![OK, 0];
                if let Some(name) = self.sd_files.get(self.sd_cursor) {
                    reply.extend_from_slice(name.as_bytes());
                    self.sd_cursor += 1;
                }
                reply.push(0);
                reply
            }
            MotherboardCommand::ToolQuery => return self.tool_query(args),
            MotherboardCommand::ToolCommand => return self.tool_command(args),
            MotherboardCommand::QueuePointAbs | MotherboardCommand::SetPosition => {
                for (i, axis) in self.position.iter_mut().enumerate() {
                    *axis = le32(args.get(4 * i..).unwrap_or(&[])) as i32;
                }
                vec![OK]
            }
            MotherboardCommand::FirstAutoRaft | MotherboardCommand::AutoRaft => {
                self.position = [0; 3];
                vec![OK]
            }
            MotherboardCommand::FindAxesMinimum
            | MotherboardCommand::FindAxesMaximum
            | MotherboardCommand::Delay
            | MotherboardCommand::ChangeTool
            | MotherboardCommand::WaitForTool
            | MotherboardCommand::EnableAxes
            | MotherboardCommand::WaitForPlatform => vec![OK],
        };
        Some(reply)
    }

    /// `tool, sub, args...`. Absent tool boards never answer; the broadcast
    /// address reaches the lowest-numbered board.
    fn tool_query(&mut self, args: &[u8]) -> Option<Vec<u8>> {
        let (&index, rest) = args.split_first()?;
        let (&sub, rest) = rest.split_first()?;
        let broadcast = index == BROADCAST_TOOL;
        let index = if broadcast {
            *self.tools.keys().next()?
        } else {
            index
        };
        let tool = self.tools.get_mut(&index)?;
        let Some(sub) = ToolCommand::from_code(sub) else {
            return Some(vec![ResponseCode::Unsupported.to_wire()]);
        };
        let reply = match sub {
            ToolCommand::Version => {
                let raw = tool.version.map(Version::to_wire).unwrap_or(0);
                ok_with(&raw.to_le_bytes())
            }
            ToolCommand::GetBuildName => {
                let mut reply = ok_with(tool.build_name.as_bytes());
                reply.push(0);
                reply
            }
            ToolCommand::GetTemp => ok_with(&tool.temperature.to_le_bytes()),
            ToolCommand::GetPlatformTemp => ok_with(&tool.platform_temperature.to_le_bytes()),
            ToolCommand::GetSetpoint => ok_with(&tool.setpoint.to_le_bytes()),
            ToolCommand::GetPlatformSetpoint => ok_with(&tool.platform_setpoint.to_le_bytes()),
            ToolCommand::GetMotor1Pwm => vec![OK, tool.motor_pwm[0]],
            ToolCommand::GetMotor2Pwm => vec![OK, tool.motor_pwm[1]],
            ToolCommand::GetMotor1Rpm => ok_with(&tool.motor_period[0].to_le_bytes()),
            ToolCommand::GetMotor2Rpm => ok_with(&tool.motor_period[1].to_le_bytes()),
            ToolCommand::ReadFromEeprom => {
                let offset = le16(rest) as usize;
                let len = rest.get(2).copied().unwrap_or(0) as usize;
                ok_with(&read_from(&tool.eeprom, offset, len))
            }
            ToolCommand::WriteToEeprom => {
                let offset = le16(rest);
                let len = rest.get(2).copied().unwrap_or(0);
                let data = rest.get(3..).unwrap_or(&[]);
                let data = &data[..data.len().min(len as usize)];
                let written = write_into(&mut tool.eeprom, offset as usize, data);
                let target = if broadcast { BROADCAST_TOOL } else { index };
                self.eeprom_writes.push(EepromWrite {
                    target: EepromTarget::Tool(target),
                    offset,
                    len,
                });
                vec![OK, written as u8]
            }
            ToolCommand::Init => vec![OK],
            _ => vec![ResponseCode::Unsupported.to_wire()],
        };
        Some(reply)
    }

    /// `tool, sub, len, args...`. Buffered by the motherboard, so answered
    /// even when the tool board is absent.
    fn tool_command(&mut self, args: &[u8]) -> Option<Vec<u8>> {
        let (&index, rest) = args.split_first()?;
        let (&sub, rest) = rest.split_first()?;
        let data = rest.get(1..).unwrap_or(&[]);
        if let (Some(tool), Some(sub)) = (self.tools.get_mut(&index), ToolCommand::from_code(sub)) {
            match sub {
                ToolCommand::SetTemp => tool.setpoint = le16(data),
                ToolCommand::SetPlatformTemp => tool.platform_setpoint = le16(data),
                ToolCommand::SetMotor1Rpm => tool.motor_period[0] = le32(data),
                ToolCommand::SetMotor2Rpm => tool.motor_period[1] = le32(data),
                ToolCommand::SetMotor1Pwm => tool.motor_pwm[0] = data.first().copied().unwrap_or(0),
                ToolCommand::SetMotor2Pwm => tool.motor_pwm[1] = data.first().copied().unwrap_or(0),
                _ => {}
            }
        }
        Some(vec![OK])
    }
}

impl Transport for SimulatedBoard {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.state();
        state.writes += 1;
        for &byte in bytes {
            match state.decoder.push(byte) {
                Ok(true) => {
                    let payload = state.decoder.take_payload().unwrap_or_default();
                    state.decoder.reset();
                    state.receive(payload);
                }
                Ok(false) => {}
                Err(e) => {
                    trace!("sim dropped bad frame: {}", e);
                    state.decoder.reset();
                }
            }
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        let mut state = self.state();
        let byte = state.outbox.pop_front();
        if byte.is_none() {
            if let Some(token) = state.cancel_on_silence.take() {
                token.cancel();
            }
        }
        Ok(byte)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        self.state().timeout = Some(timeout);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.state();
        state.clears += 1;
        state.outbox.clear();
        state.decoder.reset();
        Ok(())
    }

    fn pulse_reset(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.state();
        state.reset_pulses += 1;
        state.awaiting_reset = false;
        state.outbox.clear();
        state.position = [0; 3];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketBuilder, Response};

    fn exchange(board: &mut SimulatedBoard, packet: &Packet) -> Response {
        board.write(packet.as_bytes()).unwrap();
        let mut decoder = PacketDecoder::new();
        while let Some(byte) = board.read_byte().unwrap() {
            if decoder.push(byte).unwrap() {
                return Response::from_payload(&decoder.take_payload().unwrap());
            }
        }
        Response::timeout()
    }

    #[test]
    fn test_version_reply() {
        let mut board = SimulatedBoard::new(Version::new(2, 6));
        let packet = PacketBuilder::new(0).add16(40).build().unwrap();
        let response = exchange(&mut board, &packet);
        assert!(response.is_ok());
        assert_eq!(response.reader().get16().unwrap(), 206);
        assert_eq!(board.requests(), vec![vec![0, 40, 0]]);
    }

    #[test]
    fn test_absent_tool_is_silent() {
        let mut board = SimulatedBoard::new(Version::new(2, 0));
        let packet = PacketBuilder::new(10).add8(0).add8(0).build().unwrap();
        assert!(exchange(&mut board, &packet).is_timeout());
    }

    #[test]
    fn test_reset_gate() {
        let mut board = SimulatedBoard::new(Version::new(2, 0));
        board.require_reset();
        let packet = PacketBuilder::new(0).add16(40).build().unwrap();
        assert!(exchange(&mut board, &packet).is_timeout());
        board.pulse_reset().unwrap();
        assert!(exchange(&mut board, &packet).is_ok());
        assert_eq!(board.reset_pulses(), 1);
    }

    fn eeprom_write(offset: u16, data: &[u8]) -> Packet {
        data.iter()
            .fold(
                PacketBuilder::new(13).add16(offset).add8(data.len() as u8),
                |b, &byte| b.add8(byte),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_eeprom_write_past_end_is_truncated() {
        let mut board = SimulatedBoard::new(Version::new(2, 0));

        let response = exchange(&mut board, &eeprom_write(0x300, &[1, 2, 3]));
        assert!(response.is_ok());
        assert_eq!(response.reader().get8().unwrap(), 0);

        let response = exchange(&mut board, &eeprom_write(0x1FE, &[1, 2, 3, 4]));
        assert_eq!(response.reader().get8().unwrap(), 2);
        assert_eq!(board.eeprom(0x1FE, 4), vec![1, 2]);

        board.write_eeprom(0x300, &[9, 9]);
        assert!(board.eeprom(0x300, 2).is_empty());
    }
}
