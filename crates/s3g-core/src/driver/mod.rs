//! Machine driver
//!
//! The typed command set on top of a negotiated [`Connection`]: motion,
//! homing, tool heads, SD card and onboard parameters. The driver keeps the
//! host-side view of the machine (cached position, per-tool settings) and
//! decides from the capability table which commands the firmware can take.

mod motion;
mod onboard;
mod sdcard;
mod toolhead;

pub use toolhead::{Servo, ToolState};

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::eeprom::{Eeprom, EepromTarget, SchemaCheck};
use crate::machine::{Geometry, MachineModel, Point3};
use crate::protocol::{
    Connection, ConnectionState, DeviceInfo, MotherboardCommand, Notice, Packet, PacketBuilder,
    ProtocolError, Response, ResponseCode, RetryPolicy, Session, Transport,
};
use crate::version::{Feature, Version};

/// ENABLE_AXES argument switching every stepper on
const ENABLE_ALL_AXES: u8 = 0x9F;

/// ENABLE_AXES argument switching every stepper off
const DISABLE_ALL_AXES: u8 = 0x1F;

/// Errors raised by driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport or framing failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The machine model has no tool at this index
    #[error("Tool {0} is not part of this machine")]
    NoSuchTool(u8),

    /// The connected firmware lacks this feature
    #[error("{0:?} is not supported by the connected firmware")]
    Unsupported(Feature),

    /// The board answered with a non-OK status
    #[error("Board answered: {}", .0.message())]
    Rejected(ResponseCode),

    /// Configuration or capture file could not be read or written
    #[error("Configuration error: {0}")]
    Config(#[from] io::Error),
}

/// Driver result type
pub type Result<T> = std::result::Result<T, DriverError>;

/// Summary of the driver's view of the machine
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    /// Link state
    pub state: ConnectionState,
    /// Motherboard firmware version, once negotiated
    pub version: Option<Version>,
    /// Tool that tool commands are addressed to
    pub current_tool: u8,
    /// Last known position in millimetres
    pub position: Option<Point3>,
    /// Commands are being recorded instead of sent
    pub capturing: bool,
}

/// Driver for one motherboard and its tool boards
pub struct Driver {
    connection: Connection,
    machine: MachineModel,
    current_tool: u8,
    /// Believed position; `None` forces a query before the next move
    position: Option<Point3>,
    tools: BTreeMap<u8, ToolState>,
}

impl Driver {
    /// Driver over a connection that has not been negotiated yet
    pub fn new(connection: Connection, machine: MachineModel) -> Self {
        let current_tool = machine.tool_indices().first().copied().unwrap_or(0);
        let tools = machine
            .tool_indices()
            .into_iter()
            .map(|i| (i, ToolState::default()))
            .collect();
        Self {
            connection,
            machine,
            current_tool,
            position: None,
            tools,
        }
    }

    /// Wrap a transport that is already open
    pub fn with_transport(
        transport: impl Transport + 'static,
        config: DriverConfig,
        machine: MachineModel,
    ) -> Self {
        Self::new(Connection::new(transport, config), machine)
    }

    /// Open the configured serial port. The board is not contacted until
    /// [`Driver::initialize`].
    pub fn open(config: DriverConfig, machine: MachineModel) -> Result<Self> {
        Ok(Self::new(Connection::open(config)?, machine))
    }

    /// The underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Machine description the driver was built with
    pub fn machine(&self) -> &MachineModel {
        &self.machine
    }

    /// Connection settings
    pub fn config(&self) -> &DriverConfig {
        self.connection.config()
    }

    fn session(&self) -> &Session {
        self.connection.session()
    }

    /// True once `initialize` has succeeded and until disconnect
    pub fn is_initialized(&self) -> bool {
        self.connection.is_connected()
    }

    /// Negotiated motherboard firmware version
    pub fn version(&self) -> Option<Version> {
        self.connection.version()
    }

    /// Firmware version of a tool board, if it answered the probe
    pub fn tool_version(&self, index: u8) -> Option<Version> {
        self.connection.device().and_then(|d| d.tool_version(index))
    }

    /// Snapshot for display or JSON export
    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            state: self.connection.state(),
            version: self.version(),
            current_tool: self.current_tool,
            position: self.position,
            capturing: self.session().is_capturing(),
        }
    }

    /// Connect: handshake, version negotiation and INIT
    pub fn initialize(&mut self) -> Result<&DeviceInfo> {
        let tools = self.machine.tool_indices();
        self.connection.negotiate(&tools)?;
        self.invalidate_position();
        let device = self
            .connection
            .device()
            .ok_or(DriverError::Protocol(ProtocolError::NotConnected))?;
        info!("Connected to {} (firmware v{})", self.machine.name, device.version);
        Ok(device)
    }

    /// Release the transport
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
        self.invalidate_position();
    }

    /// Watchdog-reset the board (firmware 1.4 and later) and connect again
    pub fn reset(&mut self) -> Result<&DeviceInfo> {
        info!("Reset.");
        if self.connection.supports(Feature::RemoteReset) {
            self.session().cancel_token().reset();
            self.query(PacketBuilder::new(MotherboardCommand::Reset.code()))?;
            self.invalidate_position();
        }
        self.initialize()
    }

    /// Abort everything the board is doing and empty its command queue
    pub fn stop(&mut self) -> Result<()> {
        warn!("Stop.");
        self.session().cancel_token().reset();
        self.query(PacketBuilder::new(MotherboardCommand::Abort.code()))?;
        self.invalidate_position();
        Ok(())
    }

    /// Whether the board has worked through its command queue
    pub fn is_finished(&mut self) -> Result<bool> {
        if self.session().is_capturing() {
            return Ok(true);
        }
        let response = self.query(PacketBuilder::new(MotherboardCommand::IsFinished.code()))?;
        if response.code() == ResponseCode::Unsupported {
            if self.connection.notify_once(Notice::IsFinishedUnsupported) {
                warn!("IsFinished not supported by this firmware. Update your firmware.");
            }
            return Ok(true);
        }
        if !response.is_ok() {
            return Ok(false);
        }
        let finished = response.reader().get8().map(|v| v != 0).unwrap_or(false);
        debug!(finished, "is finished");
        Ok(finished)
    }

    /// Free space in the board's command queue, bytes
    pub fn buffer_free(&self) -> Result<Option<u32>> {
        let response = self.query(PacketBuilder::new(MotherboardCommand::GetBufferSize.code()))?;
        if !response.is_ok() {
            return Ok(None);
        }
        Ok(response.reader().get32().ok())
    }

    /// Empty the board's command queue
    pub fn clear_buffer(&self) -> Result<()> {
        self.query(PacketBuilder::new(MotherboardCommand::ClearBuffer.code()))?;
        Ok(())
    }

    /// Queue a pause of `millis` milliseconds
    pub fn delay(&self, millis: u32) -> Result<()> {
        debug!(millis, "delay");
        self.command(PacketBuilder::new(MotherboardCommand::Delay.code()).add32(millis))?;
        Ok(())
    }

    /// Energize all stepper drivers
    pub fn enable_drives(&self) -> Result<()> {
        self.command(PacketBuilder::new(MotherboardCommand::EnableAxes.code()).add8(ENABLE_ALL_AXES))?;
        Ok(())
    }

    /// Release all stepper drivers
    pub fn disable_drives(&self) -> Result<()> {
        self.command(PacketBuilder::new(MotherboardCommand::EnableAxes.code()).add8(DISABLE_ALL_AXES))?;
        Ok(())
    }

    /// Current position, asking the board if the cached one is stale
    pub fn position(&mut self) -> Result<Point3> {
        if let Some(p) = self.position {
            return Ok(p);
        }
        let p = self.reconcile_position()?;
        self.position = Some(p);
        Ok(p)
    }

    /// Drop the cached position so the next move re-reads it
    pub fn invalidate_position(&mut self) {
        self.position = None;
    }

    /// Read the position from the board (steps, converted to mm).
    /// While capturing there is no board to ask and the origin is assumed.
    pub fn reconcile_position(&self) -> Result<Point3> {
        if self.session().is_capturing() {
            return Ok(Point3::ZERO);
        }
        let response = self.query(PacketBuilder::new(MotherboardCommand::GetPosition.code()))?;
        if !response.is_ok() {
            return Err(DriverError::Rejected(response.code()));
        }
        let mut reader = response.reader();
        let steps = Point3::new(
            reader.get_i32()? as f64,
            reader.get_i32()? as f64,
            reader.get_i32()? as f64,
        );
        Ok(self.machine.steps_to_mm(steps))
    }

    /// Record commands to `path` instead of sending them
    pub fn begin_file_capture(&self, path: impl AsRef<Path>) -> Result<()> {
        info!("Capturing commands to {}", path.as_ref().display());
        self.session().begin_capture(path)?;
        Ok(())
    }

    /// Stop recording; returns the number of bytes written
    pub fn end_file_capture(&self) -> Result<usize> {
        Ok(self.session().end_capture()?)
    }

    /// Legacy schema check, run once per connection before the first
    /// motherboard EEPROM read
    fn check_eeprom(&mut self) -> Result<()> {
        if self.connection.take_eeprom_check() || !self.connection.supports(Feature::LegacyEeprom) {
            return Ok(());
        }
        if self.eeprom(EepromTarget::Motherboard).check_schema()? == SchemaCheck::Wiped {
            warn!("Motherboard EEPROM was reinitialised; stored settings are lost");
        }
        Ok(())
    }

    fn eeprom(&self, target: EepromTarget) -> Eeprom<'_> {
        Eeprom::new(self.session(), target, self.config().retries)
    }

    fn require(&self, feature: Feature) -> Result<()> {
        if self.connection.supports(feature) {
            Ok(())
        } else {
            Err(DriverError::Unsupported(feature))
        }
    }

    fn query(&self, builder: PacketBuilder) -> Result<Response> {
        let packet = builder.build()?;
        Ok(self
            .session()
            .run_query(&packet, RetryPolicy::Logged(self.config().retries))?)
    }

    fn command(&self, builder: PacketBuilder) -> Result<Response> {
        let packet = builder.build()?;
        self.run_with_backoff(&packet)
    }

    /// Send a buffered command, resending while the board's queue is full
    pub fn run_with_backoff(&self, packet: &Packet) -> Result<Response> {
        let config = self.config();
        let mut resends = 0;
        loop {
            match self
                .session()
                .run_command(packet, RetryPolicy::Logged(config.retries))
            {
                Err(ProtocolError::BufferFull) if resends < config.buffer_full_retries => {
                    resends += 1;
                    debug!(resends, "command queue full; backing off");
                    std::thread::sleep(config.buffer_full_backoff());
                }
                other => return Ok(other?),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MotherboardCommand as Mb;
    use crate::sim::SimulatedBoard;

    fn quick_config() -> DriverConfig {
        DriverConfig {
            reset_settle_ms: 1,
            buffer_full_backoff_ms: 1,
            ..DriverConfig::default()
        }
    }

    fn connected(board: &SimulatedBoard) -> Driver {
        let mut driver = Driver::with_transport(board.clone(), quick_config(), MachineModel::default());
        driver.initialize().unwrap();
        board.clear_log();
        driver
    }

    #[test]
    fn test_commands_before_initialize_still_reach_the_wire() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let driver = Driver::with_transport(board.clone(), quick_config(), MachineModel::default());
        driver.delay(250).unwrap();
        assert_eq!(board.requests(), vec![vec![Mb::Delay.code(), 250, 0, 0, 0]]);
    }

    #[test]
    fn test_buffer_full_is_resent() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let driver = connected(&board);
        board.answer_buffer_full(3);
        driver.enable_drives().unwrap();
        let codes = board.request_codes();
        assert_eq!(codes, vec![Mb::EnableAxes.code(); 4]);
        assert_eq!(board.requests()[3], vec![Mb::EnableAxes.code(), 0x9F]);
    }

    #[test]
    fn test_buffer_full_gives_up() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut config = quick_config();
        config.buffer_full_retries = 2;
        let mut driver = Driver::with_transport(board.clone(), config, MachineModel::default());
        driver.initialize().unwrap();
        board.answer_buffer_full(10);
        let err = driver.disable_drives().unwrap_err();
        assert!(matches!(err, DriverError::Protocol(ProtocolError::BufferFull)));
    }

    #[test]
    fn test_position_is_cached_until_invalidated() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        board.set_position([1177, -2353, 640]);
        let mut driver = connected(&board);

        let p = driver.position().unwrap();
        assert!((p.x - 100.0).abs() < 0.05);
        assert!((p.y + 200.0).abs() < 0.05);
        assert!((p.z - 2.0).abs() < 1e-9);

        driver.position().unwrap();
        assert_eq!(board.request_codes(), vec![Mb::GetPosition.code()]);

        driver.stop().unwrap();
        driver.position().unwrap();
        assert_eq!(
            board.request_codes(),
            vec![Mb::GetPosition.code(), Mb::Abort.code(), Mb::GetPosition.code()]
        );
    }

    #[test]
    fn test_is_finished() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = connected(&board);
        board.set_finished(false);
        assert!(!driver.is_finished().unwrap());
        board.set_finished(true);
        assert!(driver.is_finished().unwrap());
    }

    #[test]
    fn test_is_finished_unsupported_assumes_done() {
        let board = SimulatedBoard::new(Version::new(1, 1));
        board.mark_unsupported(Mb::IsFinished.code());
        let mut driver = connected(&board);
        assert!(driver.is_finished().unwrap());
        assert!(driver.is_finished().unwrap());
    }

    #[test]
    fn test_reset_requires_remote_reset_support() {
        let board = SimulatedBoard::new(Version::new(1, 3));
        let mut driver = connected(&board);
        driver.reset().unwrap();
        assert!(!board.request_codes().contains(&Mb::Reset.code()));

        let board = SimulatedBoard::new(Version::new(1, 4));
        let mut driver = connected(&board);
        driver.reset().unwrap();
        assert_eq!(board.request_codes()[0], Mb::Reset.code());
        assert!(driver.is_initialized());
    }

    #[test]
    fn test_capture_reports_finished_and_origin() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = connected(&board);
        let dir = tempfile::tempdir().unwrap();
        driver.begin_file_capture(dir.path().join("job.s3g")).unwrap();
        assert!(driver.is_finished().unwrap());
        assert_eq!(driver.reconcile_position().unwrap(), Point3::ZERO);
        driver.delay(10).unwrap();
        assert_eq!(driver.end_file_capture().unwrap(), 5);
        assert!(board.requests().is_empty());
    }
}
