//! Connection management
//!
//! Brings the link up (probe, settle, reset, probe again), negotiates
//! firmware versions with the motherboard and every registered tool board,
//! and holds the per-connection state derived from that negotiation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    open_port, MotherboardCommand, PacketBuilder, ProtocolError, Response, RetryPolicy, Session,
    ToolCommand, Transport, HOST_VERSION,
};
use crate::config::DriverConfig;
use crate::version::{Capabilities, Feature, Version};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Handshake in progress
    Probing,
    /// Versions negotiated; commands may be sent
    Connected,
    /// Handshake failed; the transport has been released
    Failed,
}

/// Outcome of probing one tool slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolProbe {
    /// The board answered with its firmware version
    Present {
        /// Tool firmware version
        version: Version,
        /// Tool firmware build name; empty if not reported
        build_name: String,
    },
    /// Nothing answered; the slot is empty or the board is unpowered
    Absent,
    /// Something answered but did not report a usable version
    Unresponsive,
}

impl ToolProbe {
    /// Firmware version if the board is present
    pub fn version(&self) -> Option<Version> {
        match self {
            ToolProbe::Present { version, .. } => Some(*version),
            _ => None,
        }
    }
}

/// What the board told us during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Motherboard firmware version
    pub version: Version,
    /// Motherboard firmware build name (empty if the board did not say)
    pub build_name: String,
    /// Probe result for every tool in the registry
    pub tools: BTreeMap<u8, ToolProbe>,
}

impl DeviceInfo {
    /// Firmware version of a probed tool
    pub fn tool_version(&self, index: u8) -> Option<Version> {
        self.tools.get(&index).and_then(ToolProbe::version)
    }

    /// Versions of the tool boards that answered
    pub fn tool_versions(&self) -> BTreeMap<u8, Version> {
        self.tools
            .iter()
            .filter_map(|(&i, p)| p.version().map(|v| (i, v)))
            .collect()
    }
}

/// Warnings shown at most once per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Notice {
    /// IS_FINISHED is not available
    IsFinishedUnsupported,
    /// Tool cannot report set points
    SetpointQueryUnsupported,
    /// WAIT_FOR_PLATFORM is not available
    PlatformWaitUnsupported,
}

/// A negotiated link to one motherboard
pub struct Connection {
    session: Session,
    config: DriverConfig,
    state: ConnectionState,
    device: Option<DeviceInfo>,
    capabilities: Capabilities,
    notices: BTreeSet<Notice>,
    eeprom_checked: bool,
}

impl Connection {
    /// Wrap an already-open transport (not yet negotiated)
    pub fn new(transport: impl Transport + 'static, config: DriverConfig) -> Self {
        Self {
            session: Session::new(transport),
            config,
            state: ConnectionState::Disconnected,
            device: None,
            capabilities: Capabilities::default(),
            notices: BTreeSet::new(),
            eeprom_checked: false,
        }
    }

    /// Open the configured serial port (not yet negotiated)
    pub fn open(config: DriverConfig) -> Result<Self, ProtocolError> {
        let transport = open_port(
            &config.port_name,
            Some(config.baud_rate),
            config.handshake_timeout(),
        )?;
        Ok(Self::new(transport, config))
    }

    /// Current link state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Negotiated and not since failed or closed
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Session that carries the traffic
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Settings the connection was opened with
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Negotiated device details (if connected)
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Motherboard firmware version (if connected)
    pub fn version(&self) -> Option<Version> {
        self.device.as_ref().map(|d| d.version)
    }

    /// Feature table from the last negotiation
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Motherboard feature check; nothing is supported until connected
    pub fn supports(&self, feature: Feature) -> bool {
        self.is_connected() && self.capabilities.supports(feature)
    }

    /// Tool feature check; nothing is supported until connected
    pub fn tool_supports(&self, tool: u8, feature: Feature) -> bool {
        self.is_connected() && self.capabilities.tool_supports(tool, feature)
    }

    /// Returns true the first time a notice is raised on this connection
    pub fn notify_once(&mut self, notice: Notice) -> bool {
        self.notices.insert(notice)
    }

    /// Mark the EEPROM schema check as done; returns whether it already was
    pub fn take_eeprom_check(&mut self) -> bool {
        std::mem::replace(&mut self.eeprom_checked, true)
    }

    /// Release the transport
    pub fn disconnect(&mut self) {
        self.session.close();
        self.clear_negotiated();
        self.state = ConnectionState::Disconnected;
    }

    fn clear_negotiated(&mut self) {
        self.device = None;
        self.capabilities = Capabilities::default();
        self.notices.clear();
        self.eeprom_checked = false;
    }

    /// Run the handshake and version negotiation.
    ///
    /// `tools` lists the tool slots to probe. On failure the transport is
    /// released and the connection ends up in [`ConnectionState::Failed`].
    pub fn negotiate(&mut self, tools: &[u8]) -> Result<&DeviceInfo, ProtocolError> {
        self.clear_negotiated();
        self.state = ConnectionState::Probing;

        let result = self
            .handshake(tools)
            .and_then(|device| self.send_init().map(|_| device));
        match result {
            Ok(device) => {
                self.capabilities = Capabilities::negotiate(device.version, &device.tool_versions());
                self.state = ConnectionState::Connected;
                let device: &DeviceInfo = self.device.insert(device);
                Ok(device)
            }
            Err(e) => {
                error!("Unable to connect to firmware: {}", e);
                self.session.close();
                self.clear_negotiated();
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    fn handshake(&mut self, tools: &[u8]) -> Result<DeviceInfo, ProtocolError> {
        let version = self
            .probe_motherboard()?
            .ok_or_else(|| ProtocolError::ConnectionFailed("no answer to version query".into()))?;
        let build_name = self.query_build_name(
            PacketBuilder::new(MotherboardCommand::GetBuildName.code()).add16(HOST_VERSION),
            RetryPolicy::Logged(1),
        )?;
        info!("Motherboard firmware v{} ({})", version, build_name);

        if version < self.config.minimum_version {
            return Err(ProtocolError::BadFirmwareVersion {
                found: version,
                minimum: self.config.minimum_version,
            });
        }
        if version < self.config.preferred_version {
            warn!(
                "Motherboard firmware v{} is older than v{}; some features are unavailable",
                version, self.config.preferred_version
            );
        }

        let mut probes = BTreeMap::new();
        for &index in tools {
            probes.insert(index, self.probe_tool(index)?);
        }

        if version.major < 2 {
            // No bounded response latency on 1.x firmware
            self.session.set_timeout(None)?;
        } else {
            self.session.set_timeout(Some(self.config.read_timeout()))?;
        }

        Ok(DeviceInfo {
            version,
            build_name,
            tools: probes,
        })
    }

    /// Version query with one settle-and-retry and one reset-and-retry
    fn probe_motherboard(&mut self) -> Result<Option<Version>, ProtocolError> {
        self.session.clear()?;
        self.session.set_timeout(Some(self.config.handshake_timeout()))?;

        if let Some(v) = self.attempt_version()? {
            return Ok(Some(v));
        }
        // Opening the port may have reset the board; give it time to boot
        if !self.settle() {
            return Ok(None);
        }
        if let Some(v) = self.attempt_version()? {
            return Ok(Some(v));
        }

        warn!("No connection; pulsing reset line");
        self.session.pulse_reset()?;
        if !self.settle() {
            return Ok(None);
        }
        self.attempt_version()
    }

    /// Sleep out the reset settle time. False if the wait was cancelled.
    fn settle(&self) -> bool {
        std::thread::sleep(self.config.reset_settle());
        !self.session.cancel_token().is_cancelled()
    }

    fn attempt_version(&mut self) -> Result<Option<Version>, ProtocolError> {
        self.session.clear()?;
        let packet = PacketBuilder::new(MotherboardCommand::Version.code())
            .add16(HOST_VERSION)
            .build()?;
        let response = self.session.run_query(&packet, RetryPolicy::Logged(1))?;
        if !response.is_ok() {
            return Ok(None);
        }
        let raw = response.reader().get16().unwrap_or(0);
        debug!(raw, "reported version");
        match Version::from_wire(raw) {
            Some(v) => Ok(Some(v)),
            None => {
                error!("Null version reported");
                Ok(None)
            }
        }
    }

    fn query_build_name(
        &self,
        builder: PacketBuilder,
        policy: RetryPolicy,
    ) -> Result<String, ProtocolError> {
        let response = self.session.run_query(&builder.build()?, policy)?;
        Ok(build_name(&response))
    }

    fn probe_tool(&mut self, index: u8) -> Result<ToolProbe, ProtocolError> {
        let policy = RetryPolicy::Silent(self.config.tool_probe_attempts);
        let packet = PacketBuilder::new(MotherboardCommand::ToolQuery.code())
            .add8(index)
            .add8(ToolCommand::Version.code())
            .build()?;
        let response = self.session.run_query(&packet, policy)?;

        if response.is_timeout() {
            info!(
                "Tool {}: not found. Check that the tool board is connected and powered",
                index
            );
            return Ok(ToolProbe::Absent);
        }
        let version = if response.is_ok() {
            response.reader().get16().ok().and_then(Version::from_wire)
        } else {
            None
        };
        let Some(version) = version else {
            warn!(
                "Tool {}: board answered ({}) but reported no firmware version",
                index,
                response.code().message()
            );
            return Ok(ToolProbe::Unresponsive);
        };

        let build_name = self.query_build_name(
            PacketBuilder::new(MotherboardCommand::ToolQuery.code())
                .add8(index)
                .add8(ToolCommand::GetBuildName.code()),
            policy,
        )?;
        info!(
            "Tool {}: extruder controller firmware v{} ({})",
            index, version, build_name
        );
        Ok(ToolProbe::Present {
            version,
            build_name,
        })
    }

    /// INIT query: resets the board's command buffer and tool selection
    pub fn send_init(&self) -> Result<Response, ProtocolError> {
        let packet = PacketBuilder::new(MotherboardCommand::Init.code()).build()?;
        self.session
            .run_query(&packet, RetryPolicy::Logged(self.config.retries))
    }

    /// Effective read timeout after negotiation (`None` = wait indefinitely)
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.version() {
            Some(v) if v.major < 2 => None,
            _ => Some(self.config.read_timeout()),
        }
    }
}

/// Build name from a response; empty unless the board answered OK
fn build_name(response: &Response) -> String {
    if !response.is_ok() {
        return String::new();
    }
    response.reader().get_cstring()
}
