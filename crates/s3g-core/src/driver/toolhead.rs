//! Tool selection and tool-board outputs
//!
//! Everything here addresses the currently selected tool. Commands travel
//! as `TOOL_COMMAND, tool, sub, len, args`; readings as
//! `TOOL_QUERY, tool, sub`.

use serde::Serialize;
use tracing::{debug, info};

use super::{Driver, DriverError, Result};
use crate::kinematics::{period_to_rpm, rpm_to_period};
use crate::machine::{MotorDirection, ToolModel};
use crate::protocol::{MotherboardCommand, Notice, PacketBuilder, Response, ToolCommand};
use crate::version::Feature;

/// Interval at which the motherboard polls a tool while waiting, ms
const WAIT_PING_MS: u16 = 100;

/// Host-side record of what was last set on, or read from, a tool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolState {
    /// Extruder set point, °C
    pub target_temperature: f64,
    /// Heated platform set point, °C
    pub platform_target_temperature: f64,
    /// Last extruder reading, °C
    pub temperature: Option<f64>,
    /// Last platform reading, °C
    pub platform_temperature: Option<f64>,
    /// Motor 1 speed last requested
    pub motor_rpm: f64,
    /// Motor 1 duty cycle last requested
    pub motor_pwm: u8,
    /// Motor 1 running
    pub motor_enabled: bool,
    /// Spindle speed last requested
    pub spindle_rpm: f64,
    /// Spindle duty cycle last requested
    pub spindle_pwm: u8,
    /// Motor 2 (spindle) running
    pub spindle_enabled: bool,
    /// Fan output state
    pub fan_on: bool,
    /// Valve output state
    pub valve_open: bool,
}

/// Servo output of a tool board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Servo {
    /// Servo 1
    First,
    /// Servo 2
    Second,
}

/// Motor output: motor 1 drives the extruder, motor 2 the spindle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Motor,
    Spindle,
}

impl Channel {
    fn set_rpm(self) -> ToolCommand {
        match self {
            Channel::Motor => ToolCommand::SetMotor1Rpm,
            Channel::Spindle => ToolCommand::SetMotor2Rpm,
        }
    }

    fn set_pwm(self) -> ToolCommand {
        match self {
            Channel::Motor => ToolCommand::SetMotor1Pwm,
            Channel::Spindle => ToolCommand::SetMotor2Pwm,
        }
    }

    fn toggle(self) -> ToolCommand {
        match self {
            Channel::Motor => ToolCommand::ToggleMotor1,
            Channel::Spindle => ToolCommand::ToggleMotor2,
        }
    }

    fn get_rpm(self) -> ToolCommand {
        match self {
            Channel::Motor => ToolCommand::GetMotor1Rpm,
            Channel::Spindle => ToolCommand::GetMotor2Rpm,
        }
    }

    fn get_pwm(self) -> ToolCommand {
        match self {
            Channel::Motor => ToolCommand::GetMotor1Pwm,
            Channel::Spindle => ToolCommand::GetMotor2Pwm,
        }
    }

    fn direction(self, tool: &ToolModel) -> MotorDirection {
        match self {
            Channel::Motor => tool.motor_direction,
            Channel::Spindle => tool.spindle_direction,
        }
    }
}

/// Toggle flags: bit 0 enables, bit 1 selects clockwise
fn toggle_flags(enable: bool, direction: MotorDirection) -> u8 {
    let mut flags = u8::from(enable);
    if direction == MotorDirection::Clockwise {
        flags |= 0x02;
    }
    flags
}

/// Temperatures travel as whole degrees in a u16
fn temperature_arg(celsius: f64) -> u16 {
    celsius.round().clamp(0.0, u16::MAX as f64) as u16
}

impl Driver {
    /// Index of the tool commands are addressed to
    pub fn current_tool(&self) -> u8 {
        self.current_tool
    }

    /// Host-side state of a tool; `None` for unknown indices
    pub fn tool_state(&self, index: u8) -> Option<&ToolState> {
        self.tools.get(&index)
    }

    fn state_mut(&mut self) -> &mut ToolState {
        self.tools.entry(self.current_tool).or_default()
    }

    fn current_model(&self) -> ToolModel {
        self.machine
            .tool(self.current_tool)
            .cloned()
            .unwrap_or_else(|| ToolModel::new(self.current_tool))
    }

    fn tool_command(&self, sub: ToolCommand, args: &[u8]) -> PacketBuilder {
        PacketBuilder::new(MotherboardCommand::ToolCommand.code())
            .add8(self.current_tool)
            .add8(sub.code())
            .add8(args.len() as u8)
            .bytes(args)
    }

    fn tool_query(&self, sub: ToolCommand) -> Result<Response> {
        self.query(
            PacketBuilder::new(MotherboardCommand::ToolQuery.code())
                .add8(self.current_tool)
                .add8(sub.code()),
        )
    }

    /// Make `index` the current tool
    pub fn select_tool(&mut self, index: u8) -> Result<()> {
        if self.machine.tool(index).is_none() {
            return Err(DriverError::NoSuchTool(index));
        }
        debug!(tool = index, "select tool");
        self.command(PacketBuilder::new(MotherboardCommand::ChangeTool.code()).add8(index))?;
        self.current_tool = index;
        Ok(())
    }

    /// Select `index` and queue waits until it (and its heated platform, if
    /// any) reaches temperature. The board gives up after `timeout_s`
    /// seconds and carries on.
    pub fn request_tool_change(&mut self, index: u8, timeout_s: u16) -> Result<()> {
        self.select_tool(index)?;
        let state = self.state_mut().clone();

        if state.target_temperature > 0.0 {
            debug!(tool = index, "waiting for tool");
            self.command(
                PacketBuilder::new(MotherboardCommand::WaitForTool.code())
                    .add8(index)
                    .add16(WAIT_PING_MS)
                    .add16(timeout_s),
            )?;
        }

        if self.current_model().heated_platform && state.platform_target_temperature > 0.0 {
            if self.connection.tool_supports(index, Feature::WaitForPlatform) {
                debug!(tool = index, "waiting for platform");
                self.command(
                    PacketBuilder::new(MotherboardCommand::WaitForPlatform.code())
                        .add8(index)
                        .add16(WAIT_PING_MS)
                        .add16(timeout_s),
                )?;
            } else if self.connection.notify_once(Notice::PlatformWaitUnsupported) {
                info!("Firmware cannot wait for the build platform; not waiting");
            }
        }
        Ok(())
    }

    fn set_channel_rpm(&mut self, channel: Channel, rpm: f64) -> Result<()> {
        let micros = rpm_to_period(rpm);
        debug!(?channel, rpm, micros, "set speed");
        self.command(self.tool_command(channel.set_rpm(), &micros.to_le_bytes()))?;
        let state = self.state_mut();
        match channel {
            Channel::Motor => state.motor_rpm = rpm,
            Channel::Spindle => state.spindle_rpm = rpm,
        }
        Ok(())
    }

    fn set_channel_pwm(&mut self, channel: Channel, pwm: u32) -> Result<()> {
        let pwm = pwm.min(255) as u8;
        debug!(?channel, pwm, "set PWM");
        self.command(self.tool_command(channel.set_pwm(), &[pwm]))?;
        let state = self.state_mut();
        match channel {
            Channel::Motor => state.motor_pwm = pwm,
            Channel::Spindle => state.spindle_pwm = pwm,
        }
        Ok(())
    }

    fn toggle_channel(&mut self, channel: Channel, enable: bool) -> Result<()> {
        let flags = toggle_flags(enable, channel.direction(&self.current_model()));
        debug!(?channel, flags, "toggle");
        self.command(self.tool_command(channel.toggle(), &[flags]))?;
        let state = self.state_mut();
        match channel {
            Channel::Motor => state.motor_enabled = enable,
            Channel::Spindle => state.spindle_enabled = enable,
        }
        Ok(())
    }

    fn read_channel_pwm(&self, channel: Channel) -> Result<Option<u8>> {
        let response = self.tool_query(channel.get_pwm())?;
        if !response.is_ok() {
            return Ok(None);
        }
        Ok(response.reader().get8().ok())
    }

    fn read_channel_rpm(&self, channel: Channel) -> Result<Option<f64>> {
        let response = self.tool_query(channel.get_rpm())?;
        if !response.is_ok() {
            return Ok(None);
        }
        Ok(response.reader().get32().ok().map(period_to_rpm))
    }

    /// Motor 1 speed, sent as a step period
    pub fn set_motor_rpm(&mut self, rpm: f64) -> Result<()> {
        self.set_channel_rpm(Channel::Motor, rpm)
    }

    /// Motor 1 duty cycle; values above 255 are clamped
    pub fn set_motor_pwm(&mut self, pwm: u32) -> Result<()> {
        self.set_channel_pwm(Channel::Motor, pwm)
    }

    /// Start motor 1 in the tool's configured direction
    pub fn enable_motor(&mut self) -> Result<()> {
        self.toggle_channel(Channel::Motor, true)
    }

    /// Stop motor 1
    pub fn disable_motor(&mut self) -> Result<()> {
        self.toggle_channel(Channel::Motor, false)
    }

    /// Motor 1 duty cycle reported by the tool
    pub fn motor_pwm(&self) -> Result<Option<u8>> {
        self.read_channel_pwm(Channel::Motor)
    }

    /// Motor 1 speed reported by the tool
    pub fn motor_rpm(&self) -> Result<Option<f64>> {
        self.read_channel_rpm(Channel::Motor)
    }

    /// Spindle (motor 2) speed
    pub fn set_spindle_rpm(&mut self, rpm: f64) -> Result<()> {
        self.set_channel_rpm(Channel::Spindle, rpm)
    }

    /// Spindle duty cycle; clamped to 255
    pub fn set_spindle_pwm(&mut self, pwm: u32) -> Result<()> {
        self.set_channel_pwm(Channel::Spindle, pwm)
    }

    /// Start the spindle in its configured direction
    pub fn enable_spindle(&mut self) -> Result<()> {
        self.toggle_channel(Channel::Spindle, true)
    }

    /// Stop the spindle
    pub fn disable_spindle(&mut self) -> Result<()> {
        self.toggle_channel(Channel::Spindle, false)
    }

    /// Spindle duty cycle reported by the tool
    pub fn spindle_pwm(&self) -> Result<Option<u8>> {
        self.read_channel_pwm(Channel::Spindle)
    }

    /// Spindle speed reported by the tool
    pub fn spindle_rpm(&self) -> Result<Option<f64>> {
        self.read_channel_rpm(Channel::Spindle)
    }

    /// Move a servo to `degrees` (0..=255)
    pub fn set_servo_position(&self, servo: Servo, degrees: f64) -> Result<()> {
        let sub = match servo {
            Servo::First => ToolCommand::SetServo1Pos,
            Servo::Second => ToolCommand::SetServo2Pos,
        };
        let angle = degrees.clamp(0.0, 255.0) as u8;
        debug!(?servo, angle, "set servo");
        self.command(self.tool_command(sub, &[angle]))?;
        Ok(())
    }

    /// Extruder set point, °C
    pub fn set_temperature(&mut self, celsius: f64) -> Result<()> {
        let value = temperature_arg(celsius);
        debug!(tool = self.current_tool, value, "set temperature");
        self.command(self.tool_command(ToolCommand::SetTemp, &value.to_le_bytes()))?;
        self.state_mut().target_temperature = celsius;
        Ok(())
    }

    /// Heated platform set point, °C
    pub fn set_platform_temperature(&mut self, celsius: f64) -> Result<()> {
        let value = temperature_arg(celsius);
        debug!(tool = self.current_tool, value, "set platform temperature");
        self.command(self.tool_command(ToolCommand::SetPlatformTemp, &value.to_le_bytes()))?;
        self.state_mut().platform_target_temperature = celsius;
        Ok(())
    }

    /// Current extruder temperature; `None` if the tool did not answer
    pub fn read_temperature(&mut self) -> Result<Option<f64>> {
        let reading = self.read_u16(ToolCommand::GetTemp)?;
        if reading.is_some() {
            self.state_mut().temperature = reading;
        }
        debug!(tool = self.current_tool, ?reading, "temperature");
        Ok(reading)
    }

    /// Platform temperature in °C; `None` if the tool did not answer
    pub fn read_platform_temperature(&mut self) -> Result<Option<f64>> {
        let reading = self.read_u16(ToolCommand::GetPlatformTemp)?;
        if reading.is_some() {
            self.state_mut().platform_temperature = reading;
        }
        debug!(tool = self.current_tool, ?reading, "platform temperature");
        Ok(reading)
    }

    /// Extruder set point. Read from the tool where its firmware allows,
    /// otherwise the last value this driver set.
    pub fn temperature_setting(&mut self) -> Result<f64> {
        if self.setpoint_query_supported() {
            if let Some(sp) = self.read_u16(ToolCommand::GetSetpoint)? {
                self.state_mut().target_temperature = sp;
            }
        }
        Ok(self.state_mut().target_temperature)
    }

    /// Platform set point, read back where the tool firmware allows
    pub fn platform_temperature_setting(&mut self) -> Result<f64> {
        if self.setpoint_query_supported() {
            if let Some(sp) = self.read_u16(ToolCommand::GetPlatformSetpoint)? {
                self.state_mut().platform_target_temperature = sp;
            }
        }
        Ok(self.state_mut().platform_target_temperature)
    }

    fn setpoint_query_supported(&mut self) -> bool {
        let tool = self.current_tool;
        if self.connection.tool_supports(tool, Feature::SetpointQuery) {
            return true;
        }
        if self.connection.notify_once(Notice::SetpointQueryUnsupported) {
            info!("Tool {} firmware cannot report set points; using the last values sent", tool);
        }
        false
    }

    fn read_u16(&self, sub: ToolCommand) -> Result<Option<f64>> {
        let response = self.tool_query(sub)?;
        if !response.is_ok() {
            return Ok(None);
        }
        Ok(response.reader().get16().ok().map(f64::from))
    }

    fn set_output(&mut self, sub: ToolCommand, on: bool) -> Result<()> {
        debug!(tool = self.current_tool, ?sub, on, "toggle output");
        self.command(self.tool_command(sub, &[u8::from(on)]))?;
        Ok(())
    }

    /// Turn the tool fan on
    pub fn enable_fan(&mut self) -> Result<()> {
        self.set_output(ToolCommand::ToggleFan, true)?;
        self.state_mut().fan_on = true;
        Ok(())
    }

    /// Turn the tool fan off
    pub fn disable_fan(&mut self) -> Result<()> {
        self.set_output(ToolCommand::ToggleFan, false)?;
        self.state_mut().fan_on = false;
        Ok(())
    }

    /// Open the tool valve
    pub fn open_valve(&mut self) -> Result<()> {
        self.set_output(ToolCommand::ToggleValve, true)?;
        self.state_mut().valve_open = true;
        Ok(())
    }

    /// Close the tool valve
    pub fn close_valve(&mut self) -> Result<()> {
        self.set_output(ToolCommand::ToggleValve, false)?;
        self.state_mut().valve_open = false;
        Ok(())
    }

    /// Pause the build. Takes effect immediately, ahead of queued commands.
    pub fn pause(&self) -> Result<()> {
        debug!("pause");
        self.query(PacketBuilder::new(MotherboardCommand::Pause.code()))?;
        Ok(())
    }

    /// Resume a paused build. The board has no separate resume; PAUSE
    /// toggles.
    pub fn unpause(&self) -> Result<()> {
        debug!("unpause");
        self.query(PacketBuilder::new(MotherboardCommand::Pause.code()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::machine::MachineModel;
    use crate::protocol::MotherboardCommand as Mb;
    use crate::sim::SimulatedBoard;
    use crate::version::Version;
    use pretty_assertions::assert_eq;

    const TC: u8 = 136;
    const TQ: u8 = 10;

    fn machine(heated_platform: bool) -> MachineModel {
        let mut machine = MachineModel::default();
        machine.tools[0].heated_platform = heated_platform;
        machine.tools[0].spindle_direction = MotorDirection::CounterClockwise;
        machine
    }

    fn driver_for(board: &SimulatedBoard, machine: MachineModel) -> Driver {
        let config = DriverConfig {
            reset_settle_ms: 1,
            ..DriverConfig::default()
        };
        let mut driver = Driver::with_transport(board.clone(), config, machine);
        driver.initialize().unwrap();
        board.clear_log();
        driver
    }

    fn sim_board(mb: Version, tool: Version) -> SimulatedBoard {
        SimulatedBoard::new(mb).with_tool(0, tool)
    }

    #[test]
    fn test_unknown_tool_is_rejected() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 0));
        let mut driver = driver_for(&board, machine(false));
        assert!(matches!(driver.select_tool(3), Err(DriverError::NoSuchTool(3))));
        assert!(board.requests().is_empty());
    }

    #[test]
    fn test_motor_packets() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 0));
        let mut driver = driver_for(&board, machine(false));
        driver.set_motor_rpm(200.0).unwrap();
        driver.set_motor_pwm(400).unwrap();
        driver.enable_motor().unwrap();
        driver.disable_motor().unwrap();
        assert_eq!(
            board.requests(),
            vec![
                vec![TC, 0, 6, 4, 0xE0, 0x93, 0x04, 0x00],
                vec![TC, 0, 4, 1, 255],
                vec![TC, 0, 10, 1, 0b11],
                vec![TC, 0, 10, 1, 0b10],
            ]
        );
        let state = driver.tool_state(0).unwrap();
        assert_eq!(state.motor_rpm, 200.0);
        assert_eq!(state.motor_pwm, 255);
        assert!(!state.motor_enabled);
    }

    #[test]
    fn test_spindle_uses_motor_two() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 0));
        let mut driver = driver_for(&board, machine(false));
        driver.set_spindle_rpm(0.0).unwrap();
        driver.enable_spindle().unwrap();
        driver.disable_spindle().unwrap();
        assert_eq!(
            board.requests(),
            vec![
                vec![TC, 0, 7, 4, 0, 0, 0, 0],
                vec![TC, 0, 11, 1, 0b01],
                vec![TC, 0, 11, 1, 0b00],
            ]
        );
    }

    #[test]
    fn test_motor_readings() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 0));
        let mut driver = driver_for(&board, machine(false));
        driver.set_motor_pwm(128).unwrap();
        driver.set_motor_rpm(300.0).unwrap();
        assert_eq!(driver.motor_pwm().unwrap(), Some(128));
        assert_eq!(driver.motor_rpm().unwrap(), Some(300.0));
    }

    #[test]
    fn test_temperature_packets() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 0));
        let mut driver = driver_for(&board, machine(true));
        driver.set_temperature(219.6).unwrap();
        driver.set_platform_temperature(1e9).unwrap();
        assert_eq!(
            board.requests(),
            vec![vec![TC, 0, 3, 2, 220, 0], vec![TC, 0, 31, 2, 0xFF, 0xFF]]
        );

        board.set_tool_temperature(0, 187);
        assert_eq!(driver.read_temperature().unwrap(), Some(187.0));
        assert_eq!(driver.tool_state(0).unwrap().temperature, Some(187.0));
    }

    #[test]
    fn test_setpoint_query_needs_tool_2_3() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 2));
        let mut driver = driver_for(&board, machine(false));
        driver.set_temperature(225.0).unwrap();
        board.set_tool_setpoint(0, 190);
        board.clear_log();
        assert_eq!(driver.temperature_setting().unwrap(), 225.0);
        assert!(board.requests().is_empty());

        let board = sim_board(Version::new(2, 0), Version::new(2, 3));
        let mut driver = driver_for(&board, machine(false));
        driver.set_temperature(225.0).unwrap();
        board.set_tool_setpoint(0, 190);
        board.clear_log();
        assert_eq!(driver.temperature_setting().unwrap(), 190.0);
        assert_eq!(board.requests(), vec![vec![TQ, 0, 32]]);
    }

    #[test]
    fn test_tool_change_waits_for_heated_parts() {
        let board = sim_board(Version::new(2, 4), Version::new(2, 6));
        let mut driver = driver_for(&board, machine(true));
        driver.request_tool_change(0, 600).unwrap();
        // Nothing is heating, so there is nothing to wait for
        assert_eq!(board.request_codes(), vec![Mb::ChangeTool.code()]);

        driver.set_temperature(220.0).unwrap();
        driver.set_platform_temperature(110.0).unwrap();
        board.clear_log();
        driver.request_tool_change(0, 600).unwrap();
        assert_eq!(
            board.requests(),
            vec![
                vec![Mb::ChangeTool.code(), 0],
                vec![Mb::WaitForTool.code(), 0, 100, 0, 0x58, 0x02],
                vec![Mb::WaitForPlatform.code(), 0, 100, 0, 0x58, 0x02],
            ]
        );
    }

    #[test]
    fn test_platform_wait_needs_new_firmware() {
        let board = sim_board(Version::new(2, 4), Version::new(2, 5));
        let mut driver = driver_for(&board, machine(true));
        driver.set_temperature(220.0).unwrap();
        driver.set_platform_temperature(110.0).unwrap();
        board.clear_log();
        driver.request_tool_change(0, 60).unwrap();
        assert_eq!(
            board.request_codes(),
            vec![Mb::ChangeTool.code(), Mb::WaitForTool.code()]
        );
    }

    #[test]
    fn test_outputs_and_pause() {
        let board = sim_board(Version::new(2, 0), Version::new(2, 0));
        let mut driver = driver_for(&board, machine(false));
        driver.enable_fan().unwrap();
        driver.close_valve().unwrap();
        driver.set_servo_position(Servo::Second, 300.0).unwrap();
        driver.pause().unwrap();
        driver.unpause().unwrap();
        assert_eq!(
            board.requests(),
            vec![
                vec![TC, 0, 12, 1, 1],
                vec![TC, 0, 13, 1, 0],
                vec![TC, 0, 15, 1, 255],
                vec![Mb::Pause.code()],
                vec![Mb::Pause.code()],
            ]
        );
        assert!(driver.tool_state(0).unwrap().fan_on);
    }
}
