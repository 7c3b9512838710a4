//! Protocol commands
//!
//! Command codes understood by the motherboard and, through it, by the tool
//! boards. Codes with bit 7 set are buffered commands; the rest are queries
//! answered immediately.

use serde::{Deserialize, Serialize};

/// Bit that marks a command code as a buffered (mutating) command
pub const COMMAND_BIT: u8 = 0x80;

/// Check whether a motherboard code is a buffered command rather than a query
pub fn is_command_code(code: u8) -> bool {
    code & COMMAND_BIT != 0
}

/// Motherboard command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotherboardCommand {
    // Queries
    /// Firmware version
    Version,
    /// Reset command buffer and tool selection
    Init,
    /// Free space in the command buffer
    GetBufferSize,
    /// Drop buffered commands
    ClearBuffer,
    /// Current position and endstop states
    GetPosition,
    /// Stop and clear everything
    Abort,
    /// Toggle pause
    Pause,
    /// Relay a query to a tool board
    ToolQuery,
    /// Whether the command buffer has drained
    IsFinished,
    /// Read EEPROM bytes
    ReadEeprom,
    /// Write EEPROM bytes
    WriteEeprom,
    /// Start recording to an SD file
    CaptureToFile,
    /// Stop recording
    EndCapture,
    /// Replay an SD file
    PlaybackCapture,
    /// Soft reset
    Reset,
    /// Enumerate SD card files
    NextFilename,
    /// Firmware build name
    GetBuildName,
    /// Write a 32-bit EEPROM word
    WriteEeprom32,

    // Buffered commands
    /// Move to an absolute step position
    QueuePointAbs,
    /// Redefine the current position
    SetPosition,
    /// Home axes toward the minimum
    FindAxesMinimum,
    /// Home axes toward the maximum
    FindAxesMaximum,
    /// Pause the queue
    Delay,
    /// Select the active tool
    ChangeTool,
    /// Wait for a tool to reach temperature
    WaitForTool,
    /// Buffered tool command
    ToolCommand,
    /// Enable or disable steppers
    EnableAxes,
    /// Wait for the platform to reach temperature
    WaitForPlatform,
    /// First auto-raft layer
    FirstAutoRaft,
    /// Auto-raft layer
    AutoRaft,
}

impl MotherboardCommand {
    /// Wire code of this command
    pub fn code(self) -> u8 {
        match self {
            MotherboardCommand::Version => 0,
            MotherboardCommand::Init => 1,
            MotherboardCommand::GetBufferSize => 2,
            MotherboardCommand::ClearBuffer => 3,
            MotherboardCommand::GetPosition => 4,
            MotherboardCommand::Abort => 7,
            MotherboardCommand::Pause => 8,
            MotherboardCommand::ToolQuery => 10,
            MotherboardCommand::IsFinished => 11,
            MotherboardCommand::ReadEeprom => 12,
            MotherboardCommand::WriteEeprom => 13,
            MotherboardCommand::CaptureToFile => 14,
            MotherboardCommand::EndCapture => 15,
            MotherboardCommand::PlaybackCapture => 16,
            MotherboardCommand::Reset => 17,
            MotherboardCommand::NextFilename => 18,
            MotherboardCommand::GetBuildName => 20,
            MotherboardCommand::WriteEeprom32 => 30,

            MotherboardCommand::QueuePointAbs => 129,
            MotherboardCommand::SetPosition => 130,
            MotherboardCommand::FindAxesMinimum => 131,
            MotherboardCommand::FindAxesMaximum => 132,
            MotherboardCommand::Delay => 133,
            MotherboardCommand::ChangeTool => 134,
            MotherboardCommand::WaitForTool => 135,
            MotherboardCommand::ToolCommand => 136,
            MotherboardCommand::EnableAxes => 137,
            MotherboardCommand::WaitForPlatform => 141,
            MotherboardCommand::FirstAutoRaft => 150,
            MotherboardCommand::AutoRaft => 151,
        }
    }

    /// Look up a command by wire code
    pub fn from_code(code: u8) -> Option<Self> {
        use MotherboardCommand::*;
        const ALL: [MotherboardCommand; 30] = [
            Version, Init, GetBufferSize, ClearBuffer, GetPosition, Abort, Pause, ToolQuery,
            IsFinished, ReadEeprom, WriteEeprom, CaptureToFile, EndCapture, PlaybackCapture,
            Reset, NextFilename, GetBuildName, WriteEeprom32, QueuePointAbs, SetPosition,
            FindAxesMinimum, FindAxesMaximum, Delay, ChangeTool, WaitForTool, ToolCommand,
            EnableAxes, WaitForPlatform, FirstAutoRaft, AutoRaft,
        ];
        ALL.into_iter().find(|c| c.code() == code)
    }

    /// Buffered commands can be refused with buffer-full; queries cannot
    pub fn is_command(self) -> bool {
        is_command_code(self.code())
    }
}

/// Tool board sub-command codes, carried inside TOOL_QUERY / TOOL_COMMAND
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCommand {
    /// Firmware version
    Version,
    /// Reset the tool
    Init,
    /// Extruder temperature
    GetTemp,
    /// Extruder set point
    SetTemp,
    /// Motor 1 duty cycle
    SetMotor1Pwm,
    /// Motor 2 duty cycle
    SetMotor2Pwm,
    /// Motor 1 speed as a step period
    SetMotor1Rpm,
    /// Motor 2 speed as a step period
    SetMotor2Rpm,
    /// Motor 1 on/off and direction
    ToggleMotor1,
    /// Motor 2 on/off and direction
    ToggleMotor2,
    /// Fan on/off
    ToggleFan,
    /// Valve open/closed
    ToggleValve,
    /// Servo 1 angle
    SetServo1Pos,
    /// Servo 2 angle
    SetServo2Pos,
    /// Motor 1 step period
    GetMotor1Rpm,
    /// Motor 2 step period
    GetMotor2Rpm,
    /// Motor 1 duty cycle readback
    GetMotor1Pwm,
    /// Motor 2 duty cycle readback
    GetMotor2Pwm,
    /// Read tool EEPROM bytes
    ReadFromEeprom,
    /// Write tool EEPROM bytes
    WriteToEeprom,
    /// Platform temperature
    GetPlatformTemp,
    /// Platform set point
    SetPlatformTemp,
    /// Extruder set point readback
    GetSetpoint,
    /// Platform set point readback
    GetPlatformSetpoint,
    /// Firmware build name
    GetBuildName,
}

impl ToolCommand {
    /// Sub-command byte
    pub fn code(self) -> u8 {
        match self {
            ToolCommand::Version => 0,
            ToolCommand::Init => 1,
            ToolCommand::GetTemp => 2,
            ToolCommand::SetTemp => 3,
            ToolCommand::SetMotor1Pwm => 4,
            ToolCommand::SetMotor2Pwm => 5,
            ToolCommand::SetMotor1Rpm => 6,
            ToolCommand::SetMotor2Rpm => 7,
            ToolCommand::ToggleMotor1 => 10,
            ToolCommand::ToggleMotor2 => 11,
            ToolCommand::ToggleFan => 12,
            ToolCommand::ToggleValve => 13,
            ToolCommand::SetServo1Pos => 14,
            ToolCommand::SetServo2Pos => 15,
            ToolCommand::GetMotor1Rpm => 17,
            ToolCommand::GetMotor2Rpm => 18,
            ToolCommand::GetMotor1Pwm => 19,
            ToolCommand::GetMotor2Pwm => 20,
            ToolCommand::ReadFromEeprom => 25,
            ToolCommand::WriteToEeprom => 26,
            ToolCommand::GetPlatformTemp => 30,
            ToolCommand::SetPlatformTemp => 31,
            ToolCommand::GetSetpoint => 32,
            ToolCommand::GetPlatformSetpoint => 33,
            ToolCommand::GetBuildName => 34,
        }
    }

    /// `None` for codes this host does not know
    pub fn from_code(code: u8) -> Option<Self> {
        use ToolCommand::*;
        const ALL: [ToolCommand; 25] = [
            Version, Init, GetTemp, SetTemp, SetMotor1Pwm, SetMotor2Pwm, SetMotor1Rpm,
            SetMotor2Rpm, ToggleMotor1, ToggleMotor2, ToggleFan, ToggleValve, SetServo1Pos,
            SetServo2Pos, GetMotor1Rpm, GetMotor2Rpm, GetMotor1Pwm, GetMotor2Pwm, ReadFromEeprom,
            WriteToEeprom, GetPlatformTemp, SetPlatformTemp, GetSetpoint, GetPlatformSetpoint,
            GetBuildName,
        ];
        ALL.into_iter().find(|c| c.code() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_classes() {
        assert!(!MotherboardCommand::Version.is_command());
        assert!(!MotherboardCommand::ToolQuery.is_command());
        assert!(!MotherboardCommand::WriteEeprom32.is_command());
        assert!(MotherboardCommand::QueuePointAbs.is_command());
        assert!(MotherboardCommand::ToolCommand.is_command());
        assert!(MotherboardCommand::AutoRaft.is_command());
    }

    #[test]
    fn test_code_lookup() {
        assert_eq!(MotherboardCommand::from_code(11), Some(MotherboardCommand::IsFinished));
        assert_eq!(MotherboardCommand::from_code(141), Some(MotherboardCommand::WaitForPlatform));
        assert_eq!(MotherboardCommand::from_code(99), None);
        assert_eq!(ToolCommand::from_code(33), Some(ToolCommand::GetPlatformSetpoint));
        assert_eq!(ToolCommand::from_code(8), None);
    }
}
