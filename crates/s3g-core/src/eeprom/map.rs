//! EEPROM offsets
//!
//! Motherboard layout:
//!
//! | offset  | size | field                                         |
//! |---------|------|-----------------------------------------------|
//! | 0x000   | 2    | schema check bytes (`5A 78`)                  |
//! | 0x002   | 1    | axis inversion bits (X=0, Y=1, Z=2)           |
//! | 0x003   | 1    | endstop type                                  |
//! | 0x020   | 16   | machine name, ISO-8859-1, NUL padded          |
//! | 0x100   | 3    | autohome direction per axis                   |
//! | 0x103   | 12   | autohome steps per axis (u32 each)            |
//! | 0x10F   | 4    | Z lift after homing, steps                    |
//! | 0x113   | 1    | Z-probe tool index                            |
//! | 0x114   | 1    | Z-probe servo lift angle                      |
//! | 0x115   | 1    | Z-probe servo lowered angle                   |
//!
//! Tool board layout: backoff timings at 0x04..0x0C, PID gains for the
//! extruder at 0x0C and the heated platform at 0x12, extra features at 0x18,
//! the board's bus address at 0x1A and two thermistor tables at 0xF0 and
//! 0x170.

use serde::{Deserialize, Serialize};

/// Bytes written at offset 0 once a legacy EEPROM has been initialised
pub const CHECK_BYTES: [u8; 2] = [0x5A, 0x78];

/// End of the region erased by a factory reset
pub const FACTORY_RESET_END: u16 = 0x200;

/// End of the region zeroed when a legacy EEPROM fails the schema check
pub const LEGACY_WIPE_END: u16 = 0x100;

/// Block size for wipes and factory resets
pub const WIPE_CHUNK: usize = 16;

/// Largest write the motherboard relays to a tool board in one packet
pub const TOOL_WRITE_CHUNK: usize = 11;

/// Largest write sent to the motherboard's own EEPROM in one packet
pub const MOTHERBOARD_WRITE_CHUNK: usize = 16;

/// Tool address every tool board answers to
pub const BROADCAST_TOOL: u8 = 255;

/// Motherboard offsets
pub mod motherboard {
    /// Schema version check bytes
    pub const CHECK: u16 = 0x0000;
    /// Axis inversion bit mask
    pub const AXIS_INVERSION: u16 = 0x0002;
    /// Endstop inversion byte
    pub const ENDSTOP_INVERSION: u16 = 0x0003;
    /// Machine name, NUL padded
    pub const MACHINE_NAME: u16 = 0x0020;
    /// Bytes reserved for the machine name
    pub const MACHINE_NAME_LEN: usize = 16;
    /// Home direction per axis
    pub const AUTOHOME_DIRECTIONS: u16 = 0x0100;
    /// Home offsets, one u32 per axis
    pub const AUTOHOME_STEPS: u16 = 0x0103;
    /// Z lift in steps
    pub const Z_LIFT_STEPS: u16 = 0x010F;
    /// Tool carrying the Z probe
    pub const Z_PROBE_TOOL_INDEX: u16 = 0x0113;
    /// Servo angle with the probe lifted
    pub const Z_PROBE_LIFT_ANGLE: u16 = 0x0114;
    /// Servo angle with the probe lowered
    pub const Z_PROBE_LOWERED_ANGLE: u16 = 0x0115;
}

/// Tool board offsets
pub mod tool {
    /// Backoff stop time
    pub const BACKOFF_STOP_MS: u16 = 0x0004;
    /// Backoff reverse time
    pub const BACKOFF_REVERSE_MS: u16 = 0x0006;
    /// Backoff forward time
    pub const BACKOFF_FORWARD_MS: u16 = 0x0008;
    /// Backoff trigger time
    pub const BACKOFF_TRIGGER_MS: u16 = 0x000A;

    /// Extruder PID block
    pub const PID_EXTRUDER: u16 = 0x000C;
    /// Platform PID block
    pub const PID_PLATFORM: u16 = 0x0012;
    /// P gain, offset within a PID block
    pub const PID_P: u16 = 0x0000;
    /// I gain
    pub const PID_I: u16 = 0x0002;
    /// D gain
    pub const PID_D: u16 = 0x0004;

    /// Extra features word
    pub const EXTRA_FEATURES: u16 = 0x0018;
    /// Bus address of the tool board
    pub const SLAVE_ID: u16 = 0x001A;

    /// Thermistor tables: extruder, platform
    pub const THERMISTOR_TABLES: [u16; 2] = [0x00F0, 0x0170];
    /// R0 word, offset within a thermistor table
    pub const THERMISTOR_R0: u16 = 0x0000;
    /// T0, °C
    pub const THERMISTOR_T0: u16 = 0x0004;
    /// Beta coefficient
    pub const THERMISTOR_BETA: u16 = 0x0008;
    /// Lookup table entries
    pub const THERMISTOR_DATA: u16 = 0x0010;
}

/// Heater channels on a tool board, each with its own PID gains and
/// thermistor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Heater {
    /// Extruder heater
    Extruder,
    /// Build platform heater
    Platform,
}

impl Heater {
    /// Start of this heater's PID block
    pub fn pid_base(self) -> u16 {
        match self {
            Heater::Extruder => tool::PID_EXTRUDER,
            Heater::Platform => tool::PID_PLATFORM,
        }
    }

    /// Start of this heater's thermistor table
    pub fn thermistor_base(self) -> u16 {
        match self {
            Heater::Extruder => tool::THERMISTOR_TABLES[0],
            Heater::Platform => tool::THERMISTOR_TABLES[1],
        }
    }

    /// Thermistor R0 word
    pub fn r0_offset(self) -> u16 {
        self.thermistor_base() + tool::THERMISTOR_R0
    }

    /// Thermistor T0 word
    pub fn t0_offset(self) -> u16 {
        self.thermistor_base() + tool::THERMISTOR_T0
    }

    /// Thermistor beta word
    pub fn beta_offset(self) -> u16 {
        self.thermistor_base() + tool::THERMISTOR_BETA
    }

    /// Offset of the lookup table data
    pub fn table_offset(self) -> u16 {
        self.thermistor_base() + tool::THERMISTOR_DATA
    }
}
