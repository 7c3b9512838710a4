//! Typed onboard parameters and their defaults

use serde::{Deserialize, Serialize};

/// Extruder motor backoff timings, milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffParameters {
    /// Forward run time
    pub forward_ms: u16,
    /// Pause between forward and reverse
    pub stop_ms: u16,
    /// Reverse run time
    pub reverse_ms: u16,
    /// Time to hold before backoff starts
    pub trigger_ms: u16,
}

impl Default for BackoffParameters {
    fn default() -> Self {
        Self {
            forward_ms: 300,
            stop_ms: 5,
            reverse_ms: 500,
            trigger_ms: 300,
        }
    }
}

/// PID gains for one heater, stored as 8.8 fixed point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParameters {
    /// Proportional gain
    pub p: f64,
    /// Integral gain
    pub i: f64,
    /// Derivative gain
    pub d: f64,
}

impl Default for PidParameters {
    fn default() -> Self {
        Self {
            p: 7.0,
            i: 0.325,
            d: 36.0,
        }
    }
}

/// Thermistor calibration for one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermistorParameters {
    /// Resistance at `t0`, ohms
    pub r0: u32,
    /// Reference temperature, °C
    pub t0: u32,
    /// Beta coefficient
    pub beta: u32,
}

impl Default for ThermistorParameters {
    fn default() -> Self {
        Self {
            r0: 100_000,
            t0: 25,
            beta: 4066,
        }
    }
}

/// Extra-features word of the extruder controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFeatures {
    /// Drive the extruder from the second motor controller
    pub swap_motor_controller: bool,
    /// Output channel driving the extruder heater
    pub heater_channel: u8,
    /// Output channel driving the heated build platform
    pub hbp_channel: u8,
    /// Output channel driving the automated build platform
    pub abp_channel: u8,
}

impl ExtraFeatures {
    /// Value of an unset word
    pub const DEFAULT_WORD: u16 = 0x4084;
    const BASE: u16 = 0x4000;

    /// Decode the EEPROM word
    pub fn from_word(word: u16) -> Self {
        Self {
            swap_motor_controller: word & 0x0001 != 0,
            heater_channel: ((word >> 2) & 0x03) as u8,
            hbp_channel: ((word >> 4) & 0x03) as u8,
            abp_channel: ((word >> 6) & 0x03) as u8,
        }
    }

    /// Encode as the EEPROM word
    pub fn to_word(self) -> u16 {
        let mut word = Self::BASE;
        if self.swap_motor_controller {
            word |= 0x0001;
        }
        word |= u16::from(self.heater_channel & 0x03) << 2;
        word |= u16::from(self.hbp_channel & 0x03) << 4;
        word |= u16::from(self.abp_channel & 0x03) << 6;
        word
    }
}

impl Default for ExtraFeatures {
    fn default() -> Self {
        Self::from_word(Self::DEFAULT_WORD)
    }
}

/// Endstop wiring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndstopType {
    /// No endstops fitted
    NotPresent,
    /// Endstops pull low when triggered
    Inverted,
    /// Endstops pull high when triggered
    NonInverted,
}

impl EndstopType {
    /// `None` for unknown values
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(EndstopType::NotPresent),
            0x9F => Some(EndstopType::Inverted),
            0x80 => Some(EndstopType::NonInverted),
            _ => None,
        }
    }

    /// Raw EEPROM byte
    pub fn to_byte(self) -> u8 {
        match self {
            EndstopType::NotPresent => 0x00,
            EndstopType::Inverted => 0x9F,
            EndstopType::NonInverted => 0x80,
        }
    }
}

/// Which way an axis seeks during auto-home
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HomeDirection {
    /// Axis is not homed
    #[default]
    Disabled,
    /// Home toward the minimum
    Negative,
    /// Home toward the maximum
    Positive,
}

impl HomeDirection {
    /// Unknown values read as disabled
    pub fn from_byte(value: u8) -> Self {
        match value {
            1 => HomeDirection::Negative,
            2 => HomeDirection::Positive,
            _ => HomeDirection::Disabled,
        }
    }

    /// To byte
    pub fn to_byte(self) -> u8 {
        match self {
            HomeDirection::Disabled => 0,
            HomeDirection::Negative => 1,
            HomeDirection::Positive => 2,
        }
    }
}

/// Z-probe servo configuration used by the auto-home script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZProbeSettings {
    /// Tool whose servo carries the probe
    pub tool_index: u8,
    /// Servo angle with the probe raised, degrees
    pub lift_angle: u8,
    /// Servo angle with the probe lowered, degrees
    pub lowered_angle: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_features_default_word() {
        let ef = ExtraFeatures::default();
        assert!(!ef.swap_motor_controller);
        assert_eq!(ef.heater_channel, 1);
        assert_eq!(ef.hbp_channel, 0);
        assert_eq!(ef.abp_channel, 2);
        assert_eq!(ef.to_word(), ExtraFeatures::DEFAULT_WORD);
    }

    #[test]
    fn test_extra_features_word() {
        let ef = ExtraFeatures {
            swap_motor_controller: true,
            heater_channel: 2,
            hbp_channel: 1,
            abp_channel: 0,
        };
        assert_eq!(ef.to_word(), 0x4000 | 0x01 | (2 << 2) | (1 << 4));
    }

    #[test]
    fn test_endstop_bytes() {
        assert_eq!(EndstopType::from_byte(0x9F), Some(EndstopType::Inverted));
        assert_eq!(EndstopType::from_byte(0x42), None);
        assert_eq!(EndstopType::NonInverted.to_byte(), 0x80);
    }
}
