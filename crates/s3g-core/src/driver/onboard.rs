//! Onboard parameters stored in motherboard and tool-board EEPROM

use tracing::{debug, info};

use super::{Driver, Result};
use crate::eeprom::codec::{decode_latin1, encode_latin1, is_unset};
use crate::eeprom::map::{motherboard, tool, BROADCAST_TOOL, CHECK_BYTES};
use crate::eeprom::thermistor::{encode_parameter, encode_table};
use crate::eeprom::{
    BackoffParameters, EepromTarget, EndstopType, ExtraFeatures, Heater, HomeDirection,
    PidParameters, ThermistorModel, ThermistorParameters, ZProbeSettings,
};
use crate::machine::{AxisSet, Geometry, Point3};
use crate::version::Feature;

impl Driver {
    fn motherboard_eeprom(&mut self) -> Result<crate::eeprom::Eeprom<'_>> {
        self.require(Feature::OnboardParameters)?;
        self.check_eeprom()?;
        Ok(self.eeprom(EepromTarget::Motherboard))
    }

    fn tool_eeprom(&self) -> Result<crate::eeprom::Eeprom<'_>> {
        self.require(Feature::OnboardParameters)?;
        Ok(self.eeprom(EepromTarget::Tool(self.current_tool)))
    }

    /// Axes whose stepper direction is inverted
    pub fn inverted_axes(&mut self) -> Result<AxisSet> {
        let bits = self.motherboard_eeprom()?.read_u8(motherboard::AXIS_INVERSION)?;
        Ok(match bits {
            Some(b) if b != 0xFF => AxisSet::from_bits(b & AxisSet::all().bits()),
            _ => AxisSet::empty(),
        })
    }

    /// Store the axis inversion mask
    pub fn set_inverted_axes(&mut self, axes: AxisSet) -> Result<()> {
        self.motherboard_eeprom()?
            .write(motherboard::AXIS_INVERSION, &[axes.bits()])?;
        Ok(())
    }

    /// Endstop wiring; `None` if unset or unrecognised
    pub fn inverted_endstops(&mut self) -> Result<Option<EndstopType>> {
        let byte = self.motherboard_eeprom()?.read_u8(motherboard::ENDSTOP_INVERSION)?;
        Ok(byte.and_then(EndstopType::from_byte))
    }

    /// Store the endstop wiring
    pub fn set_inverted_endstops(&mut self, endstops: EndstopType) -> Result<()> {
        self.motherboard_eeprom()?
            .write(motherboard::ENDSTOP_INVERSION, &[endstops.to_byte()])?;
        Ok(())
    }

    /// Name stored on the board; empty if never set
    pub fn machine_name(&mut self) -> Result<String> {
        let data = self
            .motherboard_eeprom()?
            .read(motherboard::MACHINE_NAME, motherboard::MACHINE_NAME_LEN as u8)?;
        if data.is_empty() || is_unset(&data) {
            return Ok(String::new());
        }
        Ok(decode_latin1(&data))
    }

    /// Store a name, truncated to 16 characters
    pub fn set_machine_name(&mut self, name: &str) -> Result<()> {
        let field = encode_latin1(name, motherboard::MACHINE_NAME_LEN);
        self.motherboard_eeprom()?
            .write(motherboard::MACHINE_NAME, &field)?;
        Ok(())
    }

    /// Homing direction per axis, X Y Z
    pub fn autohome_directions(&mut self) -> Result<[HomeDirection; 3]> {
        let data = self.motherboard_eeprom()?.read(motherboard::AUTOHOME_DIRECTIONS, 3)?;
        let mut directions = [HomeDirection::Disabled; 3];
        for (slot, &byte) in directions.iter_mut().zip(&data) {
            *slot = HomeDirection::from_byte(byte);
        }
        Ok(directions)
    }

    /// Store the homing direction of each axis
    pub fn set_autohome_directions(&mut self, directions: [HomeDirection; 3]) -> Result<()> {
        let bytes = directions.map(HomeDirection::to_byte);
        self.motherboard_eeprom()?
            .write(motherboard::AUTOHOME_DIRECTIONS, &bytes)?;
        Ok(())
    }

    /// Distance from each endstop to the origin recorded by the first
    /// auto-home, mm. Unset axes read as zero.
    pub fn autohome_offsets(&mut self) -> Result<Point3> {
        let eeprom = self.motherboard_eeprom()?;
        let mut steps = [0.0; 3];
        for (i, slot) in steps.iter_mut().enumerate() {
            let offset = motherboard::AUTOHOME_STEPS + 4 * i as u16;
            *slot = eeprom.read_u32(offset)?.map(|s| s as i32 as f64).unwrap_or(0.0);
        }
        Ok(self.machine.steps_to_mm(Point3::new(steps[0], steps[1], steps[2])))
    }

    /// Z lift after homing, mm; `None` if unset
    pub fn z_lift(&mut self) -> Result<Option<f64>> {
        let steps = self.motherboard_eeprom()?.read_u32(motherboard::Z_LIFT_STEPS)?;
        Ok(steps.map(|s| self.machine.steps_to_mm(Point3::new(0.0, 0.0, s as f64)).z))
    }

    /// Z lift after homing. Only lifts are stored; a negative value is taken
    /// as its magnitude.
    pub fn set_z_lift(&mut self, mm: f64) -> Result<()> {
        let steps = self.machine.mm_to_steps(Point3::new(0.0, 0.0, mm.abs())).z;
        debug!(mm, steps, "set Z lift");
        self.motherboard_eeprom()?
            .write_u32(motherboard::Z_LIFT_STEPS, steps as u32)?;
        Ok(())
    }

    /// Z probe servo settings; defaults if never stored
    pub fn z_probe_settings(&mut self) -> Result<ZProbeSettings> {
        let data = self.motherboard_eeprom()?.read(motherboard::Z_PROBE_TOOL_INDEX, 3)?;
        if data.len() < 3 || is_unset(&data) {
            return Ok(ZProbeSettings::default());
        }
        Ok(ZProbeSettings {
            tool_index: data[0],
            lift_angle: data[1],
            lowered_angle: data[2],
        })
    }

    /// Store the Z probe settings; the tool index is written last
    pub fn set_z_probe_settings(&mut self, settings: ZProbeSettings) -> Result<()> {
        let eeprom = self.motherboard_eeprom()?;
        eeprom.write(motherboard::Z_PROBE_LIFT_ANGLE, &[settings.lift_angle])?;
        eeprom.write(motherboard::Z_PROBE_LOWERED_ANGLE, &[settings.lowered_angle])?;
        eeprom.write(motherboard::Z_PROBE_TOOL_INDEX, &[settings.tool_index])?;
        Ok(())
    }

    /// Erase the motherboard EEPROM; the firmware falls back to its defaults
    pub fn reset_to_factory(&mut self) -> Result<()> {
        self.motherboard_eeprom()?.factory_reset()?;
        Ok(())
    }

    /// Thermistor calibration of the current tool, defaults where unset
    pub fn thermistor_parameters(&self, heater: Heater) -> Result<ThermistorParameters> {
        let eeprom = self.tool_eeprom()?;
        let defaults = ThermistorParameters::default();
        Ok(ThermistorParameters {
            r0: eeprom.read_u32(heater.r0_offset())?.unwrap_or(defaults.r0),
            t0: eeprom.read_u32(heater.t0_offset())?.unwrap_or(defaults.t0),
            beta: eeprom.read_u32(heater.beta_offset())?.unwrap_or(defaults.beta),
        })
    }

    /// Generate a lookup table from `params` and store it with the
    /// calibration values on the current tool
    pub fn create_thermistor_table(&self, heater: Heater, params: ThermistorParameters) -> Result<()> {
        let eeprom = self.tool_eeprom()?;
        let table = ThermistorModel::new(params).table();
        for (adc, temp) in &table {
            debug!(adc, temp, "thermistor table entry");
        }
        info!(?heater, ?params, "writing thermistor table");

        eeprom.write(0, &CHECK_BYTES)?;
        eeprom.write(heater.beta_offset(), &encode_parameter(params.beta))?;
        eeprom.write(heater.r0_offset(), &encode_parameter(params.r0))?;
        eeprom.write(heater.t0_offset(), &encode_parameter(params.t0))?;
        eeprom.write(heater.table_offset(), &encode_table(&table))?;
        Ok(())
    }

    /// Extruder backoff timings; defaults fill unset words
    pub fn backoff_parameters(&self) -> Result<BackoffParameters> {
        let eeprom = self.tool_eeprom()?;
        let defaults = BackoffParameters::default();
        Ok(BackoffParameters {
            forward_ms: eeprom.read_u16(tool::BACKOFF_FORWARD_MS)?.unwrap_or(defaults.forward_ms),
            stop_ms: eeprom.read_u16(tool::BACKOFF_STOP_MS)?.unwrap_or(defaults.stop_ms),
            reverse_ms: eeprom.read_u16(tool::BACKOFF_REVERSE_MS)?.unwrap_or(defaults.reverse_ms),
            trigger_ms: eeprom.read_u16(tool::BACKOFF_TRIGGER_MS)?.unwrap_or(defaults.trigger_ms),
        })
    }

    /// Write all four backoff timings
    pub fn set_backoff_parameters(&self, params: BackoffParameters) -> Result<()> {
        let eeprom = self.tool_eeprom()?;
        eeprom.write_u16(tool::BACKOFF_FORWARD_MS, params.forward_ms)?;
        eeprom.write_u16(tool::BACKOFF_STOP_MS, params.stop_ms)?;
        eeprom.write_u16(tool::BACKOFF_REVERSE_MS, params.reverse_ms)?;
        eeprom.write_u16(tool::BACKOFF_TRIGGER_MS, params.trigger_ms)?;
        Ok(())
    }

    /// PID gains for one heater; unset gains read as defaults
    pub fn pid_parameters(&self, heater: Heater) -> Result<PidParameters> {
        let eeprom = self.tool_eeprom()?;
        let base = heater.pid_base();
        let defaults = PidParameters::default();
        Ok(PidParameters {
            p: eeprom.read_fixed88(base + tool::PID_P)?.unwrap_or(defaults.p),
            i: eeprom.read_fixed88(base + tool::PID_I)?.unwrap_or(defaults.i),
            d: eeprom.read_fixed88(base + tool::PID_D)?.unwrap_or(defaults.d),
        })
    }

    /// Store PID gains; each is clamped to the 8.8 range
    pub fn set_pid_parameters(&self, heater: Heater, params: PidParameters) -> Result<()> {
        let eeprom = self.tool_eeprom()?;
        let base = heater.pid_base();
        eeprom.write_fixed88(base + tool::PID_P, params.p)?;
        eeprom.write_fixed88(base + tool::PID_I, params.i)?;
        eeprom.write_fixed88(base + tool::PID_D, params.d)?;
        Ok(())
    }

    /// Extra-features word; the firmware default if unset
    pub fn extra_features(&self) -> Result<ExtraFeatures> {
        let word = self
            .tool_eeprom()?
            .read_u16(tool::EXTRA_FEATURES)?
            .unwrap_or(ExtraFeatures::DEFAULT_WORD);
        Ok(ExtraFeatures::from_word(word))
    }

    /// Store the extra-features word
    pub fn set_extra_features(&self, features: ExtraFeatures) -> Result<()> {
        self.tool_eeprom()?
            .write_u16(tool::EXTRA_FEATURES, features.to_word())?;
        Ok(())
    }

    /// Give the attached tool board a new bus address. Written through the
    /// broadcast address, so only one tool board may be connected.
    pub fn set_connected_tool_index(&self, index: u8) -> Result<()> {
        self.require(Feature::OnboardParameters)?;
        info!(index, "re-addressing connected tool board");
        self.eeprom(EepromTarget::Tool(BROADCAST_TOOL))
            .write(tool::SLAVE_ID, &[index])?;
        Ok(())
    }

    /// Erase the current tool board's EEPROM
    pub fn reset_tool_to_factory(&self) -> Result<()> {
        self.tool_eeprom()?.factory_reset()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::driver::DriverError;
    use crate::eeprom::map::{FACTORY_RESET_END, TOOL_WRITE_CHUNK};
    use crate::machine::{Axis, MachineModel};
    use crate::sim::{EepromWrite, SimulatedBoard};
    use crate::version::Version;
    use pretty_assertions::assert_eq;

    fn driver(board: &SimulatedBoard) -> Driver {
        let config = DriverConfig {
            reset_settle_ms: 1,
            ..DriverConfig::default()
        };
        let mut driver = Driver::with_transport(board.clone(), config, MachineModel::default());
        driver.initialize().unwrap();
        board.clear_log();
        driver
    }

    fn board() -> SimulatedBoard {
        SimulatedBoard::new(Version::new(2, 0)).with_tool(0, Version::new(2, 6))
    }

    #[test]
    fn test_onboard_parameters_need_firmware_1_2() {
        let board = SimulatedBoard::new(Version::new(1, 1));
        let mut driver = driver(&board);
        assert!(matches!(
            driver.machine_name(),
            Err(DriverError::Unsupported(Feature::OnboardParameters))
        ));
    }

    #[test]
    fn test_machine_name() {
        let board = board();
        let mut driver = driver(&board);
        assert_eq!(driver.machine_name().unwrap(), "");
        driver.set_machine_name("Thing-O-Matic Deluxe").unwrap();
        assert_eq!(driver.machine_name().unwrap(), "Thing-O-Matic De");
        assert_eq!(board.eeprom(0x20, 4), b"Thin".to_vec());
    }

    #[test]
    fn test_axis_inversion_and_endstops() {
        let board = board();
        let mut driver = driver(&board);
        assert!(driver.inverted_axes().unwrap().is_empty());
        assert_eq!(driver.inverted_endstops().unwrap(), None);

        let axes = AxisSet::empty().with(Axis::X).with(Axis::Z);
        driver.set_inverted_axes(axes).unwrap();
        driver.set_inverted_endstops(EndstopType::Inverted).unwrap();
        assert_eq!(driver.inverted_axes().unwrap(), axes);
        assert_eq!(driver.inverted_endstops().unwrap(), Some(EndstopType::Inverted));
        assert_eq!(board.eeprom(2, 2), vec![0b101, 0x9F]);
    }

    #[test]
    fn test_z_lift_uses_32_bit_write() {
        let board = board();
        let mut driver = driver(&board);
        driver.set_z_lift(-5.0).unwrap();
        // 5 mm at 320 steps/mm
        assert_eq!(board.eeprom(0x10F, 4), 1600u32.to_le_bytes().to_vec());
        assert_eq!(board.request_codes(), vec![30]);
        assert_eq!(driver.z_lift().unwrap(), Some(5.0));
    }

    #[test]
    fn test_z_probe_settings() {
        let board = board();
        let mut driver = driver(&board);
        assert_eq!(driver.z_probe_settings().unwrap(), ZProbeSettings::default());
        let settings = ZProbeSettings {
            tool_index: 1,
            lift_angle: 150,
            lowered_angle: 40,
        };
        driver.set_z_probe_settings(settings).unwrap();
        assert_eq!(driver.z_probe_settings().unwrap(), settings);
        let offsets: Vec<u16> = board.eeprom_writes().iter().map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0x114, 0x115, 0x113]);
    }

    #[test]
    fn test_autohome_settings() {
        let board = board();
        let mut driver = driver(&board);
        let directions = [HomeDirection::Negative, HomeDirection::Positive, HomeDirection::Disabled];
        driver.set_autohome_directions(directions).unwrap();
        assert_eq!(driver.autohome_directions().unwrap(), directions);

        board.write_eeprom(0x103 + 8, &3200u32.to_le_bytes());
        let offsets = driver.autohome_offsets().unwrap();
        assert_eq!(offsets.x, 0.0);
        assert_eq!(offsets.z, 10.0);
    }

    #[test]
    fn test_tool_defaults_when_unset() {
        let board = board();
        let driver = driver(&board);
        assert_eq!(driver.backoff_parameters().unwrap(), BackoffParameters::default());
        assert_eq!(driver.pid_parameters(Heater::Platform).unwrap(), PidParameters::default());
        assert_eq!(driver.extra_features().unwrap(), ExtraFeatures::default());
        assert_eq!(
            driver.thermistor_parameters(Heater::Extruder).unwrap(),
            ThermistorParameters::default()
        );
    }

    #[test]
    fn test_pid_round_trip_through_eeprom() {
        let board = board();
        let driver = driver(&board);
        let pid = PidParameters {
            p: 9.5,
            i: 0.25,
            d: 300.0,
        };
        driver.set_pid_parameters(Heater::Extruder, pid).unwrap();
        let read = driver.pid_parameters(Heater::Extruder).unwrap();
        assert_eq!(read.p, 9.5);
        assert_eq!(read.i, 0.25);
        // Clamped to the 8.8 range
        assert_eq!(read.d, 255.0 + 255.0 / 256.0);
    }

    #[test]
    fn test_thermistor_table_write() {
        let board = board();
        let driver = driver(&board);
        let params = ThermistorParameters {
            r0: 100_000,
            t0: 25,
            beta: 4066,
        };
        driver.create_thermistor_table(Heater::Extruder, params).unwrap();

        let writes = board.eeprom_writes();
        assert_eq!(
            writes[..4].to_vec(),
            vec![
                EepromWrite { target: EepromTarget::Tool(0), offset: 0, len: 2 },
                EepromWrite { target: EepromTarget::Tool(0), offset: 0xF8, len: 4 },
                EepromWrite { target: EepromTarget::Tool(0), offset: 0xF0, len: 4 },
                EepromWrite { target: EepromTarget::Tool(0), offset: 0xF4, len: 4 },
            ]
        );
        // 80 bytes of table in tool-sized chunks
        assert_eq!(writes.len(), 4 + 8);
        assert!(writes[4..].iter().all(|w| w.len as usize <= TOOL_WRITE_CHUNK));
        assert_eq!(driver.thermistor_parameters(Heater::Extruder).unwrap(), params);
        assert_eq!(board.tool_eeprom(0, 0x100, 2), vec![1, 0]);
    }

    #[test]
    fn test_connected_tool_index_uses_broadcast() {
        let board = board();
        let driver = driver(&board);
        driver.set_connected_tool_index(3).unwrap();
        assert_eq!(
            board.eeprom_writes(),
            vec![EepromWrite { target: EepromTarget::Tool(255), offset: 0x1A, len: 1 }]
        );
    }

    #[test]
    fn test_factory_reset() {
        let board = board();
        let mut driver = driver(&board);
        driver.set_machine_name("Cupcake").unwrap();
        board.clear_log();
        driver.reset_to_factory().unwrap();
        let writes = board.eeprom_writes();
        assert_eq!(writes.len(), FACTORY_RESET_END as usize / 16);
        assert!(writes.iter().all(|w| w.len == 16));
        assert_eq!(board.eeprom(0x20, 16), vec![0xFF; 16]);
    }

    #[test]
    fn test_legacy_eeprom_wiped_once() {
        let board = SimulatedBoard::new(Version::new(1, 5));
        let mut driver = driver(&board);
        driver.machine_name().unwrap();
        assert_eq!(board.eeprom(0, 2), vec![0x5A, 0x78]);
        assert_eq!(board.eeprom(0x20, 16), vec![0; 16]);
        let wipe_writes = board.eeprom_writes().len();
        assert_eq!(wipe_writes, 16);

        driver.machine_name().unwrap();
        assert_eq!(board.eeprom_writes().len(), wipe_writes);
    }
}
