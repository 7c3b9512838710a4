//! Motion and homing commands

use tracing::debug;

use super::{Driver, Result};
use crate::eeprom::HomeDirection;
use crate::kinematics::{self, TieBreak};
use crate::machine::{Axis, AxisSet, Geometry, Point3};
use crate::protocol::{MotherboardCommand, PacketBuilder};

/// Seconds a single homing seek may run before the board gives up
pub const HOMING_TIMEOUT_S: u16 = 20;

/// Seconds the auto-home sequences may run
pub const AUTO_HOME_TIMEOUT_S: u16 = 150;

fn xy_axes(axes: AxisSet) -> AxisSet {
    let mut xy = axes;
    xy.remove(Axis::Z);
    xy
}

fn z_axis(axes: AxisSet) -> AxisSet {
    if axes.contains(Axis::Z) {
        AxisSet::empty().with(Axis::Z)
    } else {
        AxisSet::empty()
    }
}

impl Driver {
    /// Queue a linear move to `target` (mm) at up to `feedrate` mm/min.
    ///
    /// The feedrate is limited by every moving axis. A move with no steps on
    /// its longest axis is dropped; returns whether a packet was sent.
    pub fn queue_point(&mut self, target: Point3, feedrate: f64) -> Result<bool> {
        let current = self.position()?;
        let delta = current.abs_delta(&target);
        let feedrate = kinematics::safe_feedrate(self.machine.max_feedrates(), delta, feedrate);
        let Some(timing) = kinematics::plan_move(&self.machine, current, target, feedrate, TieBreak::Queue)
        else {
            debug!(%target, "move has no steps; not sent");
            return Ok(false);
        };

        let steps = self.machine.mm_to_steps(target);
        debug!(
            %target,
            master = ?timing.master.axis,
            micros = timing.step_delay,
            "queue point"
        );
        self.command(
            PacketBuilder::new(MotherboardCommand::QueuePointAbs.code())
                .add_i32(steps.x as i32)
                .add_i32(steps.y as i32)
                .add_i32(steps.z as i32)
                .add32(timing.step_delay),
        )?;
        self.position = Some(target);
        Ok(true)
    }

    /// Tell the board it is at `position` without moving
    pub fn set_current_position(&mut self, position: Point3) -> Result<()> {
        let steps = self.machine.mm_to_steps(position);
        debug!(%position, "set current position");
        self.command(
            PacketBuilder::new(MotherboardCommand::SetPosition.code())
                .add_i32(steps.x as i32)
                .add_i32(steps.y as i32)
                .add_i32(steps.z as i32),
        )?;
        self.position = Some(position);
        Ok(())
    }

    /// Seek the endstops of `axes`, toward the maximum if `positive`.
    /// A non-positive feedrate homes as fast as the slowest axis allows.
    pub fn home_axes(&mut self, axes: AxisSet, positive: bool, feedrate: f64) -> Result<()> {
        let feedrate = kinematics::homing_feedrate(self.machine.max_feedrates(), axes, feedrate);
        let micros = kinematics::homing_step_delay(&self.machine, axes, feedrate);
        let code = if positive {
            MotherboardCommand::FindAxesMaximum
        } else {
            MotherboardCommand::FindAxesMinimum
        };
        debug!(axes = axes.bits(), positive, micros, "home axes");
        self.command(
            PacketBuilder::new(code.code())
                .add8(axes.bits())
                .add32(micros)
                .add16(HOMING_TIMEOUT_S),
        )?;
        self.invalidate_position();
        Ok(())
    }

    /// First-time auto-home calibration: seek each axis in the given
    /// direction and store the result on the board. The machine ends at the
    /// origin.
    pub fn first_auto_home(
        &mut self,
        directions: [HomeDirection; 3],
        xy_feedrate: f64,
        z_feedrate: f64,
    ) -> Result<()> {
        let axes: AxisSet = Axis::ALL
            .into_iter()
            .zip(directions)
            .filter(|(_, d)| *d != HomeDirection::Disabled)
            .map(|(a, _)| a)
            .collect();
        let (xy_micros, z_micros) = self.auto_home_delays(axes, xy_feedrate, z_feedrate);
        debug!(axes = axes.bits(), xy_micros, z_micros, "first auto-home");

        let mut builder = PacketBuilder::new(MotherboardCommand::FirstAutoRaft.code());
        for direction in directions {
            builder = builder.add8(direction.to_byte());
        }
        self.command(
            builder
                .add32(xy_micros)
                .add32(z_micros)
                .add16(AUTO_HOME_TIMEOUT_S),
        )?;
        self.position = Some(Point3::ZERO);
        Ok(())
    }

    /// Auto-home using the calibration stored on the board
    pub fn auto_home(&mut self, axes: AxisSet, xy_feedrate: f64, z_feedrate: f64) -> Result<()> {
        let (xy_micros, z_micros) = self.auto_home_delays(axes, xy_feedrate, z_feedrate);
        debug!(axes = axes.bits(), xy_micros, z_micros, "auto-home");
        self.command(
            PacketBuilder::new(MotherboardCommand::AutoRaft.code())
                .add32(xy_micros)
                .add32(z_micros)
                .add16(AUTO_HOME_TIMEOUT_S),
        )?;
        self.position = Some(Point3::ZERO);
        Ok(())
    }

    fn auto_home_delays(&self, axes: AxisSet, xy_feedrate: f64, z_feedrate: f64) -> (u32, u32) {
        let (xy, z) =
            kinematics::auto_home_feedrates(self.machine.max_feedrates(), axes, xy_feedrate, z_feedrate);
        (
            kinematics::homing_step_delay(&self.machine, xy_axes(axes), xy),
            kinematics::homing_step_delay(&self.machine, z_axis(axes), z),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::machine::MachineModel;
    use crate::protocol::Response;
    use crate::sim::SimulatedBoard;
    use crate::version::Version;
    use pretty_assertions::assert_eq;

    fn unit_machine() -> MachineModel {
        MachineModel {
            steps_per_mm: Point3::new(10.0, 10.0, 100.0),
            max_feedrates: Point3::new(6000.0, 6000.0, 300.0),
            ..MachineModel::default()
        }
    }

    fn driver(board: &SimulatedBoard) -> Driver {
        let config = DriverConfig {
            reset_settle_ms: 1,
            ..DriverConfig::default()
        };
        let mut driver = Driver::with_transport(board.clone(), config, unit_machine());
        driver.initialize().unwrap();
        board.clear_log();
        driver
    }

    /// Read little-endian arguments with the response reader
    fn args(payload: &[u8]) -> Response {
        let mut framed = vec![0x81];
        framed.extend_from_slice(payload);
        Response::from_payload(&framed)
    }

    #[test]
    fn test_queue_point_packet() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver.set_current_position(Point3::ZERO).unwrap();
        board.clear_log();

        // 3-4-0 mm at 600 mm/min: 0.5 s over 40 steps of Y
        assert!(driver.queue_point(Point3::new(3.0, 4.0, 0.0), 600.0).unwrap());
        let requests = board.requests();
        let request = &requests[0];
        assert_eq!(request[0], MotherboardCommand::QueuePointAbs.code());
        let response = args(&request[1..]);
        let mut r = response.reader();
        assert_eq!(r.get_i32().unwrap(), 30);
        assert_eq!(r.get_i32().unwrap(), 40);
        assert_eq!(r.get_i32().unwrap(), 0);
        assert_eq!(r.get32().unwrap(), 12_500);
        assert_eq!(board.position(), [30, 40, 0]);
    }

    #[test]
    fn test_queue_point_without_steps_is_dropped() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver.set_current_position(Point3::new(1.0, 1.0, 1.0)).unwrap();
        board.clear_log();

        assert!(!driver.queue_point(Point3::new(1.0, 1.0, 1.0), 1000.0).unwrap());
        // Less than half a step on every axis
        assert!(!driver.queue_point(Point3::new(1.04, 1.0, 1.0), 1000.0).unwrap());
        assert!(board.requests().is_empty());
    }

    #[test]
    fn test_queue_point_reconciles_stale_position() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        board.set_position([100, 0, 0]);
        let mut driver = driver(&board);
        driver.queue_point(Point3::new(10.0, 5.0, 0.0), 6000.0).unwrap();
        assert_eq!(
            board.request_codes(),
            vec![
                MotherboardCommand::GetPosition.code(),
                MotherboardCommand::QueuePointAbs.code()
            ]
        );
    }

    #[test]
    fn test_queue_point_feedrate_limited_by_z() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver.set_current_position(Point3::ZERO).unwrap();
        board.clear_log();

        // 1 mm of Z at the requested 6000 is capped to 300 mm/min: 0.2 s / 100 steps
        driver.queue_point(Point3::new(0.0, 0.0, 1.0), 6000.0).unwrap();
        let requests = board.requests();
        let request = &requests[0];
        let response = args(&request[13..]);
        let mut r = response.reader();
        assert_eq!(r.get32().unwrap(), 2000);
    }

    #[test]
    fn test_home_axes_packet() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver
            .home_axes(AxisSet::empty().with(Axis::X).with(Axis::Y), false, 0.0)
            .unwrap();
        let requests = board.requests();
        let request = &requests[0];
        assert_eq!(request[0], MotherboardCommand::FindAxesMinimum.code());
        assert_eq!(request[1], 0b011);
        let response = args(&request[2..]);
        let mut r = response.reader();
        // Unit XY diagonal at 6000 mm/min over 10 master steps
        let expected = (2f64.sqrt() / 6000.0 * 60_000_000.0 / 10.0).round() as u32;
        assert_eq!(r.get32().unwrap(), expected);
        assert_eq!(r.get16().unwrap(), HOMING_TIMEOUT_S);
        assert_eq!(driver.status().position, None);
    }

    #[test]
    fn test_home_z_max_uses_z_limit() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver
            .home_axes(AxisSet::empty().with(Axis::Z), true, 0.0)
            .unwrap();
        let requests = board.requests();
        let request = &requests[0];
        assert_eq!(request[0], MotherboardCommand::FindAxesMaximum.code());
        assert_eq!(request[1], 0b100);
        // 1 mm at 300 mm/min over 100 steps
        assert_eq!(args(&request[2..]).reader().get32().unwrap(), 2000);
    }

    #[test]
    fn test_first_auto_home_packet() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver
            .first_auto_home(
                [HomeDirection::Negative, HomeDirection::Negative, HomeDirection::Positive],
                0.0,
                0.0,
            )
            .unwrap();
        let requests = board.requests();
        let request = &requests[0];
        assert_eq!(request[0], MotherboardCommand::FirstAutoRaft.code());
        assert_eq!(&request[1..4], &[1, 1, 2]);
        let response = args(&request[4..]);
        let mut r = response.reader();
        let xy = (2f64.sqrt() / 6000.0 * 60_000_000.0 / 10.0).round() as u32;
        assert_eq!(r.get32().unwrap(), xy);
        assert_eq!(r.get32().unwrap(), 2000);
        assert_eq!(r.get16().unwrap(), AUTO_HOME_TIMEOUT_S);
        assert_eq!(driver.status().position, Some(Point3::ZERO));
    }

    #[test]
    fn test_auto_home_packet() {
        let board = SimulatedBoard::new(Version::new(2, 0));
        let mut driver = driver(&board);
        driver.auto_home(AxisSet::empty().with(Axis::Z), 1000.0, 100.0).unwrap();
        let requests = board.requests();
        let request = &requests[0];
        assert_eq!(request[0], MotherboardCommand::AutoRaft.code());
        let response = args(&request[1..]);
        let mut r = response.reader();
        // No XY axis active: nothing to time
        assert_eq!(r.get32().unwrap(), 0);
        // 1 mm at 100 mm/min over 100 steps
        assert_eq!(r.get32().unwrap(), 6000);
        assert_eq!(r.get16().unwrap(), AUTO_HOME_TIMEOUT_S);
    }
}
