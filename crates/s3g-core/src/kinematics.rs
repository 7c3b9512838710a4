//! Feedrate to step-timing conversion
//!
//! The motherboard paces a move by the interval between steps of its
//! longest axis (the master axis). Everything here is a pure function of
//! the geometry and the requested move.

use crate::machine::{Axis, AxisSet, Geometry, Point3};

/// Microseconds per minute
const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// How equal step counts are resolved when picking the master axis.
///
/// Point queueing and homing have always resolved ties differently. Only
/// the step count of the winner enters the timing, so both rules give the
/// same delay; the axis reported differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// X wins only when strictly longer than Y; Z wins only when strictly
    /// longer than the X/Y winner. An X/Y tie goes to Y.
    Queue,
    /// First longest axis in X, Y, Z order.
    Precedence,
}

/// The longest axis of a move and its step count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterAxis {
    /// Axis with the most steps
    pub axis: Axis,
    /// Steps along that axis
    pub steps: f64,
}

/// Timing for a move that has at least one step to take
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveTiming {
    /// Axis the feed rate is computed against
    pub master: MasterAxis,
    /// Straight-line length of the move, mm
    pub distance: f64,
    /// Interval between master-axis steps, microseconds
    pub step_delay: u32,
}

/// Pick the master axis from absolute per-axis step counts
pub fn master_axis(steps: Point3, rule: TieBreak) -> MasterAxis {
    let pick = |axis: Axis| MasterAxis {
        axis,
        steps: steps.get(axis),
    };
    match rule {
        TieBreak::Queue => {
            if steps.x > steps.y {
                if steps.z > steps.x {
                    pick(Axis::Z)
                } else {
                    pick(Axis::X)
                }
            } else if steps.z > steps.y {
                pick(Axis::Z)
            } else {
                pick(Axis::Y)
            }
        }
        TieBreak::Precedence => {
            let mut best = pick(Axis::X);
            for axis in [Axis::Y, Axis::Z] {
                if steps.get(axis) > best.steps {
                    best = pick(axis);
                }
            }
            best
        }
    }
}

/// Work out the step delay for a move from `from` to `to` (mm) at
/// `feedrate` mm/min.
///
/// Returns `None` when the master axis has no steps to take, or when the
/// feedrate is not positive; such moves must not be sent.
pub fn plan_move<G: Geometry + ?Sized>(
    geometry: &G,
    from: Point3,
    to: Point3,
    feedrate: f64,
    rule: TieBreak,
) -> Option<MoveTiming> {
    let delta = from.abs_delta(&to);
    let master = master_axis(geometry.mm_to_steps(delta), rule);
    if master.steps <= 0.0 || feedrate.is_nan() || feedrate <= 0.0 {
        return None;
    }
    let distance = delta.length();
    let duration = distance / feedrate * MICROS_PER_MINUTE;
    let step_delay = (duration / master.steps).round();
    Some(MoveTiming {
        master,
        distance,
        step_delay: clamp_u32(step_delay),
    })
}

/// Step delay for a homing seek over `axes`, using a unit displacement on
/// each active axis. Zero if no axis would step.
pub fn homing_step_delay<G: Geometry + ?Sized>(geometry: &G, axes: AxisSet, feedrate: f64) -> u32 {
    let mut target = Point3::ZERO;
    for axis in axes.iter() {
        target.set(axis, 1.0);
    }
    plan_move(geometry, Point3::ZERO, target, feedrate, TieBreak::Precedence)
        .map(|t| t.step_delay)
        .unwrap_or(0)
}

/// Feedrate for a single homing seek. A non-positive request means "as fast
/// as possible"; the result never exceeds the limit of any active axis.
pub fn homing_feedrate(max: Point3, axes: AxisSet, requested: f64) -> f64 {
    let mut feedrate = if requested <= 0.0 {
        max.x.max(max.y).max(max.z)
    } else {
        requested
    };
    for axis in axes.iter() {
        feedrate = feedrate.min(max.get(axis));
    }
    feedrate
}

/// Feedrates for the auto-home sequences, resolved separately for the XY
/// stage and the Z stage. Non-positive requests default to the stage's
/// fastest axis.
pub fn auto_home_feedrates(max: Point3, axes: AxisSet, xy: f64, z: f64) -> (f64, f64) {
    let mut xy = if xy <= 0.0 { max.x.max(max.y) } else { xy };
    let mut z = if z <= 0.0 { max.z } else { z };
    if axes.contains(Axis::X) {
        xy = xy.min(max.x);
    }
    if axes.contains(Axis::Y) {
        xy = xy.min(max.y);
    }
    if axes.contains(Axis::Z) {
        z = z.min(max.z);
    }
    (xy, z)
}

/// Feedrate for a queued move: the request limited by every moving axis.
/// A non-positive request runs at the slowest moving axis's limit.
pub fn safe_feedrate(max: Point3, delta: Point3, requested: f64) -> f64 {
    let limit = Axis::ALL
        .into_iter()
        .filter(|a| delta.get(*a) != 0.0)
        .map(|a| max.get(a))
        .fold(f64::INFINITY, f64::min);
    if requested <= 0.0 {
        if limit.is_finite() {
            limit
        } else {
            0.0
        }
    } else {
        requested.min(limit)
    }
}

/// Motor speed to step period. Zero RPM encodes as a zero period.
pub fn rpm_to_period(rpm: f64) -> u32 {
    if rpm == 0.0 {
        return 0;
    }
    clamp_u32((MICROS_PER_MINUTE / rpm).round())
}

/// Step period back to RPM; a zero period reads as stopped
pub fn period_to_rpm(micros: u32) -> f64 {
    if micros == 0 {
        return 0.0;
    }
    MICROS_PER_MINUTE / micros as f64
}

fn clamp_u32(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= u32::MAX as f64 {
        u32::MAX
    } else {
        value as u32
    }
}
