//! Machine geometry and tool registry
//!
//! The driver only needs a few things from the machine description: mm/step
//! conversion, per-axis feedrate limits and the list of attached tools.
//! [`Geometry`] captures that; [`MachineModel`] is the serde-loadable
//! implementation used by the demo and tests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// A point or vector in machine space (millimetres or steps)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    /// X, mm
    pub x: f64,
    /// Y, mm
    pub y: f64,
    /// Z, mm
    pub z: f64,
}

impl Point3 {
    /// The origin
    pub const ZERO: Point3 = Point3::new(0.0, 0.0, 0.0);

    /// Point from coordinates
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate along one axis
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Replace the coordinate along one axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    /// Component-wise `|other - self|`
    pub fn abs_delta(&self, other: &Point3) -> Point3 {
        Point3::new(
            (other.x - self.x).abs(),
            (other.y - self.y).abs(),
            (other.z - self.z).abs(),
        )
    }

    /// Euclidean length as a vector
    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

impl fmt::Display for Point3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Linear axes driven by the motherboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
}

impl Axis {
    /// X, Y, Z in wire order
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Bit used for this axis in homing flags and the inversion byte
    pub const fn bit(self) -> u8 {
        match self {
            Axis::X => 0x01,
            Axis::Y => 0x02,
            Axis::Z => 0x04,
        }
    }
}

/// A set of axes, stored as the firmware's bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct AxisSet(u8);

impl AxisSet {
    /// No axes
    pub const fn empty() -> Self {
        Self(0)
    }

    /// X, Y and Z
    pub const fn all() -> Self {
        Self(0x07)
    }

    /// Build from a bit mask; bits above Z are ignored
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x07)
    }

    /// Bit mask as sent to the firmware
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builder-style `insert`
    pub fn with(mut self, axis: Axis) -> Self {
        self.insert(axis);
        self
    }

    /// Add an axis
    pub fn insert(&mut self, axis: Axis) {
        self.0 |= axis.bit();
    }

    /// Drop an axis
    pub fn remove(&mut self, axis: Axis) {
        self.0 &= !axis.bit();
    }

    /// Whether `axis` is in the set
    pub fn contains(self, axis: Axis) -> bool {
        self.0 & axis.bit() != 0
    }

    /// No axes selected
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in X, Y, Z order
    pub fn iter(self) -> impl Iterator<Item = Axis> {
        Axis::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl FromIterator<Axis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = Axis>>(iter: I) -> Self {
        iter.into_iter().fold(AxisSet::empty(), AxisSet::with)
    }
}

/// What the driver needs to know about the machine
pub trait Geometry {
    /// Convert millimetres to (whole) steps
    fn mm_to_steps(&self, mm: Point3) -> Point3;

    /// Convert steps back to millimetres
    fn steps_to_mm(&self, steps: Point3) -> Point3;

    /// Maximum feedrate per axis, mm/min
    fn max_feedrates(&self) -> Point3;

    /// Indices of every tool in the registry
    fn tool_indices(&self) -> Vec<u8>;
}

/// Rotation sense for motor and spindle outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorDirection {
    /// Clockwise
    #[default]
    Clockwise,
    /// Counter-clockwise
    CounterClockwise,
}

/// A tool (extruder controller channel) attached to the machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolModel {
    /// Bus address of the tool board
    pub index: u8,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Direction of motor 1
    #[serde(default)]
    pub motor_direction: MotorDirection,

    /// Direction of the spindle (motor 2)
    #[serde(default)]
    pub spindle_direction: MotorDirection,

    /// The tool board also drives a heated build platform
    #[serde(default)]
    pub heated_platform: bool,
}

impl ToolModel {
    /// Tool with default name and directions
    pub fn new(index: u8) -> Self {
        Self {
            index,
            name: format!("Tool {}", index),
            motor_direction: MotorDirection::default(),
            spindle_direction: MotorDirection::default(),
            heated_platform: false,
        }
    }
}

/// Serializable machine description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineModel {
    /// Machine name shown to the user
    pub name: String,

    /// Steps per millimetre for X, Y and Z
    pub steps_per_mm: Point3,

    /// Maximum feedrates for X, Y and Z, mm/min
    pub max_feedrates: Point3,

    /// Tools attached to the motherboard
    #[serde(default)]
    pub tools: Vec<ToolModel>,
}

impl Default for MachineModel {
    /// A Cupcake-class machine with one extruder
    fn default() -> Self {
        Self {
            name: "Cupcake".to_string(),
            steps_per_mm: Point3::new(11.767463, 11.767463, 320.0),
            max_feedrates: Point3::new(5000.0, 5000.0, 150.0),
            tools: vec![ToolModel::new(0)],
        }
    }
}

impl MachineModel {
    /// Tool with bus address `index`
    pub fn tool(&self, index: u8) -> Option<&ToolModel> {
        self.tools.iter().find(|t| t.index == index)
    }

    /// Parse a machine description from JSON
    pub fn from_json_str(json: &str) -> io::Result<Self> {
        serde_json::from_str(json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Load a machine description from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

impl Geometry for MachineModel {
    fn mm_to_steps(&self, mm: Point3) -> Point3 {
        Point3::new(
            (mm.x * self.steps_per_mm.x).round(),
            (mm.y * self.steps_per_mm.y).round(),
            (mm.z * self.steps_per_mm.z).round(),
        )
    }

    fn steps_to_mm(&self, steps: Point3) -> Point3 {
        Point3::new(
            steps.x / self.steps_per_mm.x,
            steps.y / self.steps_per_mm.y,
            steps.z / self.steps_per_mm.z,
        )
    }

    fn max_feedrates(&self) -> Point3 {
        self.max_feedrates
    }

    fn tool_indices(&self) -> Vec<u8> {
        self.tools.iter().map(|t| t.index).collect()
    }
}
