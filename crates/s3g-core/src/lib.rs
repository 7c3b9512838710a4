//! # s3g-core
//!
//! Host-side driver for Sanguino3G (gen3) motherboards and their extruder
//! controllers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - S3G packet framing with CRC-8 and a retrying request/response session
//! - Connection handshake with firmware version negotiation
//! - Motion, homing, tool head, SD card and onboard EEPROM commands
//! - Capture of buffered commands to a file for later playback
//! - A simulated board for testing without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use s3g_core::prelude::*;
//!
//! let config = DriverConfig::from_json_file("s3g.json")?;
//! let mut driver = Driver::open(config, MachineModel::default())?;
//! driver.initialize()?;
//!
//! driver.set_temperature(220.0)?;
//! driver.queue_point(Point3::new(10.0, 10.0, 0.0), 1200.0)?;
//! while !driver.is_finished()? {
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```

pub mod config;
pub mod driver;
pub mod eeprom;
pub mod kinematics;
pub mod machine;
pub mod protocol;
pub mod sim;
pub mod version;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DriverConfig;
    pub use crate::driver::{Driver, DriverError, DriverStatus, Servo, ToolState};
    pub use crate::eeprom::{EepromTarget, Heater, HomeDirection};
    pub use crate::machine::{Axis, AxisSet, MachineModel, Point3};
    pub use crate::protocol::{
        Connection, ConnectionState, ProtocolError, RetryPolicy, SdResponse, Session,
    };
    pub use crate::sim::SimulatedBoard;
    pub use crate::version::{Feature, Version};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
