//! Onboard parameter storage
//!
//! Field layout, codecs and raw access for the non-volatile memory of the
//! motherboard and of each tool board.

mod access;
pub mod codec;
pub mod map;
mod params;
pub mod thermistor;

pub use access::{Eeprom, EepromTarget, SchemaCheck};
pub use map::Heater;
pub use params::{
    BackoffParameters, EndstopType, ExtraFeatures, HomeDirection, PidParameters,
    ThermistorParameters, ZProbeSettings,
};
pub use thermistor::ThermistorModel;
