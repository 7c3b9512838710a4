//! Thermistor lookup table generation
//!
//! The extruder controller converts ADC readings to temperatures through a
//! table of (adc, °C) pairs. The table is generated on the host from the
//! beta model of an NTC thermistor in a divider with a fixed resistor.

use super::codec::{u16_bytes, u32_bytes};
use super::params::ThermistorParameters;

/// Full-scale ADC count
pub const ADC_RANGE: u32 = 1024;

/// Entries per table
pub const TABLE_ENTRIES: usize = 20;

const ZERO_C_IN_KELVIN: f64 = 273.15;

/// Pull-up resistor of the divider, ohms
const DIVIDER_RESISTOR: f64 = 4700.0;

/// Supply and ADC reference voltage
const SUPPLY_VOLTS: f64 = 5.0;

/// Beta-model thermistor in a voltage divider
#[derive(Debug, Clone, Copy)]
pub struct ThermistorModel {
    beta: f64,
    k: f64,
}

impl ThermistorModel {
    /// Model from stored R0, T0 and beta
    pub fn new(params: ThermistorParameters) -> Self {
        let beta = params.beta as f64;
        let t0 = params.t0 as f64 + ZERO_C_IN_KELVIN;
        Self {
            beta,
            k: params.r0 as f64 * (-beta / t0).exp(),
        }
    }

    /// Temperature in °C for an ADC reading
    pub fn temperature(&self, adc: f64) -> f64 {
        let v = adc * SUPPLY_VOLTS / ADC_RANGE as f64;
        let r = DIVIDER_RESISTOR * v / (SUPPLY_VOLTS - v);
        self.beta / (r / self.k).ln() - ZERO_C_IN_KELVIN
    }

    /// (adc, °C) pairs from ADC 1 upward in even steps
    pub fn table(&self) -> Vec<(u16, i16)> {
        let step = ADC_RANGE / (TABLE_ENTRIES as u32 - 1);
        (0..TABLE_ENTRIES as u32)
            .map(|i| {
                let adc = 1 + i * step;
                (adc as u16, self.temperature(adc as f64) as i16)
            })
            .collect()
    }
}

/// Serialize table entries as little-endian (adc, temperature) pairs
pub fn encode_table(entries: &[(u16, i16)]) -> Vec<u8> {
    entries
        .iter()
        .flat_map(|&(adc, temp)| {
            let [a0, a1] = u16_bytes(adc);
            let [t0, t1] = u16_bytes(temp as u16);
            [a0, a1, t0, t1]
        })
        .collect()
}

/// Calibration values as stored ahead of the table (u32 LE each)
pub fn encode_parameter(value: u32) -> [u8; 4] {
    u32_bytes(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_point() {
        let model = ThermistorModel::new(ThermistorParameters::default());
        // At the reference resistance the model returns the reference temperature
        let adc = ADC_RANGE as f64 * 100_000.0 / (100_000.0 + DIVIDER_RESISTOR);
        assert!((model.temperature(adc) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_table_shape() {
        let table = ThermistorModel::new(ThermistorParameters::default()).table();
        assert_eq!(table.len(), TABLE_ENTRIES);
        assert_eq!(table[0].0, 1);
        assert_eq!(table[1].0, 54);
        assert_eq!(table[TABLE_ENTRIES - 1].0, 1008);
        // Higher ADC reading means higher resistance, so colder
        assert!(table.windows(2).all(|w| w[0].1 >= w[1].1));
        assert!(table[TABLE_ENTRIES - 1].1 < 25);
    }

    #[test]
    fn test_table_encoding() {
        let bytes = encode_table(&[(1, 841), (54, -3)]);
        assert_eq!(bytes, vec![0x01, 0x00, 0x49, 0x03, 0x36, 0x00, 0xFD, 0xFF]);
    }
}
