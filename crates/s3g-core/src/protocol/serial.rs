//! Serial port handling
//!
//! Port discovery and opening for gen3 motherboards.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

use super::{transport::SerialTransport, ProtocolError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// USB vendor of the FTDI cables gen3 electronics ship with
pub const FTDI_VID: u16 = 0x0403;

/// USB vendor of Arduino boards used as gen3-compatible motherboards
pub const ARDUINO_VID: u16 = 0x2341;

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }

    /// Whether the USB vendor is one a gen3 motherboard is normally behind
    pub fn is_likely_motherboard(&self) -> bool {
        matches!(self.vid, Some(FTDI_VID) | Some(ARDUINO_VID))
    }

    fn is_usb_serial(&self) -> bool {
        let base = self.basename();
        self.vid.is_some()
            || ["ttyUSB", "ttyACM", "cu.usbserial", "tty.usbserial"]
                .iter()
                .any(|prefix| base.starts_with(prefix))
    }

    fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Trailing device number ("COM10" -> 10)
    fn unit(&self) -> Option<u32> {
        let base = self.basename();
        let digits = base.len() - base.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        base[base.len() - digits..].parse().ok()
    }

    /// Likely motherboards first, then other USB serial bridges, then
    /// everything else; by device number within each group
    fn rank(&self) -> (u8, u32, &str) {
        let group = if self.is_likely_motherboard() {
            0
        } else if self.is_usb_serial() {
            1
        } else {
            2
        };
        (group, self.unit().unwrap_or(u32::MAX), self.basename())
    }
}

/// Combine enumerated ports with bare device names; enumeration wins
fn merge_ports(
    enumerated: impl IntoIterator<Item = PortInfo>,
    device_names: impl IntoIterator<Item = String>,
) -> Vec<PortInfo> {
    let mut by_name: BTreeMap<String, PortInfo> = BTreeMap::new();
    for port in enumerated {
        by_name.entry(port.name.clone()).or_insert(port);
    }
    for name in device_names {
        by_name
            .entry(name.clone())
            .or_insert_with(|| PortInfo::bare(name));
    }

    let mut ports: Vec<PortInfo> = by_name.into_values().collect();
    ports.sort_by(|a, b| a.rank().cmp(&b.rank()));
    ports
}

#[cfg(target_os = "linux")]
fn dev_tty_names() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyUSB") || name.starts_with("ttyACM"))
        .map(|name| format!("/dev/{}", name))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn dev_tty_names() -> Vec<String> {
    Vec::new()
}

/// Serial ports that could host a motherboard, most likely first
pub fn list_ports() -> Vec<PortInfo> {
    let enumerated = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("serial port enumeration failed: {}", e);
            Vec::new()
        }
    };
    // udev can lag behind a freshly plugged adapter; /dev already has it
    merge_ports(enumerated.into_iter().map(PortInfo::from), dev_tty_names())
}

/// Open and configure a serial port for the motherboard
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
    timeout: Duration,
) -> Result<SerialTransport, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    debug!(port = name, baud, "opening serial port");

    let mut port = serialport::new(name, baud)
        .timeout(timeout)
        .open()
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    configure_port(port.as_mut())?;
    Ok(SerialTransport::new(port))
}

/// Standard 8N1 configuration, no flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

    // RTS idles high; the reset pulse drives it low
    if let Err(e) = port.write_request_to_send(true) {
        warn!("failed to set RTS high: {} (continuing)", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            product: None,
        }
    }

    fn names(ports: &[PortInfo]) -> Vec<&str> {
        ports.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_ftdi_adapter_listed_first() {
        let ports = merge_ports(
            vec![
                usb("/dev/ttyACM0", 0x2a03, 0x0042),
                usb("/dev/ttyUSB3", FTDI_VID, 0x6001),
            ],
            vec!["/dev/ttyUSB0".to_string(), "/dev/ttyS0".to_string()],
        );
        assert_eq!(
            names(&ports),
            vec!["/dev/ttyUSB3", "/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0"]
        );
        assert!(ports[0].is_likely_motherboard());
        assert!(!ports[1].is_likely_motherboard());
    }

    #[test]
    fn test_device_numbers_sort_numerically() {
        let ports = merge_ports(
            Vec::new(),
            ["COM10", "COM3", "/dev/ttyUSB10", "/dev/ttyUSB2"].map(String::from),
        );
        assert_eq!(
            names(&ports),
            vec!["/dev/ttyUSB2", "/dev/ttyUSB10", "COM3", "COM10"]
        );
    }

    #[test]
    fn test_enumerated_details_survive_merge() {
        let ports = merge_ports(
            vec![usb("/dev/ttyUSB0", ARDUINO_VID, 0x0010)],
            vec!["/dev/ttyUSB0".to_string()],
        );
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].pid, Some(0x0010));
        assert!(ports[0].is_likely_motherboard());
    }
}
