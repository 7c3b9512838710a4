//! Connect to a board, print what it reports and read the extruder temperature.
//!
//! ```text
//! cargo run --example probe -- /dev/ttyUSB0
//! cargo run --example probe -- --sim
//! RUST_LOG=s3g_core=debug cargo run --example probe -- COM3
//! ```
//!
//! With no argument the available serial ports are listed.

use anyhow::{bail, Context};
use s3g_core::prelude::*;
use s3g_core::protocol::list_ports;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(port) = std::env::args().nth(1) else {
        let ports = list_ports();
        if ports.is_empty() {
            bail!("no serial ports found");
        }
        for p in ports {
            let hint = if p.is_likely_motherboard() { "*" } else { " " };
            println!("{} {}  {}", hint, p.name, p.product.unwrap_or_default());
        }
        return Ok(());
    };

    let machine = MachineModel::default();
    let mut driver = if port == "--sim" {
        let board = SimulatedBoard::new(Version::new(2, 6)).with_tool(0, Version::new(2, 6));
        board.set_tool_temperature(0, 24);
        Driver::with_transport(board, DriverConfig::default(), machine)
    } else {
        let config = DriverConfig {
            port_name: port.clone(),
            ..DriverConfig::default()
        };
        Driver::open(config, machine).with_context(|| format!("opening {port}"))?
    };

    let device = driver.initialize().context("handshake failed")?.clone();
    println!("motherboard v{} ({})", device.version, device.build_name);
    for (index, probe) in &device.tools {
        println!("tool {index}: {probe:?}");
    }

    if device.tool_version(0).is_some() {
        match driver.read_temperature()? {
            Some(celsius) => println!("extruder temperature: {celsius:.0} C"),
            None => println!("extruder temperature: no reading"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&driver.status())?);

    driver.disconnect();
    Ok(())
}
