use pretty_assertions::assert_eq;
use s3g_core::config::DriverConfig;
use s3g_core::driver::Driver;
use s3g_core::eeprom::{Eeprom, EepromTarget};
use s3g_core::machine::MachineModel;
use s3g_core::protocol::{Connection, ConnectionState, ProtocolError, ResponseCode, ToolProbe};
use s3g_core::sim::{EepromWrite, SimulatedBoard};
use s3g_core::version::{Feature, Version};

fn quick_config() -> DriverConfig {
    DriverConfig {
        reset_settle_ms: 1,
        buffer_full_backoff_ms: 1,
        ..DriverConfig::default()
    }
}

#[test]
fn test_handshake_pulses_reset_once() {
    let board = SimulatedBoard::new(Version::new(2, 6)).with_tool(0, Version::new(2, 6));
    board.require_reset();
    let mut connection = Connection::new(board.clone(), quick_config());

    let device = connection.negotiate(&[0]).unwrap();
    assert_eq!(device.version, Version::new(2, 6));
    assert_eq!(device.tool_version(0), Some(Version::new(2, 6)));
    assert_eq!(board.reset_pulses(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
    // Version attempts: before settle, after settle, after reset
    assert_eq!(board.request_codes().iter().filter(|&&c| c == 0).count(), 3);
}

#[test]
fn test_handshake_without_reset() {
    let board = SimulatedBoard::new(Version::new(2, 0));
    let mut connection = Connection::new(board.clone(), quick_config());
    connection.negotiate(&[]).unwrap();
    assert_eq!(board.reset_pulses(), 0);
    // INIT is the last thing sent
    assert_eq!(board.request_codes().last(), Some(&1));
}

#[test]
fn test_handshake_fails_without_board() {
    let board = SimulatedBoard::new(Version::new(2, 0));
    board.drop_replies(u32::MAX);
    let mut connection = Connection::new(board.clone(), quick_config());
    assert!(matches!(
        connection.negotiate(&[0]),
        Err(ProtocolError::ConnectionFailed(_))
    ));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert_eq!(board.reset_pulses(), 1);
}

#[test]
fn test_rejected_init_releases_transport() {
    let board = SimulatedBoard::new(Version::new(2, 0));
    board.answer_with(1, ResponseCode::BufferOverflow);
    let mut connection = Connection::new(board, quick_config());

    assert!(matches!(
        connection.negotiate(&[]),
        Err(ProtocolError::QueryRejected { code: 1 })
    ));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(!connection.is_connected());
    assert!(!connection.supports(Feature::OnboardParameters));
    assert!(connection.device().is_none());
    assert!(!connection.session().is_open());
}

#[test]
fn test_old_firmware_rejected() {
    let board = SimulatedBoard::new(Version::new(1, 0));
    let mut connection = Connection::new(board, quick_config());
    assert!(matches!(
        connection.negotiate(&[]),
        Err(ProtocolError::BadFirmwareVersion { .. })
    ));
}

#[test]
fn test_legacy_firmware_reads_without_timeout() {
    let board = SimulatedBoard::new(Version::new(1, 5));
    let mut connection = Connection::new(board.clone(), quick_config());
    connection.negotiate(&[]).unwrap();
    assert_eq!(board.timeout(), Some(None));
    assert!(connection.supports(Feature::UnboundedLatency));
}

#[test]
fn test_tool_probe_outcomes() {
    let board = SimulatedBoard::new(Version::new(2, 0))
        .with_tool(0, Version::new(2, 3))
        .with_unresponsive_tool(1);
    let mut connection = Connection::new(board, quick_config());
    let device = connection.negotiate(&[0, 1, 2]).unwrap();

    assert!(matches!(device.tools[&0], ToolProbe::Present { .. }));
    assert_eq!(device.tools[&1], ToolProbe::Unresponsive);
    assert_eq!(device.tools[&2], ToolProbe::Absent);
    assert_eq!(device.tool_versions().len(), 1);
}

#[test]
fn test_tool_eeprom_write_is_chunked() {
    let board = SimulatedBoard::new(Version::new(2, 0)).with_tool(0, Version::new(2, 3));
    let mut connection = Connection::new(board.clone(), quick_config());
    connection.negotiate(&[0]).unwrap();
    board.clear_log();

    let data: Vec<u8> = (0..25).collect();
    let eeprom = Eeprom::new(connection.session(), EepromTarget::Tool(0), 5);
    eeprom.write(0x40, &data).unwrap();

    let target = EepromTarget::Tool(0);
    assert_eq!(
        board.eeprom_writes(),
        vec![
            EepromWrite { target, offset: 0x40, len: 11 },
            EepromWrite { target, offset: 0x4B, len: 11 },
            EepromWrite { target, offset: 0x56, len: 3 },
        ]
    );
    assert_eq!(board.tool_eeprom(0, 0x40, 25), data);
}

#[test]
fn test_setpoint_query_gated_by_tool_version() {
    for (version, expect_query) in [(Version::new(2, 2), false), (Version::new(2, 3), true)] {
        let board = SimulatedBoard::new(Version::new(2, 0)).with_tool(0, version);
        board.set_tool_setpoint(0, 185);
        let mut driver = Driver::with_transport(board.clone(), quick_config(), MachineModel::default());
        driver.initialize().unwrap();
        board.clear_log();

        let setting = driver.temperature_setting().unwrap();
        let queried = board.requests().iter().any(|r| r.starts_with(&[10, 0, 32]));
        assert_eq!(queried, expect_query, "tool firmware v{version}");
        if expect_query {
            assert_eq!(setting, 185.0);
        }
    }
}

#[test]
fn test_build_to_file_then_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part.s3g");
    let board = SimulatedBoard::new(Version::new(2, 0));
    let mut driver = Driver::with_transport(board.clone(), quick_config(), MachineModel::default());
    driver.initialize().unwrap();
    board.clear_log();

    driver.begin_file_capture(&path).unwrap();
    driver.enable_drives().unwrap();
    driver.delay(1000).unwrap();
    assert!(driver.is_finished().unwrap());
    let bytes = driver.end_file_capture().unwrap();

    assert_eq!(bytes, 2 + 5);
    assert!(board.requests().is_empty());

    driver.delay(10).unwrap();
    assert_eq!(board.request_codes(), vec![133]);
}
