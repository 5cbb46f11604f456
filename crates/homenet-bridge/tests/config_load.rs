//! Configuration loading from disk.

use std::io::Write;

use homenet_bridge::config::{BridgeConfig, ConfigError};

const SAMPLE: &str = r#"
homenet_bridge:
  serial: {host: 192.168.1.10, port: 8899}
  packet_defaults:
    rx_length: 4
    rx_checksum: samsung_rx
    rx_timeout_ms: 50
    tx_header: [0xF7]
    tx_checksum: add
  light:
    - id: living_light
      name: Living room
      state: {offset: 0, data: [0x31]}
      state_on: {offset: 1, data: [0x01]}
      state_off: {offset: 1, data: [0x00]}
      command_on: {data: [0x31, 0x01]}
      command_off: {data: [0x31, 0x00]}
  climate:
    - id: bedroom_ac
      state: {data: [0x80, 0x00, 0x04], mask: [0xF9, 0x00, 0xFF]}
      state_off: {offset: 1, data: [0x80]}
      state_temperature_current: {offset: 3, decode: bcd}
      command_temperature: {data: [0x80, 0x00], value_offset: 1, decode: bcd}
  automation:
    - id: heartbeat
      mode: single
      trigger: [{time: {interval: "5m"}}]
      then: [{send_packet: {data: [0x0F, 0x01]}}]
  scripts:
    crc_helper: "bitAnd(data[0], 0x0F)"
"#;

#[test]
fn loads_a_full_config_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.serial.host.as_deref(), Some("192.168.1.10"));
    assert_eq!(config.packet_defaults.rx_timeout_ms(), 50);

    let registry = config.build_registry().unwrap();
    assert_eq!(registry.len(), 2);
    let light = registry.get("living_light").unwrap();
    assert_eq!(light.name, "Living room");
    assert_eq!(light.commands.len(), 2);

    assert_eq!(config.automation.len(), 1);
    assert_eq!(config.scripts.len(), 1);
}

#[test]
fn missing_file_is_an_io_error() {
    let err = BridgeConfig::load(std::path::Path::new("/nonexistent/homenet.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn dump_round_trips_through_the_loader() {
    let config = BridgeConfig::from_yaml(SAMPLE).unwrap();
    let dumped = config.dump().unwrap();
    // Bytes come back out in hex.
    assert!(dumped.contains("0x31"), "{dumped}");
    assert!(dumped.contains("0xF7"), "{dumped}");

    let reloaded = BridgeConfig::from_yaml(&dumped).unwrap();
    let registry = reloaded.build_registry().unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry.get("living_light").unwrap().commands,
        config.build_registry().unwrap().get("living_light").unwrap().commands
    );
}
