//! Configuration loading from files and environment overrides.

use b2b_dyno::config::{DynoConfig, GridConfig};
use b2b_dyno::error::DynoError;
use b2b_dyno::sequencer::{CaptureLength, GridMode};
use serial_test::serial;
use std::fs;
use std::time::Duration;

const TOML: &str = r#"
[controllers]
dut_port = "/dev/ttyACM0"
absorber_port = "/dev/ttyACM1"

[grid]
mode = "cross"
speeds_rpm = [1000, 2000]
currents_a = [1.0, 5.0]

[capture]
duration = "2s"
poll_interval = "250ms"
settling = "1s"

[ramp]
settling = "200ms"
max_speed_step_rpm = 500.0
max_current_step_a = 1.0

[log]
prefix = "bench"
"#;

const JSON: &str = r#"{
  "controllers": { "dut_port": "COM3", "absorber_port": "COM4" },
  "grid": {
    "mode": "paired",
    "speeds_rpm": [1000, 1500],
    "currents_a": [2.5, 3.0],
    "durations": ["1s", "3s"]
  },
  "capture": { "poll_interval": "500ms", "settling": "2s" },
  "ramp": { "settling": "100ms", "max_speed_step_rpm": 250, "max_current_step_a": 0.5 }
}"#;

#[test]
#[serial]
fn toml_file_loads_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dyno.toml");
    fs::write(&path, TOML).unwrap();

    let config = DynoConfig::load_from(&path).unwrap();
    let plan = config.validate().unwrap();

    assert_eq!(config.log.prefix, "bench");
    assert!(matches!(config.grid, GridConfig::Cross { .. }));
    assert_eq!(plan.total_points(), 4);
    assert_eq!(plan.stages[0].rpm, 1000.0);
    assert_eq!(
        plan.stages[0].points[0].capture,
        CaptureLength::Duration(Duration::from_secs(2))
    );
    assert_eq!(plan.stages[0].points[0].capture.iterations(plan.poll_interval), 8);
}

#[test]
#[serial]
fn json_file_is_detected_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dyno.json");
    fs::write(&path, JSON).unwrap();

    let plan = DynoConfig::load_from(&path).unwrap().validate().unwrap();

    assert_eq!(plan.mode, GridMode::Paired);
    assert_eq!(plan.stages.len(), 2);
    assert_eq!(plan.stages[1].points[0].current_a, 3.0);
    assert_eq!(plan.ramp.max_current_step.get(), 0.5);
}

#[test]
#[serial]
fn environment_overrides_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dyno.toml");
    fs::write(&path, TOML).unwrap();

    std::env::set_var("B2B_DYNO_CONTROLLERS__DUT_PORT", "/dev/ttyUSB7");
    std::env::set_var("B2B_DYNO_RAMP__MAX_CURRENT_STEP_A", "0.25");
    let loaded = DynoConfig::load_from(&path);
    std::env::remove_var("B2B_DYNO_CONTROLLERS__DUT_PORT");
    std::env::remove_var("B2B_DYNO_RAMP__MAX_CURRENT_STEP_A");

    let config = loaded.unwrap();
    assert_eq!(config.controllers.dut_port, "/dev/ttyUSB7");
    assert_eq!(config.ramp.max_current_step_a, 0.25);
}

#[test]
#[serial]
fn malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dyno.toml");
    fs::write(&path, TOML.replace("max_speed_step_rpm = 500.0", "max_speed_step_rpm = \"fast\"")).unwrap();

    assert!(matches!(
        DynoConfig::load_from(&path),
        Err(DynoError::Config(_))
    ));
}

#[test]
#[serial]
fn zero_step_bound_is_rejected_before_any_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dyno.toml");
    fs::write(&path, TOML.replace("max_current_step_a = 1.0", "max_current_step_a = 0")).unwrap();

    let err = DynoConfig::load_from(&path).unwrap().validate().unwrap_err();
    assert!(matches!(err, DynoError::InvalidRampStep(_)));
    assert!(err.is_startup_failure());
}

#[test]
#[serial]
fn shipped_sample_configs_are_valid() {
    for name in ["config/dyno.toml", "config/torque_speed_profile.toml"] {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(name);
        let config = DynoConfig::load_from(&path).unwrap();
        assert!(config.validate().is_ok(), "{name} should validate");
    }
}
