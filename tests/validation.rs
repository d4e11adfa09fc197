use std::fs;
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use vpu_pipeline::accel::CodecFormat;
use vpu_pipeline::config::SessionConfig;
use vpu_pipeline::validation::validate_config;

fn write_config(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn yaml_config_round_trips_through_validation() {
    let temp = tempdir().unwrap();
    let path = write_config(
        temp.path(),
        "session.yaml",
        r#"
format: vp9
stream_buffers: 4
stream_buffer_size: 262144
timestamp_depth: 16
picture_limit: 120
buffer_margin:
  extra: 3
  include_frames_delay: false
max_frames_delay: 2
outputs:
  - {}
  - width: 640
    height: 360
    bit_depth: 8
model:
  dpb_size: 8
  fault_after_pictures: 10
  fault: system-error
"#,
    );

    let config = SessionConfig::load(&path).unwrap();
    assert_eq!(config.format, CodecFormat::Vp9);
    assert_eq!(config.stream_buffers, 4);
    assert_eq!(config.picture_limit, Some(120));
    assert_eq!(config.buffer_margin(), 3);
    assert_eq!(config.outputs.len(), 2);

    let report = validate_config(&config);
    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn validation_rejects_buffer_budget_over_cap() {
    let temp = tempdir().unwrap();
    let path = write_config(
        temp.path(),
        "greedy.yaml",
        "format: h264\nmax_frames_delay: 10\nmodel:\n  dpb_size: 60\n",
    );
    let config = SessionConfig::load(&path).unwrap();
    let report = validate_config(&config);
    assert!(!report.is_ok());
    assert!(
        report
            .errors
            .iter()
            .any(|error| error.contains("exceeds the 64 buffer cap")),
        "{:?}",
        report.errors
    );
}

#[test]
fn validation_reports_output_problems_by_index() {
    let mut config = SessionConfig::new(CodecFormat::Hevc);
    config.outputs = serde_yaml::from_str(
        "- {}\n- width: 0\n  height: 0\n- width: 320\n- enabled: false\n  bit_depth: 12\n",
    )
    .unwrap();
    let report = validate_config(&config);
    assert_eq!(report.errors, vec!["Output 1: scaled size must be non-zero"]);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].starts_with("Output 2"));
}

#[test]
fn unknown_format_fails_to_load() {
    let temp = tempdir().unwrap();
    let path = write_config(temp.path(), "bad.yaml", "format: av1\n");
    let err = SessionConfig::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse session config YAML"));
}
