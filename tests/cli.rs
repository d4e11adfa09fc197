use std::fs;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn cli() -> Command {
    Command::cargo_bin("vpu-pipeline").expect("binary present")
}

#[test]
fn synth_then_decode_h264_writes_one_record_per_frame() {
    let temp = tempdir().unwrap();
    let stream = temp.path().join("clip.h264");
    let frames_out = temp.path().join("out/frames.jsonl");
    let metrics = temp.path().join("out/metrics.json");

    cli()
        .args(["synth", stream.to_str().unwrap(), "--format", "h264", "--frames", "12"])
        .assert()
        .success();
    assert!(stream.is_file());

    cli()
        .args([
            "decode",
            stream.to_str().unwrap(),
            "--frames-out",
            frames_out.to_str().unwrap(),
            "--metrics-json",
            metrics.to_str().unwrap(),
        ])
        .assert()
        .success();

    let log = fs::read_to_string(&frames_out).unwrap();
    let records: Vec<Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 12);
    assert_eq!(records[0]["keyframe"], Value::Bool(true));
    assert_eq!(records[0]["outputs"][0]["width"], Value::from(352));

    let snapshot: Value = serde_json::from_str(&fs::read_to_string(&metrics).unwrap()).unwrap();
    assert_eq!(snapshot["frames_published"], Value::from(12));
    assert_eq!(snapshot["frames_returned"], Value::from(12));
}

#[test]
fn decode_vp9_ivf_prints_frames_to_stdout() {
    let temp = tempdir().unwrap();
    let stream = temp.path().join("clip.ivf");

    cli()
        .args([
            "synth",
            stream.to_str().unwrap(),
            "--format",
            "vp9",
            "--frames",
            "5",
            "--width",
            "320",
            "--height",
            "240",
            "--bit-depth",
            "10",
        ])
        .assert()
        .success();

    let output = cli()
        .args(["decode", stream.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let pts: Vec<i64> = stdout
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .map(|record| record["timestamp"]["pts"].as_i64().unwrap())
        .collect();
    assert_eq!(pts, vec![0, 1, 2, 3, 4]);
}

#[test]
fn decode_applies_session_config_and_prometheus_output() {
    let temp = tempdir().unwrap();
    let stream = temp.path().join("clip.bin");
    let config = temp.path().join("session.yaml");
    let prometheus = temp.path().join("metrics.prom");
    fs::write(&config, "format: hevc\npicture_limit: 4\n").unwrap();

    cli()
        .args(["synth", stream.to_str().unwrap(), "--format", "hevc", "--frames", "8"])
        .assert()
        .success();

    let output = cli()
        .args([
            "decode",
            stream.to_str().unwrap(),
            "--config",
            config.to_str().unwrap(),
            "--metrics-prometheus",
            prometheus.to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap().lines().count(), 4);
    let text = fs::read_to_string(&prometheus).unwrap();
    assert!(text.contains("vpu_pictures_decoded_total 4"), "{text}");
}

#[test]
fn decode_without_known_format_fails() {
    let temp = tempdir().unwrap();
    let stream = temp.path().join("clip.bin");
    fs::write(&stream, [0u8, 0, 0, 1, 0x09, 0x10]).unwrap();

    cli()
        .args(["decode", stream.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn validate_command_reports_errors() {
    let temp = tempdir().unwrap();
    let good = temp.path().join("good.yaml");
    let bad = temp.path().join("bad.yaml");
    fs::write(&good, "format: h264\n").unwrap();
    fs::write(&bad, "format: h264\nstream_buffers: 0\n").unwrap();

    cli()
        .args(["validate", good.to_str().unwrap()])
        .assert()
        .success();
    cli()
        .args(["validate", bad.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn list_formats_names_every_codec() {
    let output = cli().arg("list-formats").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for format in ["h264", "hevc", "vp9"] {
        assert!(stdout.contains(format), "{stdout}");
    }
}
