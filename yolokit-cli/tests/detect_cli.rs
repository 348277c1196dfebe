//! Process-level tests that do not require a model file.

use std::error::Error;
use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn fails_without_images() {
    let output = cargo_bin_cmd!("yolokit").output().expect("run binary");
    assert!(!output.status.success());
}

#[test]
fn missing_model_is_reported() -> Result<(), Box<dyn Error>> {
    let output = cargo_bin_cmd!("yolokit")
        .args(["--model", "/no/such/model.onnx", "image.jpg"])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("could not load model"),
        "unexpected stderr: {stderr}"
    );
    Ok(())
}

#[test]
fn model_is_required_from_flag_or_config() -> Result<(), Box<dyn Error>> {
    let output = cargo_bin_cmd!("yolokit").arg("image.jpg").output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no model given"), "unexpected stderr: {stderr}");
    Ok(())
}

#[test]
fn unreadable_config_is_an_error() -> Result<(), Box<dyn Error>> {
    let mut config = tempfile::NamedTempFile::new()?;
    config.write_all(b"{ this is not json")?;

    let output = cargo_bin_cmd!("yolokit")
        .arg("--config")
        .arg(config.path())
        .arg("image.jpg")
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("could not load settings"),
        "unexpected stderr: {stderr}"
    );
    Ok(())
}
