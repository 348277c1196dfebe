//! Command-line runner: load a model once, detect over one or more images,
//! print one JSON record per image.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser};
use log::{LevelFilter, debug, warn};
use yolokit_core::{DetectionSettings, YoloDetector, error_json};
use yolokit_utils::{AppSettings, configure_telemetry, init_logging, normalize_path};

/// Run object detection over image files.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct DetectArgs {
    /// Images to run detection on.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Path to the ONNX model. Overrides the settings file.
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Minimum confidence for a detection to be reported.
    #[arg(long)]
    conf_threshold: Option<f32>,

    /// IoU threshold for non-maximum suppression.
    #[arg(long)]
    iou_threshold: Option<f32>,

    /// Optional settings JSON (model path, thresholds, class names).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable telemetry timing logs for the pipeline stages.
    #[arg(long, action = ArgAction::SetTrue)]
    telemetry: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(all_succeeded) => {
            if all_succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let args = DetectArgs::parse();
    init_logging(LevelFilter::Warn)?;
    configure_telemetry(args.telemetry, LevelFilter::Debug);

    let settings = match &args.config {
        Some(path) => AppSettings::load_from_path(path)
            .with_context(|| format!("could not load settings from {}", path.display()))?,
        None => AppSettings::default(),
    };

    let model_path = args
        .model
        .clone()
        .or_else(|| settings.model_path.as_ref().map(PathBuf::from))
        .ok_or_else(|| anyhow!("no model given; pass --model or set model_path in --config"))?;
    let model_path = normalize_path(&model_path)
        .with_context(|| format!("could not load model {}", model_path.display()))?;

    let detection = DetectionSettings {
        conf_threshold: args
            .conf_threshold
            .unwrap_or(settings.detection.conf_threshold),
        iou_threshold: args
            .iou_threshold
            .unwrap_or(settings.detection.iou_threshold),
    };

    let mut detector = YoloDetector::load(&model_path)
        .with_context(|| format!("could not load model {}", model_path.display()))?;
    debug!(
        "loaded {} model, input {}x{}",
        detector.family().as_str(),
        detector.input_size().width,
        detector.input_size().height
    );

    if let Some(names) = settings.class_names.clone() {
        if names.is_empty() {
            warn!("ignoring empty class_names override in settings");
        } else {
            detector.set_class_names(names);
        }
    }

    let mut all_succeeded = true;
    for image in &args.images {
        match detector.detect_path(image, detection) {
            Ok(report) => println!("{}", report.to_json()),
            Err(err) => {
                all_succeeded = false;
                println!("{}", error_json(&err.to_string(), err.code()));
                warn!("{}: {err}", image.display());
            }
        }
    }

    Ok(all_succeeded)
}
