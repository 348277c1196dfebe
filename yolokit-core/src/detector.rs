//! High-level detection runner coupling ingress, preprocessing, inference,
//! and decoding behind one handle.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use log::{Level, debug};
use thiserror::Error;

use crate::classes::default_class_names;
use crate::frame::{BgrFrame, YuvPlanes};
use crate::model::{DetectionModel, ModelFamily};
use crate::postprocess::{GridTable, PostprocessParams, apply_postprocess};
use crate::preprocess::{InputSize, preprocess_frame, resize_ratio};
use crate::report::{DetectionReport, ErrorCode};
use yolokit_utils::{DetectionSettings, timing_guard};

/// A detection call failure, tagged for the host-facing error record.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Could not load image: {0}")]
    ImageLoad(anyhow::Error),
    #[error("Preprocessing failed: {0}")]
    Preprocess(anyhow::Error),
    #[error("Inference failed: {0}")]
    Runtime(anyhow::Error),
}

impl DetectError {
    /// The symbolic tag carried by the serialized error record.
    pub fn code(&self) -> ErrorCode {
        match self {
            DetectError::ImageLoad(_) => ErrorCode::ImageLoadFailed,
            DetectError::Preprocess(_) => ErrorCode::PreprocessError,
            DetectError::Runtime(_) => ErrorCode::RuntimeError,
        }
    }
}

/// One loaded model plus everything needed to turn pixels into detections.
///
/// A detector is fully initialized by construction; dropping it releases the
/// underlying session. One call runs at a time per handle (`&mut self`); the
/// graph runtime parallelizes internally but never calls back into this
/// type.
#[derive(Debug)]
pub struct YoloDetector {
    model: DetectionModel,
    grid: Option<GridTable>,
    class_names: Vec<String>,
    num_classes: usize,
}

impl YoloDetector {
    /// Load a model file and prepare the decoding tables for its family.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model = DetectionModel::load(model_path)?;

        // The stride grid only exists for YOLOX; building it also rejects
        // input resolutions the strides cannot tile.
        let grid = match model.family() {
            ModelFamily::Yolox => Some(GridTable::build(model.input_size())?),
            _ => None,
        };

        let num_classes = model.num_classes();
        Ok(Self {
            model,
            grid,
            class_names: default_class_names(),
            num_classes,
        })
    }

    pub fn family(&self) -> ModelFamily {
        self.model.family()
    }

    pub fn input_size(&self) -> InputSize {
        self.model.input_size()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Replace the class vocabulary. The class count follows the new list
    /// and is never re-derived from the graph afterwards.
    pub fn set_class_names(&mut self, names: Vec<String>) {
        self.num_classes = names.len();
        self.class_names = names;
    }

    /// Detect objects in an image file.
    pub fn detect_path<P: AsRef<Path>>(
        &mut self,
        path: P,
        settings: DetectionSettings,
    ) -> Result<DetectionReport, DetectError> {
        let started = Instant::now();
        let frame = BgrFrame::from_path(path).map_err(DetectError::ImageLoad)?;
        self.detect_frame(&frame, settings, started)
    }

    /// Detect objects in a packed BGRA buffer (alpha ignored).
    pub fn detect_bgra(
        &mut self,
        bgra: &[u8],
        width: u32,
        height: u32,
        stride: usize,
        settings: DetectionSettings,
    ) -> Result<DetectionReport, DetectError> {
        let started = Instant::now();
        let frame =
            BgrFrame::from_bgra(bgra, width, height, stride).map_err(DetectError::Preprocess)?;
        self.detect_frame(&frame, settings, started)
    }

    /// Detect objects in a tri-planar YUV 4:2:0 frame, rotating the image
    /// clockwise first. Reported dimensions are post-rotation.
    pub fn detect_yuv(
        &mut self,
        planes: &YuvPlanes<'_>,
        width: u32,
        height: u32,
        rotation: i32,
        settings: DetectionSettings,
    ) -> Result<DetectionReport, DetectError> {
        let started = Instant::now();
        let frame =
            BgrFrame::from_yuv(planes, width, height, rotation).map_err(DetectError::Preprocess)?;
        self.detect_frame(&frame, settings, started)
    }

    /// Run the pipeline on an ingested frame. `started` anchors the
    /// wall-clock measurement at ingress, before any conversion work.
    fn detect_frame(
        &mut self,
        frame: &BgrFrame,
        settings: DetectionSettings,
        started: Instant,
    ) -> Result<DetectionReport, DetectError> {
        let family = self.model.family();
        let input = self.model.input_size();

        let prep = {
            let _guard = timing_guard("yolokit::preprocess", Level::Debug);
            preprocess_frame(frame, input, family).map_err(DetectError::Preprocess)?
        };

        let ratio = resize_ratio(prep.original_size, input);
        let (output, shape) = {
            let _guard = timing_guard("yolokit::inference", Level::Debug);
            self.model
                .run(prep.tensor, ratio)
                .map_err(DetectError::Runtime)?
        };

        let params = PostprocessParams {
            conf_threshold: settings.conf_threshold,
            iou_threshold: settings.iou_threshold,
            class_names: &self.class_names,
            num_classes: self.num_classes,
            original_size: prep.original_size,
            scale: prep.scale,
            pad_x: prep.pad_x,
            pad_y: prep.pad_y,
        };
        let detections = {
            let _guard = timing_guard("yolokit::postprocess", Level::Debug);
            apply_postprocess(family, self.grid.as_ref(), &output, &shape, &params)
                .map_err(DetectError::Runtime)?
        };

        let inference_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            "{} detections in {} ms ({}x{} frame)",
            detections.len(),
            inference_time_ms,
            frame.width(),
            frame.height()
        );

        Ok(DetectionReport {
            detections,
            inference_time_ms,
            image_width: frame.width(),
            image_height: frame.height(),
        })
    }
}
