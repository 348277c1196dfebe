//! Core object-detection primitives.
//!
//! This crate loads YOLO-family ONNX models, runs inference through `ort`,
//! and converts raw output tensors into calibrated detections in the
//! original image frame. Supported families are YOLOX (grid-decoded with
//! objectness), YOLOv8 (anchor-free, no objectness), and PP-YOLOE (decoded
//! and suppressed in-graph); the family is identified automatically from
//! graph metadata at load time.

/// Default object-class vocabulary.
pub mod classes;
/// High-level detection runner.
pub mod detector;
/// Image ingress into BGR frames.
pub mod frame;
/// Model loading, family identification, and graph execution.
pub mod model;
/// Detection decoding and non-maximum suppression.
pub mod postprocess;
/// Image pre-processing into NCHW tensors.
pub mod preprocess;
/// Result serialization.
pub mod report;

pub use classes::{COCO_CLASSES, default_class_names};
pub use detector::{DetectError, YoloDetector};
pub use frame::{BgrFrame, YuvPlanes};
pub use model::{DetectionModel, ModelFamily};
pub use postprocess::{Detection, GridTable, PostprocessParams, apply_postprocess, nms};
pub use preprocess::{InputSize, PreprocessOutput, preprocess_frame, resize_ratio};
pub use report::{DetectionReport, ErrorCode, error_json};
pub use yolokit_utils::DetectionSettings;

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
