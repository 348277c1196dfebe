//! ONNX model loading, family identification, and graph execution.
//!
//! A [`DetectionModel`] owns the runtime session for one model file. The
//! model family is identified once, at load time, from graph metadata: a
//! `scale_factor`-style input marks PP-YOLOE, otherwise the first output's
//! feature dimension separates YOLOX (4 + 1 + classes) from YOLOv8
//! (4 + classes). Hardware execution providers are attempted per platform
//! and failure to enable one silently degrades to CPU.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use ndarray::Array4;
use ort::execution_providers::ExecutionProviderDispatch;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::{Tensor, ValueType};

use crate::preprocess::InputSize;

/// Output-tensor layout family of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Anchor-free with objectness; rows are grid-relative and need
    /// stride/grid reconstruction.
    Yolox,
    /// Anchor-free without objectness; rows are absolute letterbox-space
    /// center/size boxes.
    Yolov8,
    /// Decoded in-graph (including NMS); rows are finished detections.
    PpYoloe,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Yolox => "yolox",
            ModelFamily::Yolov8 => "yolov8",
            ModelFamily::PpYoloe => "pp-yoloe",
        }
    }
}

/// Default class count when the graph does not pin one down.
const DEFAULT_NUM_CLASSES: usize = 80;

/// Wrapper around one runtime session plus the metadata read at load time.
pub struct DetectionModel {
    session: Session,
    family: ModelFamily,
    input_size: InputSize,
    num_classes: usize,
    input_names: Vec<String>,
    output_names: Vec<String>,
    /// `(image_idx, scale_idx)` for PP-YOLOE's two inputs.
    ppyoloe_inputs: Option<(usize, usize)>,
}

impl std::fmt::Debug for DetectionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionModel")
            .field("family", &self.family)
            .field("input_size", &self.input_size)
            .field("num_classes", &self.num_classes)
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .finish_non_exhaustive()
    }
}

impl DetectionModel {
    /// Load a serialized graph and identify its family and input resolution.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let path = model_path.as_ref();
        anyhow::ensure!(path.exists(), "model file not found: {}", path.display());

        ort::init().with_name("yolokit").commit()?;
        let session = build_session(path)?;

        let mut input_size = InputSize::default();
        let mut has_scale_input = false;
        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();

        for input in &session.inputs {
            if input.name.contains("scale") {
                has_scale_input = true;
                continue;
            }
            if let ValueType::Tensor { shape, .. } = &input.input_type {
                if shape.len() == 4 {
                    if shape[2] > 0 {
                        input_size.height = shape[2] as u32;
                    }
                    if shape[3] > 0 {
                        input_size.width = shape[3] as u32;
                    }
                }
            }
        }

        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        let (family, num_classes) = if has_scale_input {
            (ModelFamily::PpYoloe, DEFAULT_NUM_CLASSES)
        } else {
            let dims = session.outputs.first().and_then(|output| {
                if let ValueType::Tensor { shape, .. } = &output.output_type {
                    Some(output_dims(shape))
                } else {
                    None
                }
            });
            match dims {
                Some((d1, d2)) => classify_output(d1, d2),
                None => (ModelFamily::Yolox, DEFAULT_NUM_CLASSES),
            }
        };

        let ppyoloe_inputs = if family == ModelFamily::PpYoloe && input_names.len() >= 2 {
            Some(locate_ppyoloe_inputs(&input_names))
        } else {
            None
        };

        debug!(
            "model {} identified as {} ({} classes, input {}x{})",
            path.display(),
            family.as_str(),
            num_classes,
            input_size.width,
            input_size.height
        );

        Ok(Self {
            session,
            family,
            input_size,
            num_classes,
            input_names,
            output_names,
            ppyoloe_inputs,
        })
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn input_size(&self) -> InputSize {
        self.input_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Execute the graph on a preprocessed `[1, 3, H, W]` tensor and return
    /// the first output flattened together with its shape.
    ///
    /// `resize_ratio` is `(input_h / orig_h, input_w / orig_w)`; it is wired
    /// into PP-YOLOE's `scale_factor` input and ignored by the other
    /// families. Its backing tensor stays alive in this scope for the whole
    /// run.
    pub fn run(
        &mut self,
        tensor: Array4<f32>,
        resize_ratio: [f32; 2],
    ) -> Result<(Vec<f32>, Vec<usize>)> {
        let image = Tensor::from_array(tensor)?;

        let outputs = if let Some((image_idx, scale_idx)) = self.ppyoloe_inputs {
            let scale = Tensor::from_array(([1usize, 2], resize_ratio.to_vec()))?;
            let image_name = self.input_names[image_idx].clone();
            let scale_name = self.input_names[scale_idx].clone();
            self.session
                .run(ort::inputs![image_name => image, scale_name => scale])?
        } else {
            let name = self.input_names[0].clone();
            self.session.run(ort::inputs![name => image])?
        };

        let view = outputs[0].try_extract_array::<f32>()?;
        let shape = view.shape().to_vec();
        let data: Vec<f32> = view.iter().copied().collect();
        Ok((data, shape))
    }
}

/// Build a session, preferring the platform accelerator and falling back to
/// CPU when registration or loading with it fails.
fn build_session(path: &Path) -> Result<Session> {
    let accelerators = platform_execution_providers();
    if !accelerators.is_empty() {
        match session_with_providers(path, accelerators) {
            Ok(session) => return Ok(session),
            Err(err) => {
                warn!("accelerated execution provider unavailable ({err}); using CPU");
            }
        }
    }
    session_with_providers(path, Vec::new())
        .with_context(|| format!("failed to load model from {}", path.display()))
}

fn session_with_providers(
    path: &Path,
    providers: Vec<ExecutionProviderDispatch>,
) -> Result<Session> {
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .with_inter_threads(2)?;
    if !providers.is_empty() {
        builder = builder.with_execution_providers(providers)?;
    }
    Ok(builder.commit_from_file(path)?)
}

#[cfg(target_os = "android")]
fn platform_execution_providers() -> Vec<ExecutionProviderDispatch> {
    use ort::execution_providers::NNAPIExecutionProvider;
    vec![NNAPIExecutionProvider::default().build()]
}

#[cfg(target_vendor = "apple")]
fn platform_execution_providers() -> Vec<ExecutionProviderDispatch> {
    use ort::execution_providers::CoreMLExecutionProvider;
    vec![CoreMLExecutionProvider::default().build()]
}

#[cfg(target_os = "windows")]
fn platform_execution_providers() -> Vec<ExecutionProviderDispatch> {
    use ort::execution_providers::DirectMLExecutionProvider;
    vec![DirectMLExecutionProvider::default().build()]
}

#[cfg(not(any(target_os = "android", target_vendor = "apple", target_os = "windows")))]
fn platform_execution_providers() -> Vec<ExecutionProviderDispatch> {
    Vec::new()
}

/// The two non-batch dims of an output shape (`-1` marks a dynamic dim).
fn output_dims(shape: &[i64]) -> (i64, i64) {
    match shape.len() {
        0 => (0, 0),
        1 => (shape[0], 0),
        2 => (shape[0], shape[1]),
        _ => (shape[1], shape[2]),
    }
}

/// Classify a model by its first output's non-batch dimensions.
fn classify_output(d1: i64, d2: i64) -> (ModelFamily, usize) {
    if d1 == 6 || d2 == 6 {
        (ModelFamily::PpYoloe, DEFAULT_NUM_CLASSES)
    } else if d1 == 85 || d2 == 85 {
        (ModelFamily::Yolox, DEFAULT_NUM_CLASSES)
    } else if d1 == 84 || d2 == 84 {
        (ModelFamily::Yolov8, DEFAULT_NUM_CLASSES)
    } else {
        let features = d1.min(d2);
        if features > 5 {
            (ModelFamily::Yolox, (features - 5) as usize)
        } else if features >= 4 {
            (ModelFamily::Yolov8, (features - 4) as usize)
        } else {
            (ModelFamily::Yolox, DEFAULT_NUM_CLASSES)
        }
    }
}

/// Find the image and scale input positions by name substring, defaulting to
/// `{image = 1, scale = 0}` when neither matches.
fn locate_ppyoloe_inputs(input_names: &[String]) -> (usize, usize) {
    let mut image_idx = None;
    let mut scale_idx = None;
    for (i, name) in input_names.iter().enumerate() {
        if name.contains("image") {
            image_idx = Some(i);
        } else if name.contains("scale") {
            scale_idx = Some(i);
        }
    }
    (image_idx.unwrap_or(1), scale_idx.unwrap_or(0))
}
