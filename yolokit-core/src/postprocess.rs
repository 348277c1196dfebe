//! Detection post-processing: raw output tensors to calibrated boxes in the
//! original image frame.
//!
//! Each model family encodes its predictions differently. YOLOX rows carry
//! grid-relative offsets plus an objectness score and must be reconstructed
//! against the stride grid; YOLOv8 rows carry absolute letterbox-space
//! center/size values and per-class scores only; PP-YOLOE performs decoding
//! and NMS inside the graph and emits finished `(class_id, score, x1, y1,
//! x2, y2)` rows. The first two run through per-class greedy NMS here.

use std::cmp::Ordering;

use anyhow::Result;

use crate::model::ModelFamily;
use crate::preprocess::InputSize;

/// Strides of the YOLOX detection heads, in table order.
const YOLOX_STRIDES: [u32; 3] = [8, 16, 32];

/// A single detection in original-image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Detection {
    /// Intersection over union with another box; zero when the union is empty.
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let area_a = (self.x2 - self.x1) * (self.y2 - self.y1);
        let area_b = (other.x2 - other.x1) * (other.y2 - other.y1);
        let union = area_a + area_b - intersection;

        if union > 0.0 { intersection / union } else { 0.0 }
    }
}

/// Everything the decoders need besides the output tensor itself.
#[derive(Debug)]
pub struct PostprocessParams<'a> {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub class_names: &'a [String],
    pub num_classes: usize,
    pub original_size: (u32, u32),
    /// Letterbox mapping produced by preprocessing (unused for PP-YOLOE).
    pub scale: f32,
    pub pad_x: i32,
    pub pad_y: i32,
}

/// Precomputed `(grid_x, grid_y, stride)` table for YOLOX decoding.
///
/// Enumeration order is load-bearing: stride outermost, then grid rows, then
/// grid columns, matching the concatenation order of the model's heads.
#[derive(Debug, Clone)]
pub struct GridTable {
    cells: Vec<(f32, f32, f32)>,
}

impl GridTable {
    /// Build the table for an input resolution. Both dimensions must tile
    /// evenly by every stride, i.e. be multiples of 32.
    pub fn build(input: InputSize) -> Result<Self> {
        anyhow::ensure!(
            input.width % 32 == 0 && input.height % 32 == 0,
            "input resolution {}x{} is not a multiple of 32",
            input.width,
            input.height
        );

        let mut cells = Vec::new();
        for stride in YOLOX_STRIDES {
            let cols = input.width / stride;
            let rows = input.height / stride;
            for gy in 0..rows {
                for gx in 0..cols {
                    cells.push((gx as f32, gy as f32, stride as f32));
                }
            }
        }
        Ok(Self { cells })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Decode an output tensor into final detections, applying NMS where the
/// family requires it.
///
/// `output` is the flattened first output of the graph and `shape` its
/// dimensions as reported by the runtime.
pub fn apply_postprocess(
    family: ModelFamily,
    grid: Option<&GridTable>,
    output: &[f32],
    shape: &[usize],
    params: &PostprocessParams<'_>,
) -> Result<Vec<Detection>> {
    let (d1, d2) = non_batch_dims(shape, output.len());

    match family {
        ModelFamily::PpYoloe => decode_ppyoloe(output, shape, d1, d2, params),
        ModelFamily::Yolox => {
            let grid =
                grid.ok_or_else(|| anyhow::anyhow!("missing grid table for YOLOX decode"))?;
            let mut candidates = decode_yolox(output, d1, d2, grid, params)?;
            Ok(nms(&mut candidates, params.iou_threshold))
        }
        ModelFamily::Yolov8 => {
            let mut candidates = decode_yolov8(output, d1, d2, params);
            Ok(nms(&mut candidates, params.iou_threshold))
        }
    }
}

/// The two non-batch dimensions of an output shape.
fn non_batch_dims(shape: &[usize], element_count: usize) -> (usize, usize) {
    match shape.len() {
        0 => (0, 0),
        1 => (element_count, 0),
        2 => (shape[0], shape[1]),
        _ => (shape[1], shape[2]),
    }
}

/// YOLOX: `(N, 4 + 1 + num_classes)` rows of grid-relative offsets with an
/// explicit objectness score.
fn decode_yolox(
    output: &[f32],
    d1: usize,
    d2: usize,
    grid: &GridTable,
    params: &PostprocessParams<'_>,
) -> Result<Vec<Detection>> {
    let num_boxes = d1;
    let features = d2;
    anyhow::ensure!(features >= 6, "YOLOX output has {} features per row", features);
    anyhow::ensure!(
        num_boxes <= grid.cells.len(),
        "output rows ({}) exceed grid table ({}); input resolution mismatch",
        num_boxes,
        grid.cells.len()
    );
    anyhow::ensure!(output.len() >= num_boxes * features, "output tensor too short");

    let class_count = params.num_classes.min(features - 5);
    let mut detections = Vec::new();

    for (i, &(grid_x, grid_y, stride)) in grid.cells.iter().take(num_boxes).enumerate() {
        let row = &output[i * features..(i + 1) * features];

        let objectness = row[4];
        if objectness < params.conf_threshold {
            continue;
        }

        let (max_class, max_class_score) = argmax(&row[5..5 + class_count]);
        let confidence = objectness * max_class_score;
        if !confidence.is_finite() || confidence < params.conf_threshold {
            continue;
        }

        let cx = (row[0] + grid_x) * stride;
        let cy = (row[1] + grid_y) * stride;
        let w = row[2].exp() * stride;
        let h = row[3].exp() * stride;

        if let Some(det) = project_letterbox_box(
            cx,
            cy,
            w,
            h,
            confidence,
            max_class as u32,
            params,
        ) {
            detections.push(det);
        }
    }

    Ok(detections)
}

/// YOLOv8: `(N, 4 + num_classes)` or its transpose; absolute letterbox-space
/// center/size, no objectness.
fn decode_yolov8(
    output: &[f32],
    d1: usize,
    d2: usize,
    params: &PostprocessParams<'_>,
) -> Vec<Detection> {
    // Boxes outnumber features in every real model; pick the layout so that
    // the larger dimension is the box count.
    let row_major = d1 > d2;
    let num_boxes = d1.max(d2);
    let features = d1.min(d2);
    let mut detections = Vec::new();
    if features < 5 || output.len() < num_boxes * features {
        return detections;
    }
    let class_count = features - 4;

    let at = |feature: usize, i: usize| -> f32 {
        if row_major {
            output[i * features + feature]
        } else {
            output[feature * num_boxes + i]
        }
    };

    for i in 0..num_boxes {
        let mut max_score = 0.0f32;
        let mut max_class = 0usize;
        for c in 0..class_count {
            let score = at(4 + c, i);
            if score > max_score {
                max_score = score;
                max_class = c;
            }
        }
        if !max_score.is_finite() || max_score < params.conf_threshold {
            continue;
        }

        let cx = at(0, i);
        let cy = at(1, i);
        let w = at(2, i);
        let h = at(3, i);

        if let Some(det) =
            project_letterbox_box(cx, cy, w, h, max_score, max_class as u32, params)
        {
            detections.push(det);
        }
    }

    detections
}

/// PP-YOLOE: finished `(class_id, score, x1, y1, x2, y2)` rows, already in
/// original-image coordinates because the graph consumed the resize ratio.
/// No NMS; the graph applied it.
fn decode_ppyoloe(
    output: &[f32],
    shape: &[usize],
    d1: usize,
    d2: usize,
    params: &PostprocessParams<'_>,
) -> Result<Vec<Detection>> {
    let num_detections = if shape.len() == 2 {
        if d2 == 6 {
            d1
        } else if d1 == 6 {
            d2
        } else {
            output.len() / 6
        }
    } else if shape.len() >= 3 {
        if d2 == 6 && d1 > 0 {
            d1
        } else if d1 == 6 {
            d2.max(output.len() / 6)
        } else {
            output.len() / 6
        }
    } else {
        output.len() / 6
    };

    let mut detections = Vec::new();
    if num_detections == 0 {
        return Ok(detections);
    }
    anyhow::ensure!(output.len() >= num_detections * 6, "output tensor too short");

    let (orig_w, orig_h) = params.original_size;
    for row in output.chunks_exact(6).take(num_detections) {
        let score = row[1];
        if !score.is_finite() || score < params.conf_threshold {
            continue;
        }
        if row[0] < 0.0 || !row[0].is_finite() {
            continue;
        }
        let class_id = row[0] as u32;

        let (x1, x2) = ordered_clamped(row[2], row[4], orig_w as f32);
        let (y1, y2) = ordered_clamped(row[3], row[5], orig_h as f32);
        if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            continue;
        }

        detections.push(Detection {
            class_id,
            class_name: class_label(params.class_names, class_id),
            confidence: score,
            x1,
            y1,
            x2,
            y2,
        });
    }

    Ok(detections)
}

/// Undo the letterbox transform for a center/size box and clamp it to the
/// original frame. Returns `None` for non-finite candidates.
fn project_letterbox_box(
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    confidence: f32,
    class_id: u32,
    params: &PostprocessParams<'_>,
) -> Option<Detection> {
    let (orig_w, orig_h) = params.original_size;
    let pad_x = params.pad_x as f32;
    let pad_y = params.pad_y as f32;

    let x1 = (cx - w / 2.0 - pad_x) / params.scale;
    let y1 = (cy - h / 2.0 - pad_y) / params.scale;
    let x2 = (cx + w / 2.0 - pad_x) / params.scale;
    let y2 = (cy + h / 2.0 - pad_y) / params.scale;

    let (x1, x2) = ordered_clamped(x1, x2, orig_w as f32);
    let (y1, y2) = ordered_clamped(y1, y2, orig_h as f32);
    if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
        return None;
    }

    Some(Detection {
        class_id,
        class_name: class_label(params.class_names, class_id),
        confidence,
        x1,
        y1,
        x2,
        y2,
    })
}

fn ordered_clamped(a: f32, b: f32, upper: f32) -> (f32, f32) {
    let lo = a.min(b).clamp(0.0, upper);
    let hi = a.max(b).clamp(0.0, upper);
    (lo, hi)
}

fn class_label(names: &[String], class_id: u32) -> String {
    names
        .get(class_id as usize)
        .cloned()
        .unwrap_or_else(|| format!("class_{class_id}"))
}

fn argmax(scores: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_score = 0.0f32;
    for (idx, &score) in scores.iter().enumerate() {
        if score > best_score {
            best_score = score;
            best = idx;
        }
    }
    (best, best_score)
}

/// Greedy per-class non-maximum suppression.
///
/// Candidates are sorted by descending confidence (ties keep their original
/// order); each survivor suppresses every later candidate of the same class
/// whose IoU with it exceeds the threshold. Survivors are returned in walk
/// order.
pub fn nms(candidates: &mut Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut suppressed = vec![false; candidates.len()];
    let mut survivors = Vec::new();

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[j].class_id != candidates[i].class_id {
                continue;
            }
            if candidates[i].iou(&candidates[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
        survivors.push(candidates[i].clone());
    }

    survivors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["cat".to_string(), "dog".to_string()]
    }

    fn params<'a>(
        class_names: &'a [String],
        conf: f32,
        iou: f32,
        original: (u32, u32),
        scale: f32,
        pad_x: i32,
        pad_y: i32,
    ) -> PostprocessParams<'a> {
        PostprocessParams {
            conf_threshold: conf,
            iou_threshold: iou,
            class_names,
            num_classes: class_names.len(),
            original_size: original,
            scale,
            pad_x,
            pad_y,
        }
    }

    fn det(class_id: u32, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id,
            class_name: format!("class_{class_id}"),
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn grid_table_covers_all_strides_in_order() {
        let grid = GridTable::build(InputSize::new(640, 640)).expect("grid");
        assert_eq!(grid.len(), 80 * 80 + 40 * 40 + 20 * 20);
        assert_eq!(grid.cells[0], (0.0, 0.0, 8.0));
        assert_eq!(grid.cells[1], (1.0, 0.0, 8.0));
        assert_eq!(grid.cells[80], (0.0, 1.0, 8.0));
        // First cell of the stride-16 head.
        assert_eq!(grid.cells[80 * 80], (0.0, 0.0, 16.0));
        assert_eq!(grid.cells[80 * 80 + 40 * 40], (0.0, 0.0, 32.0));
    }

    #[test]
    fn grid_table_supports_rectangular_inputs() {
        let grid = GridTable::build(InputSize::new(640, 320)).expect("grid");
        assert_eq!(grid.len(), 80 * 40 + 40 * 20 + 20 * 10);
        // Row length follows the width: cell 80 starts the second row.
        assert_eq!(grid.cells[80], (0.0, 1.0, 8.0));
    }

    #[test]
    fn grid_table_rejects_unaligned_resolution() {
        assert!(GridTable::build(InputSize::new(600, 600)).is_err());
    }

    #[test]
    fn yolox_decode_reconstructs_letterboxed_box() {
        // 1280x720 source letterboxed into 640x640: scale 0.5, pad (0, 140).
        let class_names = names();
        let grid = GridTable::build(InputSize::default()).expect("grid");
        let features = 7; // 4 + 1 + 2 classes
        let mut output = vec![0f32; grid.len() * features];

        // Stride-8 cell (gx=40, gy=40) puts the center at (320, 320) in
        // letterbox space; exp(ln 10) * 8 = 80 px wide and tall.
        let i = 40 * 80 + 40;
        let row = &mut output[i * features..(i + 1) * features];
        row[0] = 0.0;
        row[1] = 0.0;
        row[2] = 10f32.ln();
        row[3] = 10f32.ln();
        row[4] = 0.9;
        row[5] = 0.25;
        row[6] = 0.8;

        let p = params(&class_names, 0.5, 0.5, (1280, 720), 0.5, 0, 140);
        let dets = apply_postprocess(
            ModelFamily::Yolox,
            Some(&grid),
            &output,
            &[1, grid.len(), features],
            &p,
        )
        .expect("decode");

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.class_id, 1);
        assert_eq!(d.class_name, "dog");
        assert!((d.confidence - 0.72).abs() < 1e-6);
        assert!(((d.x1 + d.x2) / 2.0 - 640.0).abs() < 1e-3);
        assert!(((d.y1 + d.y2) / 2.0 - 360.0).abs() < 1e-3);
        assert!((d.x2 - d.x1 - 160.0).abs() < 1e-3);
        assert!((d.y2 - d.y1 - 160.0).abs() < 1e-3);
    }

    #[test]
    fn yolox_objectness_gates_candidates() {
        let class_names = names();
        let grid = GridTable::build(InputSize::default()).expect("grid");
        let features = 7;
        let mut output = vec![0f32; grid.len() * features];
        let row = &mut output[..features];
        row[4] = 0.3; // objectness below threshold
        row[5] = 1.0;

        let p = params(&class_names, 0.5, 0.5, (640, 640), 1.0, 0, 0);
        let dets = apply_postprocess(
            ModelFamily::Yolox,
            Some(&grid),
            &output,
            &[1, grid.len(), features],
            &p,
        )
        .expect("decode");
        assert!(dets.is_empty());
    }

    #[test]
    fn yolov8_layouts_agree() {
        let class_names = names();
        let num_boxes = 8usize;
        let features = 6usize; // 4 + 2 classes

        // One confident box centered at (100, 100), 40x20.
        let mut rows: Vec<[f32; 6]> = vec![[0.0; 6]; num_boxes];
        rows[0] = [100.0, 100.0, 40.0, 20.0, 0.1, 0.9];

        let row_major: Vec<f32> = rows.iter().flatten().copied().collect();
        let mut col_major = vec![0f32; num_boxes * features];
        for (i, row) in rows.iter().enumerate() {
            for (f, &v) in row.iter().enumerate() {
                col_major[f * num_boxes + i] = v;
            }
        }

        let p = params(&class_names, 0.5, 0.5, (640, 640), 1.0, 0, 0);
        let from_rows = apply_postprocess(
            ModelFamily::Yolov8,
            None,
            &row_major,
            &[1, num_boxes, features],
            &p,
        )
        .expect("decode rows");
        let from_cols = apply_postprocess(
            ModelFamily::Yolov8,
            None,
            &col_major,
            &[1, features, num_boxes],
            &p,
        )
        .expect("decode cols");

        assert_eq!(from_rows, from_cols);
        assert_eq!(from_rows.len(), 1);
        assert_eq!(from_rows[0].class_id, 1);
        assert!((from_rows[0].x1 - 80.0).abs() < 1e-4);
        assert!((from_rows[0].y2 - 110.0).abs() < 1e-4);
    }

    #[test]
    fn ppyoloe_rows_pass_through_without_rescaling() {
        let class_names = names();
        let output = [
            0.0, 0.9, 10.0, 20.0, 110.0, 220.0, // valid cat
            -1.0, 0.95, 0.0, 0.0, 50.0, 50.0, // negative class id, dropped
            1.0, 0.05, 0.0, 0.0, 50.0, 50.0, // below threshold
            1.0, 0.8, 900.0, 400.0, 1100.0, 600.0, // clamped to bounds
        ];
        let p = params(&class_names, 0.25, 0.5, (1000, 500), 1.0, 0, 0);
        let dets =
            apply_postprocess(ModelFamily::PpYoloe, None, &output, &[1, 4, 6], &p).expect("decode");

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_name, "cat");
        assert_eq!(dets[0].x1, 10.0);
        assert_eq!(dets[0].y2, 220.0);
        assert_eq!(dets[1].x2, 1000.0);
        assert_eq!(dets[1].y2, 500.0);
    }

    #[test]
    fn ppyoloe_degenerate_output_is_empty() {
        let class_names = names();
        let p = params(&class_names, 0.25, 0.5, (640, 640), 1.0, 0, 0);
        let dets =
            apply_postprocess(ModelFamily::PpYoloe, None, &[], &[1, 0, 6], &p).expect("decode");
        assert!(dets.is_empty());
    }

    #[test]
    fn nms_keeps_single_survivor_for_stacked_boxes() {
        // Five same-class candidates over one spot; only the best survives.
        let confidences = [0.6, 0.9, 0.5, 0.8, 0.7];
        let mut candidates: Vec<Detection> = confidences
            .iter()
            .map(|&c| det(0, c, 10.0, 10.0, 110.0, 90.0))
            .collect();

        let survivors = nms(&mut candidates, 0.5);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].confidence, 0.9);
    }

    #[test]
    fn nms_only_suppresses_within_a_class() {
        let mut candidates = vec![
            det(0, 0.9, 0.0, 0.0, 100.0, 100.0),
            det(1, 0.8, 0.0, 0.0, 100.0, 100.0),
        ];
        let survivors = nms(&mut candidates, 0.5);
        assert_eq!(survivors.len(), 2);
    }

    #[test]
    fn nms_survivors_ordered_by_confidence() {
        let mut candidates = vec![
            det(0, 0.5, 500.0, 500.0, 600.0, 600.0),
            det(0, 0.9, 0.0, 0.0, 100.0, 100.0),
            det(0, 0.7, 200.0, 200.0, 300.0, 300.0),
        ];
        let survivors = nms(&mut candidates, 0.5);
        let confs: Vec<f32> = survivors.iter().map(|d| d.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn raising_iou_threshold_is_monotonic() {
        let mut base = vec![
            det(0, 0.9, 0.0, 0.0, 100.0, 100.0),
            det(0, 0.8, 20.0, 0.0, 120.0, 100.0),
            det(0, 0.7, 40.0, 0.0, 140.0, 100.0),
            det(0, 0.6, 300.0, 300.0, 400.0, 400.0),
        ];
        let mut previous = 0usize;
        for iou in [0.1, 0.3, 0.5, 0.7, 0.9] {
            let survivors = nms(&mut base.clone(), iou);
            assert!(survivors.len() >= previous, "iou {iou} lost survivors");
            previous = survivors.len();
        }
        let _ = nms(&mut base, 1.0);
    }

    #[test]
    fn raising_conf_threshold_yields_subset() {
        let class_names = names();
        let output = [
            0.0, 0.9, 10.0, 10.0, 50.0, 50.0, //
            1.0, 0.6, 60.0, 60.0, 100.0, 100.0, //
            0.0, 0.3, 200.0, 200.0, 260.0, 260.0,
        ];
        let collect = |conf: f32| -> Vec<Detection> {
            let p = params(&class_names, conf, 0.5, (640, 640), 1.0, 0, 0);
            apply_postprocess(ModelFamily::PpYoloe, None, &output, &[1, 3, 6], &p).unwrap()
        };

        let low = collect(0.2);
        let high = collect(0.7);
        assert!(high.iter().all(|d| low.contains(d)));
        assert!(high.len() <= low.len());
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = det(0, 1.0, 0.0, 0.0, 10.0, 10.0);
        let b = det(0, 1.0, 20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);

        let degenerate = det(0, 1.0, 5.0, 5.0, 5.0, 5.0);
        assert_eq!(degenerate.iou(&degenerate), 0.0);
    }

    #[test]
    fn non_finite_candidates_are_discarded() {
        let class_names = names();
        let output = [
            0.0,
            f32::NAN,
            10.0,
            10.0,
            50.0,
            50.0,
            0.0,
            0.9,
            f32::INFINITY,
            10.0,
            50.0,
            50.0,
        ];
        let p = params(&class_names, 0.25, 0.5, (640, 640), 1.0, 0, 0);
        let dets =
            apply_postprocess(ModelFamily::PpYoloe, None, &output, &[1, 2, 6], &p).expect("decode");
        // The NaN score row is dropped; the infinite coordinate clamps into
        // range and survives.
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].x2, 640.0);
    }
}
