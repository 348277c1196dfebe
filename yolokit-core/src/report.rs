//! Serialization of detection results into the self-describing JSON record
//! handed back to hosts.
//!
//! The record is assembled by hand so field precision stays fixed:
//! confidences carry four decimal places, coordinates two. Hosts on the
//! other side of the C ABI parse these records with ordinary JSON tooling.

use crate::postprocess::Detection;

/// Symbolic failure tags carried in error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotInitialized,
    ImageLoadFailed,
    PreprocessError,
    RuntimeError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotInitialized => "NOT_INITIALIZED",
            ErrorCode::ImageLoadFailed => "IMAGE_LOAD_FAILED",
            ErrorCode::PreprocessError => "PREPROCESS_ERROR",
            ErrorCode::RuntimeError => "RUNTIME_ERROR",
        }
    }
}

/// Final result of one detection call.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub detections: Vec<Detection>,
    /// Wall-clock time from ingress start to the end of suppression.
    pub inference_time_ms: u64,
    /// Source dimensions after any input-side rotation.
    pub image_width: u32,
    pub image_height: u32,
}

impl DetectionReport {
    /// Render the record as a JSON object.
    pub fn to_json(&self) -> String {
        let mut out = String::from("{\"detections\":[");

        for (i, det) in self.detections.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!(
                "{{\"class_id\":{},\"class_name\":\"{}\",\"confidence\":{:.4},\"x1\":{:.2},\"y1\":{:.2},\"x2\":{:.2},\"y2\":{:.2}}}",
                det.class_id,
                json_escape(&det.class_name),
                det.confidence,
                det.x1,
                det.y1,
                det.x2,
                det.y2
            ));
        }

        out.push_str(&format!(
            "],\"count\":{},\"inference_time_ms\":{},\"image_width\":{},\"image_height\":{}}}",
            self.detections.len(),
            self.inference_time_ms,
            self.image_width,
            self.image_height
        ));
        out
    }
}

/// Render a failure as an error record.
pub fn error_json(message: &str, code: ErrorCode) -> String {
    format!(
        "{{\"error\":\"{}\",\"code\":\"{}\"}}",
        json_escape(message),
        code.as_str()
    )
}

fn json_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}
