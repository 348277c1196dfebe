//! C ABI over the detector core.
//!
//! One detector lives per process, held in a global slot; `yolo_init`
//! replaces it, `yolo_release` empties it. Every record-returning entry
//! point hands back a heap-allocated JSON string that the caller must free
//! with [`free_string`]. No panic or error crosses the boundary: failures
//! come back as `{"error": ..., "code": ...}` records, and detect calls on
//! an empty slot return `NOT_INITIALIZED` without touching input buffers.

use std::ffi::{CStr, CString, c_char, c_float, c_int};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard};

use log::warn;
use yolokit_core::{DetectionSettings, ErrorCode, YoloDetector, YuvPlanes, error_json};

static DETECTOR: Mutex<Option<YoloDetector>> = Mutex::new(None);

const NOT_INITIALIZED_MSG: &str = "Detector not initialized";

fn detector_slot() -> MutexGuard<'static, Option<YoloDetector>> {
    DETECTOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Move a JSON record onto the C heap. The caller owns the result.
fn into_owned_cstring(json: String) -> *mut c_char {
    match CString::new(json) {
        Ok(s) => s.into_raw(),
        // Interior NUL can only come from a hostile class name; degrade to a
        // plain error record.
        Err(_) => CString::new(error_json("Invalid characters in record", ErrorCode::RuntimeError))
            .expect("static record contains no NUL")
            .into_raw(),
    }
}

fn error_record(message: &str, code: ErrorCode) -> *mut c_char {
    into_owned_cstring(error_json(message, code))
}

/// Run a detection body with panic containment.
fn guarded_detect(body: impl FnOnce() -> String) -> *mut c_char {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(json) => into_owned_cstring(json),
        Err(_) => error_record("Internal panic during detection", ErrorCode::RuntimeError),
    }
}

fn settings(conf_threshold: c_float, iou_threshold: c_float) -> DetectionSettings {
    DetectionSettings {
        conf_threshold,
        iou_threshold,
    }
}

/// Initialize the process-wide detector from an ONNX model path.
///
/// Any previously loaded model is released first. Returns 1 on success and
/// 0 on failure (the slot is left empty on failure).
#[unsafe(no_mangle)]
pub extern "C" fn yolo_init(model_path: *const c_char) -> c_int {
    if model_path.is_null() {
        return 0;
    }
    let path = unsafe { CStr::from_ptr(model_path) }.to_string_lossy();

    let mut slot = detector_slot();
    *slot = None;
    match YoloDetector::load(path.as_ref()) {
        Ok(detector) => {
            *slot = Some(detector);
            1
        }
        Err(err) => {
            warn!("model initialization failed: {err:#}");
            0
        }
    }
}

/// Detect objects in an image file. Returns an owned JSON record.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_detect_path(
    image_path: *const c_char,
    conf_threshold: c_float,
    iou_threshold: c_float,
) -> *mut c_char {
    guarded_detect(|| {
        let mut slot = detector_slot();
        let Some(detector) = slot.as_mut() else {
            return error_json(NOT_INITIALIZED_MSG, ErrorCode::NotInitialized);
        };
        if image_path.is_null() {
            return error_json("Image path is null", ErrorCode::ImageLoadFailed);
        }
        let path = unsafe { CStr::from_ptr(image_path) }.to_string_lossy();

        match detector.detect_path(path.as_ref(), settings(conf_threshold, iou_threshold)) {
            Ok(report) => report.to_json(),
            Err(err) => error_json(&err.to_string(), err.code()),
        }
    })
}

/// Detect objects in a packed BGRA buffer (for example a desktop capture).
/// The buffer is borrowed for the duration of the call, never copied
/// wholesale, and its alpha channel is ignored.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_detect_buffer(
    image_data: *const u8,
    width: c_int,
    height: c_int,
    stride: c_int,
    conf_threshold: c_float,
    iou_threshold: c_float,
) -> *mut c_char {
    guarded_detect(|| {
        let mut slot = detector_slot();
        let Some(detector) = slot.as_mut() else {
            return error_json(NOT_INITIALIZED_MSG, ErrorCode::NotInitialized);
        };
        if image_data.is_null() || width <= 0 || height <= 0 || stride < width * 4 {
            return error_json("Invalid BGRA buffer", ErrorCode::PreprocessError);
        }

        let (w, h, stride) = (width as usize, height as usize, stride as usize);
        let len = (h - 1) * stride + w * 4;
        let bgra = unsafe { std::slice::from_raw_parts(image_data, len) };

        match detector.detect_bgra(
            bgra,
            width as u32,
            height as u32,
            stride,
            settings(conf_threshold, iou_threshold),
        ) {
            Ok(report) => report.to_json(),
            Err(err) => error_json(&err.to_string(), err.code()),
        }
    })
}

/// Detect objects in a tri-planar YUV 4:2:0 camera frame.
///
/// `rotation` is clockwise degrees in {0, 90, 180, 270}; other values are
/// treated as 0. Reported image dimensions are post-rotation.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_detect_yuv(
    y_data: *const u8,
    u_data: *const u8,
    v_data: *const u8,
    width: c_int,
    height: c_int,
    y_row_stride: c_int,
    uv_row_stride: c_int,
    uv_pixel_stride: c_int,
    rotation: c_int,
    conf_threshold: c_float,
    iou_threshold: c_float,
) -> *mut c_char {
    guarded_detect(|| {
        let mut slot = detector_slot();
        let Some(detector) = slot.as_mut() else {
            return error_json(NOT_INITIALIZED_MSG, ErrorCode::NotInitialized);
        };
        if y_data.is_null()
            || u_data.is_null()
            || v_data.is_null()
            || width <= 0
            || height <= 0
            || width % 2 != 0
            || height % 2 != 0
            || y_row_stride < width
            || uv_row_stride <= 0
            || !(1..=2).contains(&uv_pixel_stride)
        {
            return error_json("Invalid YUV planes", ErrorCode::PreprocessError);
        }

        let (w, h) = (width as usize, height as usize);
        let y_stride = y_row_stride as usize;
        let uv_stride = uv_row_stride as usize;
        let y_len = (h - 1) * y_stride + w;
        let uv_len = if uv_pixel_stride == 2 {
            (h / 2 - 1) * uv_stride + w
        } else {
            (h / 2 - 1) * uv_stride + w / 2
        };

        let planes = YuvPlanes {
            y: unsafe { std::slice::from_raw_parts(y_data, y_len) },
            u: unsafe { std::slice::from_raw_parts(u_data, uv_len) },
            v: unsafe { std::slice::from_raw_parts(v_data, uv_len) },
            y_row_stride: y_stride,
            uv_row_stride: uv_stride,
            uv_pixel_stride: uv_pixel_stride as usize,
        };

        match detector.detect_yuv(
            &planes,
            width as u32,
            height as u32,
            rotation,
            settings(conf_threshold, iou_threshold),
        ) {
            Ok(report) => report.to_json(),
            Err(err) => error_json(&err.to_string(), err.code()),
        }
    })
}

/// Replace the class vocabulary with a JSON array of names, e.g.
/// `["person", "car"]`. No-op when the detector is not initialized or the
/// payload parses to an empty list.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_set_classes(class_names_json: *const c_char) {
    if class_names_json.is_null() {
        return;
    }
    let raw = unsafe { CStr::from_ptr(class_names_json) }.to_string_lossy();

    let names: Vec<String> = match serde_json::from_str(raw.as_ref()) {
        Ok(names) => names,
        Err(err) => {
            warn!("ignoring malformed class-name list: {err}");
            return;
        }
    };
    if names.is_empty() {
        return;
    }

    if let Some(detector) = detector_slot().as_mut() {
        detector.set_class_names(names);
    }
}

/// Release the process-wide detector. Safe to call repeatedly.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_release() {
    *detector_slot() = None;
}

/// 1 when a detector is loaded, 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_is_initialized() -> c_int {
    detector_slot().is_some() as c_int
}

/// Static version string; not owned by the caller.
#[unsafe(no_mangle)]
pub extern "C" fn yolo_get_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

/// Free a record previously returned by a detect call. Null is ignored.
#[unsafe(no_mangle)]
pub extern "C" fn free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}
