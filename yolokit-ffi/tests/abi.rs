//! Contract tests for the C entry points that do not require a model file.

use std::ffi::{CStr, CString, c_char};

use yolokit_ffi::{
    free_string, yolo_detect_buffer, yolo_detect_path, yolo_detect_yuv, yolo_get_version,
    yolo_init, yolo_is_initialized, yolo_release, yolo_set_classes,
};

/// Take ownership of a returned record and free it.
fn take_record(ptr: *mut c_char) -> String {
    assert!(!ptr.is_null(), "record pointer must never be null");
    let record = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .expect("records are UTF-8")
        .to_string();
    free_string(ptr);
    record
}

#[test]
fn detect_path_without_init_reports_not_initialized() {
    yolo_release();
    let path = CString::new("/tmp/any.jpg").unwrap();
    let record = take_record(yolo_detect_path(path.as_ptr(), 0.5, 0.5));
    assert!(record.contains("\"code\":\"NOT_INITIALIZED\""), "{record}");
    assert!(record.contains("not initialized"), "{record}");
}

#[test]
fn detect_buffer_without_init_does_not_read_the_buffer() {
    yolo_release();
    // A null buffer would crash if it were dereferenced before the
    // initialization check.
    let record = take_record(yolo_detect_buffer(std::ptr::null(), 640, 480, 2560, 0.5, 0.5));
    assert!(record.contains("\"code\":\"NOT_INITIALIZED\""), "{record}");
}

#[test]
fn detect_yuv_without_init_does_not_read_the_planes() {
    yolo_release();
    let record = take_record(yolo_detect_yuv(
        std::ptr::null(),
        std::ptr::null(),
        std::ptr::null(),
        640,
        480,
        640,
        640,
        2,
        90,
        0.5,
        0.5,
    ));
    assert!(record.contains("\"code\":\"NOT_INITIALIZED\""), "{record}");
}

#[test]
fn init_with_missing_model_leaves_slot_empty() {
    assert_eq!(yolo_is_initialized(), 0);
    let path = CString::new("/definitely/not/a/model.onnx").unwrap();
    assert_eq!(yolo_init(path.as_ptr()), 0);
    assert_eq!(yolo_is_initialized(), 0);
}

#[test]
fn init_rejects_null_path() {
    assert_eq!(yolo_init(std::ptr::null()), 0);
}

#[test]
fn release_is_idempotent() {
    yolo_release();
    yolo_release();
    assert_eq!(yolo_is_initialized(), 0);
}

#[test]
fn set_classes_without_detector_is_a_no_op() {
    yolo_release();
    let names = CString::new(r#"["person", "car"]"#).unwrap();
    yolo_set_classes(names.as_ptr());
    let garbage = CString::new("not json").unwrap();
    yolo_set_classes(garbage.as_ptr());
    yolo_set_classes(std::ptr::null());
}

#[test]
fn version_matches_crate_metadata() {
    let version = unsafe { CStr::from_ptr(yolo_get_version()) }
        .to_str()
        .expect("version is UTF-8");
    assert_eq!(version, env!("CARGO_PKG_VERSION"));
}

#[test]
fn free_string_ignores_null() {
    free_string(std::ptr::null_mut());
}
