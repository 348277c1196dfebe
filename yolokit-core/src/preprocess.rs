//! Image pre-processing: geometric fit to the model's input resolution and
//! conversion into a planar NCHW float tensor.
//!
//! YOLOX and YOLOv8 expect a letterbox fit (uniform scale, neutral-gray
//! padding split evenly on both sides) so the decoder can invert the
//! transform exactly. PP-YOLOE is resized directly to the input resolution
//! and receives the resize ratio as a separate `scale_factor` graph input
//! instead.

use anyhow::Result;
use image::{ImageBuffer, Rgb, imageops};
use ndarray::Array4;

use crate::frame::BgrFrame;
use crate::model::ModelFamily;

/// Gray value used for letterbox padding.
const PAD_VALUE: u8 = 114;

/// Model input resolution in pixels (width x height).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for InputSize {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
        }
    }
}

/// Output of preprocessing: the input tensor plus the geometric mapping the
/// decoder needs to project boxes back into the original frame.
#[derive(Debug)]
pub struct PreprocessOutput {
    /// `[1, 3, H, W]` float tensor, channel order and scaling per family.
    pub tensor: Array4<f32>,
    /// Uniform letterbox scale (1.0 for direct resize).
    pub scale: f32,
    /// Horizontal letterbox padding in input pixels.
    pub pad_x: i32,
    /// Vertical letterbox padding in input pixels.
    pub pad_y: i32,
    /// Dimensions of the source frame.
    pub original_size: (u32, u32),
}

/// Resize ratio `(input_h / original_h, input_w / original_w)` handed to
/// PP-YOLOE graphs as the `scale_factor` input.
pub fn resize_ratio(original: (u32, u32), input: InputSize) -> [f32; 2] {
    [
        input.height as f32 / original.1 as f32,
        input.width as f32 / original.0 as f32,
    ]
}

/// Fit a BGR frame to the model input and convert it to a planar tensor.
pub fn preprocess_frame(
    frame: &BgrFrame,
    input: InputSize,
    family: ModelFamily,
) -> Result<PreprocessOutput> {
    anyhow::ensure!(
        input.width > 0 && input.height > 0,
        "input dimensions must be greater than zero"
    );

    let (orig_w, orig_h) = (frame.width(), frame.height());
    anyhow::ensure!(orig_w > 0 && orig_h > 0, "source frame is empty");

    // The frame stores BGR bytes; an `Rgb` container is only a 3-byte pixel
    // view here, channel meaning is tracked by hand below.
    let src: ImageBuffer<Rgb<u8>, &[u8]> =
        ImageBuffer::from_raw(orig_w, orig_h, frame.data())
            .ok_or_else(|| anyhow::anyhow!("frame buffer does not match its dimensions"))?;

    let (canvas, scale, pad_x, pad_y) = match family {
        ModelFamily::PpYoloe => {
            let resized = imageops::resize(
                &src,
                input.width,
                input.height,
                imageops::FilterType::Triangle,
            );
            (resized, 1.0, 0, 0)
        }
        ModelFamily::Yolox | ModelFamily::Yolov8 => {
            let scale = (input.width as f32 / orig_w as f32)
                .min(input.height as f32 / orig_h as f32);
            let new_w = ((orig_w as f32 * scale).round() as u32).max(1);
            let new_h = ((orig_h as f32 * scale).round() as u32).max(1);
            let pad_x = (input.width as i32 - new_w as i32) / 2;
            let pad_y = (input.height as i32 - new_h as i32) / 2;

            let resized = imageops::resize(&src, new_w, new_h, imageops::FilterType::Triangle);
            let mut canvas = ImageBuffer::from_pixel(
                input.width,
                input.height,
                Rgb([PAD_VALUE, PAD_VALUE, PAD_VALUE]),
            );
            imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);
            (canvas, scale, pad_x, pad_y)
        }
    };

    let w = input.width as usize;
    let h = input.height as usize;
    let channel = w * h;
    let mut tensor = vec![0f32; 3 * channel];

    match family {
        // YOLOX consumes BGR in the raw 0..255 range.
        ModelFamily::Yolox => {
            for (idx, px) in canvas.pixels().enumerate() {
                tensor[idx] = px[0] as f32;
                tensor[channel + idx] = px[1] as f32;
                tensor[2 * channel + idx] = px[2] as f32;
            }
        }
        // YOLOv8 and PP-YOLOE consume RGB scaled to [0, 1].
        ModelFamily::Yolov8 | ModelFamily::PpYoloe => {
            for (idx, px) in canvas.pixels().enumerate() {
                tensor[idx] = px[2] as f32 / 255.0;
                tensor[channel + idx] = px[1] as f32 / 255.0;
                tensor[2 * channel + idx] = px[0] as f32 / 255.0;
            }
        }
    }

    let tensor = Array4::from_shape_vec((1, 3, h, w), tensor)?;

    Ok(PreprocessOutput {
        tensor,
        scale,
        pad_x,
        pad_y,
        original_size: (orig_w, orig_h),
    })
}
