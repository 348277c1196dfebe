//! Image ingress: every input shape the detector accepts is normalized here
//! into a contiguous 3-channel BGR buffer in original orientation.
//!
//! Three paths feed the detector: on-disk files, packed BGRA buffers from
//! desktop capture, and tri-planar YUV 4:2:0 camera frames. The YUV path
//! assembles an NV21 image first (full-resolution luma followed by
//! half-resolution VU-interleaved chroma) and converts from there, so all
//! chroma-ordering quirks are resolved in one place.

use std::path::Path;

use anyhow::{Context, Result};
use image::GenericImageView;

/// Contiguous 8-bit BGR pixel buffer.
#[derive(Debug, Clone)]
pub struct BgrFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// Borrowed tri-planar YUV 4:2:0 frame as delivered by camera APIs.
///
/// `uv_pixel_stride` is 1 when chroma is planar (separate U and V planes)
/// and 2 when it is semi-planar (U and V interleaved in one buffer, with
/// `u` and `v` pointing at the first sample of each component).
#[derive(Debug, Clone, Copy)]
pub struct YuvPlanes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_row_stride: usize,
    pub uv_row_stride: usize,
    pub uv_pixel_stride: usize,
}

impl BgrFrame {
    /// Wrap an already-assembled BGR buffer. `data.len()` must be exactly
    /// `width * height * 3`.
    pub fn from_raw(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        anyhow::ensure!(
            data.len() == width as usize * height as usize * 3,
            "BGR buffer length {} does not match {}x{}",
            data.len(),
            width,
            height
        );
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Decode an image file into a BGR frame.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let image = image::open(path_ref)
            .with_context(|| format!("failed to open image {}", path_ref.display()))?;
        let (width, height) = image.dimensions();
        let rgb = image.into_rgb8();

        let mut data = vec![0u8; width as usize * height as usize * 3];
        for (dst, px) in data.chunks_exact_mut(3).zip(rgb.pixels()) {
            dst[0] = px[2];
            dst[1] = px[1];
            dst[2] = px[0];
        }
        Self::from_raw(data, width, height)
    }

    /// Strip the alpha channel from a packed BGRA buffer.
    ///
    /// The source buffer is borrowed, never copied wholesale; `stride` is the
    /// byte distance between row starts and must be at least `width * 4`.
    pub fn from_bgra(bgra: &[u8], width: u32, height: u32, stride: usize) -> Result<Self> {
        let w = width as usize;
        let h = height as usize;
        anyhow::ensure!(width > 0 && height > 0, "empty BGRA buffer");
        anyhow::ensure!(stride >= w * 4, "stride {} shorter than row ({})", stride, w * 4);
        anyhow::ensure!(
            bgra.len() >= (h - 1) * stride + w * 4,
            "BGRA buffer too short: {} bytes for {}x{} stride {}",
            bgra.len(),
            width,
            height,
            stride
        );

        let mut data = vec![0u8; w * h * 3];
        for row in 0..h {
            let src = &bgra[row * stride..row * stride + w * 4];
            let dst = &mut data[row * w * 3..(row + 1) * w * 3];
            for col in 0..w {
                dst[col * 3] = src[col * 4];
                dst[col * 3 + 1] = src[col * 4 + 1];
                dst[col * 3 + 2] = src[col * 4 + 2];
            }
        }
        Self::from_raw(data, width, height)
    }

    /// Assemble a tri-planar YUV 4:2:0 frame into BGR, applying a clockwise
    /// rotation of 0, 90, 180 or 270 degrees at the end. Any other rotation
    /// value is treated as 0. The returned frame carries the post-rotation
    /// dimensions.
    pub fn from_yuv(planes: &YuvPlanes<'_>, width: u32, height: u32, rotation: i32) -> Result<Self> {
        let nv21 = assemble_nv21(planes, width, height)?;
        let frame = nv21_to_bgr(&nv21, width, height)?;
        Ok(frame.rotate_clockwise(rotation))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw BGR bytes in row-major order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// BGR triple at (x, y). Panics when out of bounds; test helper.
    #[cfg(test)]
    pub(crate) fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Rotate clockwise by the given number of degrees. Values outside
    /// {90, 180, 270} leave the frame untouched.
    pub fn rotate_clockwise(self, degrees: i32) -> Self {
        match degrees {
            90 | 180 | 270 => {}
            _ => return self,
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let (new_w, new_h) = if degrees == 180 { (w, h) } else { (h, w) };
        let mut rotated = vec![0u8; self.data.len()];

        for y in 0..h {
            for x in 0..w {
                let (nx, ny) = match degrees {
                    90 => (h - 1 - y, x),
                    180 => (w - 1 - x, h - 1 - y),
                    _ => (y, w - 1 - x),
                };
                let src = (y * w + x) * 3;
                let dst = (ny * new_w + nx) * 3;
                rotated[dst..dst + 3].copy_from_slice(&self.data[src..src + 3]);
            }
        }

        Self {
            data: rotated,
            width: new_w as u32,
            height: new_h as u32,
        }
    }
}

/// Build an NV21 buffer (luma plane followed by VU-interleaved chroma at
/// half resolution) from the three source planes.
fn assemble_nv21(planes: &YuvPlanes<'_>, width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    anyhow::ensure!(width > 0 && height > 0, "empty YUV frame");
    anyhow::ensure!(
        w % 2 == 0 && h % 2 == 0,
        "YUV 4:2:0 requires even dimensions, got {}x{}",
        width,
        height
    );
    anyhow::ensure!(
        planes.y_row_stride >= w,
        "Y row stride {} shorter than width {}",
        planes.y_row_stride,
        w
    );
    anyhow::ensure!(
        planes.y.len() >= (h - 1) * planes.y_row_stride + w,
        "Y plane too short"
    );

    let mut nv21 = vec![0u8; w * h * 3 / 2];

    // Luma, row by row when the stride carries padding.
    if planes.y_row_stride == w {
        nv21[..w * h].copy_from_slice(&planes.y[..w * h]);
    } else {
        for row in 0..h {
            let src = row * planes.y_row_stride;
            nv21[row * w..(row + 1) * w].copy_from_slice(&planes.y[src..src + w]);
        }
    }

    let uv_dst = &mut nv21[w * h..];
    let chroma_rows = h / 2;
    let chroma_cols = w / 2;

    match planes.uv_pixel_stride {
        1 => {
            // Planar chroma: interleave V then U for every sub-sampled site.
            let needed = (chroma_rows - 1) * planes.uv_row_stride + chroma_cols;
            anyhow::ensure!(
                planes.u.len() >= needed && planes.v.len() >= needed,
                "chroma planes too short for {}x{}",
                width,
                height
            );
            for row in 0..chroma_rows {
                for col in 0..chroma_cols {
                    let src = row * planes.uv_row_stride + col;
                    let dst = row * w + col * 2;
                    uv_dst[dst] = planes.v[src];
                    uv_dst[dst + 1] = planes.u[src];
                }
            }
        }
        2 => {
            // Semi-planar chroma: U and V views alias one interleaved buffer.
            // When the V samples start below the U samples in memory the
            // buffer is already VU-interleaved (NV21); otherwise it is UV
            // (NV12) and every pair gets swapped on the way in.
            if planes.v.as_ptr() < planes.u.as_ptr() {
                anyhow::ensure!(
                    planes.v.len() >= (chroma_rows - 1) * planes.uv_row_stride + w,
                    "interleaved chroma plane too short"
                );
                if planes.uv_row_stride == w {
                    uv_dst[..w * chroma_rows].copy_from_slice(&planes.v[..w * chroma_rows]);
                } else {
                    for row in 0..chroma_rows {
                        let src = row * planes.uv_row_stride;
                        uv_dst[row * w..(row + 1) * w]
                            .copy_from_slice(&planes.v[src..src + w]);
                    }
                }
            } else {
                let needed = (chroma_rows - 1) * planes.uv_row_stride + (chroma_cols - 1) * 2 + 1;
                anyhow::ensure!(
                    planes.u.len() >= needed && planes.v.len() >= needed,
                    "interleaved chroma plane too short"
                );
                for row in 0..chroma_rows {
                    for col in 0..chroma_cols {
                        let src = row * planes.uv_row_stride + col * 2;
                        let dst = row * w + col * 2;
                        uv_dst[dst] = planes.v[src];
                        uv_dst[dst + 1] = planes.u[src];
                    }
                }
            }
        }
        other => anyhow::bail!("unsupported uv_pixel_stride {}", other),
    }

    Ok(nv21)
}

/// BT.601 full-range NV21 to BGR conversion.
fn nv21_to_bgr(nv21: &[u8], width: u32, height: u32) -> Result<BgrFrame> {
    let w = width as usize;
    let h = height as usize;
    anyhow::ensure!(nv21.len() >= w * h * 3 / 2, "NV21 buffer too short");

    let luma = &nv21[..w * h];
    let chroma = &nv21[w * h..];
    let mut data = vec![0u8; w * h * 3];

    for y in 0..h {
        for x in 0..w {
            let yv = luma[y * w + x] as f32;
            let c = (y / 2) * w + (x / 2) * 2;
            let v = chroma[c] as f32 - 128.0;
            let u = chroma[c + 1] as f32 - 128.0;

            let r = yv + 1.402 * v;
            let g = yv - 0.344_136 * u - 0.714_136 * v;
            let b = yv + 1.772 * u;

            let idx = (y * w + x) * 3;
            data[idx] = b.round().clamp(0.0, 255.0) as u8;
            data[idx + 1] = g.round().clamp(0.0, 255.0) as u8;
            data[idx + 2] = r.round().clamp(0.0, 255.0) as u8;
        }
    }

    BgrFrame::from_raw(data, width, height)
}
