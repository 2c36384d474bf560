//! Separable gaussian blur over premultiplied RGBA8.

use crate::{BeatReelError, Result};

/// Blurs with a standard deviation of `sigma_px`, matching a CSS-style
/// `blur(<px>)` filter. The kernel spans about two and a half sigmas.
pub fn blur_rgba8_premul(src: &[u8], width: u32, height: u32, sigma_px: f32) -> Result<Vec<u8>> {
    let expected_len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(4))
        .ok_or(BeatReelError::InvalidInput("blur buffer size overflow"))?;
    if src.len() != expected_len {
        return Err(BeatReelError::InvalidInput(
            "blur expects a buffer of width * height * 4 bytes",
        ));
    }
    if !sigma_px.is_finite() || sigma_px <= 0.0 || width == 0 || height == 0 {
        return Ok(src.to_vec());
    }

    let radius = (sigma_px * 2.5).ceil() as u32;
    let kernel = gaussian_kernel_q16(radius, sigma_px);
    let mut tmp = vec![0u8; expected_len];
    let mut out = vec![0u8; expected_len];

    pass(src, &mut tmp, width, height, &kernel, Axis::Horizontal);
    pass(&tmp, &mut out, width, height, &kernel, Axis::Vertical);
    Ok(out)
}

fn gaussian_kernel_q16(radius: u32, sigma: f32) -> Vec<u32> {
    let r = radius as i32;
    let denom = 2.0 * f64::from(sigma) * f64::from(sigma);
    let weights_f: Vec<f64> = (-r..=r)
        .map(|i| (-(f64::from(i) * f64::from(i)) / denom).exp())
        .collect();
    let sum: f64 = weights_f.iter().sum();

    let mut weights: Vec<u32> = weights_f
        .iter()
        .map(|w| ((w / sum) * 65536.0).round().clamp(0.0, 65536.0) as u32)
        .collect();

    // fold rounding error into the centre tap so the kernel sums to 1.0
    let acc: i64 = weights.iter().map(|&w| i64::from(w)).sum();
    let mid = weights.len() / 2;
    weights[mid] = (i64::from(weights[mid]) + 65536 - acc).clamp(0, 65536) as u32;
    weights
}

#[derive(Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

fn pass(src: &[u8], dst: &mut [u8], width: u32, height: u32, kernel: &[u32], axis: Axis) {
    let radius = (kernel.len() / 2) as i32;
    let w = width as i32;
    let h = height as i32;
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0u64; 4];
            for (ki, &kw) in kernel.iter().enumerate() {
                let d = ki as i32 - radius;
                let (sx, sy) = match axis {
                    Axis::Horizontal => ((x + d).clamp(0, w - 1), y),
                    Axis::Vertical => (x, (y + d).clamp(0, h - 1)),
                };
                let idx = ((sy * w + sx) as usize) * 4;
                for c in 0..4 {
                    acc[c] += u64::from(kw) * u64::from(src[idx + c]);
                }
            }
            let out_idx = ((y * w + x) as usize) * 4;
            for c in 0..4 {
                dst[out_idx + c] = (((acc[c] + 32768) >> 16).min(255)) as u8;
            }
        }
    }
}
