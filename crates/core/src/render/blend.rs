//! Pixel arithmetic for the compositor.
//!
//! Layer pixels carry premultiplied alpha. The output surface is always
//! opaque, so anything landing on it only has to mix colour.

use image::{Rgba, RgbaImage};

use crate::{BeatReelError, Result};

/// Alpha as an 8-bit weight, 255 meaning fully covered.
fn weight(alpha: f32) -> u32 {
    (alpha.clamp(0.0, 1.0) * 255.0).round() as u32
}

/// `value * weight / 255`, rounded to nearest.
fn scale(value: u8, weight: u32) -> u8 {
    let product = u32::from(value) * weight + 128;
    ((product + (product >> 8)) >> 8) as u8
}

/// Image pixel with its colour scaled by its own alpha.
pub(super) fn premultiplied(px: Rgba<u8>) -> Rgba<u8> {
    let [r, g, b, a] = px.0;
    let w = u32::from(a);
    Rgba([scale(r, w), scale(g, w), scale(b, w), a])
}

/// Glow colour at `alpha` coverage, premultiplied.
pub(super) fn glow_pixel(color: [u8; 3], alpha: f32) -> Rgba<u8> {
    let w = weight(alpha);
    let [r, g, b] = color;
    Rgba([scale(r, w), scale(g, w), scale(b, w), w as u8])
}

/// Puts premultiplied `above` on top of premultiplied `below`.
pub(super) fn stack(below: Rgba<u8>, above: Rgba<u8>) -> Rgba<u8> {
    let through = 255 - u32::from(above[3]);
    let mut out = above;
    for (channel, &under) in out.0.iter_mut().zip(below.0.iter()) {
        *channel = channel.saturating_add(scale(under, through));
    }
    out
}

/// Mixes a premultiplied layer onto the opaque surface at `opacity`.
pub(super) fn fade_onto(surface: &mut RgbaImage, layer: &RgbaImage, opacity: f32) -> Result<()> {
    if surface.dimensions() != layer.dimensions() {
        return Err(BeatReelError::InvalidInput(
            "layer and surface sizes differ",
        ));
    }
    let strength = weight(opacity);
    if strength == 0 {
        return Ok(());
    }
    for (dst, src) in surface.pixels_mut().zip(layer.pixels()) {
        let covered = u32::from(scale(src[3], strength));
        if covered == 0 {
            continue;
        }
        let through = 255 - covered;
        for c in 0..3 {
            dst[c] = scale(src[c], strength).saturating_add(scale(dst[c], through));
        }
        dst[3] = 255;
    }
    Ok(())
}

/// Pulls an opaque pixel towards white by `alpha`.
pub(super) fn lighten(px: &mut Rgba<u8>, alpha: f32) {
    let w = weight(alpha);
    if w == 0 {
        return;
    }
    for c in 0..3 {
        px[c] = px[c].saturating_add(scale(255 - px[c], w));
    }
}
