//! Software compositor for one slideshow frame.

mod blend;
mod blur;

use std::time::Duration;

use image::{Rgba, RgbaImage};

use crate::{AnimationParams, BeatReelError, Glow, ImageAsset, RenderConfig, Result, Variant};

pub use blur::blur_rgba8_premul;

/// Output surface written every tick. Opaque RGBA8.
pub type Surface = RgbaImage;

const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Full-surface flash laid over the frame while a transition is in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wash {
    pub variant: Variant,
    /// Time since the transition started.
    pub elapsed: Duration,
}

/// Everything that determines the pixels of one frame besides the asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderInput {
    pub params: AnimationParams,
    /// Glow left over from a settled transition.
    pub afterglow: Option<Glow>,
    pub wash: Option<Wash>,
    pub visible: bool,
}

impl Default for RenderInput {
    fn default() -> Self {
        Self {
            params: AnimationParams::IDENTITY,
            afterglow: None,
            wash: None,
            visible: true,
        }
    }
}

/// Letterboxed size of an image fitted inside the canvas, preserving aspect.
pub fn fit_rect(image_w: u32, image_h: u32, canvas_w: u32, canvas_h: u32) -> (f32, f32) {
    if image_w == 0 || image_h == 0 || canvas_w == 0 || canvas_h == 0 {
        return (0.0, 0.0);
    }
    let image_aspect = image_w as f32 / image_h as f32;
    let canvas_aspect = canvas_w as f32 / canvas_h as f32;
    if image_aspect > canvas_aspect {
        (canvas_w as f32, canvas_w as f32 / image_aspect)
    } else {
        (canvas_h as f32 * image_aspect, canvas_h as f32)
    }
}

/// Paints frames. Holds only a scratch layer, so output depends on inputs alone.
#[derive(Debug, Default)]
pub struct FrameCompositor {
    /// Placed image plus glow, premultiplied, before blur and opacity.
    layer: RgbaImage,
}

impl FrameCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank surface at the configured resolution.
    pub fn surface(config: &RenderConfig) -> Surface {
        RgbaImage::from_pixel(config.width, config.height, Rgba(BLACK))
    }

    pub fn render(
        &mut self,
        surface: &mut Surface,
        asset: Option<&ImageAsset>,
        input: &RenderInput,
    ) -> Result<()> {
        for px in surface.pixels_mut() {
            px.0 = BLACK;
        }
        if !input.visible {
            return Ok(());
        }
        let Some(asset) = asset else {
            return Ok(());
        };

        let (width, height) = surface.dimensions();
        let params = &input.params;
        if self.layer.dimensions() != (width, height) {
            self.layer = RgbaImage::new(width, height);
        }

        let (base_w, base_h) = fit_rect(asset.width(), asset.height(), width, height);
        let draw_w = base_w * params.scale.max(0.0);
        let draw_h = base_h * params.scale.max(0.0);
        let x = (width as f32 - draw_w) / 2.0 + params.entry_x + params.shake_x + params.offset_x;
        let y = (height as f32 - draw_h) / 2.0 + params.entry_y + params.shake_y + params.offset_y;

        let placement = Placement {
            x,
            y,
            w: draw_w,
            h: draw_h,
        };
        let glow = params.glow.or(input.afterglow);
        self.paint_layer(asset, &placement, glow, params.rotation_deg);

        if params.blur_px > 0.0 {
            let blurred = blur_rgba8_premul(self.layer.as_raw(), width, height, params.blur_px)?;
            self.layer = RgbaImage::from_raw(width, height, blurred)
                .ok_or(BeatReelError::InvalidInput("blurred layer has the wrong size"))?;
        }
        blend::fade_onto(surface, &self.layer, params.opacity)?;

        if let Some(wash) = input.wash {
            apply_wash(surface, &wash);
        }
        Ok(())
    }

    fn paint_layer(
        &mut self,
        asset: &ImageAsset,
        placement: &Placement,
        glow: Option<Glow>,
        rotation_deg: f32,
    ) {
        let (width, height) = self.layer.dimensions();
        let (sin, cos) = (-rotation_deg.to_radians()).sin_cos();
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let (gx, gy) = (placement.x + placement.w / 2.0, placement.y + placement.h / 2.0);
        let bitmap = asset.bitmap();

        for (x, y, px) in self.layer.enumerate_pixels_mut() {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            // inverse-rotate the destination pixel into unrotated layout space
            let lx = dx * cos - dy * sin + cx;
            let ly = dx * sin + dy * cos + cy;

            let mut out = Rgba([0u8; 4]);
            if let Some(glow) = glow {
                let half = glow.radius_px / 2.0;
                let in_halo = lx >= placement.x - half
                    && lx < placement.x + placement.w + half
                    && ly >= placement.y - half
                    && ly < placement.y + placement.h + half;
                if in_halo && glow.radius_px > 0.0 {
                    let t = ((lx - gx).hypot(ly - gy)) / glow.radius_px;
                    let alpha = glow.intensity.clamp(0.0, 1.0) * glow_stop(t);
                    if alpha > 0.0 {
                        out = blend::glow_pixel(glow.color, alpha);
                    }
                }
            }

            if placement.w > 0.0
                && placement.h > 0.0
                && lx >= placement.x
                && lx < placement.x + placement.w
                && ly >= placement.y
                && ly < placement.y + placement.h
            {
                let u = ((lx - placement.x) / placement.w * bitmap.width() as f32) as u32;
                let v = ((ly - placement.y) / placement.h * bitmap.height() as f32) as u32;
                let sample = *bitmap.get_pixel(u.min(bitmap.width() - 1), v.min(bitmap.height() - 1));
                out = blend::stack(out, blend::premultiplied(sample));
            }

            *px = out;
        }
        tracing::trace!(width, height, "layer painted");
    }
}

struct Placement {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

/// Three-stop radial falloff: full at the centre, half at mid-radius, none at the rim.
fn glow_stop(t: f32) -> f32 {
    const STOPS: [(f32, f32); 3] = [(0.0, 1.0), (0.5, 0.5), (1.0, 0.0)];
    for pair in STOPS.windows(2) {
        let ((t0, a0), (t1, a1)) = (pair[0], pair[1]);
        if t < t1 {
            let f = ((t - t0) / (t1 - t0)).clamp(0.0, 1.0);
            return a0 + (a1 - a0) * f;
        }
    }
    0.0
}

fn wash_alpha(variant: Variant, elapsed: Duration) -> f32 {
    let ms = elapsed.as_secs_f32() * 1000.0;
    match variant {
        Variant::Rotate | Variant::Spiral => ((ms / 100.0).sin() * 0.05).abs() * 0.1,
        Variant::Zoom => ((ms / 80.0).sin() * 0.03).abs() * 0.2,
        Variant::Slide | Variant::Fade => ((ms / 120.0).sin() * 0.08).abs(),
    }
}

fn apply_wash(surface: &mut Surface, wash: &Wash) {
    let alpha = wash_alpha(wash.variant, wash.elapsed);
    if alpha <= 0.0 {
        return;
    }
    let (width, height) = surface.dimensions();
    match wash.variant {
        Variant::Zoom => {
            let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
            let reach = width.max(height) as f32;
            for (x, y, px) in surface.enumerate_pixels_mut() {
                let dist = (x as f32 + 0.5 - cx).hypot(y as f32 + 0.5 - cy);
                let falloff = (1.0 - dist / reach).max(0.0);
                blend::lighten(px, alpha * falloff);
            }
        }
        _ => {
            for px in surface.pixels_mut() {
                blend::lighten(px, alpha);
            }
        }
    }
}
