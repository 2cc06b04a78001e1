//! Built-in synthetic scenes

use crate::{FrameSet, Rgba8, Scene, SequenceResult, encode_motion, encode_normal, pack_depth};
use image::{RgbaImage, imageops::FilterType};
use std::{cell::RefCell, f32::consts::TAU, path::Path};

/// Normalized position of texel `i` out of `n`, matching an inclusive linspace over `[0, 1]`
fn linspace(i: u32, n: u32) -> f32 {
    if n <= 1 { 0.0 } else { i as f32 / (n - 1) as f32 }
}

/// Scrolling color gradient on a flat far plane
#[derive(Debug, Clone, Copy)]
pub struct Gradient;

impl Scene for Gradient {
    fn name(&self) -> &'static str {
        "gradient"
    }

    fn render(&self, index: u32, frames: u32, width: u32, height: u32) -> FrameSet {
        let t = index as f32 / frames.max(1) as f32;
        let mut frame = FrameSet::blank(width, height);

        for y in 0..height {
            for x in 0..width {
                let i = (y * width + x) as usize;
                let color = Rgba8::from_unit((linspace(x, width) + t) % 1.0, linspace(y, height), 0.5, 1.0);
                frame.color[i] = color;
                frame.albedo[i] = color;
            }
        }

        // The pattern scrolls left by 1/frames of the width per frame
        frame.motion_vectors.fill(encode_motion(-1.0 / frames.max(1) as f32, 0.0));
        frame
    }
}

/// A sphere circling in front of a checkered far plane
#[derive(Debug, Clone, Copy)]
pub struct Sphere {
    pub radius: f32,
    /// View-space distance of the sphere center
    pub center_depth: f32,
    /// View-space distance of the background, also the normalization range
    pub far: f32,
}

impl Default for Sphere {
    fn default() -> Self {
        Self {
            radius: 0.4,
            center_depth: 2.0,
            far: 5.0,
        }
    }
}

impl Sphere {
    /// Sphere center in screen space at time `t` in `[0, 1)`
    fn center(t: f32) -> (f32, f32) {
        (0.5 * (TAU * t).cos(), 0.3 * (TAU * t).sin())
    }
}

impl Scene for Sphere {
    fn name(&self) -> &'static str {
        "sphere"
    }

    fn render(&self, index: u32, frames: u32, width: u32, height: u32) -> FrameSet {
        let frames = frames.max(1) as f32;
        let t = index as f32 / frames;
        let (cx, cy) = Self::center(t);
        let (next_x, next_y) = Self::center((index + 1) as f32 / frames);

        // Screen spans x in [-1, 1] and y in [-aspect, aspect]
        let aspect = height as f32 / width as f32;
        let velocity = encode_motion((next_x - cx) / 2.0, (next_y - cy) / (2.0 * aspect));

        let mut frame = FrameSet::blank(width, height);
        for row in 0..height {
            for col in 0..width {
                let i = (row * width + col) as usize;
                let x = linspace(col, width) * 2.0 - 1.0;
                let y = (linspace(row, height) * 2.0 - 1.0) * aspect;
                let (dx, dy) = (x - cx, y - cy);
                let dist_sq = dx * dx + dy * dy;

                if dist_sq < self.radius * self.radius {
                    let dz = (self.radius * self.radius - dist_sq).sqrt();
                    let normal = [dx / self.radius, dy / self.radius, dz / self.radius];
                    let shade = 0.2 + 0.8 * normal[2];
                    frame.depth[i] = pack_depth((self.center_depth - dz) / self.far);
                    frame.normal[i] = encode_normal(normal);
                    frame.albedo[i] = Rgba8::from_unit(0.9, 0.3, 0.2, 1.0);
                    frame.color[i] = Rgba8::from_unit(0.9 * shade, 0.3 * shade, 0.2 * shade, 1.0);
                    frame.motion_vectors[i] = velocity;
                } else {
                    let checker = ((col / 32) + (row / 32)) % 2 == 0;
                    let base = if checker { 0.8 } else { 0.3 };
                    let color = Rgba8::from_unit(base, base, base, 1.0);
                    frame.depth[i] = pack_depth(1.0);
                    frame.albedo[i] = color;
                    frame.color[i] = color;
                }
            }
        }
        frame
    }
}

/// Horizontal pan across a source image, one column per frame, over a vertical depth ramp
#[derive(Debug, Clone)]
pub struct Pan {
    source: RgbaImage,
    /// Source resized to the last requested strip extent
    strip: RefCell<Option<RgbaImage>>,
}

impl Pan {
    pub fn new(source: RgbaImage) -> Self {
        Self {
            source,
            strip: RefCell::new(None),
        }
    }

    /// Decodes any format `image` understands
    pub fn open(path: &Path) -> SequenceResult<Self> {
        Ok(Self::new(image::open(path)?.to_rgba8()))
    }
}

impl Scene for Pan {
    fn name(&self) -> &'static str {
        "pan"
    }

    fn render(&self, index: u32, frames: u32, width: u32, height: u32) -> FrameSet {
        // Wide enough to pan one column per frame
        let extent = (width + frames, height);
        let mut cache = self.strip.borrow_mut();
        if cache.as_ref().is_some_and(|strip| strip.dimensions() != extent) {
            *cache = None;
        }
        let strip = cache.get_or_insert_with(|| image::imageops::resize(&self.source, extent.0, extent.1, FilterType::Lanczos3));
        let offset = index.min(frames);

        let mut frame = FrameSet::blank(width, height);
        for y in 0..height {
            let depth = pack_depth(0.001 + linspace(y, height) * (1.0 - 0.001));
            for x in 0..width {
                let i = (y * width + x) as usize;
                let [r, g, b, a] = strip.get_pixel(x + offset, y).0;
                let color = Rgba8::new(r, g, b, a);
                frame.color[i] = color;
                frame.albedo[i] = color;
                frame.depth[i] = depth;
            }
        }

        frame.motion_vectors.fill(encode_motion(-1.0 / width as f32, 0.0));
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unpack_depth;
    use image::Rgba;

    #[test]
    fn test_gradient_scrolls() {
        let first = Gradient.render(0, 4, 5, 2);
        let later = Gradient.render(2, 4, 5, 2);

        assert_eq!(first.color[0], Rgba8::from_unit(0.0, 0.0, 0.5, 1.0));
        assert_eq!(later.color[0], Rgba8::from_unit(0.5, 0.0, 0.5, 1.0));
        assert_eq!(first.albedo, first.color);
    }

    #[test]
    fn test_sphere_is_nearer_than_background() {
        let sphere = Sphere::default();
        let (width, height) = (64, 32);
        let frame = sphere.render(0, 30, width, height);

        // At t = 0 the center sits at (0.5, 0), i.e. three quarters across, mid-height
        let center = (height / 2 * width + width * 3 / 4) as usize;
        assert!(unpack_depth(frame.depth[center]) < 0.4);
        assert_eq!(unpack_depth(frame.depth[0]), 1.0);
        assert_ne!(frame.normal[center], frame.normal[0]);
        assert_ne!(frame.motion_vectors[center], frame.motion_vectors[0]);
    }

    #[test]
    fn test_pan_shifts_one_column_per_frame() {
        let source = RgbaImage::from_fn(16, 4, |x, y| Rgba([(x * 16) as u8, (y * 60) as u8, 7, 255]));
        let pan = Pan::new(source);

        let (width, height, frames) = (12, 4, 4);
        let first = pan.render(0, frames, width, height);
        let second = pan.render(1, frames, width, height);

        for y in 0..height as usize {
            let row = y * width as usize;
            assert_eq!(first.color[row + 1..row + width as usize], second.color[row..row + width as usize - 1]);
        }
        // Depth ramps from near at the top to far at the bottom
        assert!(unpack_depth(first.depth[0]) < unpack_depth(first.depth[first.depth.len() - 1]));
    }
}
