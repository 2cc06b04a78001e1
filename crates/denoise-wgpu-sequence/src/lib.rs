//! Synthetic raw sequences for the denoise pipeline
//!
//! Generators produce every layer the pipeline uploads and write them in the
//! layout `denoise_wgpu::frame_loader` expects: tightly packed RGBA8, one file
//! per layer and frame, bottom row first.

pub mod scenes;

use bytemuck::{Pod, Zeroable};
use denoise_wgpu::frame_loader::LayerKind;
use std::path::{Path, PathBuf};

/// Errors produced while generating a sequence
#[derive(thiserror::Error, Debug)]
pub enum SequenceError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load source image: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid sequence extent {width}x{height}")]
    InvalidExtent { width: u32, height: u32 },
}

pub type SequenceResult<T> = Result<T, SequenceError>;

/// Scale between uv offsets and encoded motion vectors; matches the temporal shaders
pub const MOTION_SCALE: f32 = 0.05;

/// Largest value of the 24-bit packed depth
const DEPTH_MAX: f32 = 16_777_215.0;

/// One RGBA8 texel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8 {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Converts normalized channels, clamping to `[0, 1]`
    pub fn from_unit(r: f32, g: f32, b: f32, a: f32) -> Self {
        let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        Self::new(quantize(r), quantize(g), quantize(b), quantize(a))
    }
}

/// Packs a depth in `[0, 1]` as a 24-bit integer, least significant byte in red
pub fn pack_depth(depth: f32) -> Rgba8 {
    let z = (depth.clamp(0.0, 1.0) * DEPTH_MAX).round() as u32;
    Rgba8::new((z & 0xFF) as u8, ((z >> 8) & 0xFF) as u8, ((z >> 16) & 0xFF) as u8, 255)
}

/// Inverse of [`pack_depth`]
pub fn unpack_depth(texel: Rgba8) -> f32 {
    let z = u32::from(texel.r) | u32::from(texel.g) << 8 | u32::from(texel.b) << 16;
    z as f32 / DEPTH_MAX
}

/// Maps a unit normal from `[-1, 1]` to `[0, 1]` per channel
pub fn encode_normal(normal: [f32; 3]) -> Rgba8 {
    let [x, y, z] = normal;
    Rgba8::from_unit(x * 0.5 + 0.5, y * 0.5 + 0.5, z * 0.5 + 0.5, 1.0)
}

/// Encodes a per-frame uv velocity, biased around mid-gray
pub fn encode_motion(du: f32, dv: f32) -> Rgba8 {
    Rgba8::from_unit(du / MOTION_SCALE * 0.5 + 0.5, dv / MOTION_SCALE * 0.5 + 0.5, 0.5, 1.0)
}

/// Every layer of one frame, top row first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSet {
    pub width: u32,
    pub height: u32,
    pub color: Vec<Rgba8>,
    pub depth: Vec<Rgba8>,
    pub normal: Vec<Rgba8>,
    pub albedo: Vec<Rgba8>,
    pub motion_vectors: Vec<Rgba8>,
}

impl FrameSet {
    /// Opaque black color, far depth, camera-facing normals and no motion
    pub fn blank(width: u32, height: u32) -> Self {
        let texels = width as usize * height as usize;
        Self {
            width,
            height,
            color: vec![Rgba8::new(0, 0, 0, 255); texels],
            depth: vec![pack_depth(1.0); texels],
            normal: vec![encode_normal([0.0, 0.0, 1.0]); texels],
            albedo: vec![Rgba8::new(0, 0, 0, 255); texels],
            motion_vectors: vec![encode_motion(0.0, 0.0); texels],
        }
    }

    pub fn layer(&self, kind: LayerKind) -> &[Rgba8] {
        match kind {
            LayerKind::Color => &self.color,
            LayerKind::Depth => &self.depth,
            LayerKind::Normal => &self.normal,
            LayerKind::Albedo => &self.albedo,
            LayerKind::MotionVectors => &self.motion_vectors,
        }
    }

    /// Raw bytes of `kind`, bottom row first
    pub fn bottom_up_bytes(&self, kind: LayerKind) -> Vec<u8> {
        let layer = self.layer(kind);
        let mut bytes = Vec::with_capacity(layer.len() * size_of::<Rgba8>());
        for row in layer.chunks_exact(self.width as usize).rev() {
            bytes.extend_from_slice(bytemuck::cast_slice(row));
        }
        bytes
    }

    /// Writes every layer of frame `index` into `dir`
    pub fn write(&self, dir: &Path, index: u32) -> SequenceResult<()> {
        for kind in LayerKind::ALL {
            let path = dir.join(kind.file_name(index));
            std::fs::write(&path, self.bottom_up_bytes(kind)).map_err(|source| SequenceError::Write { path, source })?;
        }
        Ok(())
    }
}

/// Produces the frames of a synthetic sequence
pub trait Scene {
    fn name(&self) -> &'static str;

    /// Renders frame `index` of a `frames`-long sequence
    fn render(&self, index: u32, frames: u32, width: u32, height: u32) -> FrameSet;
}

/// Renders `frames` frames of `scene` into `dir`, creating it if needed
///
/// # Returns
/// The number of frames written
pub fn generate_sequence(scene: &dyn Scene, dir: &Path, frames: u32, width: u32, height: u32) -> SequenceResult<u32> {
    if width == 0 || height == 0 {
        return Err(SequenceError::InvalidExtent { width, height });
    }
    std::fs::create_dir_all(dir).map_err(|source| SequenceError::Write { path: dir.to_path_buf(), source })?;

    for index in 0..frames {
        scene.render(index, frames, width, height).write(dir, index)?;
        if index % 10 == 0 {
            tracing::info!(scene = scene.name(), index, "generated frame");
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use denoise_wgpu::frame_loader::{FrameSource, LayerSource, RawSequenceLoader};

    #[test]
    fn test_depth_packing_matches_loader_layout() {
        assert_eq!(pack_depth(0.0), Rgba8::new(0, 0, 0, 255));
        assert_eq!(pack_depth(1.0), Rgba8::new(255, 255, 255, 255));
        let texel = Rgba8::new(0x03, 0x02, 0x01, 255);
        assert_eq!(unpack_depth(texel), 0x010203 as f32 / DEPTH_MAX);
        assert_eq!(pack_depth(unpack_depth(texel)), texel);
        assert!((unpack_depth(pack_depth(0.25)) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_motion_is_biased_around_mid_gray() {
        assert_eq!(encode_motion(0.0, 0.0), Rgba8::new(128, 128, 128, 255));
        assert_eq!(encode_motion(MOTION_SCALE, -MOTION_SCALE), Rgba8::new(255, 0, 128, 255));
    }

    #[test]
    fn test_layers_are_written_bottom_up() {
        let mut frame = FrameSet::blank(2, 2);
        frame.color = vec![Rgba8::new(1, 1, 1, 1), Rgba8::new(2, 2, 2, 2), Rgba8::new(3, 3, 3, 3), Rgba8::new(4, 4, 4, 4)];

        assert_eq!(frame.bottom_up_bytes(LayerKind::Color), [3, 3, 3, 3, 4, 4, 4, 4, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_loader_reads_back_top_row_first() {
        let dir = tempfile::tempdir().unwrap();
        let scene = scenes::Gradient;
        generate_sequence(&scene, dir.path(), 2, 8, 4).unwrap();

        let mut loader = RawSequenceLoader::with_extent(dir.path(), 8, 4);
        let loaded = loader.load(1);
        let expected = scene.render(1, 2, 8, 4);

        assert_eq!(loaded.color.as_ref(), bytemuck::cast_slice::<Rgba8, u8>(&expected.color));
        assert_eq!(loaded.depth.as_ref(), bytemuck::cast_slice::<Rgba8, u8>(&expected.depth));
        for kind in LayerKind::ALL {
            assert_eq!(loader.source(kind), LayerSource::Loaded);
        }
    }

    #[test]
    fn test_zero_extent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate_sequence(&scenes::Gradient, dir.path(), 1, 0, 4).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidExtent { width: 0, height: 4 }));
    }
}
