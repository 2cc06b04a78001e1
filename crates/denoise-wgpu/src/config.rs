//! Compile-time pipeline dimensions and the runtime configuration

use std::path::PathBuf;

/// Native frame width in pixels
pub const WIDTH: u32 = 1920;
/// Native frame height in pixels
pub const HEIGHT: u32 = 864;

/// Downscale factor of the ray-march resolution relative to the native frame
pub const RAY_MARCH_STRIDE: u32 = 1;
pub const RAY_MARCH_WIDTH: u32 = WIDTH / RAY_MARCH_STRIDE;
pub const RAY_MARCH_HEIGHT: u32 = HEIGHT / RAY_MARCH_STRIDE;

/// Number of frame-in-flight slots
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Number of frames in a raw input sequence; the frame index wraps here
pub const SEQUENCE_LENGTH: u32 = 148;

/// Pipeline iterations per frame-index advance
pub const DEFAULT_FRAME_DELAY: u32 = 2;

/// All raw layers are tightly packed RGBA8
pub const BYTES_PER_PIXEL: usize = 4;

/// Byte length of one raw layer at native resolution
pub const LAYER_BYTES: usize = WIDTH as usize * HEIGHT as usize * BYTES_PER_PIXEL;

/// Vertex count of the procedural full-screen quad (two triangles)
pub const QUAD_VERTEX_COUNT: u32 = 6;

/// Runtime configuration supplied by the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Directory holding the `*_0_NNNN.raw` sequence files
    pub sequence_dir: PathBuf,
    /// Optional directory with WGSL overrides for the built-in shaders
    pub shader_dir: Option<PathBuf>,
    /// Pipeline iterations per frame-index advance
    pub frame_delay: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sequence_dir: PathBuf::from("img"),
            shader_dir: None,
            frame_delay: DEFAULT_FRAME_DELAY,
        }
    }
}
