//! Raw frame sequence input
//!
//! Each frame is five tightly packed RGBA8 layers stored as
//! `<prefix><index:04>.raw`, bottom row first. [`RawSequenceLoader`] reads them
//! top row first and never fails: a missing or malformed layer is replaced
//! with a fallback so that playback keeps going.

use crate::{
    config::{BYTES_PER_PIXEL, HEIGHT, SEQUENCE_LENGTH, WIDTH},
    error::{PipelineError, PipelineResult},
    stage_graph::TextureKey,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};

/// Written over a layer whose file has the wrong size; opaque green in RGBA8
pub const SIZE_MISMATCH_SENTINEL: u32 = 0xFF00FF00;

const FILE_EXTENSION: &str = ".raw";

/// One uploaded input layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Color,
    Depth,
    Normal,
    Albedo,
    MotionVectors,
}

impl LayerKind {
    pub const ALL: [LayerKind; 5] = [LayerKind::Color, LayerKind::Depth, LayerKind::Normal, LayerKind::Albedo, LayerKind::MotionVectors];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            LayerKind::Color => "color",
            LayerKind::Depth => "depth",
            LayerKind::Normal => "normal",
            LayerKind::Albedo => "albedo",
            LayerKind::MotionVectors => "motion_vectors",
        }
    }

    pub fn file_prefix(self) -> &'static str {
        match self {
            LayerKind::Color => "color_input_0_",
            LayerKind::Depth => "depth_input_0_",
            LayerKind::Normal => "normal_input_0_",
            LayerKind::Albedo => "albedo_0_",
            LayerKind::MotionVectors => "mv_input_0_",
        }
    }

    /// File name of this layer for frame `index`, e.g. `depth_input_0_0012.raw`
    pub fn file_name(self, index: u32) -> String {
        format!("{}{index:04}{FILE_EXTENSION}", self.file_prefix())
    }

    /// Pipeline texture this layer is uploaded into
    pub fn texture_key(self) -> TextureKey {
        match self {
            LayerKind::Color => TextureKey::Color,
            LayerKind::Depth => TextureKey::Depth,
            LayerKind::Normal => TextureKey::Normal,
            LayerKind::Albedo => TextureKey::Albedo,
            LayerKind::MotionVectors => TextureKey::MotionVectors,
        }
    }
}

/// Pixel data of one frame, top row first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayers {
    pub color: Bytes,
    pub depth: Bytes,
    pub normal: Bytes,
    pub albedo: Bytes,
    pub motion_vectors: Bytes,
}

impl FrameLayers {
    /// All layers zero-filled
    pub fn zeroed(layer_bytes: usize) -> Self {
        let zero = BytesMut::zeroed(layer_bytes).freeze();
        Self {
            color: zero.clone(),
            depth: zero.clone(),
            normal: zero.clone(),
            albedo: zero.clone(),
            motion_vectors: zero,
        }
    }

    pub fn layer(&self, kind: LayerKind) -> &Bytes {
        match kind {
            LayerKind::Color => &self.color,
            LayerKind::Depth => &self.depth,
            LayerKind::Normal => &self.normal,
            LayerKind::Albedo => &self.albedo,
            LayerKind::MotionVectors => &self.motion_vectors,
        }
    }

    fn layer_mut(&mut self, kind: LayerKind) -> &mut Bytes {
        match kind {
            LayerKind::Color => &mut self.color,
            LayerKind::Depth => &mut self.depth,
            LayerKind::Normal => &mut self.normal,
            LayerKind::Albedo => &mut self.albedo,
            LayerKind::MotionVectors => &mut self.motion_vectors,
        }
    }
}

/// Where the bytes of a loaded layer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSource {
    /// The requested file
    Loaded,
    /// The requested file was missing; frame 0 was used instead
    FallbackToFirst,
    /// Nothing usable was found
    ZeroFilled,
    /// The file had the wrong size and was replaced by [`SIZE_MISMATCH_SENTINEL`]
    SizeMismatch,
}

/// Supplies the input layers of a frame
pub trait FrameSource {
    /// Loads frame `index`; always returns a full set of layers
    fn load(&mut self, index: u32) -> FrameLayers;
}

/// A layer file that was found on disk
#[derive(Debug, PartialEq, Eq)]
enum LayerFile {
    Data(Vec<u8>),
    /// Size on disk; the contents are never read
    WrongSize(u64),
}

/// Reads frames from a directory of `.raw` files
#[derive(Debug, Clone)]
pub struct RawSequenceLoader {
    dir: PathBuf,
    width: u32,
    height: u32,
    sources: [LayerSource; 5],
}

impl RawSequenceLoader {
    /// Loader for native-resolution frames in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_extent(dir, WIDTH, HEIGHT)
    }

    pub fn with_extent(dir: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            dir: dir.into(),
            width,
            height,
            sources: [LayerSource::ZeroFilled; 5],
        }
    }

    /// Where each layer of the last loaded frame came from
    pub fn source(&self, kind: LayerKind) -> LayerSource {
        self.sources[kind.index()]
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    fn layer_bytes(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Paths tried for `file_name`: the sequence directory, then the same
    /// relative directory one level up
    fn candidates(&self, file_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![self.dir.join(file_name)];
        if self.dir.is_relative() {
            paths.push(Path::new("..").join(&self.dir).join(file_name));
        }
        paths
    }

    /// Finds the layer file and reads it when its size matches the layer
    fn read(&self, kind: LayerKind, index: u32) -> PipelineResult<LayerFile> {
        let file_name = kind.file_name(index);
        let expected = self.layer_bytes() as u64;
        for path in self.candidates(&file_name) {
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if metadata.len() != expected {
                return Ok(LayerFile::WrongSize(metadata.len()));
            }
            if let Ok(data) = std::fs::read(&path) {
                tracing::trace!(path = %path.display(), bytes = data.len(), "read layer");
                return Ok(LayerFile::Data(data));
            }
        }
        Err(PipelineError::FrameLoadMissing { path: self.dir.join(file_name) })
    }

    /// Reverses the row order
    fn flip_rows(&self, data: &[u8]) -> Bytes {
        let mut flipped = BytesMut::with_capacity(data.len());
        for row in data.chunks_exact(self.row_bytes()).rev() {
            flipped.extend_from_slice(row);
        }
        flipped.freeze()
    }

    fn sentinel(&self) -> Bytes {
        let mut filled = BytesMut::with_capacity(self.layer_bytes());
        for _ in 0..self.width as usize * self.height as usize {
            filled.put_u32_le(SIZE_MISMATCH_SENTINEL);
        }
        filled.freeze()
    }

    fn load_layer(&self, kind: LayerKind, index: u32) -> (Bytes, LayerSource) {
        let expected = self.layer_bytes();
        let error = match self.read(kind, index) {
            // The file may have changed size between the metadata check and the read
            Ok(LayerFile::Data(data)) if data.len() == expected => return (self.flip_rows(&data), LayerSource::Loaded),
            Ok(LayerFile::Data(data)) => {
                tracing::warn!(layer = kind.label(), index, bytes = data.len(), expected, "incorrect file size, filling with sentinel");
                return (self.sentinel(), LayerSource::SizeMismatch);
            }
            Ok(LayerFile::WrongSize(bytes)) => {
                tracing::warn!(layer = kind.label(), index, bytes, expected, "incorrect file size, filling with sentinel");
                return (self.sentinel(), LayerSource::SizeMismatch);
            }
            Err(error) => error,
        };

        if index > 0 {
            match self.read(kind, 0) {
                Ok(LayerFile::Data(data)) if data.len() == expected => {
                    tracing::warn!(layer = kind.label(), index, "{error}, falling back to frame 0");
                    return (self.flip_rows(&data), LayerSource::FallbackToFirst);
                }
                _ => {}
            }
        }

        tracing::warn!(layer = kind.label(), index, "{error}, filling with zeros");
        (BytesMut::zeroed(expected).freeze(), LayerSource::ZeroFilled)
    }
}

impl FrameSource for RawSequenceLoader {
    fn load(&mut self, index: u32) -> FrameLayers {
        let mut frame = FrameLayers::zeroed(0);
        for kind in LayerKind::ALL {
            let (bytes, source) = self.load_layer(kind, index);
            *frame.layer_mut(kind) = bytes;
            self.sources[kind.index()] = source;
        }
        tracing::debug!(index, sources = ?self.sources, "loaded frame");
        frame
    }
}

/// Paces the frame index: one advance every `frame_delay` ticks, wrapping at
/// the sequence length
#[derive(Debug, Clone)]
pub struct FrameSequencer {
    frame_delay: u32,
    counter: u32,
    next_index: u32,
    advances: u64,
}

impl FrameSequencer {
    pub fn new(frame_delay: u32) -> Self {
        Self {
            frame_delay,
            counter: 0,
            next_index: 0,
            advances: 0,
        }
    }

    /// Counts one pipeline iteration
    ///
    /// # Returns
    /// The frame index to load when the delay has elapsed, `None` otherwise
    pub fn tick(&mut self) -> Option<u32> {
        self.counter += 1;
        if self.counter < self.frame_delay {
            return None;
        }
        self.counter = 0;

        let index = self.next_index;
        self.next_index = (index + 1) % SEQUENCE_LENGTH;
        self.advances += 1;
        Some(index)
    }

    /// Index the next advance will load
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn advances(&self) -> u64 {
        self.advances
    }
}
