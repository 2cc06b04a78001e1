//! WGSL sources for the full-screen vertex shader and every stage
//!
//! Built-in sources are embedded at compile time. A shader directory may
//! override any of them by file name.

use crate::{
    error::{PipelineError, PipelineResult},
    stage_graph::StageDecl,
};
use std::{collections::HashMap, io, path::Path};

/// File name of the shared vertex shader
pub const VERTEX_SHADER: &str = "fullscreen.vert.wgsl";

static BUILTIN: &[(&str, &str)] = &[
    (VERTEX_SHADER, include_str!("../shaders/fullscreen.vert.wgsl")),
    ("depth_downsample.frag.wgsl", include_str!("../shaders/depth_downsample.frag.wgsl")),
    ("ray_march.frag.wgsl", include_str!("../shaders/ray_march.frag.wgsl")),
    ("tnr.frag.wgsl", include_str!("../shaders/tnr.frag.wgsl")),
    ("snr.frag.wgsl", include_str!("../shaders/snr.frag.wgsl")),
    ("snr2.frag.wgsl", include_str!("../shaders/snr2.frag.wgsl")),
    ("fresnel.frag.wgsl", include_str!("../shaders/fresnel.frag.wgsl")),
    ("tnr2.frag.wgsl", include_str!("../shaders/tnr2.frag.wgsl")),
    ("present.frag.wgsl", include_str!("../shaders/present.frag.wgsl")),
];

/// Shader sources keyed by file name
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    sources: HashMap<String, String>,
}

impl ShaderLibrary {
    /// The sources embedded in the crate
    pub fn builtin() -> Self {
        Self {
            sources: BUILTIN.iter().map(|(name, source)| (name.to_string(), source.to_string())).collect(),
        }
    }

    /// Built-in sources, with every file found in `dir` taking precedence
    ///
    /// Files missing from `dir` keep their built-in source. Any other read
    /// failure is reported as `ShaderLoad`.
    pub fn from_dir(dir: &Path) -> PipelineResult<Self> {
        let mut library = Self::builtin();
        for (name, _) in BUILTIN {
            let path = dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    tracing::info!(shader = name, path = %path.display(), "using shader override");
                    library.sources.insert(name.to_string(), source);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(shader = name, "no override, using built-in shader");
                }
                Err(source) => {
                    return Err(PipelineError::ShaderLoad {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(library)
    }

    pub fn vertex(&self) -> PipelineResult<&str> {
        self.get(VERTEX_SHADER)
    }

    /// Fragment source of `stage`
    pub fn fragment(&self, stage: &StageDecl) -> PipelineResult<&str> {
        self.get(stage.fragment_shader)
    }

    fn get(&self, name: &str) -> PipelineResult<&str> {
        self.sources.get(name).map(String::as_str).ok_or_else(|| PipelineError::ShaderLoad {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such shader in the library"),
        })
    }
}
