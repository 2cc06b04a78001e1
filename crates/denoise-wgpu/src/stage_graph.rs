//! The fixed stage graph of the denoise pipeline
//!
//! Every stage is one full-screen draw described by a static [`StageDecl`]. The
//! table below is the whole graph; [`StageGraph::record`] walks it once per
//! frame, placing state transitions around each draw.

use crate::{
    binding_table::{BindingTable, OutputTarget},
    config::{HEIGHT, QUAD_VERTEX_COUNT, RAY_MARCH_STRIDE, WIDTH},
    error::PipelineResult,
    frame_scheduler::FrameContext,
    recording::{Command, FrameRecording, StageDraw},
    resource_pool::PixelFormat,
    resource_state::{ResourceState, StateTracker},
    resources::PipelineResources,
};
use std::{collections::HashSet, fmt};

/// Identifies one stage of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    DepthDownsample,
    RayMarch,
    TemporalDenoise,
    SpatialDenoise,
    SpatialDenoise2,
    Fresnel,
    TemporalDenoise2,
    Present,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::DepthDownsample,
        StageId::RayMarch,
        StageId::TemporalDenoise,
        StageId::SpatialDenoise,
        StageId::SpatialDenoise2,
        StageId::Fresnel,
        StageId::TemporalDenoise2,
        StageId::Present,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Single-instance textures, either uploaded from the frame loader or written by one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKey {
    Color,
    Depth,
    Normal,
    Albedo,
    MotionVectors,
    DepthDownsampled,
    RayMarchColor,
    TnrIntermediate,
    TnrAux,
    Fresnel,
}

impl TextureKey {
    pub const ALL: [TextureKey; 10] = [
        TextureKey::Color,
        TextureKey::Depth,
        TextureKey::Normal,
        TextureKey::Albedo,
        TextureKey::MotionVectors,
        TextureKey::DepthDownsampled,
        TextureKey::RayMarchColor,
        TextureKey::TnrIntermediate,
        TextureKey::TnrAux,
        TextureKey::Fresnel,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Uploaded every frame rather than rendered
    pub fn is_external(self) -> bool {
        matches!(self, TextureKey::Color | TextureKey::Depth | TextureKey::Normal | TextureKey::Albedo | TextureKey::MotionVectors)
    }

    pub fn label(self) -> &'static str {
        match self {
            TextureKey::Color => "color",
            TextureKey::Depth => "depth",
            TextureKey::Normal => "normal",
            TextureKey::Albedo => "albedo",
            TextureKey::MotionVectors => "motion_vectors",
            TextureKey::DepthDownsampled => "depth_downsampled",
            TextureKey::RayMarchColor => "ray_march_color",
            TextureKey::TnrIntermediate => "tnr_intermediate",
            TextureKey::TnrAux => "tnr_aux",
            TextureKey::Fresnel => "fresnel",
        }
    }

    /// Uploaded layers keep the native size; everything rendered before the final upscale is ray-march sized
    pub fn resolution(self) -> Resolution {
        if self.is_external() { Resolution::Native } else { Resolution::RayMarch }
    }

    pub fn format(self) -> PixelFormat {
        if self.is_external() { PixelFormat::Rgba8Unorm } else { PixelFormat::Rgba16Float }
    }
}

/// Textures kept as a read/write pair across frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryKey {
    TnrInfo,
    Snr,
    Snr2,
    Tnr2,
    Tnr2Info,
}

impl HistoryKey {
    pub const ALL: [HistoryKey; 5] = [HistoryKey::TnrInfo, HistoryKey::Snr, HistoryKey::Snr2, HistoryKey::Tnr2, HistoryKey::Tnr2Info];

    /// Every history image is a float target
    pub const FORMAT: PixelFormat = PixelFormat::Rgba16Float;
    /// History pairs are ray-march sized
    pub const RESOLUTION: Resolution = Resolution::RayMarch;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            HistoryKey::TnrInfo => "tnr_info",
            HistoryKey::Snr => "snr",
            HistoryKey::Snr2 => "snr2",
            HistoryKey::Tnr2 => "tnr2",
            HistoryKey::Tnr2Info => "tnr2_info",
        }
    }
}

/// Which half of a history pair a slot refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryRole {
    /// Written last frame, read this frame (`[historyIndex]`)
    Previous,
    /// Written this frame (`[1 - historyIndex]`)
    Current,
}

/// Logical texture named by a stage slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureRef {
    Fixed(TextureKey),
    History(HistoryKey, HistoryRole),
    /// The acquired swap-chain image
    PresentTarget,
}

impl TextureRef {
    /// Size the texture is allocated at; the present target is native
    pub fn resolution(self) -> Resolution {
        match self {
            TextureRef::Fixed(key) => key.resolution(),
            TextureRef::History(..) => HistoryKey::RESOLUTION,
            TextureRef::PresentTarget => Resolution::Native,
        }
    }
}

impl fmt::Display for TextureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureRef::Fixed(key) => f.write_str(key.label()),
            TextureRef::History(key, HistoryRole::Previous) => write!(f, "{}[prev]", key.label()),
            TextureRef::History(key, HistoryRole::Current) => write!(f, "{}[cur]", key.label()),
            TextureRef::PresentTarget => f.write_str("present_target"),
        }
    }
}

/// Sampler addressing for an input slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    ClampToEdge,
}

/// Viewport and scissor size of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Native,
    RayMarch,
}

impl Resolution {
    pub fn extent(self) -> (u32, u32) {
        self.extent_for_stride(RAY_MARCH_STRIDE)
    }

    /// Extent when the ray-march targets are downscaled by `stride`
    pub fn extent_for_stride(self, stride: u32) -> (u32, u32) {
        match self {
            Resolution::Native => (WIDTH, HEIGHT),
            Resolution::RayMarch => (WIDTH / stride, HEIGHT / stride),
        }
    }
}

/// A sampled input of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    /// Input slot index in the fragment shader
    pub binding: u32,
    pub source: TextureRef,
    pub addressing: AddressMode,
}

/// A color attachment of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSlot {
    /// Fragment output location
    pub location: u32,
    pub target: TextureRef,
}

/// Static description of one stage
#[derive(Debug)]
pub struct StageDecl {
    pub id: StageId,
    /// Human-readable name for labels and logs
    pub name: &'static str,
    /// File name of the fragment program
    pub fragment_shader: &'static str,
    pub resolution: Resolution,
    pub inputs: &'static [InputSlot],
    pub outputs: &'static [OutputSlot],
}

impl StageDecl {
    /// Whether any slot of this stage goes through a history pair
    pub fn has_history(&self) -> bool {
        self.inputs.iter().map(|input| input.source).chain(self.outputs.iter().map(|output| output.target)).any(|r| matches!(r, TextureRef::History(..)))
    }

    pub fn writes_present_target(&self) -> bool {
        self.outputs.iter().any(|output| output.target == TextureRef::PresentTarget)
    }
}

const fn input(binding: u32, source: TextureRef) -> InputSlot {
    InputSlot {
        binding,
        source,
        addressing: AddressMode::ClampToEdge,
    }
}

/// Raw color is sampled with wrap-around addressing
const fn color_input(binding: u32) -> InputSlot {
    InputSlot {
        binding,
        source: TextureRef::Fixed(TextureKey::Color),
        addressing: AddressMode::Repeat,
    }
}

const fn output(location: u32, target: TextureRef) -> OutputSlot {
    OutputSlot { location, target }
}

use HistoryRole::{Current, Previous};
use TextureRef::{Fixed, History, PresentTarget};

/// The pipeline, in execution order
pub static STAGES: &[StageDecl] = &[
    StageDecl {
        id: StageId::DepthDownsample,
        name: "Depth Downsample",
        fragment_shader: "depth_downsample.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[
            input(0, Fixed(TextureKey::Depth)),
            color_input(1),
            input(2, Fixed(TextureKey::Normal)),
            input(3, Fixed(TextureKey::Albedo)),
        ],
        outputs: &[output(0, Fixed(TextureKey::DepthDownsampled))],
    },
    StageDecl {
        id: StageId::RayMarch,
        name: "Ray March",
        fragment_shader: "ray_march.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[color_input(0), input(1, Fixed(TextureKey::DepthDownsampled)), input(2, Fixed(TextureKey::Normal))],
        outputs: &[output(0, Fixed(TextureKey::RayMarchColor))],
    },
    StageDecl {
        id: StageId::TemporalDenoise,
        name: "Temporal Denoise",
        fragment_shader: "tnr.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[
            input(0, Fixed(TextureKey::RayMarchColor)),
            input(1, Fixed(TextureKey::DepthDownsampled)),
            input(2, Fixed(TextureKey::MotionVectors)),
            input(3, History(HistoryKey::Snr, Previous)),
            input(4, History(HistoryKey::TnrInfo, Previous)),
            color_input(5),
        ],
        outputs: &[
            output(0, Fixed(TextureKey::TnrIntermediate)),
            output(1, History(HistoryKey::TnrInfo, Current)),
            output(2, Fixed(TextureKey::TnrAux)),
        ],
    },
    StageDecl {
        id: StageId::SpatialDenoise,
        name: "Spatial Denoise",
        fragment_shader: "snr.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[
            input(0, Fixed(TextureKey::TnrIntermediate)),
            input(1, Fixed(TextureKey::DepthDownsampled)),
            input(2, History(HistoryKey::TnrInfo, Current)),
        ],
        outputs: &[output(0, History(HistoryKey::Snr, Current))],
    },
    StageDecl {
        id: StageId::SpatialDenoise2,
        name: "Spatial Denoise 2",
        fragment_shader: "snr2.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[input(0, History(HistoryKey::Snr, Current))],
        outputs: &[output(0, History(HistoryKey::Snr2, Current))],
    },
    StageDecl {
        id: StageId::Fresnel,
        name: "Fresnel",
        fragment_shader: "fresnel.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[input(0, Fixed(TextureKey::Depth)), input(1, Fixed(TextureKey::Normal))],
        outputs: &[output(0, Fixed(TextureKey::Fresnel))],
    },
    StageDecl {
        id: StageId::TemporalDenoise2,
        name: "Temporal Denoise 2",
        fragment_shader: "tnr2.frag.wgsl",
        resolution: Resolution::RayMarch,
        inputs: &[
            input(0, History(HistoryKey::Snr2, Current)),
            input(1, History(HistoryKey::Tnr2, Previous)),
            input(2, Fixed(TextureKey::Depth)),
            input(3, Fixed(TextureKey::MotionVectors)),
            input(4, Fixed(TextureKey::Fresnel)),
            input(5, History(HistoryKey::TnrInfo, Current)),
        ],
        outputs: &[output(0, History(HistoryKey::Tnr2, Current)), output(1, History(HistoryKey::Tnr2Info, Current))],
    },
    StageDecl {
        id: StageId::Present,
        name: "Present",
        fragment_shader: "present.frag.wgsl",
        resolution: Resolution::Native,
        inputs: &[input(0, History(HistoryKey::Tnr2, Current)), color_input(1)],
        outputs: &[output(0, PresentTarget)],
    },
];

/// Errors found while validating a stage table
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("stage graph must have at least one stage")]
    NoStages,

    #[error("stage {0:?} is missing outputs")]
    StageMissingOutputs(StageId),

    /// Two inputs share a binding, or two outputs share a location
    #[error("duplicate binding {1} in stage {0:?}")]
    DuplicateBinding(StageId, u32),

    #[error("stage {0:?} reads '{1}' which it also writes")]
    OutputAlsoInput(StageId, TextureRef),

    /// A texture is written by more than one stage, or an uploaded texture is rendered to
    #[error("texture '{1}' is being overwritten in stage {0:?}")]
    TextureOverwritten(StageId, TextureRef),

    #[error("input texture '{1}' in stage {0:?} is not uploaded or written by any earlier stage")]
    InputNotProduced(StageId, TextureRef),

    #[error("stage {0:?} writes the read half of history '{1}'")]
    HistoryWriteToPrevious(StageId, TextureRef),

    /// An output is allocated at a different size than the stage's viewport
    #[error("stage {0:?} writes '{1}' at a different resolution than its viewport")]
    ResolutionMismatch(StageId, TextureRef),

    #[error("stage {0:?} samples the present target")]
    PresentTargetAsInput(StageId),

    #[error("present target written in stage {0:?} but must only be in the last stage")]
    PresentNotInLastStage(StageId),

    #[error("no stage writes the present target")]
    MissingPresent,

    /// A stage the binding table expects is not declared
    #[error("stage {0:?} is not declared")]
    MissingStage(StageId),
}

/// Checks a stage table for correctness
///
/// Verifies binding uniqueness, that no stage reads its own output, that every
/// input is produced before it is read, and that only the last stage presents.
pub fn validate(stages: &[StageDecl]) -> Result<(), GraphValidationError> {
    if stages.is_empty() {
        return Err(GraphValidationError::NoStages);
    }

    for stage in stages {
        if stage.outputs.is_empty() {
            return Err(GraphValidationError::StageMissingOutputs(stage.id));
        }

        let mut used_bindings = HashSet::new();
        for slot in stage.inputs {
            if !used_bindings.insert(slot.binding) {
                return Err(GraphValidationError::DuplicateBinding(stage.id, slot.binding));
            }
            if slot.source == TextureRef::PresentTarget {
                return Err(GraphValidationError::PresentTargetAsInput(stage.id));
            }
        }

        let mut used_locations = HashSet::new();
        for slot in stage.outputs {
            if !used_locations.insert(slot.location) {
                return Err(GraphValidationError::DuplicateBinding(stage.id, slot.location));
            }
            if stage.inputs.iter().any(|input| input.source == slot.target) {
                return Err(GraphValidationError::OutputAlsoInput(stage.id, slot.target));
            }
        }
    }

    let last = stages.len() - 1;
    for (i, stage) in stages.iter().enumerate() {
        if stage.writes_present_target() && i != last {
            return Err(GraphValidationError::PresentNotInLastStage(stage.id));
        }
    }
    if !stages[last].writes_present_target() {
        return Err(GraphValidationError::MissingPresent);
    }

    // History pairs read as `Previous` must be written as `Current` somewhere in the frame
    let history_written: HashSet<HistoryKey> = stages
        .iter()
        .flat_map(|stage| stage.outputs.iter())
        .filter_map(|slot| match slot.target {
            TextureRef::History(key, _) => Some(key),
            _ => None,
        })
        .collect();

    let mut written = HashSet::new();
    for stage in stages {
        for slot in stage.inputs {
            let available = match slot.source {
                TextureRef::Fixed(key) => key.is_external() || written.contains(&slot.source),
                TextureRef::History(key, HistoryRole::Previous) => history_written.contains(&key),
                TextureRef::History(_, HistoryRole::Current) => written.contains(&slot.source),
                TextureRef::PresentTarget => false,
            };
            if !available {
                return Err(GraphValidationError::InputNotProduced(stage.id, slot.source));
            }
        }

        for slot in stage.outputs {
            match slot.target {
                TextureRef::Fixed(key) if key.is_external() => return Err(GraphValidationError::TextureOverwritten(stage.id, slot.target)),
                TextureRef::History(_, HistoryRole::Previous) => return Err(GraphValidationError::HistoryWriteToPrevious(stage.id, slot.target)),
                _ => {}
            }
            if !written.insert(slot.target) {
                return Err(GraphValidationError::TextureOverwritten(stage.id, slot.target));
            }
        }
    }

    for stage in stages {
        if let Some(slot) = stage.outputs.iter().find(|slot| slot.target.resolution() != stage.resolution) {
            return Err(GraphValidationError::ResolutionMismatch(stage.id, slot.target));
        }
    }

    Ok(())
}

/// A validated stage table
#[derive(Debug, Clone, Copy)]
pub struct StageGraph {
    stages: &'static [StageDecl],
}

impl StageGraph {
    /// Validates `stages` and wraps them
    pub fn new(stages: &'static [StageDecl]) -> Result<Self, GraphValidationError> {
        validate(stages)?;
        Ok(Self { stages })
    }

    /// The built-in denoise pipeline
    pub fn standard() -> Result<Self, GraphValidationError> {
        Self::new(STAGES)
    }

    pub fn stages(&self) -> &'static [StageDecl] {
        self.stages
    }

    pub fn stage(&self, id: StageId) -> Option<&'static StageDecl> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    /// Records every stage of one frame, in order
    ///
    /// For each stage: inputs are moved to `ShaderReadable`, outputs are opened
    /// as color attachments, the draw is recorded with the bindings resolved for
    /// `ctx`, and the outputs are stored back to `ShaderReadable`.
    ///
    /// # Arguments
    /// * `ctx` - Slot and history index of the frame being recorded
    /// * `bindings` - Binding sets, rewritten here when the history index changed
    /// * `tracker` - Recorded state of every pooled image
    /// * `resources` - Physical resources behind each logical texture
    /// * `recording` - Command list the frame is appended to
    pub fn record(&self, ctx: &FrameContext, bindings: &mut BindingTable, tracker: &mut StateTracker, resources: &PipelineResources, recording: &mut FrameRecording) -> PipelineResult<()> {
        for stage in self.stages {
            let set = bindings.resolve(stage, ctx, resources)?;
            debug_assert!(set.history_index.is_none_or(|h| h == ctx.history_index()), "binding set for {:?} resolved with a different history index", stage.id);

            for input in &set.inputs {
                if let Some(barrier) = tracker.require(input.resource, ResourceState::ShaderReadable)? {
                    recording.push(Command::Barrier(barrier));
                }
            }

            for output in &set.outputs {
                if let OutputTarget::Resource(resource) = output.target {
                    recording.push(Command::Barrier(tracker.begin_attachment(resource)?));
                }
            }

            tracing::debug!(stage = stage.name, generation = set.generation, history_index = ?set.history_index, "recording stage");
            recording.push(Command::Draw(StageDraw {
                stage: stage.id,
                bindings: set.clone(),
                viewport: stage.resolution.extent(),
                vertex_count: QUAD_VERTEX_COUNT,
            }));

            for output in &set.outputs {
                if let OutputTarget::Resource(resource) = output.target {
                    recording.push(Command::Barrier(tracker.end_attachment(resource)?));
                }
            }
        }

        Ok(())
    }
}
