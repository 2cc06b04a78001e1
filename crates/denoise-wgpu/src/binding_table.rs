//! Resolution of stage slots to physical resources
//!
//! A [`BindingSet`] exists per (stage, frame-in-flight slot). Sets of stages
//! that never touch a history pair are resolved once and reused. Sets of
//! history stages are rewritten in place whenever they are resolved with a
//! history index other than the one they were last published with.

use crate::{
    config::FRAMES_IN_FLIGHT,
    error::{PipelineError, PipelineResult},
    frame_scheduler::{FrameContext, HistoryIndex},
    resource_pool::ResourceId,
    resources::PipelineResources,
    stage_graph::{AddressMode, GraphValidationError, StageDecl, StageGraph, StageId, TextureRef},
};

/// A resolved input slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInput {
    pub binding: u32,
    pub source: TextureRef,
    pub resource: ResourceId,
    pub addressing: AddressMode,
}

/// Where a color attachment writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    Resource(ResourceId),
    /// The present target acquired for this frame
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub location: u32,
    pub target: OutputTarget,
}

/// Live bindings of one stage for one frame-in-flight slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSet {
    pub stage: StageId,
    pub frame_slot: usize,
    /// History index the contents were resolved with; `None` for stages without history
    pub history_index: Option<HistoryIndex>,
    pub inputs: Vec<ResolvedInput>,
    pub outputs: Vec<ResolvedOutput>,
    /// Bumped every time the contents are rewritten
    pub generation: u64,
}

impl BindingSet {
    /// Resource ids read by this set
    pub fn input_resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.inputs.iter().map(|input| input.resource)
    }

    /// Resource ids written by this set
    pub fn output_resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.outputs.iter().filter_map(|output| match output.target {
            OutputTarget::Resource(id) => Some(id),
            OutputTarget::Present => None,
        })
    }
}

/// Binding sets for every (stage, slot) pair
#[derive(Debug)]
pub struct BindingTable {
    /// Indexed by `stage * FRAMES_IN_FLIGHT + frame_slot`
    sets: Vec<BindingSet>,
    /// Number of times any set was (re)published
    publications: u64,
}

impl BindingTable {
    /// Allocates and publishes one set per (stage, slot) pair of `graph`
    ///
    /// History sets start out resolved for history index 0.
    pub fn new(graph: &StageGraph, resources: &PipelineResources) -> PipelineResult<Self> {
        let mut sets = Vec::with_capacity(StageId::ALL.len() * FRAMES_IN_FLIGHT);
        for stage_id in StageId::ALL {
            let stage = graph.stage(stage_id).ok_or(GraphValidationError::MissingStage(stage_id))?;
            for frame_slot in 0..FRAMES_IN_FLIGHT {
                let history_index = stage.has_history().then_some(HistoryIndex::ZERO);
                let (inputs, outputs) = Self::bind(stage, history_index.unwrap_or_default(), resources)?;
                sets.push(BindingSet {
                    stage: stage.id,
                    frame_slot,
                    history_index,
                    inputs,
                    outputs,
                    generation: 0,
                });
            }
        }

        let publications = sets.len() as u64;
        Ok(Self { sets, publications })
    }

    pub fn publications(&self) -> u64 {
        self.publications
    }

    /// Returns the bindings of `stage` for the slot and history index of `ctx`
    ///
    /// Sets of history stages are rewritten in place when `ctx` carries a
    /// different history index than the one they were last published with.
    ///
    /// # Arguments
    /// * `stage` - The stage whose slots are resolved
    /// * `ctx` - Frame slot and history index in effect
    /// * `resources` - Physical resources behind the logical textures
    pub fn resolve(&mut self, stage: &StageDecl, ctx: &FrameContext, resources: &PipelineResources) -> PipelineResult<&BindingSet> {
        let frame_slot = ctx.frame_slot();
        let set = &mut self.sets[stage.id.index() * FRAMES_IN_FLIGHT + frame_slot];
        debug_assert_eq!((set.stage, set.frame_slot), (stage.id, frame_slot), "binding set stored under the wrong key");

        let history_index = stage.has_history().then(|| ctx.history_index());
        if set.history_index != history_index {
            let (inputs, outputs) = Self::bind(stage, ctx.history_index(), resources)?;
            set.inputs = inputs;
            set.outputs = outputs;
            set.history_index = history_index;
            set.generation += 1;
            self.publications += 1;
            tracing::trace!(stage = ?stage.id, frame_slot, ?history_index, generation = set.generation, "republished binding set");
        }

        Ok(set)
    }

    fn bind(stage: &StageDecl, history_index: HistoryIndex, resources: &PipelineResources) -> PipelineResult<(Vec<ResolvedInput>, Vec<ResolvedOutput>)> {
        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for slot in stage.inputs {
            let resource = resources.resolve(slot.source, history_index).ok_or(PipelineError::InvalidGraph(GraphValidationError::PresentTargetAsInput(stage.id)))?;
            inputs.push(ResolvedInput {
                binding: slot.binding,
                source: slot.source,
                resource,
                addressing: slot.addressing,
            });
        }

        let outputs = stage
            .outputs
            .iter()
            .map(|slot| ResolvedOutput {
                location: slot.location,
                target: match resources.resolve(slot.target, history_index) {
                    Some(id) => OutputTarget::Resource(id),
                    None => OutputTarget::Present,
                },
            })
            .collect();

        Ok((inputs, outputs))
    }
}
