//! Backend-neutral command list for one frame
//!
//! The orchestrator records a [`FrameRecording`] and hands it to
//! [`Backend::submit`](crate::backend::Backend::submit), which turns it into
//! device commands.

use crate::{
    binding_table::BindingSet,
    frame_scheduler::HistoryIndex,
    resource_pool::ResourceId,
    resource_state::Barrier,
    stage_graph::StageId,
};

/// One full-screen draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDraw {
    pub stage: StageId,
    /// Snapshot of the binding set the draw was recorded with
    pub bindings: BindingSet,
    /// Viewport and scissor extent
    pub viewport: (u32, u32),
    pub vertex_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// State transition of one image
    Barrier(Barrier),
    /// Copy a whole staging buffer into an image
    Upload { staging: ResourceId, image: ResourceId },
    Draw(StageDraw),
}

/// Everything submitted for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecording {
    pub frame_slot: usize,
    pub history_index: HistoryIndex,
    /// Acquired present target, `None` for setup work
    pub target_index: Option<u32>,
    pub commands: Vec<Command>,
}

impl FrameRecording {
    pub fn new(frame_slot: usize, history_index: HistoryIndex, target_index: Option<u32>) -> Self {
        Self {
            frame_slot,
            history_index,
            target_index,
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn draws(&self) -> impl Iterator<Item = &StageDraw> {
        self.commands.iter().filter_map(|command| match command {
            Command::Draw(draw) => Some(draw),
            _ => None,
        })
    }

    pub fn barriers(&self) -> impl Iterator<Item = &Barrier> {
        self.commands.iter().filter_map(|command| match command {
            Command::Barrier(barrier) => Some(barrier),
            _ => None,
        })
    }

    pub fn uploads(&self) -> impl Iterator<Item = (ResourceId, ResourceId)> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Upload { staging, image } => Some((*staging, *image)),
            _ => None,
        })
    }

    pub fn presents(&self) -> bool {
        self.draws().any(|draw| draw.stage == StageId::Present)
    }
}
