//! Per-resource access-state tracking
//!
//! Every image the pipeline touches has a recorded [`ResourceState`]. Before a
//! command reads or writes an image, the tracker compares the recorded state to
//! the one the command needs and emits a [`Barrier`] when they differ.

use crate::{
    error::{PipelineError, PipelineResult},
    resource_pool::ResourceId,
};
use std::collections::HashMap;

/// Access mode an image is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Contents are undefined (freshly created)
    #[default]
    Undefined,
    /// Target of a buffer-to-image copy
    TransferDestination,
    /// Bound as a sampled texture
    ShaderReadable,
    /// Bound as a render-pass color attachment
    ColorOutput,
}

impl ResourceState {
    /// Whether `self -> to` is one of the explicitly requestable edges
    pub fn can_transition_to(self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (Undefined, TransferDestination) | (TransferDestination, ShaderReadable) | (ShaderReadable, TransferDestination) | (Undefined, ShaderReadable)
        )
    }
}

/// How a barrier is realized on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Standalone pipeline barrier requested through [`StateTracker::require`]
    Explicit,
    /// Render pass load; previous contents are discarded
    AttachmentLoad,
    /// Render pass store into the sampled state
    AttachmentStore,
}

/// A single recorded state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub from: ResourceState,
    pub to: ResourceState,
    pub kind: BarrierKind,
}

/// Recorded state of every tracked image
#[derive(Debug, Default)]
pub struct StateTracker {
    states: HashMap<ResourceId, ResourceState>,
    /// Number of barriers emitted so far
    emitted: u64,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly allocated image in the `Undefined` state
    pub fn track(&mut self, resource: ResourceId) {
        self.states.insert(resource, ResourceState::Undefined);
    }

    /// Stops tracking a released image
    pub fn forget(&mut self, resource: ResourceId) {
        self.states.remove(&resource);
    }

    pub fn state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Moves `resource` into `target`
    ///
    /// # Returns
    /// `None` when the resource is already in `target`, the barrier otherwise.
    /// Edges outside the four legal ones fail with `UnsupportedTransition`.
    pub fn require(&mut self, resource: ResourceId, target: ResourceState) -> PipelineResult<Option<Barrier>> {
        let current = self.current_mut(resource)?;
        let from = *current;
        if from == target {
            return Ok(None);
        }
        if !from.can_transition_to(target) {
            return Err(PipelineError::UnsupportedTransition { resource, from, to: target });
        }

        *current = target;
        Ok(Some(self.emit(resource, from, target, BarrierKind::Explicit)))
    }

    /// Render pass begin: the attachment enters `ColorOutput` and its contents are cleared
    pub fn begin_attachment(&mut self, resource: ResourceId) -> PipelineResult<Barrier> {
        let current = self.current_mut(resource)?;
        let from = *current;
        if from == ResourceState::ColorOutput {
            // Still open from a previous pass that never ended
            return Err(PipelineError::UnsupportedTransition {
                resource,
                from,
                to: ResourceState::ColorOutput,
            });
        }

        *current = ResourceState::ColorOutput;
        Ok(self.emit(resource, from, ResourceState::ColorOutput, BarrierKind::AttachmentLoad))
    }

    /// Render pass end: the attachment is stored into `ShaderReadable`
    pub fn end_attachment(&mut self, resource: ResourceId) -> PipelineResult<Barrier> {
        let current = self.current_mut(resource)?;
        let from = *current;
        if from != ResourceState::ColorOutput {
            return Err(PipelineError::UnsupportedTransition {
                resource,
                from,
                to: ResourceState::ShaderReadable,
            });
        }

        *current = ResourceState::ShaderReadable;
        Ok(self.emit(resource, from, ResourceState::ShaderReadable, BarrierKind::AttachmentStore))
    }

    fn current_mut(&mut self, resource: ResourceId) -> PipelineResult<&mut ResourceState> {
        self.states.get_mut(&resource).ok_or(PipelineError::UnknownResource(resource))
    }

    fn emit(&mut self, resource: ResourceId, from: ResourceState, to: ResourceState, kind: BarrierKind) -> Barrier {
        self.emitted += 1;
        tracing::trace!(%resource, ?from, ?to, ?kind, "state transition");
        Barrier { resource, from, to, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        resource_pool::{PixelFormat, ResourceDesc, ResourcePool, ResourceUsage},
    };

    fn tracked_image() -> (StateTracker, ResourceId) {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let id = pool.allocate(&mut backend, ResourceDesc::image("image", 8, 8, PixelFormat::Rgba8Unorm, ResourceUsage::INPUT_LAYER)).unwrap();

        let mut tracker = StateTracker::new();
        tracker.track(id);
        (tracker, id)
    }

    #[test]
    fn test_require_same_state_twice_emits_once() {
        let (mut tracker, id) = tracked_image();

        let first = tracker.require(id, ResourceState::TransferDestination).unwrap();
        let second = tracker.require(id, ResourceState::TransferDestination).unwrap();

        assert_eq!(
            first,
            Some(Barrier {
                resource: id,
                from: ResourceState::Undefined,
                to: ResourceState::TransferDestination,
                kind: BarrierKind::Explicit,
            })
        );
        assert_eq!(second, None);
        assert_eq!(tracker.emitted(), 1);
    }

    #[test]
    fn test_upload_cycle_is_legal() {
        let (mut tracker, id) = tracked_image();

        for target in [
            ResourceState::TransferDestination,
            ResourceState::ShaderReadable,
            ResourceState::TransferDestination,
            ResourceState::ShaderReadable,
        ] {
            assert!(tracker.require(id, target).unwrap().is_some());
        }
        assert_eq!(tracker.state(id), Some(ResourceState::ShaderReadable));
    }

    #[test]
    fn test_illegal_edges_are_rejected() {
        let (mut tracker, id) = tracked_image();
        tracker.require(id, ResourceState::ShaderReadable).unwrap();

        let result = tracker.require(id, ResourceState::Undefined);
        assert!(matches!(
            result,
            Err(PipelineError::UnsupportedTransition {
                from: ResourceState::ShaderReadable,
                to: ResourceState::Undefined,
                ..
            })
        ));

        let result = tracker.require(id, ResourceState::ColorOutput);
        assert!(matches!(result, Err(PipelineError::UnsupportedTransition { .. })));

        // A failed request leaves the record untouched
        assert_eq!(tracker.state(id), Some(ResourceState::ShaderReadable));
    }

    #[test]
    fn test_only_four_explicit_edges() {
        use ResourceState::*;
        let all = [Undefined, TransferDestination, ShaderReadable, ColorOutput];
        let legal = all.iter().flat_map(|from| all.iter().map(move |to| (*from, *to))).filter(|(from, to)| from.can_transition_to(*to)).count();
        assert_eq!(legal, 4);
    }

    #[test]
    fn test_attachment_round_trip() {
        let (mut tracker, id) = tracked_image();
        tracker.require(id, ResourceState::ShaderReadable).unwrap();

        let load = tracker.begin_attachment(id).unwrap();
        assert_eq!(load.kind, BarrierKind::AttachmentLoad);
        assert_eq!(tracker.state(id), Some(ResourceState::ColorOutput));

        // Reading an open attachment is a defect
        assert!(tracker.require(id, ResourceState::ShaderReadable).is_err());

        let store = tracker.end_attachment(id).unwrap();
        assert_eq!(store.from, ResourceState::ColorOutput);
        assert_eq!(store.to, ResourceState::ShaderReadable);
        assert!(tracker.end_attachment(id).is_err());
    }

    #[test]
    fn test_untracked_resource_is_unknown() {
        let (mut tracker, id) = tracked_image();
        tracker.forget(id);

        assert!(matches!(tracker.require(id, ResourceState::ShaderReadable), Err(PipelineError::UnknownResource(_))));
    }
}
