//! Per-frame driver
//!
//! [`Pipeline`] owns every other component and runs one displayed frame per
//! [`Pipeline::render_frame`] call: wait and acquire, refresh the input
//! layers, record the stage graph, submit, present, advance.

use crate::{
    backend::Backend,
    binding_table::BindingTable,
    error::{PipelineError, PipelineResult},
    frame_loader::{FrameLayers, FrameSequencer, FrameSource, LayerKind},
    frame_scheduler::{FrameContext, FrameScheduler},
    recording::{Command, FrameRecording},
    resource_pool::ResourcePool,
    resource_state::{Barrier, ResourceState, StateTracker},
    resources::PipelineResources,
    stage_graph::StageGraph,
};

/// Result of one [`Pipeline::render_frame`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented; `frame_index` is set when new input was uploaded
    Presented { frame_index: Option<u32> },
    /// The present target was stale; nothing was recorded or submitted
    Skipped,
}

/// The denoise pipeline bound to a backend and a frame source
pub struct Pipeline<B: Backend, S: FrameSource> {
    backend: B,
    source: S,
    pool: ResourcePool<B>,
    tracker: StateTracker,
    resources: PipelineResources,
    graph: StageGraph,
    bindings: BindingTable,
    scheduler: FrameScheduler<B>,
    sequencer: FrameSequencer,
}

impl<B: Backend, S: FrameSource> Pipeline<B, S> {
    /// Allocates every resource, publishes all binding sets and uploads frame 0
    ///
    /// # Arguments
    /// * `backend` - Device the pipeline records for
    /// * `source` - Supplies the raw input layers
    /// * `frame_delay` - Displayed frames per input frame advance
    pub fn new(mut backend: B, source: S, frame_delay: u32) -> PipelineResult<Self> {
        let graph = StageGraph::standard()?;

        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();
        let (resources, barriers) = match PipelineResources::allocate(&mut pool, &mut backend, &mut tracker) {
            Ok(allocated) => allocated,
            Err(e) => {
                pool.teardown(&mut backend, &mut tracker);
                return Err(e);
            }
        };
        let bindings = match BindingTable::new(&graph, &resources) {
            Ok(bindings) => bindings,
            Err(e) => {
                pool.teardown(&mut backend, &mut tracker);
                return Err(e);
            }
        };

        let mut pipeline = Self {
            backend,
            source,
            pool,
            tracker,
            resources,
            graph,
            bindings,
            scheduler: FrameScheduler::new(),
            sequencer: FrameSequencer::new(frame_delay),
        };
        if let Err(e) = pipeline.prime(barriers) {
            // Nothing is in flight: prime either failed before submitting or waited on its fence
            pipeline.pool.teardown(&mut pipeline.backend, &mut pipeline.tracker);
            return Err(e);
        }

        tracing::info!(stages = pipeline.graph.stages().len(), frame_delay, "pipeline ready");
        Ok(pipeline)
    }

    /// Submits the startup transitions plus an upload of frame 0 and waits for them
    fn prime(&mut self, barriers: Vec<Barrier>) -> PipelineResult<()> {
        let mut recording = FrameRecording::new(self.scheduler.frame_slot(), self.scheduler.history_index(), None);
        for barrier in barriers {
            recording.push(Command::Barrier(barrier));
        }

        let frame = self.source.load(0);
        self.record_upload(&frame, &mut recording)?;

        let fence = self.backend.submit(&recording, &self.pool, None)?;
        self.backend.wait(&fence)
    }

    /// Runs one displayed frame
    ///
    /// A stale present target skips the frame and leaves all state unchanged.
    /// Any other error is fatal.
    pub fn render_frame(&mut self) -> PipelineResult<FrameOutcome> {
        let (ctx, target) = match self.scheduler.begin_frame(&mut self.backend) {
            Ok(begun) => begun,
            Err(PipelineError::AcquireStale) => {
                tracing::debug!(slot = self.scheduler.frame_slot(), "present target is stale, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let frame_index = self.sequencer.tick();
        let mut recording = FrameRecording::new(ctx.frame_slot(), ctx.history_index(), Some(ctx.target_index()));
        if let Err(e) = self.record_frame(&ctx, frame_index, &mut recording) {
            self.scheduler.abandon(ctx);
            return Err(e);
        }
        self.scheduler.mark_recorded(&ctx);

        let fence = match self.backend.submit(&recording, &self.pool, Some(&target)) {
            Ok(fence) => fence,
            Err(e) => {
                self.scheduler.abandon(ctx);
                return Err(e);
            }
        };
        self.scheduler.mark_submitted(&ctx, fence);

        self.backend.present(target);
        self.scheduler.mark_presented(&ctx);
        tracing::debug!(slot = ctx.frame_slot(), target = ctx.target_index(), history_index = ctx.history_index().value(), ?frame_index, "presented frame");
        self.scheduler.finish(ctx);

        Ok(FrameOutcome::Presented { frame_index })
    }

    fn record_frame(&mut self, ctx: &FrameContext, frame_index: Option<u32>, recording: &mut FrameRecording) -> PipelineResult<()> {
        if let Some(index) = frame_index {
            let frame = self.source.load(index);
            self.record_upload(&frame, recording)?;
        }
        self.graph.record(ctx, &mut self.bindings, &mut self.tracker, &self.resources, recording)
    }

    /// Writes every layer into its staging buffer and records the copies
    ///
    /// Each copy is bracketed by a move to `TransferDestination` and back to
    /// `ShaderReadable`.
    fn record_upload(&mut self, frame: &FrameLayers, recording: &mut FrameRecording) -> PipelineResult<()> {
        for kind in LayerKind::ALL {
            let staging = self.resources.staging(kind);
            let image = self.resources.layer_texture(kind);
            self.backend.write_buffer(self.pool.buffer(staging)?, frame.layer(kind))?;

            if let Some(barrier) = self.tracker.require(image, ResourceState::TransferDestination)? {
                recording.push(Command::Barrier(barrier));
            }
            recording.push(Command::Upload { staging, image });
            if let Some(barrier) = self.tracker.require(image, ResourceState::ShaderReadable)? {
                recording.push(Command::Barrier(barrier));
            }
        }
        Ok(())
    }

    /// Waits for all outstanding work and releases every resource
    pub fn shutdown(&mut self) -> PipelineResult<()> {
        self.scheduler.wait_idle(&mut self.backend)?;
        self.pool.teardown(&mut self.backend, &mut self.tracker);
        tracing::info!(frames = self.scheduler.frames_presented(), "pipeline shut down");
        Ok(())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn scheduler(&self) -> &FrameScheduler<B> {
        &self.scheduler
    }

    pub fn sequencer(&self) -> &FrameSequencer {
        &self.sequencer
    }

    pub fn resources(&self) -> &PipelineResources {
        &self.resources
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        binding_table::OutputTarget,
        frame_scheduler::{HistoryIndex, SchedulerState},
        resource_state::BarrierKind,
        stage_graph::{HistoryKey, HistoryRole, Resolution, StageId, TextureKey, TextureRef},
    };
    use bytes::Bytes;

    /// Returns tiny layers tagged with the frame index and remembers every load
    #[derive(Default)]
    struct FakeSource {
        loaded: Vec<u32>,
    }

    impl FrameSource for FakeSource {
        fn load(&mut self, index: u32) -> FrameLayers {
            self.loaded.push(index);
            let tagged = Bytes::from(vec![index as u8; 16]);
            FrameLayers {
                color: tagged.clone(),
                depth: tagged.clone(),
                normal: tagged.clone(),
                albedo: tagged.clone(),
                motion_vectors: tagged,
            }
        }
    }

    fn pipeline(frame_delay: u32) -> Pipeline<HeadlessBackend, FakeSource> {
        Pipeline::new(HeadlessBackend::new(), FakeSource::default(), frame_delay).unwrap()
    }

    fn presented(outcome: FrameOutcome) -> bool {
        matches!(outcome, FrameOutcome::Presented { .. })
    }

    #[test]
    fn test_startup_uploads_first_frame() {
        let pipeline = pipeline(2);

        let setup = &pipeline.backend().submissions()[0];
        assert_eq!(setup.target_index, None);
        assert_eq!(setup.uploads().count(), LayerKind::ALL.len());
        assert_eq!(setup.draws().count(), 0);
        assert_eq!(pipeline.source.loaded, [0]);
        for kind in LayerKind::ALL {
            assert_eq!(pipeline.tracker().state(pipeline.resources().layer_texture(kind)), Some(ResourceState::ShaderReadable));
        }
    }

    #[test]
    fn test_failed_allocation_is_reported() {
        let mut backend = HeadlessBackend::new();
        backend.refuse_allocations_after(4);
        let live = backend.live_counts();

        let Err(err) = Pipeline::new(backend, FakeSource::default(), 2) else {
            panic!("allocation should fail");
        };
        assert!(matches!(err, PipelineError::ResourceCreation { .. }));
        assert_eq!((live.images(), live.buffers()), (0, 0));
    }

    #[test]
    fn test_failed_startup_submission_releases_resources() {
        let mut backend = HeadlessBackend::new();
        backend.script_failed_submissions(1);
        let live = backend.live_counts();

        let Err(err) = Pipeline::new(backend, FakeSource::default(), 2) else {
            panic!("startup submission should fail");
        };
        assert!(matches!(err, PipelineError::Submission(_)));
        assert_eq!((live.images(), live.buffers()), (0, 0));
    }

    #[test]
    fn test_every_frame_records_all_stages_in_order() {
        let mut pipeline = pipeline(2);
        for _ in 0..3 {
            assert!(presented(pipeline.render_frame().unwrap()));
        }

        for recording in &pipeline.backend().submissions()[1..] {
            let order: Vec<_> = recording.draws().map(|draw| draw.stage).collect();
            assert_eq!(order, StageId::ALL);
            assert!(recording.presents());

            // Only the final upscale renders at native size
            for draw in recording.draws() {
                let expected = if draw.stage == StageId::Present { Resolution::Native } else { Resolution::RayMarch };
                assert_eq!(draw.viewport, expected.extent(), "{:?}", draw.stage);
            }
        }
        assert_eq!(pipeline.backend().presented(), [0, 1, 2]);
    }

    #[test]
    fn test_history_index_alternates_per_presented_frame() {
        let mut pipeline = pipeline(2);
        for _ in 0..6 {
            pipeline.render_frame().unwrap();
        }

        let used: Vec<_> = pipeline.backend().submissions()[1..].iter().map(|recording| recording.history_index.value()).collect();
        assert_eq!(used, [0, 1, 0, 1, 0, 1]);
        assert_eq!(pipeline.scheduler().frames_presented(), 6);
    }

    #[test]
    fn test_no_torn_frames() {
        let mut pipeline = pipeline(1);
        for _ in 0..4 {
            pipeline.render_frame().unwrap();
        }

        let resources = pipeline.resources().clone();
        for recording in &pipeline.backend().submissions()[1..] {
            let h = recording.history_index;
            for draw in recording.draws() {
                assert!(draw.bindings.history_index.is_none_or(|used| used == h), "{:?} used another history index", draw.stage);
                for input in &draw.bindings.inputs {
                    assert_eq!(Some(input.resource), resources.resolve(input.source, h));
                }
            }

            // Present shows exactly what TNR2 wrote this frame
            let tnr2_written = resources.history(HistoryKey::Tnr2, HistoryRole::Current, h);
            let present = recording.draws().find(|draw| draw.stage == StageId::Present).unwrap();
            assert_eq!(present.bindings.inputs[0].source, TextureRef::History(HistoryKey::Tnr2, HistoryRole::Current));
            assert_eq!(present.bindings.inputs[0].resource, tnr2_written);
            let tnr2 = recording.draws().find(|draw| draw.stage == StageId::TemporalDenoise2).unwrap();
            assert_eq!(tnr2.bindings.outputs[0].target, OutputTarget::Resource(tnr2_written));
        }
    }

    #[test]
    fn test_stale_acquire_skips_without_side_effects() {
        let mut pipeline = pipeline(1);
        pipeline.render_frame().unwrap();
        let submissions = pipeline.backend().submission_count();

        pipeline.backend_mut().script_stale_acquires(2);
        assert_eq!(pipeline.render_frame().unwrap(), FrameOutcome::Skipped);
        assert_eq!(pipeline.render_frame().unwrap(), FrameOutcome::Skipped);

        assert_eq!(pipeline.backend().submission_count(), submissions);
        assert_eq!(pipeline.scheduler().history_index(), HistoryIndex::ONE);
        assert_eq!(pipeline.scheduler().frame_slot(), 1);
        assert_eq!(pipeline.sequencer().advances(), 1);
        assert_eq!(pipeline.scheduler().state(), SchedulerState::Idle);

        assert_eq!(pipeline.render_frame().unwrap(), FrameOutcome::Presented { frame_index: Some(1) });
        assert_eq!(pipeline.backend().submissions().last().unwrap().history_index, HistoryIndex::ONE);
    }

    #[test]
    fn test_submission_failure_is_fatal() {
        let mut pipeline = pipeline(2);
        pipeline.backend_mut().script_failed_submissions(1);

        let err = pipeline.render_frame().unwrap_err();
        assert!(matches!(err, PipelineError::Submission(_)));
        assert!(!err.is_recoverable());
        assert_eq!(pipeline.scheduler().state(), SchedulerState::Idle);
        assert_eq!(pipeline.scheduler().history_index(), HistoryIndex::ZERO);
        assert_eq!(pipeline.scheduler().frames_presented(), 0);
    }

    #[test]
    fn test_illegal_transition_abandons_frame() {
        let mut pipeline = pipeline(2);
        pipeline.render_frame().unwrap();
        let submissions = pipeline.backend().submission_count();
        let history_index = pipeline.scheduler().history_index();
        let frame_slot = pipeline.scheduler().frame_slot();

        // An attachment left open from a pass that never ended
        let fresnel = pipeline.resources().fixed(TextureKey::Fresnel);
        pipeline.tracker.begin_attachment(fresnel).unwrap();

        let err = pipeline.render_frame().unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedTransition { resource, .. } if resource == fresnel));
        assert_eq!(pipeline.backend().submission_count(), submissions);
        assert_eq!(pipeline.scheduler().history_index(), history_index);
        assert_eq!(pipeline.scheduler().frame_slot(), frame_slot);
        assert_eq!(pipeline.scheduler().state(), SchedulerState::Idle);
        assert_eq!(pipeline.scheduler().frames_presented(), 1);
        assert_eq!(pipeline.backend().presented(), [0]);
    }

    #[test]
    fn test_uploads_follow_frame_delay() {
        let mut pipeline = pipeline(2);
        let outcomes: Vec<_> = (0..4).map(|_| pipeline.render_frame().unwrap()).collect();

        assert_eq!(
            outcomes,
            [
                FrameOutcome::Presented { frame_index: None },
                FrameOutcome::Presented { frame_index: Some(0) },
                FrameOutcome::Presented { frame_index: None },
                FrameOutcome::Presented { frame_index: Some(1) },
            ]
        );
        // Startup load, then one load per advance
        assert_eq!(pipeline.source.loaded, [0, 0, 1]);

        let submissions = pipeline.backend().submissions();
        assert_eq!(submissions[1].uploads().count(), 0);
        assert_eq!(submissions[2].uploads().count(), LayerKind::ALL.len());
        assert_eq!(pipeline.backend().bytes_written(), 3 * 5 * 16);
    }

    #[test]
    fn test_uploads_are_bracketed_by_transitions() {
        let mut pipeline = pipeline(1);
        pipeline.render_frame().unwrap();

        let recording = &pipeline.backend().submissions()[1];
        for (i, command) in recording.commands.iter().enumerate() {
            if let Command::Upload { image, .. } = command {
                let Command::Barrier(before) = &recording.commands[i - 1] else {
                    panic!("upload without a preceding barrier");
                };
                let Command::Barrier(after) = &recording.commands[i + 1] else {
                    panic!("upload without a following barrier");
                };
                assert_eq!((before.resource, before.from, before.to), (*image, ResourceState::ShaderReadable, ResourceState::TransferDestination));
                assert_eq!((after.resource, after.from, after.to), (*image, ResourceState::TransferDestination, ResourceState::ShaderReadable));
                assert_eq!(before.kind, BarrierKind::Explicit);
            }
        }
    }

    #[test]
    fn test_outstanding_work_is_bounded() {
        let mut pipeline = pipeline(2);
        pipeline.backend_mut().set_fence_latency(5);
        for _ in 0..10 {
            pipeline.render_frame().unwrap();
            assert!(pipeline.scheduler().outstanding(pipeline.backend()) <= crate::config::FRAMES_IN_FLIGHT);
        }

        assert!(pipeline.backend().max_outstanding() <= crate::config::FRAMES_IN_FLIGHT);
        assert_eq!(pipeline.backend().resubmissions_before_signal(), 0);
    }

    #[test]
    fn test_history_sets_republished_once_per_frame() {
        let mut pipeline = pipeline(2);
        let published = pipeline.bindings().publications();
        for _ in 0..4 {
            pipeline.render_frame().unwrap();
        }

        // Slot 0 keeps history index 0 and slot 1 keeps index 1, so only the
        // first pass through slot 1 republishes its five history stages
        assert_eq!(pipeline.bindings().publications(), published + 5);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut pipeline = pipeline(2);
        pipeline.render_frame().unwrap();
        pipeline.render_frame().unwrap();

        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.backend().live_images(), 0);
        assert_eq!(pipeline.backend().live_buffers(), 0);
    }
}
