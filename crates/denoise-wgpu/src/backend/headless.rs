//! In-memory backend
//!
//! Keeps the most recent submitted [`FrameRecording`]s and simulates a GPU
//! that finishes each submission a fixed number of ticks after it was queued.
//! One tick passes per acquire and per submit. Failures can be scripted to
//! exercise recovery.

use super::{AcquiredTarget, Backend};
use crate::{
    binding_table::OutputTarget,
    error::{PipelineError, PipelineResult},
    recording::{Command, FrameRecording},
    resource_pool::{ResourceDesc, ResourceKind, ResourcePool},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Number of present targets the simulated swap chain rotates through
const TARGET_COUNT: u32 = 3;

/// Recordings and present indices kept for inspection; older ones are dropped
pub const RETAINED_SUBMISSIONS: usize = 32;

/// Live object counts, readable after the backend itself has been dropped
#[derive(Debug, Default)]
pub struct LiveCounts {
    images: AtomicUsize,
    buffers: AtomicUsize,
}

impl LiveCounts {
    pub fn images(&self) -> usize {
        self.images.load(Ordering::Relaxed)
    }

    pub fn buffers(&self) -> usize {
        self.buffers.load(Ordering::Relaxed)
    }
}

fn push_retained<T>(retained: &mut Vec<T>, item: T) {
    if retained.len() == RETAINED_SUBMISSIONS {
        retained.remove(0);
    }
    retained.push(item);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessImage {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessBuffer {
    id: u64,
    pub label: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessFence {
    submission: u64,
    frame_slot: usize,
    ready_at: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct HeadlessTarget {
    pub index: u32,
}

/// Recording backend with simulated fences
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    tick: u64,
    fence_latency: u64,
    next_buffer_id: u64,
    live: Arc<LiveCounts>,
    allocation_budget: Option<usize>,
    next_target: u32,
    stale_acquires: u32,
    suboptimal_acquires: u32,
    fail_submissions: u32,
    /// Fences handed out and not yet known to be waited on
    in_flight: Vec<HeadlessFence>,
    max_outstanding: usize,
    resubmissions_before_signal: usize,
    bytes_written: u64,
    submission_count: u64,
    barrier_count: u64,
    upload_count: u64,
    present_count: u64,
    /// Last [`RETAINED_SUBMISSIONS`] recordings, oldest first
    submissions: Vec<FrameRecording>,
    presented: Vec<u32>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            fence_latency: 1,
            ..Self::default()
        }
    }

    /// Ticks between a submit and its fence signaling
    pub fn set_fence_latency(&mut self, ticks: u64) {
        self.fence_latency = ticks;
    }

    /// Fails every allocation after the first `count`
    pub fn refuse_allocations_after(&mut self, count: usize) {
        self.allocation_budget = Some(count);
    }

    /// The next `count` acquires report a stale target
    pub fn script_stale_acquires(&mut self, count: u32) {
        self.stale_acquires = count;
    }

    /// The next `count` acquires succeed but report a suboptimal target
    pub fn script_suboptimal_acquires(&mut self, count: u32) {
        self.suboptimal_acquires = count;
    }

    /// The next `count` submissions fail
    pub fn script_failed_submissions(&mut self, count: u32) {
        self.fail_submissions = count;
    }

    pub fn live_images(&self) -> usize {
        self.live.images()
    }

    pub fn live_buffers(&self) -> usize {
        self.live.buffers()
    }

    /// Shared handle to the live object counts
    pub fn live_counts(&self) -> Arc<LiveCounts> {
        Arc::clone(&self.live)
    }

    /// Largest number of unsignaled submissions seen at any submit
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Submissions queued from a slot whose previous fence had not signaled
    pub fn resubmissions_before_signal(&self) -> usize {
        self.resubmissions_before_signal
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// The most recent accepted recordings, oldest first
    pub fn submissions(&self) -> &[FrameRecording] {
        &self.submissions
    }

    /// Accepted submissions since creation
    pub fn submission_count(&self) -> u64 {
        self.submission_count
    }

    /// Barriers across every accepted submission
    pub fn barrier_count(&self) -> u64 {
        self.barrier_count
    }

    /// Layer copies across every accepted submission
    pub fn upload_count(&self) -> u64 {
        self.upload_count
    }

    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    /// Recent present target indices, in presentation order
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    fn advance(&mut self) {
        self.tick += 1;
    }

    fn signaled(&self, fence: &HeadlessFence) -> bool {
        self.tick >= fence.ready_at
    }

    fn charge_allocation(&mut self, desc: &ResourceDesc) -> PipelineResult<()> {
        if let Some(budget) = self.allocation_budget.as_mut() {
            if *budget == 0 {
                return Err(PipelineError::resource_creation(&desc.label, "out of device memory"));
            }
            *budget -= 1;
        }
        Ok(())
    }

    /// Checks that every resource a recording names is alive and of the right kind
    fn validate(recording: &FrameRecording, pool: &ResourcePool<Self>, target: Option<&HeadlessTarget>) -> PipelineResult<()> {
        for command in &recording.commands {
            match command {
                Command::Barrier(barrier) => {
                    pool.view(barrier.resource)?;
                }
                Command::Upload { staging, image } => {
                    pool.buffer(*staging)?;
                    pool.view(*image)?;
                }
                Command::Draw(draw) => {
                    for input in &draw.bindings.inputs {
                        pool.view(input.resource)?;
                    }
                    for output in &draw.bindings.outputs {
                        match output.target {
                            OutputTarget::Resource(id) => {
                                pool.view(id)?;
                            }
                            OutputTarget::Present => match target {
                                Some(target) if Some(target.index) == recording.target_index => {}
                                _ => return Err(PipelineError::submission(format!("{:?} draws to a present target that was not acquired", draw.stage))),
                            },
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Backend for HeadlessBackend {
    type Image = HeadlessImage;
    type Buffer = HeadlessBuffer;
    type Fence = HeadlessFence;
    type Target = HeadlessTarget;

    fn create_image(&mut self, desc: &ResourceDesc) -> PipelineResult<HeadlessImage> {
        let ResourceKind::Image { width, height, .. } = desc.kind else {
            return Err(PipelineError::resource_creation(&desc.label, "not an image"));
        };
        self.charge_allocation(desc)?;
        self.live.images.fetch_add(1, Ordering::Relaxed);
        Ok(HeadlessImage {
            label: desc.label.clone(),
            width,
            height,
        })
    }

    fn create_buffer(&mut self, desc: &ResourceDesc) -> PipelineResult<HeadlessBuffer> {
        let ResourceKind::StagingBuffer { size } = desc.kind else {
            return Err(PipelineError::resource_creation(&desc.label, "not a buffer"));
        };
        self.charge_allocation(desc)?;
        self.live.buffers.fetch_add(1, Ordering::Relaxed);
        self.next_buffer_id += 1;
        Ok(HeadlessBuffer {
            id: self.next_buffer_id,
            label: desc.label.clone(),
            size,
        })
    }

    fn destroy_image(&mut self, _image: HeadlessImage) {
        self.live.images.fetch_sub(1, Ordering::Relaxed);
    }

    fn destroy_buffer(&mut self, _buffer: HeadlessBuffer) {
        self.live.buffers.fetch_sub(1, Ordering::Relaxed);
    }

    fn write_buffer(&mut self, buffer: &HeadlessBuffer, data: &[u8]) -> PipelineResult<()> {
        if data.len() as u64 > buffer.size {
            return Err(PipelineError::submission(format!("{} bytes do not fit staging buffer `{}` #{}", data.len(), buffer.label, buffer.id)));
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn acquire_next(&mut self) -> PipelineResult<AcquiredTarget<HeadlessTarget>> {
        self.advance();
        if self.stale_acquires > 0 {
            self.stale_acquires -= 1;
            return Err(PipelineError::AcquireStale);
        }

        let suboptimal = self.suboptimal_acquires > 0;
        self.suboptimal_acquires = self.suboptimal_acquires.saturating_sub(1);

        let index = self.next_target;
        self.next_target = (self.next_target + 1) % TARGET_COUNT;
        Ok(AcquiredTarget {
            index,
            suboptimal,
            target: HeadlessTarget { index },
        })
    }

    fn submit(&mut self, recording: &FrameRecording, pool: &ResourcePool<Self>, target: Option<&HeadlessTarget>) -> PipelineResult<HeadlessFence> {
        self.advance();
        if self.fail_submissions > 0 {
            self.fail_submissions -= 1;
            return Err(PipelineError::submission("scripted device loss"));
        }
        Self::validate(recording, pool, target)?;

        let frame_slot = recording.frame_slot;
        if self.in_flight.iter().any(|fence| fence.frame_slot == frame_slot && !self.signaled(fence)) {
            self.resubmissions_before_signal += 1;
        }

        let fence = HeadlessFence {
            submission: self.submission_count,
            frame_slot,
            ready_at: self.tick + self.fence_latency,
        };
        self.in_flight.retain(|fence| fence.frame_slot != frame_slot);
        self.in_flight.push(fence);

        let outstanding = self.in_flight.iter().filter(|fence| !self.signaled(fence)).count();
        self.max_outstanding = self.max_outstanding.max(outstanding);

        tracing::trace!(submission = fence.submission, frame_slot, commands = recording.commands.len(), "headless submit");
        self.submission_count += 1;
        self.barrier_count += recording.barriers().count() as u64;
        self.upload_count += recording.uploads().count() as u64;
        push_retained(&mut self.submissions, recording.clone());
        Ok(fence)
    }

    fn wait(&mut self, fence: &HeadlessFence) -> PipelineResult<()> {
        self.tick = self.tick.max(fence.ready_at);
        Ok(())
    }

    fn is_signaled(&self, fence: &HeadlessFence) -> bool {
        self.signaled(fence)
    }

    fn present(&mut self, target: HeadlessTarget) {
        self.present_count += 1;
        push_retained(&mut self.presented, target.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding_table::BindingTable,
        frame_scheduler::{FrameContext, HistoryIndex},
        resource_pool::{PixelFormat, ResourceUsage},
        resource_state::StateTracker,
        resources::PipelineResources,
        stage_graph::StageGraph,
    };

    fn empty_recording(frame_slot: usize) -> FrameRecording {
        FrameRecording::new(frame_slot, HistoryIndex::ZERO, None)
    }

    #[test]
    fn test_fence_signals_after_latency() {
        let mut backend = HeadlessBackend::new();
        backend.set_fence_latency(2);
        let pool = ResourcePool::new();

        let fence = backend.submit(&empty_recording(0), &pool, None).unwrap();
        assert!(!backend.is_signaled(&fence));
        backend.acquire_next().unwrap();
        assert!(!backend.is_signaled(&fence));
        backend.acquire_next().unwrap();
        assert!(backend.is_signaled(&fence));
    }

    #[test]
    fn test_wait_retires_fence() {
        let mut backend = HeadlessBackend::new();
        backend.set_fence_latency(10);
        let pool = ResourcePool::new();

        let fence = backend.submit(&empty_recording(1), &pool, None).unwrap();
        backend.wait(&fence).unwrap();
        assert!(backend.is_signaled(&fence));
    }

    #[test]
    fn test_resubmitting_busy_slot_is_counted() {
        let mut backend = HeadlessBackend::new();
        backend.set_fence_latency(5);
        let pool = ResourcePool::new();

        backend.submit(&empty_recording(0), &pool, None).unwrap();
        backend.submit(&empty_recording(0), &pool, None).unwrap();
        assert_eq!(backend.resubmissions_before_signal(), 1);
    }

    #[test]
    fn test_long_runs_keep_a_bounded_history() {
        let mut backend = HeadlessBackend::new();
        let pool = ResourcePool::new();

        let mut last = None;
        for slot in 0..40 {
            last = Some(backend.submit(&empty_recording(slot % 2), &pool, None).unwrap());
            backend.present(HeadlessTarget { index: slot as u32 });
        }

        assert_eq!(backend.submissions().len(), RETAINED_SUBMISSIONS);
        assert_eq!(backend.submission_count(), 40);
        assert_eq!(last.unwrap().submission, 39);
        assert_eq!(backend.presented().len(), RETAINED_SUBMISSIONS);
        assert_eq!(backend.presented().first(), Some(&8));
        assert_eq!(backend.presented().last(), Some(&39));
        assert_eq!(backend.present_count(), 40);
    }

    #[test]
    fn test_live_counts_outlive_backend() {
        let mut backend = HeadlessBackend::new();
        let counts = backend.live_counts();
        let image = backend.create_image(&ResourceDesc::image("image", 4, 4, PixelFormat::Rgba8Unorm, ResourceUsage::SAMPLED)).unwrap();
        backend.create_buffer(&ResourceDesc::staging_buffer("staging", 4)).unwrap();
        backend.destroy_image(image);
        drop(backend);

        assert_eq!((counts.images(), counts.buffers()), (0, 1));
    }

    #[test]
    fn test_scripted_acquires() {
        let mut backend = HeadlessBackend::new();
        backend.script_stale_acquires(1);
        backend.script_suboptimal_acquires(1);

        assert!(matches!(backend.acquire_next(), Err(PipelineError::AcquireStale)));
        let first = backend.acquire_next().unwrap();
        let second = backend.acquire_next().unwrap();
        assert!(first.suboptimal);
        assert!(!second.suboptimal);
        assert_eq!((first.index, second.index), (0, 1));
    }

    #[test]
    fn test_present_without_target_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();
        let (resources, _) = PipelineResources::allocate(&mut pool, &mut backend, &mut tracker).unwrap();
        let graph = StageGraph::standard().unwrap();
        let mut bindings = BindingTable::new(&graph, &resources).unwrap();

        let ctx = FrameContext::new(0, 0, HistoryIndex::ZERO);
        let mut recording = FrameRecording::new(0, HistoryIndex::ZERO, Some(0));
        graph.record(&ctx, &mut bindings, &mut tracker, &resources, &mut recording).unwrap();

        assert!(matches!(backend.submit(&recording, &pool, None), Err(PipelineError::Submission(_))));
        assert!(backend.submit(&recording, &pool, Some(&HeadlessTarget { index: 0 })).is_ok());
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(&ResourceDesc::staging_buffer("small", 4)).unwrap();

        assert!(backend.write_buffer(&buffer, &[0; 8]).is_err());
        assert!(backend.write_buffer(&buffer, &[0; 4]).is_ok());
        assert_eq!(backend.bytes_written(), 4);
        assert!(backend.create_buffer(&ResourceDesc::image("image", 4, 4, PixelFormat::Rgba8Unorm, ResourceUsage::SAMPLED)).is_err());
    }
}
