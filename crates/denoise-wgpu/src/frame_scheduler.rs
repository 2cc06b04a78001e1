//! Frame-in-flight scheduling
//!
//! The scheduler owns one completion fence per frame-in-flight slot and walks
//! every displayed frame through `Idle -> Acquiring -> Recording -> Submitted ->
//! Presenting -> Idle`. It is also the only place the shared history index
//! changes: once per displayed frame, in [`FrameScheduler::finish`].

use crate::{
    backend::{AcquiredTarget, Backend},
    config::FRAMES_IN_FLIGHT,
    error::PipelineResult,
};

/// Selects which half of every history pair is read this frame
///
/// `read()` is `[historyIndex]`, `write()` is `[1 - historyIndex]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HistoryIndex(u8);

impl HistoryIndex {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1);

    pub fn value(self) -> usize {
        self.0 as usize
    }

    /// Index of the pair element holding last frame's result
    pub fn read(self) -> usize {
        self.value()
    }

    /// Index of the pair element written this frame
    pub fn write(self) -> usize {
        1 - self.value()
    }

    pub fn flipped(self) -> Self {
        Self(1 - self.0)
    }
}

/// Per-frame state handed from the scheduler to recording and back
///
/// Created by [`FrameScheduler::begin_frame`] and consumed by
/// [`FrameScheduler::finish`] or [`FrameScheduler::abandon`].
#[derive(Debug, PartialEq, Eq)]
pub struct FrameContext {
    frame_slot: usize,
    target_index: u32,
    history_index: HistoryIndex,
}

impl FrameContext {
    pub(crate) fn new(frame_slot: usize, target_index: u32, history_index: HistoryIndex) -> Self {
        Self {
            frame_slot,
            target_index,
            history_index,
        }
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    pub fn target_index(&self) -> u32 {
        self.target_index
    }

    pub fn history_index(&self) -> HistoryIndex {
        self.history_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// Bounds CPU/GPU overlap to [`FRAMES_IN_FLIGHT`] frames
pub struct FrameScheduler<B: Backend> {
    state: SchedulerState,
    frame_slot: usize,
    history_index: HistoryIndex,
    /// Completion fence of the last submission from each slot
    fences: Vec<Option<B::Fence>>,
    frames_presented: u64,
}

impl<B: Backend> Default for FrameScheduler<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> FrameScheduler<B> {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            frame_slot: 0,
            history_index: HistoryIndex::ZERO,
            fences: (0..FRAMES_IN_FLIGHT).map(|_| None).collect(),
            frames_presented: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    pub fn history_index(&self) -> HistoryIndex {
        self.history_index
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Number of submissions whose fence has not signaled yet
    pub fn outstanding(&self, backend: &B) -> usize {
        self.fences.iter().flatten().filter(|fence| !backend.is_signaled(fence)).count()
    }

    /// Steps 1 and 2: waits for the slot's previous submission, then acquires a present target
    ///
    /// A stale target returns `AcquireStale` and leaves the scheduler exactly as
    /// it was, so the next call retries the same slot with the same history index.
    ///
    /// # Returns
    /// The context for this frame and the acquired present target
    pub fn begin_frame(&mut self, backend: &mut B) -> PipelineResult<(FrameContext, B::Target)> {
        debug_assert_eq!(self.state, SchedulerState::Idle, "begin_frame called mid-frame");
        self.state = SchedulerState::Acquiring;

        if let Some(fence) = &self.fences[self.frame_slot] {
            tracing::trace!(slot = self.frame_slot, "waiting for slot fence");
            if let Err(err) = backend.wait(fence) {
                self.state = SchedulerState::Idle;
                return Err(err);
            }
        }

        let AcquiredTarget { index, suboptimal, target } = match backend.acquire_next() {
            Ok(acquired) => acquired,
            Err(err) => {
                // The fence is left in place; it has already signaled
                self.state = SchedulerState::Idle;
                return Err(err);
            }
        };
        if suboptimal {
            tracing::warn!(index, "present target is suboptimal; continuing without recreation");
        }

        self.fences[self.frame_slot] = None;
        self.state = SchedulerState::Recording;
        Ok((FrameContext::new(self.frame_slot, index, self.history_index), target))
    }

    /// Step 3 finished: every stage is recorded
    pub fn mark_recorded(&mut self, ctx: &FrameContext) {
        self.check_context(ctx);
        debug_assert_eq!(self.state, SchedulerState::Recording);
        self.state = SchedulerState::Submitted;
    }

    /// Step 4: stores the fence that signals when this slot's work completes
    pub fn mark_submitted(&mut self, ctx: &FrameContext, fence: B::Fence) {
        self.check_context(ctx);
        debug_assert_eq!(self.state, SchedulerState::Submitted);
        debug_assert!(self.fences[ctx.frame_slot].is_none(), "slot {} resubmitted before its fence was consumed", ctx.frame_slot);
        self.fences[ctx.frame_slot] = Some(fence);
    }

    /// Step 5: the present request has been queued
    pub fn mark_presented(&mut self, ctx: &FrameContext) {
        self.check_context(ctx);
        debug_assert_eq!(self.state, SchedulerState::Submitted);
        self.state = SchedulerState::Presenting;
    }

    /// Steps 6 and 7: flips the history index and advances to the next slot
    pub fn finish(&mut self, ctx: FrameContext) {
        self.check_context(&ctx);
        debug_assert_eq!(self.state, SchedulerState::Presenting, "finish called before present");

        self.history_index = self.history_index.flipped();
        self.frame_slot = (self.frame_slot + 1) % FRAMES_IN_FLIGHT;
        self.frames_presented += 1;
        self.state = SchedulerState::Idle;
    }

    /// Abandons a frame whose recording failed before submission
    ///
    /// Nothing was submitted, so neither the slot nor the history index moves.
    pub fn abandon(&mut self, ctx: FrameContext) {
        self.check_context(&ctx);
        debug_assert!(matches!(self.state, SchedulerState::Recording | SchedulerState::Submitted));
        self.state = SchedulerState::Idle;
    }

    /// Blocks until every outstanding submission has completed
    pub fn wait_idle(&mut self, backend: &mut B) -> PipelineResult<()> {
        for fence in self.fences.iter_mut() {
            if let Some(fence) = fence.take() {
                backend.wait(&fence)?;
            }
        }
        Ok(())
    }

    fn check_context(&self, ctx: &FrameContext) {
        debug_assert_eq!(ctx.frame_slot, self.frame_slot, "frame context belongs to another slot");
        debug_assert_eq!(ctx.history_index, self.history_index, "frame context carries a stale history index");
    }
}
