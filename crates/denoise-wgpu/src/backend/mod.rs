//! Device abstraction the pipeline records against
//!
//! [`gpu::WgpuBackend`] drives a real device and surface;
//! [`headless::HeadlessBackend`] records everything in memory and simulates
//! fences, for tests and dry runs.

pub mod gpu;
pub mod headless;

use crate::{
    error::PipelineResult,
    recording::FrameRecording,
    resource_pool::{ResourceDesc, ResourcePool},
};

/// A present target handed out by [`Backend::acquire_next`]
#[derive(Debug)]
pub struct AcquiredTarget<T> {
    pub index: u32,
    /// The target still works but no longer matches the surface; recreation is not handled
    pub suboptimal: bool,
    pub target: T,
}

/// Operations the pipeline needs from a graphics device
pub trait Backend: Sized {
    /// Sampled/attachment image and its view
    type Image;
    /// CPU-writable staging buffer
    type Buffer;
    /// Completion signal of one submission
    type Fence;
    /// Acquired present target
    type Target;

    fn create_image(&mut self, desc: &ResourceDesc) -> PipelineResult<Self::Image>;
    fn create_buffer(&mut self, desc: &ResourceDesc) -> PipelineResult<Self::Buffer>;
    fn destroy_image(&mut self, image: Self::Image);
    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    /// Copies `data` into a staging buffer from the CPU
    fn write_buffer(&mut self, buffer: &Self::Buffer, data: &[u8]) -> PipelineResult<()>;

    /// Acquires the next present target
    ///
    /// Fails with `AcquireStale` when the target is out of date; the caller
    /// skips the frame and retries next iteration.
    fn acquire_next(&mut self) -> PipelineResult<AcquiredTarget<Self::Target>>;

    /// Translates and submits a recorded frame
    ///
    /// Work that draws to the present target needs `target`.
    ///
    /// # Returns
    /// A fence that signals when the GPU has finished the submission
    fn submit(&mut self, recording: &FrameRecording, pool: &ResourcePool<Self>, target: Option<&Self::Target>) -> PipelineResult<Self::Fence>;

    /// Blocks until `fence` signals
    fn wait(&mut self, fence: &Self::Fence) -> PipelineResult<()>;

    fn is_signaled(&self, fence: &Self::Fence) -> bool;

    /// Queues `target` for display
    fn present(&mut self, target: Self::Target);
}
