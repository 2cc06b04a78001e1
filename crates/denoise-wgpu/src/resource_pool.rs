//! Ownership of every GPU image and buffer used by the pipeline
//!
//! The pool is the only owner of backing memory. Everything else refers to a
//! resource through a [`ResourceId`], and destruction happens in one place,
//! [`ResourcePool::teardown`].

use crate::{
    backend::Backend,
    error::{PipelineError, PipelineResult},
    resource_state::StateTracker,
};
use std::fmt;

/// Non-owning handle to a pooled resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u32);

impl ResourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel formats used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Raw input layers as delivered by the frame loader
    Rgba8Unorm,
    /// Intermediate render targets
    Rgba16Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8Unorm => 4,
            PixelFormat::Rgba16Float => 8,
        }
    }
}

/// How a resource may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceUsage {
    pub sampled: bool,
    pub color_output: bool,
    pub transfer_target: bool,
}

impl ResourceUsage {
    pub const NONE: Self = Self {
        sampled: false,
        color_output: false,
        transfer_target: false,
    };
    pub const SAMPLED: Self = Self { sampled: true, ..Self::NONE };
    pub const COLOR_OUTPUT: Self = Self { color_output: true, ..Self::NONE };
    pub const TRANSFER_TARGET: Self = Self { transfer_target: true, ..Self::NONE };

    /// Raw input layers: written by copy, then sampled
    pub const INPUT_LAYER: Self = Self::SAMPLED.union(Self::TRANSFER_TARGET);
    /// Stage outputs: rendered to, then sampled by later stages
    pub const RENDER_TARGET: Self = Self::SAMPLED.union(Self::COLOR_OUTPUT);

    pub const fn union(self, other: Self) -> Self {
        Self {
            sampled: self.sampled || other.sampled,
            color_output: self.color_output || other.color_output,
            transfer_target: self.transfer_target || other.transfer_target,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.sampled || self.color_output || self.transfer_target)
    }
}

/// Shape of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image { width: u32, height: u32, format: PixelFormat },
    /// CPU-visible upload buffer
    StagingBuffer { size: u64 },
}

/// Everything needed to create a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub label: String,
    pub kind: ResourceKind,
    pub usage: ResourceUsage,
}

impl ResourceDesc {
    pub fn image(label: impl Into<String>, width: u32, height: u32, format: PixelFormat, usage: ResourceUsage) -> Self {
        Self {
            label: label.into(),
            kind: ResourceKind::Image { width, height, format },
            usage,
        }
    }

    pub fn staging_buffer(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            kind: ResourceKind::StagingBuffer { size },
            usage: ResourceUsage::NONE,
        }
    }

    fn check(&self) -> PipelineResult<()> {
        match self.kind {
            ResourceKind::Image { width, height, .. } => {
                if width == 0 || height == 0 {
                    return Err(PipelineError::resource_creation(&self.label, format!("zero-sized image {width}x{height}")));
                }
                if self.usage.is_empty() {
                    return Err(PipelineError::resource_creation(&self.label, "image has no usage"));
                }
            }
            ResourceKind::StagingBuffer { size } => {
                if size == 0 {
                    return Err(PipelineError::resource_creation(&self.label, "zero-sized buffer"));
                }
            }
        }
        Ok(())
    }
}

/// Backend object that backs a pooled resource
pub enum Backing<B: Backend> {
    Image(B::Image),
    Buffer(B::Buffer),
}

struct PoolEntry<B: Backend> {
    desc: ResourceDesc,
    backing: Backing<B>,
}

/// Exclusive owner of all pipeline resources
pub struct ResourcePool<B: Backend> {
    /// Released slots stay `None`; ids are never reused
    entries: Vec<Option<PoolEntry<B>>>,
}

impl<B: Backend> Default for ResourcePool<B> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<B: Backend> ResourcePool<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resource and takes ownership of its backing memory
    ///
    /// # Arguments
    /// * `backend` - The backend that creates the device object
    /// * `desc` - Dimensions, format and usage of the resource
    ///
    /// # Returns
    /// The id of the new resource, or `ResourceCreation` if the backend refuses it
    pub fn allocate(&mut self, backend: &mut B, desc: ResourceDesc) -> PipelineResult<ResourceId> {
        desc.check()?;

        let backing = match desc.kind {
            ResourceKind::Image { .. } => Backing::Image(backend.create_image(&desc)?),
            ResourceKind::StagingBuffer { .. } => Backing::Buffer(backend.create_buffer(&desc)?),
        };

        let id = ResourceId(self.entries.len() as u32);
        tracing::debug!(resource = %id, label = %desc.label, kind = ?desc.kind, "allocated resource");
        self.entries.push(Some(PoolEntry { desc, backing }));
        Ok(id)
    }

    /// Frees one resource and drops its recorded state from `tracker`
    ///
    /// The caller guarantees no in-flight command sequence still references it.
    pub fn release(&mut self, backend: &mut B, tracker: &mut StateTracker, id: ResourceId) -> PipelineResult<()> {
        let entry = self.entries.get_mut(id.index()).and_then(Option::take).ok_or(PipelineError::UnknownResource(id))?;
        tracing::debug!(resource = %id, label = %entry.desc.label, "released resource");
        tracker.forget(id);
        Self::destroy(backend, entry.backing);
        Ok(())
    }

    /// Returns the image view used for binding
    pub fn view(&self, id: ResourceId) -> PipelineResult<&B::Image> {
        match self.entry(id)?.backing {
            Backing::Image(ref image) => Ok(image),
            Backing::Buffer(_) => Err(PipelineError::UnknownResource(id)),
        }
    }

    /// Returns the staging buffer behind `id`
    pub fn buffer(&self, id: ResourceId) -> PipelineResult<&B::Buffer> {
        match self.entry(id)?.backing {
            Backing::Buffer(ref buffer) => Ok(buffer),
            Backing::Image(_) => Err(PipelineError::UnknownResource(id)),
        }
    }

    pub fn desc(&self, id: ResourceId) -> PipelineResult<&ResourceDesc> {
        Ok(&self.entry(id)?.desc)
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys every remaining resource
    ///
    /// The caller must have waited for all outstanding GPU work first.
    pub fn teardown(&mut self, backend: &mut B, tracker: &mut StateTracker) {
        let count = self.len();
        for (index, entry) in self.entries.drain(..).enumerate() {
            if let Some(entry) = entry {
                tracker.forget(ResourceId(index as u32));
                Self::destroy(backend, entry.backing);
            }
        }
        tracing::info!(count, "resource pool torn down");
    }

    fn entry(&self, id: ResourceId) -> PipelineResult<&PoolEntry<B>> {
        self.entries.get(id.index()).and_then(Option::as_ref).ok_or(PipelineError::UnknownResource(id))
    }

    fn destroy(backend: &mut B, backing: Backing<B>) {
        match backing {
            Backing::Image(image) => backend.destroy_image(image),
            Backing::Buffer(buffer) => backend.destroy_buffer(buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::headless::HeadlessBackend, resource_state::ResourceState};

    fn sampled_image(label: &str) -> ResourceDesc {
        ResourceDesc::image(label, 64, 32, PixelFormat::Rgba16Float, ResourceUsage::RENDER_TARGET)
    }

    #[test]
    fn test_allocate_assigns_distinct_ids() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();

        let a = pool.allocate(&mut backend, sampled_image("a")).unwrap();
        let b = pool.allocate(&mut backend, sampled_image("b")).unwrap();

        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.desc(b).unwrap().label, "b");
        assert_eq!(backend.live_images(), 2);
    }

    #[test]
    fn test_allocate_rejects_zero_size() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();

        let desc = ResourceDesc::image("empty", 0, 32, PixelFormat::Rgba8Unorm, ResourceUsage::INPUT_LAYER);
        let result = pool.allocate(&mut backend, desc);

        assert!(matches!(result, Err(PipelineError::ResourceCreation { .. })));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_allocate_surfaces_backend_refusal() {
        let mut backend = HeadlessBackend::new();
        backend.refuse_allocations_after(1);
        let mut pool = ResourcePool::new();

        assert!(pool.allocate(&mut backend, sampled_image("first")).is_ok());
        let result = pool.allocate(&mut backend, sampled_image("second"));

        assert!(matches!(result, Err(PipelineError::ResourceCreation { ref label, .. }) if label == "second"));
    }

    #[test]
    fn test_release_invalidates_id() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();

        let id = pool.allocate(&mut backend, sampled_image("gone")).unwrap();
        pool.release(&mut backend, &mut tracker, id).unwrap();

        assert!(matches!(pool.view(id), Err(PipelineError::UnknownResource(_))));
        assert!(matches!(pool.release(&mut backend, &mut tracker, id), Err(PipelineError::UnknownResource(_))));
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_release_drops_tracked_state() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();

        let kept = pool.allocate(&mut backend, sampled_image("kept")).unwrap();
        let gone = pool.allocate(&mut backend, sampled_image("gone")).unwrap();
        tracker.track(kept);
        tracker.track(gone);
        tracker.require(gone, ResourceState::ShaderReadable).unwrap();

        pool.release(&mut backend, &mut tracker, gone).unwrap();

        assert_eq!(tracker.state(gone), None);
        assert_eq!(tracker.state(kept), Some(ResourceState::Undefined));
        assert!(matches!(tracker.require(gone, ResourceState::TransferDestination), Err(PipelineError::UnknownResource(_))));
    }

    #[test]
    fn test_view_and_buffer_distinguish_kinds() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();

        let image = pool.allocate(&mut backend, sampled_image("image")).unwrap();
        let staging = pool.allocate(&mut backend, ResourceDesc::staging_buffer("staging", 256)).unwrap();

        assert!(pool.view(image).is_ok());
        assert!(pool.buffer(image).is_err());
        assert!(pool.buffer(staging).is_ok());
        assert!(pool.view(staging).is_err());
    }

    #[test]
    fn test_teardown_destroys_everything() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();

        let mut tracker = StateTracker::new();

        let image = pool.allocate(&mut backend, sampled_image("a")).unwrap();
        tracker.track(image);
        pool.allocate(&mut backend, ResourceDesc::staging_buffer("b", 16)).unwrap();
        pool.teardown(&mut backend, &mut tracker);

        assert!(pool.is_empty());
        assert_eq!(tracker.state(image), None);
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }
}
