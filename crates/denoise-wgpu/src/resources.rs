//! Physical resources behind the logical textures of the stage graph

use crate::{
    backend::Backend,
    config::LAYER_BYTES,
    error::PipelineResult,
    frame_loader::LayerKind,
    frame_scheduler::HistoryIndex,
    resource_pool::{ResourceDesc, ResourceId, ResourcePool, ResourceUsage},
    resource_state::{Barrier, ResourceState, StateTracker},
    stage_graph::{HistoryKey, HistoryRole, TextureKey, TextureRef},
};

/// Every pooled resource the pipeline uses, allocated once at startup
#[derive(Debug, Clone)]
pub struct PipelineResources {
    /// Indexed by [`TextureKey::index`]
    fixed: Vec<ResourceId>,
    /// Indexed by [`HistoryKey::index`]; each entry is a read/write pair
    history: Vec<[ResourceId; 2]>,
    /// Upload buffers, indexed by [`LayerKind::index`]
    staging: Vec<ResourceId>,
}

impl PipelineResources {
    /// Allocates all images and staging buffers and registers the images with `tracker`
    ///
    /// Rendered images are moved straight to `ShaderReadable` so that the first
    /// frame can sample history it has never written. Uploaded images stay
    /// `Undefined` until their first copy.
    ///
    /// # Returns
    /// The resources and the startup barriers, in order
    pub fn allocate<B: Backend>(pool: &mut ResourcePool<B>, backend: &mut B, tracker: &mut StateTracker) -> PipelineResult<(Self, Vec<Barrier>)> {
        let mut barriers = Vec::new();

        let mut fixed = Vec::with_capacity(TextureKey::ALL.len());
        for key in TextureKey::ALL {
            let (width, height) = key.resolution().extent();
            let usage = if key.is_external() { ResourceUsage::INPUT_LAYER } else { ResourceUsage::RENDER_TARGET };
            let id = pool.allocate(backend, ResourceDesc::image(key.label(), width, height, key.format(), usage))?;
            tracker.track(id);
            if !key.is_external() {
                barriers.extend(tracker.require(id, ResourceState::ShaderReadable)?);
            }
            fixed.push(id);
        }

        let mut history = Vec::with_capacity(HistoryKey::ALL.len());
        let (width, height) = HistoryKey::RESOLUTION.extent();
        for key in HistoryKey::ALL {
            let mut allocate_half = |i: usize| -> PipelineResult<ResourceId> {
                let desc = ResourceDesc::image(format!("{}[{i}]", key.label()), width, height, HistoryKey::FORMAT, ResourceUsage::RENDER_TARGET);
                let id = pool.allocate(backend, desc)?;
                tracker.track(id);
                barriers.extend(tracker.require(id, ResourceState::ShaderReadable)?);
                Ok(id)
            };
            history.push([allocate_half(0)?, allocate_half(1)?]);
        }

        let mut staging = Vec::with_capacity(LayerKind::ALL.len());
        for layer in LayerKind::ALL {
            staging.push(pool.allocate(backend, ResourceDesc::staging_buffer(format!("{} staging", layer.label()), LAYER_BYTES as u64))?);
        }

        tracing::info!(resources = pool.len(), "allocated pipeline resources");
        Ok((Self { fixed, history, staging }, barriers))
    }

    pub fn fixed(&self, key: TextureKey) -> ResourceId {
        self.fixed[key.index()]
    }

    /// Both halves of a history pair, in index order
    pub fn history_pair(&self, key: HistoryKey) -> [ResourceId; 2] {
        self.history[key.index()]
    }

    /// Physical resource behind one role of a history pair for `history_index`
    pub fn history(&self, key: HistoryKey, role: HistoryRole, history_index: HistoryIndex) -> ResourceId {
        let pair = self.history_pair(key);
        match role {
            HistoryRole::Previous => pair[history_index.read()],
            HistoryRole::Current => pair[history_index.write()],
        }
    }

    /// Resolves a logical texture; `None` for the present target
    pub fn resolve(&self, texture: TextureRef, history_index: HistoryIndex) -> Option<ResourceId> {
        match texture {
            TextureRef::Fixed(key) => Some(self.fixed(key)),
            TextureRef::History(key, role) => Some(self.history(key, role, history_index)),
            TextureRef::PresentTarget => None,
        }
    }

    /// Staging buffer that feeds the texture of `layer`
    pub fn staging(&self, layer: LayerKind) -> ResourceId {
        self.staging[layer.index()]
    }

    /// Texture written by uploads of `layer`
    pub fn layer_texture(&self, layer: LayerKind) -> ResourceId {
        self.fixed(layer.texture_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        config::{HEIGHT, RAY_MARCH_HEIGHT, RAY_MARCH_WIDTH, WIDTH},
        resource_pool::{PixelFormat, ResourceKind},
    };

    fn extent(pool: &ResourcePool<HeadlessBackend>, id: ResourceId) -> (u32, u32) {
        match pool.desc(id).unwrap().kind {
            ResourceKind::Image { width, height, .. } => (width, height),
            ResourceKind::StagingBuffer { .. } => panic!("{id} is not an image"),
        }
    }

    #[test]
    fn test_allocate_everything_up_front() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();

        let (resources, barriers) = PipelineResources::allocate(&mut pool, &mut backend, &mut tracker).unwrap();

        let images = TextureKey::ALL.len() + 2 * HistoryKey::ALL.len();
        assert_eq!(pool.len(), images + LayerKind::ALL.len());
        // Rendered fixed textures plus every history image start out readable
        assert_eq!(barriers.len(), 5 + 2 * HistoryKey::ALL.len());
        assert_eq!(tracker.state(resources.fixed(TextureKey::Color)), Some(ResourceState::Undefined));
        assert_eq!(tracker.state(resources.fixed(TextureKey::Fresnel)), Some(ResourceState::ShaderReadable));
    }

    #[test]
    fn test_history_roles_swap_with_index() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();
        let (resources, _) = PipelineResources::allocate(&mut pool, &mut backend, &mut tracker).unwrap();

        for key in HistoryKey::ALL {
            let [a, b] = resources.history_pair(key);
            assert_eq!(resources.history(key, HistoryRole::Previous, HistoryIndex::ZERO), a);
            assert_eq!(resources.history(key, HistoryRole::Current, HistoryIndex::ZERO), b);
            assert_eq!(resources.history(key, HistoryRole::Previous, HistoryIndex::ONE), b);
            assert_eq!(resources.history(key, HistoryRole::Current, HistoryIndex::ONE), a);
        }
    }

    #[test]
    fn test_ray_march_targets_use_ray_march_extent() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();
        let (resources, _) = PipelineResources::allocate(&mut pool, &mut backend, &mut tracker).unwrap();

        let desc = pool.desc(resources.fixed(TextureKey::RayMarchColor)).unwrap();
        assert_eq!(
            desc.kind,
            ResourceKind::Image {
                width: RAY_MARCH_WIDTH,
                height: RAY_MARCH_HEIGHT,
                format: PixelFormat::Rgba16Float,
            }
        );
    }

    #[test]
    fn test_only_uploaded_layers_are_native_size() {
        let mut backend = HeadlessBackend::new();
        let mut pool = ResourcePool::new();
        let mut tracker = StateTracker::new();
        let (resources, _) = PipelineResources::allocate(&mut pool, &mut backend, &mut tracker).unwrap();
        let ray_march = (RAY_MARCH_WIDTH, RAY_MARCH_HEIGHT);

        for key in [TextureKey::TnrIntermediate, TextureKey::TnrAux, TextureKey::Fresnel] {
            assert_eq!(extent(&pool, resources.fixed(key)), ray_march, "{key:?}");
        }
        for key in HistoryKey::ALL {
            for id in resources.history_pair(key) {
                assert_eq!(extent(&pool, id), ray_march, "{key:?}");
            }
        }
        for layer in LayerKind::ALL {
            assert_eq!(extent(&pool, resources.layer_texture(layer)), (WIDTH, HEIGHT), "{layer:?}");
        }
    }
}
