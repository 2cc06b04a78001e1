//! Window and event handling for the denoise player

use denoise_wgpu::{Pipeline, PipelineConfig, PipelineError, PipelineResult, RawSequenceLoader, ShaderLibrary, StageGraph, WgpuBackend, config};
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::ActiveEventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

/// Live window plus the pipeline presenting into it
struct PlayerContext {
    window: Arc<Window>,
    pipeline: Pipeline<WgpuBackend, RawSequenceLoader>,
}

impl PlayerContext {
    fn new(event_loop: &ActiveEventLoop, config: &PipelineConfig) -> PipelineResult<Self> {
        let window_attributes = Window::default_attributes()
            .with_title("Denoise Player")
            .with_inner_size(PhysicalSize::new(config::WIDTH, config::HEIGHT))
            .with_resizable(false);
        let window = Arc::new(event_loop.create_window(window_attributes).map_err(|e| PipelineError::resource_creation("window", e))?);

        let shaders = match &config.shader_dir {
            Some(dir) => ShaderLibrary::from_dir(dir)?,
            None => ShaderLibrary::builtin(),
        };
        let graph = StageGraph::standard()?;

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let surface = instance.create_surface(window.clone()).map_err(|e| PipelineError::resource_creation("surface", e))?;
        let mut backend = WgpuBackend::new(&instance, surface, &graph, &shaders)?;
        tracing::info!(format = ?backend.surface_format(), "surface configured");

        let notify = window.clone();
        backend.set_pre_present_hook(move || notify.pre_present_notify());

        let loader = RawSequenceLoader::new(&config.sequence_dir);
        let pipeline = Pipeline::new(backend, loader, config.frame_delay)?;

        window.request_redraw();
        Ok(Self { window, pipeline })
    }
}

/// Application handler driving one pipeline frame per redraw
pub struct DenoiseApp {
    config: PipelineConfig,
    context: Option<PlayerContext>,
    error: Option<PipelineError>,
}

impl DenoiseApp {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, context: None, error: None }
    }

    /// The fatal error that stopped the event loop, if any
    pub fn into_error(self) -> Option<PipelineError> {
        self.error
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: PipelineError) {
        tracing::error!("{err}");
        self.error = Some(err);
        self.shutdown();
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(mut context) = self.context.take() {
            if let Err(err) = context.pipeline.shutdown() {
                tracing::error!("shutdown failed: {err}");
            }
        }
    }
}

impl ApplicationHandler for DenoiseApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.context.is_some() {
            return;
        }
        match PlayerContext::new(event_loop, &self.config) {
            Ok(context) => {
                self.context = Some(context);
                println!();
                println!("Keyboard shortcuts:");
                println!("  - Esc: Quit");
                println!();
            }
            Err(err) => self.fail(event_loop, err),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::KeyboardInput {
                event: KeyEvent {
                    state: ElementState::Pressed,
                    physical_key: PhysicalKey::Code(KeyCode::Escape),
                    ..
                },
                ..
            }
            | WindowEvent::CloseRequested => {
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                let Some(context) = self.context.as_mut() else {
                    return;
                };
                match context.pipeline.render_frame() {
                    Ok(_) => context.window.request_redraw(),
                    Err(err) => self.fail(event_loop, err),
                }
            }

            // The surface stays at the native frame size
            WindowEvent::Resized(size) => {
                tracing::debug!(width = size.width, height = size.height, "ignoring resize");
            }

            _ => {}
        }
    }
}
