// Ember - a small forward renderer on raw Vulkan
//
// Frame flow, driven once per RedrawRequested:
//   begin_frame        acquire image, open the slot's command buffer
//   begin_render_pass  clear, viewport, scissor
//   render systems     record draws
//   end_render_pass
//   end_frame          submit, present, advance frame-in-flight slot
//
// begin_frame returns None while the surface is being rebuilt (resize,
// minimize); the tick is skipped.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use glam::Vec3;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use ember_renderer::backend::model::{Model, Vertex};
use ember_renderer::backend::VulkanDevice;
use ember_renderer::config::Config;
use ember_renderer::render_system::SimpleRenderSystem;
use ember_renderer::renderer::Renderer;
use ember_renderer::scene::{Camera, GameObject};

fn main() -> Result<()> {
    let config = Config::load();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting ember renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Application state. Renderer and scene resources hold `Arc`s to the
/// device, so the device outlives everything that records against it.
struct App {
    config: Config,

    window: Option<Arc<Window>>,
    device: Option<Arc<VulkanDevice>>,
    renderer: Option<Renderer>,
    render_system: Option<SimpleRenderSystem>,

    game_objects: Vec<GameObject>,
    camera: Camera,

    is_fullscreen: bool,
    fatal: Option<anyhow::Error>,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            device: None,
            renderer: None,
            render_system: None,
            game_objects: Vec::new(),
            camera: Camera::new(),
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&window, &self.config.window.title, enable_validation)?;

        let renderer = Renderer::new(
            device.clone(),
            window,
            self.config.preferred_present_mode(),
        )?;

        let render_system = SimpleRenderSystem::new(device.clone(), renderer.render_pass())?;

        self.load_game_objects(&device)?;
        self.camera.set_view_target(
            Vec3::new(-1.0, -2.0, 2.0),
            Vec3::new(0.0, 0.0, 2.5),
            Vec3::NEG_Y,
        );

        self.device = Some(device);
        self.renderer = Some(renderer);
        self.render_system = Some(render_system);

        log::info!("Vulkan initialized");
        Ok(())
    }

    fn load_game_objects(&mut self, device: &Arc<VulkanDevice>) -> Result<()> {
        let cube = Arc::new(cube_model(device.clone())?);

        let mut object = GameObject::new();
        object.model = Some(cube);
        object.color = Vec3::new(0.9, 0.6, 0.2);
        object.transform.translation = Vec3::new(0.0, 0.0, 2.5);
        object.transform.scale = Vec3::splat(0.5);

        log::info!("Loaded game object {}", object.id());
        self.game_objects.push(object);
        Ok(())
    }

    fn draw_frame(&mut self) -> Result<()> {
        let renderer = self
            .renderer
            .as_mut()
            .context("Renderer not initialized")?;
        let render_system = self
            .render_system
            .as_ref()
            .context("Render system not initialized")?;

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        for object in &mut self.game_objects {
            object.transform.rotation.y += 0.5 * frame_time;
            object.transform.rotation.x += 0.25 * frame_time;
        }

        self.camera.set_perspective_projection(
            50_f32.to_radians(),
            renderer.aspect_ratio(),
            0.1,
            10.0,
        );

        if let Some(command_buffer) = renderer.begin_frame()? {
            renderer.begin_render_pass(command_buffer);
            render_system.render(command_buffer, &self.game_objects, &self.camera);
            renderer.end_render_pass(command_buffer);
            renderer.end_frame()?;

            self.update_fps();
        }

        Ok(())
    }

    fn toggle_fullscreen(&mut self) {
        let Some(window) = &self.window else {
            return;
        };

        self.is_fullscreen = !self.is_fullscreen;
        if self.is_fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }

        if let Some(renderer) = &mut self.renderer {
            renderer.note_resized();
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();

        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(window) = &self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fatal = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window.clone()) {
            self.fatal = Some(e.context("Failed to initialize Vulkan"));
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(device) = &self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = &mut self.renderer {
                    renderer.note_resized();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw_frame() {
                    log::error!("Fatal render error: {:#}", e);
                    self.fatal = Some(e);
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        PhysicalKey::Code(KeyCode::F11) => {
                            self.toggle_fullscreen();
                        }
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

/// Unit cube centered on the origin, one color per face.
fn cube_model(device: Arc<VulkanDevice>) -> Result<Model> {
    fn face(corners: [[f32; 3]; 4], color: [f32; 3]) -> [Vertex; 6] {
        let v = |position| Vertex { position, color };
        [
            v(corners[0]),
            v(corners[1]),
            v(corners[2]),
            v(corners[0]),
            v(corners[2]),
            v(corners[3]),
        ]
    }

    let mut vertices = Vec::with_capacity(36);
    // left (white)
    vertices.extend(face(
        [
            [-0.5, -0.5, -0.5],
            [-0.5, -0.5, 0.5],
            [-0.5, 0.5, 0.5],
            [-0.5, 0.5, -0.5],
        ],
        [0.9, 0.9, 0.9],
    ));
    // right (yellow)
    vertices.extend(face(
        [
            [0.5, -0.5, -0.5],
            [0.5, 0.5, -0.5],
            [0.5, 0.5, 0.5],
            [0.5, -0.5, 0.5],
        ],
        [0.8, 0.8, 0.1],
    ));
    // top (orange)
    vertices.extend(face(
        [
            [-0.5, -0.5, -0.5],
            [0.5, -0.5, -0.5],
            [0.5, -0.5, 0.5],
            [-0.5, -0.5, 0.5],
        ],
        [0.9, 0.6, 0.1],
    ));
    // bottom (red)
    vertices.extend(face(
        [
            [-0.5, 0.5, -0.5],
            [-0.5, 0.5, 0.5],
            [0.5, 0.5, 0.5],
            [0.5, 0.5, -0.5],
        ],
        [0.8, 0.1, 0.1],
    ));
    // near (blue)
    vertices.extend(face(
        [
            [-0.5, -0.5, -0.5],
            [-0.5, 0.5, -0.5],
            [0.5, 0.5, -0.5],
            [0.5, -0.5, -0.5],
        ],
        [0.1, 0.1, 0.8],
    ));
    // far (green)
    vertices.extend(face(
        [
            [-0.5, -0.5, 0.5],
            [0.5, -0.5, 0.5],
            [0.5, 0.5, 0.5],
            [-0.5, 0.5, 0.5],
        ],
        [0.1, 0.8, 0.1],
    ));

    Model::new(device, &vertices)
}
