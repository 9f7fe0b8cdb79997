//! vkexp - exploratory Vulkan harness.
//!
//! Opens a window, initializes a device and swap chain, and draws one
//! hard-coded triangle per frame until the window closes.

use anyhow::Result;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::WindowId;

use vkexp_core::Timer;
use vkexp_platform::Window;
use vkexp_renderer::Renderer;

const WINDOW_TITLE: &str = "vkexp - Vulkan exploring";
const WINDOW_WIDTH: u32 = 800;
const WINDOW_HEIGHT: u32 = 600;
const FULLSCREEN: bool = false;

struct App {
    window: Option<Window>,
    renderer: Option<Renderer>,
    timer: Timer,
    frame_accum: f32,
    frame_count: u32,
}

impl App {
    fn new() -> Self {
        Self {
            window: None,
            renderer: None,
            timer: Timer::new(),
            frame_accum: 0.0,
            frame_count: 0,
        }
    }

    /// Reports the average frame time roughly once per second.
    fn report_timing(&mut self) {
        self.frame_accum += self.timer.delta_secs();
        self.frame_count += 1;

        if self.frame_accum >= 1.0 {
            let avg_ms = self.frame_accum * 1000.0 / self.frame_count as f32;
            info!("{} frames, {:.2} ms avg", self.frame_count, avg_ms);
            self.frame_accum = 0.0;
            self.frame_count = 0;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            match Window::new(
                event_loop,
                WINDOW_WIDTH,
                WINDOW_HEIGHT,
                WINDOW_TITLE,
                FULLSCREEN,
            ) {
                Ok(window) => match Renderer::new(&window) {
                    Ok(renderer) => {
                        info!("Initialization complete, entering main loop");
                        self.renderer = Some(renderer);
                        self.window = Some(window);
                    }
                    Err(e) => {
                        error!("Failed to initialize renderer: {}", e);
                        event_loop.exit();
                    }
                },
                Err(e) => {
                    error!("Failed to create window: {}", e);
                    event_loop.exit();
                }
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    info!("Escape pressed, shutting down");
                    event_loop.exit();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(ref mut renderer) = self.renderer {
                    // Frame errors are fatal; there is no degraded mode
                    if let Err(e) = renderer.render_frame() {
                        error!("Frame failed, aborting: {}", e);
                        event_loop.exit();
                        return;
                    }
                    self.report_timing();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Drive every ring slot idle before resources are released
        if let Some(ref mut renderer) = self.renderer {
            if let Err(e) = renderer.shutdown() {
                error!("Shutdown wait failed: {}", e);
            }
        }
        self.renderer = None;
        self.window = None;
    }
}

fn main() -> Result<()> {
    vkexp_core::init_logging();
    info!("Starting vkexp");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new();
    event_loop.run_app(&mut app)?;

    Ok(())
}
