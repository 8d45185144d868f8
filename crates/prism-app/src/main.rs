// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{anyhow, Result};
use clap::Parser;
use prism_core::init_tracing;
use prism_render::{PresentPreference, RenderOptions, RenderSize, Renderer};
use prism_render_vk::VkRenderer;
use tracing::{info, warn};

use prism_platform::winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{fs, time::Instant};

const WINDOW_WIDTH: u32 = 800;
const WINDOW_HEIGHT: u32 = 600;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "prism.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
struct RenderCfg {
    #[serde(default = "default_clear")]
    clear_color: [f32; 4],
    #[serde(default)]
    vsync_mode: VsyncMode,
    #[serde(default = "default_validation")]
    validation: bool,
    #[serde(default)]
    vert_shader: Option<PathBuf>,
    #[serde(default)]
    frag_shader: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync_mode: VsyncMode::Mailbox,
            validation: default_validation(),
            vert_shader: None,
            frag_shader: None,
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_validation() -> bool {
    cfg!(debug_assertions)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match toml::from_str::<AppCfg>(&s) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("{}: {e}; using defaults", path.display());
                AppCfg::default()
            }
        },
        Err(_) => AppCfg::default(),
    }
}

fn render_options(cfg: &RenderCfg) -> RenderOptions {
    RenderOptions {
        clear_color: cfg.clear_color,
        present: match cfg.vsync_mode {
            VsyncMode::Fifo => PresentPreference::Vsync,
            VsyncMode::Mailbox => PresentPreference::LowLatency,
        },
        validation: cfg.validation,
        vert_shader: cfg.vert_shader.clone(),
        frag_shader: cfg.frag_shader.clone(),
    }
}

struct App {
    cfg: AppCfg,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,

    paused: bool,
    exiting: bool,
    fatal: Option<anyhow::Error>,

    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        self.fatal = Some(err);
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let attrs = Window::default_attributes()
                .with_title("prism")
                .with_inner_size(LogicalSize::new(WINDOW_WIDTH, WINDOW_HEIGHT));
            let window = match event_loop.create_window(attrs) {
                Ok(w) => w,
                Err(e) => return self.fail(event_loop, anyhow!("could not create window: {e}")),
            };

            let size = window.inner_size();
            self.render_size = RenderSize {
                width: size.width.max(1),
                height: size.height.max(1),
            };

            let renderer = window
                .window_handle()
                .map_err(anyhow::Error::from)
                .and_then(|wh| {
                    let dh = window.display_handle()?;
                    VkRenderer::new(&wh, &dh, self.render_size, render_options(&self.cfg.render))
                });
            match renderer {
                Ok(r) => self.renderer = Some(r),
                Err(e) => return self.fail(event_loop, e),
            }

            self.window = Some(window);
        }

        self.paused = self.render_size.width == 0 || self.render_size.height == 0;
        event_loop.set_control_flow(ControlFlow::Poll);

        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("close requested");
                self.exiting = true;
                // Dropping the renderer waits the device idle before any
                // object goes away.
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                self.paused = self.render_size.width == 0 || self.render_size.height == 0;
                info!(
                    "resized to {}x{} (paused={})",
                    self.render_size.width, self.render_size.height, self.paused
                );

                if !self.paused {
                    if let Some(renderer) = &mut self.renderer {
                        if let Err(e) = renderer.resize(self.render_size) {
                            return self.fail(event_loop, e);
                        }
                    }
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                if let Some(renderer) = &mut self.renderer {
                    match renderer.render() {
                        Ok(()) => self.frames = self.frames.saturating_add(1),
                        Err(e) => self.fail(event_loop, e),
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App {
        cfg: load_cfg(&args.config),
        window: None,
        renderer: None,
        render_size: RenderSize {
            width: WINDOW_WIDTH,
            height: WINDOW_HEIGHT,
        },
        paused: false,
        exiting: false,
        fatal: None,
        frames: 0,
        last_fps_instant: Instant::now(),
    };

    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    println!("prism {}", env!("CARGO_PKG_VERSION"));
    init_tracing();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
