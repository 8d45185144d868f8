// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

/// Present-mode preference. `LowLatency` takes mailbox when the surface
/// offers it; `Vsync` always takes FIFO, which every surface must support.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPreference {
    Vsync,
    #[default]
    LowLatency,
}

/// Everything a backend needs to know before the first frame. The pipeline
/// and command buffers are immutable once built, so this is taken at
/// construction rather than through per-field setters.
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub clear_color: [f32; 4],
    pub present: PresentPreference,
    /// Request the validation layer and a debug messenger.
    pub validation: bool,
    /// Pre-compiled SPIR-V blobs; `None` falls back to the backend's
    /// build-time shaders.
    pub vert_shader: Option<PathBuf>,
    pub frag_shader: Option<PathBuf>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            present: PresentPreference::default(),
            validation: cfg!(debug_assertions),
            vert_shader: None,
            frag_shader: None,
        }
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        opts: RenderOptions,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Tear down and rebuild everything that depends on the surface extent.
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
}
