// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports zero in at least one dimension.
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The window side of presentation: where the drawable extent comes from and
/// how to block until the platform has something new to say.
pub trait SurfaceSource {
    /// Current drawable size in physical pixels.
    fn drawable_size(&self) -> RenderSize;

    /// Block until at least one platform event has been processed.
    fn wait_events(&mut self);

    /// True once the window has been asked to close.
    fn is_closing(&self) -> bool {
        false
    }
}

/// What one call to [`Renderer::render`] achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// An image was presented.
    Presented,
    /// Nothing was presented this call (surface rebuilt, wait timed out).
    Skipped,
    /// The surface is going away; stop rendering.
    Closing,
}

pub trait Renderer {
    type Config;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        surface: &mut dyn SurfaceSource,
        config: Self::Config,
    ) -> Result<Self>
    where
        Self: Sized;

    /// The window changed size; presentation resources are rebuilt lazily.
    fn resize(&mut self, size: RenderSize);
    fn render(&mut self, surface: &mut dyn SurfaceSource) -> Result<FrameOutcome>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);

    /// Wait for the GPU to finish everything in flight.
    fn drain(&mut self) -> Result<()>;
}
