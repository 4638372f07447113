// SPDX-License-Identifier: CEPL-1.0
//! Frame pacing and swapchain lifecycle for Vulkan.
//!
//! The core types are generic over [`DeviceApi`]; [`VkRenderer`] wires them to
//! a real device and a clear-only render target.

use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_render::{FrameOutcome, RenderSize, Renderer, SurfaceSource};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{info, warn};

mod clear_pass;
mod config;
mod context;
mod device;
mod error;
mod frame;
mod queue;
mod render_loop;
mod swapchain;
mod sync;

#[cfg(test)]
pub(crate) mod fake;

pub use clear_pass::{pulse, ClearPass, FrameUniforms};
pub use config::{FrameConfig, PresentSync, VkVsyncMode, MAX_FRAMES_IN_FLIGHT};
pub use context::DeviceContext;
pub use device::{
    DeviceApi, QueueInfo, QueueRole, SemaphoreKind, Submission, SwapchainParams,
    SwapchainSupport,
};
pub use error::{FrameError, FrameResult};
pub use frame::{CommandPool, FramePool, FrameSlot};
pub use queue::Queue;
pub use render_loop::{FrameInfo, FrameRecorder, FrameStatus, LoopStats, RenderLoop};
pub use swapchain::{
    choose_present_mode, choose_surface_format, extent_from_caps, image_count, Acquire, Present,
    Rebuild, SwapImage, Swapchain, SwapchainState,
};
pub use sync::{Fence, Semaphore, SyncPrimitive, WaitGroup, WaitMode, WaitStatus};

const DEFAULT_CLEAR: [f32; 4] = [0.02, 0.02, 0.04, 1.0];

pub struct VkRenderer {
    // Dropped in this order, after `Drop::drop` has drained the device.
    pass: ClearPass,
    frames: RenderLoop<DeviceContext, FrameUniforms>,
    context: Arc<DeviceContext>,
}

impl VkRenderer {
    pub fn stats(&self) -> LoopStats {
        self.frames.stats()
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }
}

impl Renderer for VkRenderer {
    type Config = FrameConfig;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        surface: &mut dyn SurfaceSource,
        config: FrameConfig,
    ) -> Result<Self> {
        let context = Arc::new(DeviceContext::new(window, display)?);
        let mut pass = ClearPass::new(context.clone(), DEFAULT_CLEAR);
        let frames = RenderLoop::new(context.clone(), config, surface, &mut pass, |_| {
            FrameUniforms::default()
        })
        .context("create render loop")?;

        let extent = frames.swapchain().extent();
        info!(
            "Vulkan swapchain ready ({}x{}, fmt 0x{:x})",
            extent.width,
            extent.height,
            frames.swapchain().format().format.as_raw()
        );
        Ok(Self {
            pass,
            frames,
            context,
        })
    }

    fn resize(&mut self, size: RenderSize) {
        if size.is_zero_area() {
            info!("vk: resize to 0x0, rebuild waits for a drawable size");
        }
        self.frames.request_recreate();
    }

    fn render(&mut self, surface: &mut dyn SurfaceSource) -> Result<FrameOutcome> {
        let status = self
            .frames
            .tick(surface, &mut self.pass)
            .context("render frame")?;
        Ok(match status {
            FrameStatus::Presented { .. } | FrameStatus::PresentedThenRecreated { .. } => {
                FrameOutcome::Presented
            }
            FrameStatus::Recreated | FrameStatus::TimedOut { .. } => FrameOutcome::Skipped,
            FrameStatus::SurfaceClosing => FrameOutcome::Closing,
        })
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.pass.set_clear_color(rgba);
    }

    fn drain(&mut self) -> Result<()> {
        self.frames.drain().context("drain frames in flight")
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        // Nothing in flight may reference the framebuffers dropped next.
        if let Err(e) = self.frames.drain() {
            warn!("vk: drain on shutdown failed: {e}");
        }
    }
}
