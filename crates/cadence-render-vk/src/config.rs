// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use ash::vk;

use crate::error::{FrameError, FrameResult};

/// Upper bound on frame slots; more than this only adds latency.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VkVsyncMode {
    Fifo, // Target monitor refresh rate
    #[default]
    Mailbox, // Smart Vsync, fps uncapped
}

/// Which semaphore carries "rendering finished" from submit to present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PresentSync {
    /// One semaphore per swapchain image, owned by the swapchain.
    #[default]
    PerImage,
    /// The frame slot's own render-finished semaphore.
    PerSlot,
}

#[derive(Clone, Copy, Debug)]
pub struct FrameConfig {
    pub frames_in_flight: usize,
    pub vsync_mode: VkVsyncMode,
    pub preferred_format: vk::SurfaceFormatKHR,
    /// `None` waits forever.
    pub fence_timeout: Option<Duration>,
    /// `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    pub present_sync: PresentSync,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            vsync_mode: VkVsyncMode::Mailbox,
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            fence_timeout: None,
            acquire_timeout: None,
            present_sync: PresentSync::PerImage,
        }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> FrameResult<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(FrameError::InvalidConfig(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        // A zero timeout turns every wait into a poll and the loop into a spin.
        if self.fence_timeout == Some(Duration::ZERO) {
            return Err(FrameError::InvalidConfig(
                "fence_timeout of zero; use None for an unbounded wait".into(),
            ));
        }
        if self.acquire_timeout == Some(Duration::ZERO) {
            return Err(FrameError::InvalidConfig(
                "acquire_timeout of zero; use None for an unbounded wait".into(),
            ));
        }
        Ok(())
    }
}

/// Converts an optional timeout to the nanosecond form the driver takes.
pub(crate) fn timeout_ns(timeout: Option<Duration>) -> u64 {
    match timeout {
        None => u64::MAX,
        Some(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX),
    }
}
