// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Faults the frame loop cannot absorb on its own.
///
/// A surface that stopped matching the swapchain is not in here: that case is
/// an ordinary outcome of acquire/present and is handled by rebuilding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("device lost during {0}")]
    DeviceLost(&'static str),

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    #[error("surface reports no supported formats")]
    NoSurfaceFormats,

    #[error("swapchain provides {images} images but {required} frames in flight were requested")]
    InsufficientImages { images: usize, required: usize },

    #[error("invalid frame configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid wait group: {0}")]
    InvalidWaitGroup(&'static str),

    #[error("swap image {index} belongs to generation {issued}, swapchain is at {current}")]
    StaleImage {
        index: u32,
        issued: u64,
        current: u64,
    },

    #[error("swapchain has been destroyed")]
    SwapchainDestroyed,
}

impl FrameError {
    /// Maps a raw driver result for `op`, folding every flavour of device loss
    /// into [`FrameError::DeviceLost`].
    pub fn vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost(op),
            result => FrameError::Vulkan { op, result },
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, FrameError::DeviceLost(_))
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;
