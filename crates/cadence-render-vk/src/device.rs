// SPDX-License-Identifier: CEPL-1.0
//! The device seam.
//!
//! Every call the frame loop makes into the driver goes through [`DeviceApi`].
//! [`crate::DeviceContext`] implements it on top of ash; the unit tests run
//! the same protocol against a simulated device.

use ash::prelude::VkResult;
use ash::vk;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub handle: vk::Queue,
    pub family: u32,
}

/// What the surface supports right now; re-queried on every swapchain build.
#[derive(Clone, Debug, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Negotiated parameters for one swapchain build.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainParams {
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// One batch for [`DeviceApi::queue_submit`]. `wait_stages` pairs with
/// `wait_semaphores` index for index.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline { initial: u64 },
}

/// Device, queue and surface operations consumed by the frame loop.
///
/// Timeouts are in nanoseconds with `u64::MAX` meaning "forever". Waits that
/// expire return `Err(vk::Result::TIMEOUT)`, matching ash.
pub trait DeviceApi {
    fn queue(&self, role: QueueRole) -> QueueInfo;
    fn device_wait_idle(&self) -> VkResult<()>;

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    /// # Safety
    /// No pending queue operation may still reference `fence`.
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64)
        -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore>;
    /// # Safety
    /// No pending queue or present operation may still reference `semaphore`.
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Host wait on timeline semaphores.
    fn wait_semaphores(
        &self,
        semaphores: &[vk::Semaphore],
        values: &[u64],
        wait_any: bool,
        timeout_ns: u64,
    ) -> VkResult<()>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;
    /// # Safety
    /// None of the pool's command buffers may be pending execution.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn swapchain_support(&self) -> VkResult<SwapchainSupport>;
    fn create_swapchain(&self, params: &SwapchainParams) -> VkResult<vk::SwapchainKHR>;
    /// # Safety
    /// The device must be idle with respect to every image of `swapchain`.
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    /// # Safety
    /// No pending work may reference `view`.
    unsafe fn destroy_image_view(&self, view: vk::ImageView);
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;
}
