// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;

use crate::device::{DeviceApi, QueueRole, Submission};
use crate::error::{FrameError, FrameResult};
use crate::swapchain::{Present, SwapImage, Swapchain};
use crate::sync::{Fence, Semaphore};

/// A device queue bound to one role. Graphics and present may share the
/// underlying handle.
pub struct Queue<D: DeviceApi> {
    device: Arc<D>,
    handle: vk::Queue,
    family: u32,
    role: QueueRole,
}

impl<D: DeviceApi> Queue<D> {
    pub fn new(device: Arc<D>, role: QueueRole) -> Self {
        let info = device.queue(role);
        Self {
            device,
            handle: info.handle,
            family: info.family,
            role,
        }
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Submits one batch. Each wait semaphore is paired with the stage that
    /// must not start before it is signaled; `fence` is signaled when the
    /// whole batch has executed.
    pub fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait: &[(&Semaphore<D>, vk::PipelineStageFlags)],
        signal: &[&Semaphore<D>],
        fence: Option<&Fence<D>>,
    ) -> FrameResult<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            wait.iter().map(|(s, stage)| (s.handle(), *stage)).unzip();
        let signal_semaphores: Vec<_> = signal.iter().map(|s| s.handle()).collect();
        if let Some(fence) = fence {
            debug_assert!(
                fence.is_armed(),
                "fence submitted again without a reset since its last signal"
            );
        }

        let submission = Submission {
            command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
        };
        self.device
            .queue_submit(
                self.handle,
                &submission,
                fence.map_or(vk::Fence::null(), |f| f.handle()),
            )
            .map_err(|e| FrameError::vk("queue_submit", e))?;

        if let Some(fence) = fence {
            fence.mark_submitted();
        }
        Ok(())
    }

    pub fn present(
        &self,
        swapchain: &Swapchain<D>,
        wait: &[&Semaphore<D>],
        image: SwapImage,
    ) -> FrameResult<Present> {
        debug_assert_eq!(self.role, QueueRole::Present);
        swapchain.present(self, wait, image)
    }
}
