// SPDX-License-Identifier: CEPL-1.0
//! The per-frame protocol.
//!
//! One [`RenderLoop::tick`] walks the current slot through
//! wait → acquire → reset → update → record → submit → present → advance.
//! A surface that stopped matching the swapchain ends the tick early with
//! [`FrameStatus::Recreated`], or with [`FrameStatus::PresentedThenRecreated`]
//! when the image still reached the screen. The slot index only moves after a
//! clean present.

use std::sync::Arc;

use ash::vk;
use cadence_render::SurfaceSource;
use tracing::{debug, error, info, warn};

use crate::config::{FrameConfig, PresentSync};
use crate::device::{DeviceApi, QueueRole};
use crate::error::{FrameError, FrameResult};
use crate::frame::FramePool;
use crate::queue::Queue;
use crate::swapchain::{Acquire, Present, Rebuild, SwapImage, Swapchain, SwapchainState};
use crate::sync::WaitStatus;

/// What the recorder gets to know about the frame being built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub slot: usize,
    pub image: SwapImage,
    pub extent: vk::Extent2D,
    pub frame_number: u64,
}

/// Fills a slot's command buffer. The loop owns reset/begin/end; the recorder
/// only writes what goes in between.
pub trait FrameRecorder<D: DeviceApi, T> {
    /// Per-frame payload update. The slot's previous submission has retired.
    fn update(&mut self, _frame: &FrameInfo, _data: &mut T) -> FrameResult<()> {
        Ok(())
    }

    fn record(
        &mut self,
        device: &D,
        cmd: vk::CommandBuffer,
        frame: &FrameInfo,
        data: &T,
    ) -> FrameResult<()>;

    /// Called after every swapchain build, including the first.
    fn swapchain_rebuilt(&mut self, _swapchain: &Swapchain<D>) -> FrameResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { slot: usize, image: u32 },
    /// The image was presented on a suboptimal swapchain, which was then
    /// rebuilt.
    PresentedThenRecreated { slot: usize, image: u32 },
    /// The swapchain was rebuilt; call `tick` again.
    Recreated,
    /// A bounded wait expired before the slot or an image was free.
    TimedOut { slot: usize },
    /// The window is closing and no swapchain could be built.
    SurfaceClosing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub presented: u64,
    pub recreations: u64,
    pub timeouts: u64,
}

pub struct RenderLoop<D: DeviceApi, T> {
    // Field order is teardown order.
    swapchain: Swapchain<D>,
    frames: FramePool<D, T>,
    graphics: Queue<D>,
    present: Queue<D>,
    config: FrameConfig,
    recreate_requested: bool,
    frame_number: u64,
    stats: LoopStats,
    device: Arc<D>,
}

impl<D: DeviceApi, T> RenderLoop<D, T> {
    /// Allocates the slot pool and builds the first swapchain.
    pub fn new<R>(
        device: Arc<D>,
        config: FrameConfig,
        surface: &mut dyn SurfaceSource,
        recorder: &mut R,
        init: impl FnMut(usize) -> T,
    ) -> FrameResult<Self>
    where
        R: FrameRecorder<D, T> + ?Sized,
    {
        config.validate()?;
        let graphics = Queue::new(device.clone(), QueueRole::Graphics);
        let present = Queue::new(device.clone(), QueueRole::Present);
        let frames = FramePool::new(&device, graphics.family(), config.frames_in_flight, init)?;

        let mut swapchain = Swapchain::new(device.clone(), &config);
        if swapchain.create(surface)? == Rebuild::Rebuilt {
            recorder.swapchain_rebuilt(&swapchain)?;
        }

        info!(
            "vk: render loop ready, {} frames in flight, {} swapchain images, present_sync={:?}",
            frames.len(),
            swapchain.image_count(),
            config.present_sync
        );
        Ok(Self {
            swapchain,
            frames,
            graphics,
            present,
            config,
            recreate_requested: false,
            frame_number: 0,
            stats: LoopStats::default(),
            device,
        })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn current_frame_index(&self) -> usize {
        self.frames.current_index()
    }

    pub fn frames(&self) -> &FramePool<D, T> {
        &self.frames
    }

    pub fn swapchain(&self) -> &Swapchain<D> {
        &self.swapchain
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// The window changed; the next tick rebuilds before touching a slot.
    pub fn request_recreate(&mut self) {
        self.recreate_requested = true;
    }

    /// Runs one frame. Errors are fatal: the loop drains before returning
    /// them.
    pub fn tick<R>(
        &mut self,
        surface: &mut dyn SurfaceSource,
        recorder: &mut R,
    ) -> FrameResult<FrameStatus>
    where
        R: FrameRecorder<D, T> + ?Sized,
    {
        self.stats.ticks += 1;
        let status = self.run_tick(surface, recorder);
        if let Err(e) = &status {
            error!("vk: frame {} failed: {e}", self.frame_number);
            if let Err(drain) = self.drain() {
                warn!("vk: drain after failure: {drain}");
            }
        }
        status
    }

    fn run_tick<R>(
        &mut self,
        surface: &mut dyn SurfaceSource,
        recorder: &mut R,
    ) -> FrameResult<FrameStatus>
    where
        R: FrameRecorder<D, T> + ?Sized,
    {
        if self.recreate_requested || self.swapchain.state() != SwapchainState::Valid {
            return self.rebuild(surface, recorder);
        }

        let slot_index = self.frames.current_index();
        let slot = self.frames.current();

        if slot.in_flight().wait(self.config.fence_timeout)? == WaitStatus::TimedOut {
            self.stats.timeouts += 1;
            warn!("vk: slot {slot_index} fence wait timed out");
            return Ok(FrameStatus::TimedOut { slot: slot_index });
        }

        let acquired = self.swapchain.acquire_next_image(
            Some(slot.image_available()),
            None,
            self.config.acquire_timeout,
        )?;
        let (image, suboptimal) = match acquired {
            Acquire::Image { image, suboptimal } => (image, suboptimal),
            Acquire::OutOfDate => {
                debug!("vk: acquire out of date, rebuilding");
                return self.rebuild(surface, recorder);
            }
            Acquire::TimedOut => {
                self.stats.timeouts += 1;
                warn!("vk: acquire timed out on slot {slot_index}");
                return Ok(FrameStatus::TimedOut { slot: slot_index });
            }
        };

        // Past this point the slot is committed to a submit.
        slot.in_flight().reset()?;

        let frame = FrameInfo {
            slot: slot_index,
            image,
            extent: self.swapchain.extent(),
            frame_number: self.frame_number,
        };
        recorder.update(&frame, self.frames.current_mut().data_mut())?;

        let slot = self.frames.current();
        let cmd = slot.command_buffer();
        let device = &*self.device;
        device
            .reset_command_buffer(cmd)
            .map_err(|e| FrameError::vk("reset_command_buffer", e))?;
        device
            .begin_command_buffer(cmd)
            .map_err(|e| FrameError::vk("begin_command_buffer", e))?;
        recorder.record(device, cmd, &frame, slot.data())?;
        device
            .end_command_buffer(cmd)
            .map_err(|e| FrameError::vk("end_command_buffer", e))?;

        let render_finished = match self.config.present_sync {
            PresentSync::PerImage => self.swapchain.present_semaphore(image),
            PresentSync::PerSlot => slot.render_finished(),
        };
        self.graphics.submit(
            &[cmd],
            &[(
                slot.image_available(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            &[render_finished],
            Some(slot.in_flight()),
        )?;
        self.frame_number += 1;

        let presented = self
            .present
            .present(&self.swapchain, &[render_finished], image)?;

        match presented {
            Present::Presented if !suboptimal => {
                self.stats.presented += 1;
                self.frames.advance();
                Ok(FrameStatus::Presented {
                    slot: slot_index,
                    image: image.index,
                })
            }
            Present::Presented | Present::Suboptimal => {
                self.stats.presented += 1;
                debug!("vk: swapchain suboptimal, rebuilding");
                match self.rebuild(surface, recorder)? {
                    FrameStatus::Recreated => Ok(FrameStatus::PresentedThenRecreated {
                        slot: slot_index,
                        image: image.index,
                    }),
                    other => Ok(other),
                }
            }
            Present::OutOfDate => {
                debug!("vk: present out of date, rebuilding");
                self.rebuild(surface, recorder)
            }
        }
    }

    fn rebuild<R>(
        &mut self,
        surface: &mut dyn SurfaceSource,
        recorder: &mut R,
    ) -> FrameResult<FrameStatus>
    where
        R: FrameRecorder<D, T> + ?Sized,
    {
        self.recreate_requested = false;
        match self.swapchain.recreate(surface)? {
            Rebuild::Rebuilt => {
                recorder.swapchain_rebuilt(&self.swapchain)?;
                self.stats.recreations += 1;
                debug!(stats = ?self.stats, "vk: swapchain rebuilt");
                Ok(FrameStatus::Recreated)
            }
            Rebuild::SurfaceClosing => Ok(FrameStatus::SurfaceClosing),
        }
    }

    /// Waits for every submitted slot to retire, then for the device to go
    /// idle.
    pub fn drain(&self) -> FrameResult<()> {
        self.frames.wait_in_flight(None)?;
        self.device
            .device_wait_idle()
            .map_err(|e| FrameError::vk("device_wait_idle", e))
    }
}

impl<D: DeviceApi, T> Drop for RenderLoop<D, T> {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            warn!("vk: drain on shutdown failed: {e}");
        }
        debug!(stats = ?self.stats, "vk: render loop stopped");
    }
}
