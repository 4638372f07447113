// SPDX-License-Identifier: CEPL-1.0
//! Swapchain lifecycle: build, acquire, present, rebuild.
//!
//! A swapchain is only ever replaced after the device has been drained, and
//! every replacement bumps a generation counter. Images carry the generation
//! they were acquired under so a stale index cannot reach `queue_present`.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use cadence_render::{RenderSize, SurfaceSource};
use tracing::{debug, error, info, warn};

use crate::config::{timeout_ns, FrameConfig, VkVsyncMode};
use crate::device::{DeviceApi, SwapchainParams};
use crate::error::{FrameError, FrameResult};
use crate::queue::Queue;
use crate::sync::{Fence, Semaphore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Valid,
    /// Acquire or present reported the surface no longer matches.
    OutOfDate,
    Destroyed,
}

/// A presentable image index tagged with the swapchain generation that
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapImage {
    pub index: u32,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { image: SwapImage, suboptimal: bool },
    OutOfDate,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Present {
    Presented,
    /// Shown, but the swapchain should be rebuilt.
    Suboptimal,
    OutOfDate,
}

/// Result of a (re)build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rebuild {
    Rebuilt,
    /// The window started closing while we waited for a drawable size.
    SurfaceClosing,
}

pub struct Swapchain<D: DeviceApi> {
    device: Arc<D>,
    config: FrameConfig,
    state: Cell<SwapchainState>,
    handle: vk::SwapchainKHR,
    generation: u64,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    // One render-finished semaphore per image; a present holds its semaphore
    // until the image comes back from the engine.
    present_semaphores: Vec<Semaphore<D>>,
}

impl<D: DeviceApi> Swapchain<D> {
    pub fn new(device: Arc<D>, config: &FrameConfig) -> Self {
        Self {
            device,
            config: *config,
            state: Cell::new(SwapchainState::Uninitialized),
            handle: vk::SwapchainKHR::null(),
            generation: 0,
            format: config.preferred_format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            present_semaphores: Vec::new(),
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state.get()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// The render-finished semaphore bound to `image`.
    pub fn present_semaphore(&self, image: SwapImage) -> &Semaphore<D> {
        &self.present_semaphores[image.index as usize]
    }

    /// First build. Blocks while the surface has zero area.
    pub fn create(&mut self, surface: &mut dyn SurfaceSource) -> FrameResult<Rebuild> {
        debug_assert_eq!(self.state(), SwapchainState::Uninitialized);
        self.rebuild(surface)
    }

    /// Drains the device and replaces the swapchain with one matching the
    /// surface as it is now.
    ///
    /// While the surface has zero area this blocks on
    /// [`SurfaceSource::wait_events`]. If the window starts closing meanwhile
    /// the rebuild is abandoned and the state stays as it was.
    pub fn recreate(&mut self, surface: &mut dyn SurfaceSource) -> FrameResult<Rebuild> {
        if self.state() == SwapchainState::Destroyed {
            return Err(FrameError::SwapchainDestroyed);
        }
        self.rebuild(surface)
    }

    fn rebuild(&mut self, surface: &mut dyn SurfaceSource) -> FrameResult<Rebuild> {
        // Nothing may still be using the images we are about to drop.
        self.device
            .device_wait_idle()
            .map_err(|e| FrameError::vk("device_wait_idle", e))?;

        let mut waited = false;
        loop {
            if surface.is_closing() {
                info!("vk: surface closing, swapchain rebuild abandoned");
                return Ok(Rebuild::SurfaceClosing);
            }
            let size = surface.drawable_size();
            if size.is_zero_area() {
                if !waited {
                    info!("vk: surface is 0x0, waiting for a drawable size");
                    waited = true;
                }
                surface.wait_events();
                continue;
            }
            if self.build(size)? {
                return Ok(Rebuild::Rebuilt);
            }
            // The window has a size but the surface does not yet.
            surface.wait_events();
        }
    }

    /// Returns `false` when the surface currently reports a zero extent.
    fn build(&mut self, window: RenderSize) -> FrameResult<bool> {
        let support = self
            .device
            .swapchain_support()
            .map_err(|e| FrameError::vk("get_surface_support", e))?;
        let caps = support.capabilities;

        let surface_format = choose_surface_format(&support.formats, self.config.preferred_format)
            .ok_or(FrameError::NoSurfaceFormats)?;
        let present_mode = choose_present_mode(&support.present_modes, self.config.vsync_mode);
        let extent = extent_from_caps(&caps, window);
        if extent.width == 0 || extent.height == 0 {
            debug!("vk: surface current_extent is 0x0");
            return Ok(false);
        }
        let min_image_count = image_count(&caps, self.config.frames_in_flight);

        let old = self.handle;
        self.destroy_views();

        let params = SwapchainParams {
            min_image_count,
            surface_format,
            present_mode,
            extent,
            pre_transform: caps.current_transform,
            old_swapchain: old,
        };
        let created = self.device.create_swapchain(&params);

        // The old swapchain is retired either way once a replacement was
        // requested against it.
        if old != vk::SwapchainKHR::null() {
            unsafe { self.device.destroy_swapchain(old) };
            self.handle = vk::SwapchainKHR::null();
            self.present_semaphores.clear();
            self.images.clear();
            self.state.set(SwapchainState::OutOfDate);
        }
        let handle = created.map_err(|e| FrameError::vk("create_swapchain", e))?;
        self.handle = handle;

        let images = self
            .device
            .swapchain_images(handle)
            .map_err(|e| FrameError::vk("get_swapchain_images", e))?;
        if images.len() < self.config.frames_in_flight {
            error!(
                "vk: swapchain gave {} images for {} frames in flight",
                images.len(),
                self.config.frames_in_flight
            );
            self.images = images;
            return Err(FrameError::InsufficientImages {
                images: self.images.len(),
                required: self.config.frames_in_flight,
            });
        }

        for &image in &images {
            let view = self
                .device
                .create_image_view(image, surface_format.format)
                .map_err(|e| FrameError::vk("create_image_view", e))?;
            self.views.push(view);
        }
        self.present_semaphores = images
            .iter()
            .map(|_| Semaphore::new(self.device.clone()))
            .collect::<FrameResult<_>>()?;

        self.images = images;
        self.format = surface_format;
        self.present_mode = present_mode;
        self.extent = extent;
        self.generation += 1;
        self.state.set(SwapchainState::Valid);

        info!(
            "vk: swapchain gen {} format: {} / {}, present_mode: {}, mode={:?}, extent: {}x{}, images(min={} → picked={} → got={})",
            self.generation,
            fmt_name(surface_format.format),
            cs_name(surface_format.color_space),
            pm_name(present_mode),
            self.config.vsync_mode,
            extent.width,
            extent.height,
            caps.min_image_count,
            min_image_count,
            self.images.len(),
        );
        Ok(true)
    }

    /// Requests the next presentable image. `signal` and `fence` are
    /// signaled once the image is actually free.
    pub fn acquire_next_image(
        &self,
        signal: Option<&Semaphore<D>>,
        fence: Option<&Fence<D>>,
        timeout: Option<Duration>,
    ) -> FrameResult<Acquire> {
        match self.state() {
            SwapchainState::Valid => {}
            SwapchainState::Uninitialized | SwapchainState::OutOfDate => {
                return Ok(Acquire::OutOfDate)
            }
            SwapchainState::Destroyed => return Err(FrameError::SwapchainDestroyed),
        }

        let result = self.device.acquire_next_image(
            self.handle,
            timeout_ns(timeout),
            signal.map_or(vk::Semaphore::null(), |s| s.handle()),
            fence.map_or(vk::Fence::null(), |f| f.handle()),
        );
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("vk: acquire reported suboptimal (image {index})");
                }
                Ok(Acquire::Image {
                    image: SwapImage {
                        index,
                        generation: self.generation,
                    },
                    suboptimal,
                })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state.set(SwapchainState::OutOfDate);
                Ok(Acquire::OutOfDate)
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(Acquire::TimedOut),
            Err(e) => Err(FrameError::vk("acquire_next_image", e)),
        }
    }

    /// Queues `image` for presentation once every semaphore in `wait` is
    /// signaled.
    pub fn present(
        &self,
        queue: &Queue<D>,
        wait: &[&Semaphore<D>],
        image: SwapImage,
    ) -> FrameResult<Present> {
        match self.state() {
            SwapchainState::Destroyed => return Err(FrameError::SwapchainDestroyed),
            SwapchainState::Uninitialized => return Ok(Present::OutOfDate),
            SwapchainState::Valid | SwapchainState::OutOfDate => {}
        }
        if image.generation != self.generation {
            error!(
                "vk: present of image {} from generation {} (current {})",
                image.index, image.generation, self.generation
            );
            return Err(FrameError::StaleImage {
                index: image.index,
                issued: image.generation,
                current: self.generation,
            });
        }

        let wait: Vec<_> = wait.iter().map(|s| s.handle()).collect();
        match self
            .device
            .queue_present(queue.handle(), self.handle, image.index, &wait)
        {
            Ok(false) => Ok(Present::Presented),
            Ok(true) => {
                debug!("vk: present reported suboptimal");
                Ok(Present::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state.set(SwapchainState::OutOfDate);
                Ok(Present::OutOfDate)
            }
            Err(e) => Err(FrameError::vk("queue_present", e)),
        }
    }

    fn destroy_views(&mut self) {
        for view in self.views.drain(..) {
            unsafe { self.device.destroy_image_view(view) };
        }
    }

    /// Releases every swapchain resource. The caller must have drained the
    /// device first.
    pub fn destroy(&mut self) {
        if self.state() == SwapchainState::Destroyed {
            return;
        }
        self.destroy_views();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.device.destroy_swapchain(self.handle) };
            self.handle = vk::SwapchainKHR::null();
        }
        // Presents waiting on these ended with the swapchain.
        self.present_semaphores.clear();
        self.images.clear();
        self.state.set(SwapchainState::Destroyed);
        debug!("vk: swapchain destroyed");
    }
}

impl<D: DeviceApi> Drop for Swapchain<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Preferred format if the surface lists it, else whatever comes first.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
}

/// MAILBOX when asked for and available; FIFO otherwise since every surface
/// supports it.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], mode: VkVsyncMode) -> vk::PresentModeKHR {
    match mode {
        VkVsyncMode::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        VkVsyncMode::Mailbox => {
            warn!("vk: MAILBOX unavailable, falling back to FIFO");
            vk::PresentModeKHR::FIFO
        }
        VkVsyncMode::Fifo => vk::PresentModeKHR::FIFO,
    }
}

/// The surface dictates the extent unless it reports the `u32::MAX` sentinel,
/// in which case the window size is clamped into the supported range.
pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        // Some drivers report min > max; the maximum wins.
        vk::Extent2D {
            width: want
                .width
                .max(caps.min_image_extent.width)
                .min(caps.max_image_extent.width),
            height: want
                .height
                .max(caps.min_image_extent.height)
                .min(caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, at least one image per frame slot, capped by
/// the maximum (0 means "no maximum").
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR, frames_in_flight: usize) -> u32 {
    let slots = u32::try_from(frames_in_flight).unwrap_or(u32::MAX);
    let want = (caps.min_image_count + 1).max(slots);
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

fn fmt_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        vk::Format::A2B10G10R10_UNORM_PACK32 => "A2B10G10R10_UNORM",
        _ => "OTHER",
    }
}

fn cs_name(cs: vk::ColorSpaceKHR) -> &'static str {
    match cs {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => "SRGB_NONLINEAR",
        vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT => "EXTENDED_SRGB_LINEAR",
        _ => "OTHER",
    }
}

fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}
