// SPDX-License-Identifier: CEPL-1.0
//! A simulated device for unit tests.
//!
//! Submissions complete in order when the host waits on them, so the tests run
//! the real frame protocol without a GPU. Anything the Vulkan spec calls a
//! usage error is recorded as a violation instead of crashing the test.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use cadence_render::{RenderSize, SurfaceSource};

use crate::device::{
    DeviceApi, QueueInfo, QueueRole, SemaphoreKind, Submission, SwapchainParams,
    SwapchainSupport,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    WaitFences(Vec<vk::Fence>),
    ResetFences(Vec<vk::Fence>),
    Acquire(Result<u32, vk::Result>),
    Submit {
        cmd: vk::CommandBuffer,
        wait: Vec<vk::Semaphore>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present {
        image: u32,
        wait: Vec<vk::Semaphore>,
    },
    WaitIdle,
    CreateSwapchain {
        extent: vk::Extent2D,
        images: u32,
        old: vk::SwapchainKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
}

#[derive(Clone, Copy, Debug)]
enum Scripted {
    Fail(vk::Result),
    Suboptimal,
}

#[derive(Default)]
struct SemaphoreState {
    timeline: Option<u64>,
    signaled: bool,
    // A present is still waiting on this semaphore; released when the
    // presentation engine hands the image back.
    held_by: Option<(vk::SwapchainKHR, u32)>,
}

struct Pending {
    cmd: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next: usize,
}

struct State {
    next_handle: u64,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, SemaphoreState>,
    pools: usize,
    views: usize,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    pending: VecDeque<Pending>,
    support: SwapchainSupport,
    image_count_override: Option<u32>,
    last_params: Option<SwapchainParams>,
    acquire_script: VecDeque<Scripted>,
    present_script: VecDeque<Scripted>,
    gpu_stalled: bool,
    device_lost: bool,
    log: Vec<Call>,
    violations: Vec<String>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn complete_front(&mut self) -> bool {
        let Some(done) = self.pending.pop_front() else {
            return false;
        };
        if done.fence != vk::Fence::null() {
            self.fences.insert(done.fence, true);
        }
        true
    }

    fn violation(&mut self, what: String) {
        self.violations.push(what);
    }

    fn signal_binary(&mut self, semaphore: vk::Semaphore, by: &str) {
        let reused = match self.semaphores.get(&semaphore) {
            Some(s) => s.signaled || s.held_by.is_some(),
            None => {
                self.violation(format!("{by} signals unknown semaphore {semaphore:?}"));
                return;
            }
        };
        if reused {
            self.violation(format!(
                "{by} signals {semaphore:?} before its previous signal was consumed"
            ));
        }
        if let Some(s) = self.semaphores.get_mut(&semaphore) {
            s.signaled = true;
        }
    }

    fn consume_binary(&mut self, semaphore: vk::Semaphore, by: &str) {
        let ready = self
            .semaphores
            .get(&semaphore)
            .is_some_and(|s| s.signaled && s.held_by.is_none());
        if !ready {
            self.violation(format!("{by} waits on unsignaled semaphore {semaphore:?}"));
        }
        if let Some(s) = self.semaphores.get_mut(&semaphore) {
            s.signaled = false;
        }
    }

    fn release_image(&mut self, swapchain: vk::SwapchainKHR, image: u32) {
        for s in self.semaphores.values_mut() {
            if s.held_by == Some((swapchain, image)) {
                s.held_by = None;
                s.signaled = false;
            }
        }
    }
}

pub(crate) struct FakeDevice {
    state: Mutex<State>,
}

pub(crate) const GRAPHICS_FAMILY: u32 = 0;

pub(crate) fn default_support() -> SwapchainSupport {
    SwapchainSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

impl FakeDevice {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_support(default_support())
    }

    pub(crate) fn with_support(support: SwapchainSupport) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_handle: 0,
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                pools: 0,
                views: 0,
                swapchains: HashMap::new(),
                pending: VecDeque::new(),
                support,
                image_count_override: None,
                last_params: None,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                gpu_stalled: false,
                device_lost: false,
                log: Vec::new(),
                violations: Vec::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_current_extent(&self, width: u32, height: u32) {
        self.state().support.capabilities.current_extent = vk::Extent2D { width, height };
    }

    /// Force the number of images the next swapchains report.
    pub(crate) fn set_image_count(&self, count: u32) {
        self.state().image_count_override = Some(count);
    }

    pub(crate) fn fail_next_acquire(&self, result: vk::Result) {
        self.state().acquire_script.push_back(Scripted::Fail(result));
    }

    pub(crate) fn suboptimal_next_acquire(&self) {
        self.state().acquire_script.push_back(Scripted::Suboptimal);
    }

    pub(crate) fn fail_next_present(&self, result: vk::Result) {
        self.state().present_script.push_back(Scripted::Fail(result));
    }

    pub(crate) fn suboptimal_next_present(&self) {
        self.state().present_script.push_back(Scripted::Suboptimal);
    }

    /// While stalled, nothing submitted completes.
    pub(crate) fn stall_gpu(&self, stalled: bool) {
        self.state().gpu_stalled = stalled;
    }

    pub(crate) fn lose_device(&self) {
        self.state().device_lost = true;
    }

    pub(crate) fn log(&self) -> Vec<Call> {
        self.state().log.clone()
    }

    pub(crate) fn clear_log(&self) {
        self.state().log.clear();
    }

    pub(crate) fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }

    pub(crate) fn assert_clean(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "usage violations: {violations:#?}");
    }

    pub(crate) fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence).copied().unwrap_or(false)
    }

    pub(crate) fn pending_submissions(&self) -> usize {
        self.state().pending.len()
    }

    pub(crate) fn last_params(&self) -> Option<SwapchainParams> {
        self.state().last_params
    }

    /// Everything created and not yet destroyed.
    pub(crate) fn live_objects(&self) -> usize {
        let s = self.state();
        s.fences.len() + s.semaphores.len() + s.pools + s.views + s.swapchains.len()
    }
}

impl DeviceApi for FakeDevice {
    fn queue(&self, _role: QueueRole) -> QueueInfo {
        QueueInfo {
            handle: vk::Queue::from_raw(0x51),
            family: GRAPHICS_FAMILY,
        }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut s = self.state();
        s.log.push(Call::WaitIdle);
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if s.gpu_stalled && !s.pending.is_empty() {
            s.violation("device_wait_idle on a stalled queue would never return".into());
            return Err(vk::Result::TIMEOUT);
        }
        while s.complete_front() {}
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut s = self.state();
        let fence = vk::Fence::from_raw(s.handle());
        s.fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.state();
        if s.pending.iter().any(|p| p.fence == fence) {
            s.violation(format!("destroyed {fence:?} while in flight"));
        }
        s.fences.remove(&fence);
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        let mut s = self.state();
        s.log.push(Call::WaitFences(fences.to_vec()));
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        loop {
            let signaled = |f: &vk::Fence| s.fences.get(f).copied().unwrap_or(false);
            let done = if wait_all {
                fences.iter().all(signaled)
            } else {
                fences.iter().any(signaled)
            };
            if done {
                return Ok(());
            }
            if s.gpu_stalled || !s.complete_front() {
                if timeout_ns == u64::MAX {
                    s.violation(format!("unbounded wait on {fences:?} that nothing will signal"));
                }
                return Err(vk::Result::TIMEOUT);
            }
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut s = self.state();
        s.log.push(Call::ResetFences(fences.to_vec()));
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        for fence in fences {
            if s.pending.iter().any(|p| p.fence == *fence) {
                s.violation(format!("reset of {fence:?} while in flight"));
            }
            s.fences.insert(*fence, false);
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let s = self.state();
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(s.fences.get(&fence).copied().unwrap_or(false))
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        let mut s = self.state();
        let semaphore = vk::Semaphore::from_raw(s.handle());
        let timeline = match kind {
            SemaphoreKind::Binary => None,
            SemaphoreKind::Timeline { initial } => Some(initial),
        };
        s.semaphores.insert(
            semaphore,
            SemaphoreState {
                timeline,
                ..Default::default()
            },
        );
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.state();
        let held = s
            .semaphores
            .get(&semaphore)
            .and_then(|st| st.held_by)
            .is_some();
        if held {
            s.violation(format!("destroyed {semaphore:?} while a present waits on it"));
        }
        s.semaphores.remove(&semaphore);
    }

    fn wait_semaphores(
        &self,
        semaphores: &[vk::Semaphore],
        values: &[u64],
        wait_any: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        let mut s = self.state();
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let reached = |(sem, value): (&vk::Semaphore, &u64)| {
            s.semaphores
                .get(sem)
                .and_then(|st| st.timeline)
                .is_some_and(|v| v >= *value)
        };
        let done = if wait_any {
            semaphores.iter().zip(values).any(reached)
        } else {
            semaphores.iter().zip(values).all(reached)
        };
        if done {
            return Ok(());
        }
        if timeout_ns == u64::MAX {
            s.violation(format!("unbounded wait on {semaphores:?} that nothing will signal"));
        }
        Err(vk::Result::TIMEOUT)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let mut s = self.state();
        let current = s.semaphores.get(&semaphore).and_then(|st| st.timeline);
        match current {
            Some(v) if value > v => {
                if let Some(st) = s.semaphores.get_mut(&semaphore) {
                    st.timeline = Some(value);
                }
            }
            Some(v) => s.violation(format!("timeline {semaphore:?} moved backwards {v} -> {value}")),
            None => s.violation(format!("host signal on binary semaphore {semaphore:?}")),
        }
        Ok(())
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let s = self.state();
        s.semaphores
            .get(&semaphore)
            .and_then(|st| st.timeline)
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_command_pool(&self, _queue_family: u32) -> VkResult<vk::CommandPool> {
        let mut s = self.state();
        s.pools += 1;
        Ok(vk::CommandPool::from_raw(s.handle()))
    }

    unsafe fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        let mut s = self.state();
        if !s.pending.is_empty() {
            s.violation("command pool destroyed with work in flight".into());
        }
        s.pools -= 1;
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut s = self.state();
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(s.handle()))
            .collect())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.state();
        if s.pending.iter().any(|p| p.cmd.contains(&cmd)) {
            s.violation(format!("reset of {cmd:?} while in flight"));
        }
        Ok(())
    }

    fn begin_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut s = self.state();
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        for cmd in submission.command_buffers {
            if s.pending.iter().any(|p| p.cmd.contains(cmd)) {
                s.violation(format!("{cmd:?} submitted while still in flight"));
            }
        }
        if fence != vk::Fence::null() {
            let signaled = s.fences.get(&fence).copied().unwrap_or(false);
            if signaled || s.pending.iter().any(|p| p.fence == fence) {
                s.violation(format!("submit with {fence:?} not in the unsignaled state"));
            }
        }
        for wait in submission.wait_semaphores {
            s.consume_binary(*wait, "submit");
        }
        for signal in submission.signal_semaphores {
            s.signal_binary(*signal, "submit");
        }
        s.pending.push_back(Pending {
            cmd: submission.command_buffers.to_vec(),
            fence,
        });
        let cmd = submission
            .command_buffers
            .first()
            .copied()
            .unwrap_or_default();
        s.log.push(Call::Submit {
            cmd,
            wait: submission.wait_semaphores.to_vec(),
            signal: submission.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn swapchain_support(&self) -> VkResult<SwapchainSupport> {
        Ok(self.state().support.clone())
    }

    fn create_swapchain(&self, params: &SwapchainParams) -> VkResult<vk::SwapchainKHR> {
        let mut s = self.state();
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if params.extent.width == 0 || params.extent.height == 0 {
            s.violation(format!("swapchain created with zero extent {:?}", params.extent));
        }
        if params.old_swapchain != vk::SwapchainKHR::null()
            && !s.swapchains.contains_key(&params.old_swapchain)
        {
            s.violation("old_swapchain is not a live swapchain".into());
        }
        let count = s.image_count_override.unwrap_or(params.min_image_count);
        let handle = vk::SwapchainKHR::from_raw(s.handle());
        let images = (0..count).map(|_| vk::Image::from_raw(s.handle())).collect();
        s.swapchains.insert(handle, SwapchainState { images, next: 0 });
        s.last_params = Some(*params);
        s.log.push(Call::CreateSwapchain {
            extent: params.extent,
            images: count,
            old: params.old_swapchain,
        });
        Ok(handle)
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.state();
        if !s.pending.is_empty() {
            s.violation("swapchain destroyed with work in flight".into());
        }
        if let Some(chain) = s.swapchains.remove(&swapchain) {
            for image in 0..chain.images.len() as u32 {
                s.release_image(swapchain, image);
            }
        }
        s.log.push(Call::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let s = self.state();
        s.swapchains
            .get(&swapchain)
            .map(|c| c.images.clone())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        let mut s = self.state();
        s.views += 1;
        Ok(vk::ImageView::from_raw(s.handle()))
    }

    unsafe fn destroy_image_view(&self, _view: vk::ImageView) {
        self.state().views -= 1;
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut s = self.state();
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let scripted = s.acquire_script.pop_front();
        if let Some(Scripted::Fail(result)) = scripted {
            s.log.push(Call::Acquire(Err(result)));
            return Err(result);
        }
        let Some(chain) = s.swapchains.get_mut(&swapchain) else {
            s.violation(format!("acquire from dead swapchain {swapchain:?}"));
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };
        let index = chain.next as u32;
        chain.next = (chain.next + 1) % chain.images.len();
        // The engine gives the image back only once its last present is done.
        s.release_image(swapchain, index);
        if semaphore != vk::Semaphore::null() {
            s.signal_binary(semaphore, "acquire");
        }
        if fence != vk::Fence::null() {
            s.fences.insert(fence, true);
        }
        s.log.push(Call::Acquire(Ok(index)));
        Ok((index, matches!(scripted, Some(Scripted::Suboptimal))))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut s = self.state();
        if s.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        for wait in wait_semaphores {
            s.consume_binary(*wait, "present");
        }
        s.log.push(Call::Present {
            image: image_index,
            wait: wait_semaphores.to_vec(),
        });
        match s.present_script.pop_front() {
            Some(Scripted::Fail(result)) => Err(result),
            scripted => {
                for wait in wait_semaphores {
                    if let Some(st) = s.semaphores.get_mut(wait) {
                        st.held_by = Some((swapchain, image_index));
                    }
                }
                Ok(matches!(scripted, Some(Scripted::Suboptimal)))
            }
        }
    }
}

/// A window whose size follows a script. Each `wait_events` applies the next
/// queued size.
pub(crate) struct ScriptedSurface {
    pub size: RenderSize,
    queued: VecDeque<RenderSize>,
    pub waits: usize,
    pub closing: bool,
    close_when_drained: bool,
}

impl ScriptedSurface {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            size: RenderSize::new(width, height),
            queued: VecDeque::new(),
            waits: 0,
            closing: false,
            close_when_drained: false,
        }
    }

    pub(crate) fn then(mut self, width: u32, height: u32) -> Self {
        self.queued.push_back(RenderSize::new(width, height));
        self
    }

    /// Report a close request once the queued sizes run out.
    pub(crate) fn then_close(mut self) -> Self {
        self.close_when_drained = true;
        self
    }
}

impl SurfaceSource for ScriptedSurface {
    fn drawable_size(&self) -> RenderSize {
        self.size
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        assert!(self.waits < 1000, "surface never became drawable");
        match self.queued.pop_front() {
            Some(next) => self.size = next,
            None if self.close_when_drained => self.closing = true,
            None => {}
        }
    }

    fn is_closing(&self) -> bool {
        self.closing
    }
}
