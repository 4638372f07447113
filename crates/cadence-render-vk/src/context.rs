// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface and logical device bring-up on top of ash.

use std::ffi::CStr;

use anyhow::{anyhow, Context, Result};
use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::info;

#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;

use crate::device::{
    DeviceApi, QueueInfo, QueueRole, SemaphoreKind, Submission, SwapchainParams,
    SwapchainSupport,
};

#[cfg(debug_assertions)]
type DebugState = Option<vk::DebugUtilsMessengerEXT>;
#[cfg(not(debug_assertions))]
type DebugState = ();

#[cfg(debug_assertions)]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug)]
struct QueueFamilies {
    graphics: u32,
    present: u32,
}

/// The Vulkan instance, window surface and logical device.
///
/// Shared by `Arc` with every primitive created from it, so it is always the
/// last thing dropped.
pub struct DeviceContext {
    entry: Entry,
    instance: Instance,
    debug: DebugState,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    graphics: QueueInfo,
    present: QueueInfo,
    timeline_semaphores: bool,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if !data.is_null() && !(*data).p_message.is_null() {
        let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
        if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            tracing::error!("[Vulkan] {msg}");
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            tracing::warn!("[Vulkan] {msg}");
        } else {
            tracing::debug!("[Vulkan] {msg}");
        }
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
    enabled: bool,
) -> Result<DebugState> {
    if !enabled {
        return Ok(None);
    }
    let debug_loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    Ok(Some(debug_loader.create_debug_utils_messenger(&ci, None)?))
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(
    _entry: &Entry,
    _instance: &Instance,
    _enabled: bool,
) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(entry: &Entry, instance: &Instance, dbg: DebugState) {
    if let Some(messenger) = dbg {
        let loader = ext_debug::Instance::new(entry, instance);
        loader.destroy_debug_utils_messenger(messenger, None);
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_entry: &Entry, _instance: &Instance, _dbg: DebugState) {}

/// Returns the instance and whether validation (and with it debug utils)
/// was enabled.
unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<(Instance, bool)> {
    let app = c"Cadence";
    let app_info = vk::ApplicationInfo::default()
        .application_name(app)
        .engine_name(app)
        .api_version(vk::API_VERSION_1_2);

    #[cfg_attr(not(debug_assertions), allow(unused_mut))]
    let mut ext_vec = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    #[cfg_attr(not(debug_assertions), allow(unused_mut))]
    let mut layers: Vec<*const std::os::raw::c_char> = Vec::new();

    #[cfg(debug_assertions)]
    let validation = {
        let available = entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default()
            .iter()
            .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
        if available {
            layers.push(VALIDATION_LAYER.as_ptr());
            ext_vec.push(ext_debug::NAME.as_ptr());
        } else {
            tracing::warn!("vk: {VALIDATION_LAYER:?} not installed, running without validation");
        }
        available
    };
    #[cfg(not(debug_assertions))]
    let validation = false;

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&ext_vec)
        .enabled_layer_names(&layers);

    let instance = entry.create_instance(&create_info, None)?;
    Ok((instance, validation))
}

unsafe fn pick_device_and_queues(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    for phys in instance.enumerate_physical_devices()? {
        let has_swapchain = instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default()
            .iter()
            .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
        if !has_swapchain {
            continue;
        }

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        let presents = |i: u32| {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        };
        let graphics: Vec<u32> = qprops
            .iter()
            .enumerate()
            .filter(|(_, q)| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32)
            .collect();

        // One family doing both is the common case and avoids concurrent
        // sharing of swapchain images.
        if let Some(&both) = graphics.iter().find(|&&i| presents(i)) {
            return Ok((
                phys,
                QueueFamilies {
                    graphics: both,
                    present: both,
                },
            ));
        }
        let present = (0..qprops.len() as u32).find(|&i| presents(i));
        if let (Some(&graphics), Some(present)) = (graphics.first(), present) {
            return Ok((phys, QueueFamilies { graphics, present }));
        }
    }
    Err(anyhow!("no physical device with graphics + present support"))
}

unsafe fn supports_timeline(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
    let api = instance.get_physical_device_properties(phys).api_version;
    if vk::api_version_major(api) == 1 && vk::api_version_minor(api) < 2 {
        return false;
    }
    let mut feats12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut feats2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut feats12);
    instance.get_physical_device_features2(phys, &mut feats2);
    feats12.timeline_semaphore == vk::TRUE
}

impl DeviceContext {
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        unsafe { Self::init(window, display) }
    }

    unsafe fn init(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        // The surface must come from this instance before any device is
        // picked against it.
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::load().context("load Vulkan loader")?;
        let (instance, validation) =
            create_instance(&entry, dh).context("create_instance (with WSI + optional debug)")?;

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;
        let debug = create_debug_messenger(&entry, &instance, validation)?;

        let (phys, families) = pick_device_and_queues(&instance, &surface_loader, surface)?;
        let timeline_semaphores = supports_timeline(&instance, phys);

        let priorities = [1.0_f32];
        let mut qinfos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(families.graphics)
            .queue_priorities(&priorities)];
        if families.present != families.graphics {
            qinfos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(families.present)
                    .queue_priorities(&priorities),
            );
        }

        let device_exts = [swapchain::NAME.as_ptr()];
        let mut feats12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut dinfo = vk::DeviceCreateInfo::default()
            .queue_create_infos(&qinfos)
            .enabled_extension_names(&device_exts);
        if timeline_semaphores {
            dinfo = dinfo.push_next(&mut feats12);
        }
        let device = instance
            .create_device(phys, &dinfo, None)
            .context("create_device")?;

        let graphics = QueueInfo {
            handle: device.get_device_queue(families.graphics, 0),
            family: families.graphics,
        };
        let present = QueueInfo {
            handle: device.get_device_queue(families.present, 0),
            family: families.present,
        };
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        let props = instance.get_physical_device_properties(phys);
        info!(
            "vk: device {:?}, graphics family {}, present family {}, timeline semaphores: {}",
            CStr::from_ptr(props.device_name.as_ptr()),
            families.graphics,
            families.present,
            timeline_semaphores
        );

        Ok(Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            device,
            swapchain_loader,
            graphics,
            present,
            timeline_semaphores,
        })
    }

    /// The ash device, for recording commands.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn supports_timeline_semaphores(&self) -> bool {
        self.timeline_semaphores
    }
}

// Device, then surface, then instance. Everything created from the device
// holds an Arc to this context and is already gone by now.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&self.entry, &self.instance, self.debug);
            self.instance.destroy_instance(None);
        }
    }
}

impl DeviceApi for DeviceContext {
    fn queue(&self, role: QueueRole) -> QueueInfo {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
        }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        match kind {
            SemaphoreKind::Binary => {
                let info = vk::SemaphoreCreateInfo::default();
                unsafe { self.device.create_semaphore(&info, None) }
            }
            SemaphoreKind::Timeline { initial } => {
                if !self.timeline_semaphores {
                    return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
                }
                let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial);
                let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
                unsafe { self.device.create_semaphore(&info, None) }
            }
        }
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None);
    }

    fn wait_semaphores(
        &self,
        semaphores: &[vk::Semaphore],
        values: &[u64],
        wait_any: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        if !self.timeline_semaphores {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let flags = if wait_any {
            vk::SemaphoreWaitFlags::ANY
        } else {
            vk::SemaphoreWaitFlags::empty()
        };
        let info = vk::SemaphoreWaitInfo::default()
            .flags(flags)
            .semaphores(semaphores)
            .values(values);
        unsafe { self.device.wait_semaphores(&info, timeout_ns) }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&info) }
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, None);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);
        unsafe {
            self.device
                .queue_submit(queue, std::slice::from_ref(&submit), fence)
        }
    }

    fn swapchain_support(&self) -> VkResult<SwapchainSupport> {
        unsafe {
            Ok(SwapchainSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.phys, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.phys, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.phys, self.surface)?,
            })
        }
    }

    fn create_swapchain(&self, params: &SwapchainParams) -> VkResult<vk::SwapchainKHR> {
        let families = [self.graphics.family, self.present.family];
        let (sharing, indices): (_, &[u32]) = if self.graphics.family == self.present.family {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        } else {
            (vk::SharingMode::CONCURRENT, &families[..])
        };
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(params.min_image_count)
            .image_format(params.surface_format.format)
            .image_color_space(params.surface_format.color_space)
            .image_extent(params.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(indices)
            .pre_transform(params.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(params.present_mode)
            .clipped(true)
            .old_swapchain(params.old_swapchain);
        unsafe { self.swapchain_loader.create_swapchain(&info, None) }
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.swapchain_loader.destroy_swapchain(swapchain, None);
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
        let sub = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(sub);
        unsafe { self.device.create_image_view(&info, None) }
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.swapchain_loader.queue_present(queue, &info) }
    }
}
