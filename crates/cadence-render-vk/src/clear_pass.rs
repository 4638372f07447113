// SPDX-License-Identifier: CEPL-1.0
//! The demo render target: one render pass that clears each swapchain image.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{FrameError, FrameResult};
use crate::render_loop::{FrameInfo, FrameRecorder};
use crate::swapchain::Swapchain;

/// Per-slot data written once the slot's fence has retired.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameUniforms {
    pub clear: [f32; 4],
}

/// Scales the color channels of `base` by a slow brightness wave.
pub fn pulse(base: [f32; 4], frame_number: u64) -> [f32; 4] {
    let phase = (frame_number % 720) as f32 * (std::f32::consts::TAU / 720.0);
    let k = 0.85 + 0.15 * phase.sin();
    [
        (base[0] * k).clamp(0.0, 1.0),
        (base[1] * k).clamp(0.0, 1.0),
        (base[2] * k).clamp(0.0, 1.0),
        base[3],
    ]
}

pub struct ClearPass {
    device: Arc<DeviceContext>,
    base: [f32; 4],
    format: vk::Format,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
}

// Render pass: single color attachment → present
unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> FrameResult<vk::RenderPass> {
    let color_att = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&att_ref);

    // The layout transition must wait for the stage the acquire semaphore
    // is waited at.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let attachments = [color_att];
    let subpasses = [subpass];
    let dependencies = [dependency];
    let rp_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    device
        .create_render_pass(&rp_info, None)
        .map_err(|e| FrameError::vk("create_render_pass", e))
}

impl ClearPass {
    pub fn new(device: Arc<DeviceContext>, clear: [f32; 4]) -> Self {
        Self {
            device,
            base: clear,
            format: vk::Format::UNDEFINED,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
        }
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.base
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.base = rgba;
    }

    fn destroy_framebuffers(&mut self) {
        let d = self.device.raw();
        for fb in self.framebuffers.drain(..) {
            unsafe { d.destroy_framebuffer(fb, None) };
        }
    }
}

impl FrameRecorder<DeviceContext, FrameUniforms> for ClearPass {
    fn update(&mut self, frame: &FrameInfo, data: &mut FrameUniforms) -> FrameResult<()> {
        data.clear = pulse(self.base, frame.frame_number);
        Ok(())
    }

    fn record(
        &mut self,
        device: &DeviceContext,
        cmd: vk::CommandBuffer,
        frame: &FrameInfo,
        data: &FrameUniforms,
    ) -> FrameResult<()> {
        let framebuffer = self.framebuffers[frame.image.index as usize];
        let clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: data.clear,
            },
        }];
        let rp_begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: frame.extent,
            })
            .clear_values(&clears);

        let d = device.raw();
        unsafe {
            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            d.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    fn swapchain_rebuilt(&mut self, swapchain: &Swapchain<DeviceContext>) -> FrameResult<()> {
        self.destroy_framebuffers();

        let format = swapchain.format().format;
        if format != self.format || self.render_pass == vk::RenderPass::null() {
            let d = self.device.raw();
            unsafe {
                if self.render_pass != vk::RenderPass::null() {
                    d.destroy_render_pass(self.render_pass, None);
                }
                self.render_pass = vk::RenderPass::null();
                self.render_pass = create_render_pass(d, format)?;
            }
            self.format = format;
        }

        let extent = swapchain.extent();
        let d = self.device.raw();
        for &view in swapchain.image_views() {
            let views = [view];
            let fb_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let fb = unsafe { d.create_framebuffer(&fb_info, None) }
                .map_err(|e| FrameError::vk("create_framebuffer", e))?;
            self.framebuffers.push(fb);
        }
        debug!(
            "vk: {} framebuffers for {}x{}",
            self.framebuffers.len(),
            extent.width,
            extent.height
        );
        Ok(())
    }
}

impl Drop for ClearPass {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        if self.render_pass != vk::RenderPass::null() {
            unsafe { self.device.raw().destroy_render_pass(self.render_pass, None) };
        }
    }
}
