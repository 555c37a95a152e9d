// SPDX-License-Identifier: CEPL-1.0
use std::cell::Cell;
use std::ffi::CStr;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use kestrel_render::RenderSize;
use tracing::debug;

use crate::device::DeviceContext;
use crate::overlay::{TextureId, UiOverlay};
use crate::shader::ShaderLibrary;
use crate::swapchain::COLOR_RANGE;

pub const OFFSCREEN_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Bytes available to the scene pipeline's vertex-stage push constant (a mat4).
pub const PUSH_CONSTANT_SIZE: usize = 64;

/// A colour image rendered by its own pass and command buffer, then sampled
/// by the overlay. Every handle is owned; `Drop` waits on the target's fence
/// before releasing them.
pub struct OffscreenTarget {
    device: ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,

    size: RenderSize,
    clear: [f32; 4],

    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    framebuffer: vk::Framebuffer,
    fence: vk::Fence,
    /// A submit is outstanding on `fence`.
    pending: Cell<bool>,
    cmd: vk::CommandBuffer,
    texture: Option<TextureId>,
}

impl OffscreenTarget {
    // STRICT ORDER: image, memory, view, render pass, pipeline, framebuffer,
    // fence, command buffer, texture registration. A failure part way drops
    // the half-built target, which releases whatever exists so far.
    pub unsafe fn new(
        ctx: &DeviceContext,
        shaders: &ShaderLibrary,
        overlay: &mut dyn UiOverlay,
        size: RenderSize,
        clear: [f32; 4],
    ) -> Result<Self> {
        if size.is_empty() {
            return Err(anyhow!("offscreen target needs a non-empty size"));
        }
        let mut t = Self {
            device: ctx.device.clone(),
            queue: ctx.graphics_queue,
            pool: ctx.command_pool,
            size,
            clear,
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            render_pass: vk::RenderPass::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffer: vk::Framebuffer::null(),
            fence: vk::Fence::null(),
            pending: Cell::new(false),
            cmd: vk::CommandBuffer::null(),
            texture: None,
        };
        let d = &ctx.device;
        let extent = t.extent();

        let image_info = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: OFFSCREEN_FORMAT,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        t.image = d
            .create_image(&image_info, None)
            .context("create_image(offscreen)")?;

        let req = d.get_image_memory_requirements(t.image);
        let memory_type_index = ctx
            .find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .context("offscreen image memory")?;
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        t.memory = d
            .allocate_memory(&alloc, None)
            .context("allocate_memory(offscreen)")?;
        d.bind_image_memory(t.image, t.memory, 0)
            .context("bind_image_memory(offscreen)")?;

        let view_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: t.image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: OFFSCREEN_FORMAT,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        t.view = d
            .create_image_view(&view_info, None)
            .context("create_image_view(offscreen)")?;

        t.render_pass = create_render_pass(d)?;
        t.pipeline_layout = create_pipeline_layout(d)?;
        t.pipeline = create_pipeline(d, shaders, t.pipeline_layout, t.render_pass)?;

        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass: t.render_pass,
            attachment_count: 1,
            p_attachments: &t.view,
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        t.framebuffer = d
            .create_framebuffer(&fb_info, None)
            .context("create_framebuffer(offscreen)")?;

        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        t.fence = d
            .create_fence(&fence_info, None)
            .context("create_fence(offscreen)")?;
        t.cmd = ctx.allocate_command_buffers(1)?[0];

        t.texture = Some(overlay.register_texture(
            ctx.sampler,
            t.view,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?);

        debug!("offscreen target built: {}x{}", size.width, size.height);
        Ok(t)
    }

    pub fn size(&self) -> RenderSize {
        self.size
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.size.width,
            height: self.size.height,
        }
    }

    /// Waits for the previous submission of this target, re-records the fixed
    /// draw and submits it. `push` feeds the vertex-stage push constant.
    pub unsafe fn render(&self, push: &[u8]) -> Result<()> {
        if push.len() > PUSH_CONSTANT_SIZE {
            return Err(anyhow!(
                "push constant block is {} bytes, limit {PUSH_CONSTANT_SIZE}",
                push.len()
            ));
        }
        let d = &self.device;
        resubmit(
            &self.pending,
            || {
                d.wait_for_fences(&[self.fence], true, u64::MAX)
                    .context("wait_for_fences(offscreen)")
            },
            || self.record(push),
            || d.reset_fences(&[self.fence]).context("reset_fences(offscreen)"),
            || {
                let submit = vk::SubmitInfo {
                    s_type: vk::StructureType::SUBMIT_INFO,
                    command_buffer_count: 1,
                    p_command_buffers: &self.cmd,
                    ..Default::default()
                };
                d.queue_submit(self.queue, std::slice::from_ref(&submit), self.fence)
                    .context("queue_submit(offscreen)")
            },
        )
    }

    unsafe fn record(&self, push: &[u8]) -> Result<()> {
        let d = &self.device;
        d.reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
            .context("reset_command_buffer(offscreen)")?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        d.begin_command_buffer(self.cmd, &begin)
            .context("begin_command_buffer(offscreen)")?;

        let extent = self.extent();
        let clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear,
            },
        }];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.render_pass,
            framebuffer: self.framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        d.cmd_begin_render_pass(self.cmd, &rp_begin, vk::SubpassContents::INLINE);
        d.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        d.cmd_set_viewport(self.cmd, 0, &[viewport]);
        d.cmd_set_scissor(self.cmd, 0, &[scissor]);
        if !push.is_empty() {
            d.cmd_push_constants(
                self.cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                push,
            );
        }
        d.cmd_draw(self.cmd, 3, 1, 0, 0);
        d.cmd_end_render_pass(self.cmd);
        d.end_command_buffer(self.cmd)
            .context("end_command_buffer(offscreen)")?;

        Ok(())
    }
}

// STRICT ORDER: wait the outstanding submit (if any), record, reset the
// fence, submit. The fence is reset only once a submit is about to follow, and
// `pending` is set only after it went through, so a failure at any step never
// leaves an unsignalled fence for `Drop` to wait on.
fn resubmit(
    pending: &Cell<bool>,
    wait: impl FnOnce() -> Result<()>,
    record: impl FnOnce() -> Result<()>,
    reset: impl FnOnce() -> Result<()>,
    submit: impl FnOnce() -> Result<()>,
) -> Result<()> {
    if pending.get() {
        wait()?;
        pending.set(false);
    }
    record()?;
    reset()?;
    submit()?;
    pending.set(true);
    Ok(())
}

// STRICT TEARDOWN ORDER: wait own fence, then reverse build order.
impl Drop for OffscreenTarget {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;
            if self.fence != vk::Fence::null() && self.pending.get() {
                d.wait_for_fences(&[self.fence], true, u64::MAX).ok();
            }
            if self.cmd != vk::CommandBuffer::null() {
                d.free_command_buffers(self.pool, &[self.cmd]);
            }
            if self.fence != vk::Fence::null() {
                d.destroy_fence(self.fence, None);
            }
            if self.framebuffer != vk::Framebuffer::null() {
                d.destroy_framebuffer(self.framebuffer, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                d.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                d.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                d.destroy_render_pass(self.render_pass, None);
            }
            if self.view != vk::ImageView::null() {
                d.destroy_image_view(self.view, None);
            }
            if self.image != vk::Image::null() {
                d.destroy_image(self.image, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                d.free_memory(self.memory, None);
            }
        }
        debug!("offscreen target released: {}x{}", self.size.width, self.size.height);
    }
}

/// Clears, draws, and leaves the image ready for sampling.
unsafe fn create_render_pass(device: &ash::Device) -> Result<vk::RenderPass> {
    let color_att = vk::AttachmentDescription {
        format: OFFSCREEN_FORMAT,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };
    let dependencies = [
        // Previous frame's sampling must finish before we overwrite.
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        // Writes visible to the overlay's fragment shader later in the queue.
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ];
    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: dependencies.len() as u32,
        p_dependencies: dependencies.as_ptr(),
        ..Default::default()
    };
    Ok(device
        .create_render_pass(&rp_info, None)
        .context("create_render_pass(offscreen)")?)
}

unsafe fn create_pipeline_layout(device: &ash::Device) -> Result<vk::PipelineLayout> {
    let push_range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: PUSH_CONSTANT_SIZE as u32,
    };
    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        push_constant_range_count: 1,
        p_push_constant_ranges: &push_range,
        ..Default::default()
    };
    Ok(device
        .create_pipeline_layout(&layout_info, None)
        .context("create_pipeline_layout(offscreen)")?)
}

unsafe fn create_pipeline(
    device: &ash::Device,
    shaders: &ShaderLibrary,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> Result<vk::Pipeline> {
    const ENTRY: &CStr = c"main";
    let vs = shaders.create_module(device, "tri.vert")?;
    let fs = match shaders.create_module(device, "tri.frag") {
        Ok(m) => m,
        Err(e) => {
            device.destroy_shader_module(vs, None);
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: ENTRY.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: ENTRY.as_ptr(),
            ..Default::default()
        },
    ];

    // No vertex buffers; positions live in the shader.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    // Both faces: the triangle spins.
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let created = device.create_graphics_pipelines(
        vk::PipelineCache::null(),
        std::slice::from_ref(&pipeline_info),
        None,
    );
    device.destroy_shader_module(vs, None);
    device.destroy_shader_module(fs, None);
    match created {
        Ok(p) => Ok(p[0]),
        Err((_, err)) => Err(anyhow!("create_graphics_pipelines(offscreen) failed: {err:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn run(
        pending: &Cell<bool>,
        fail_at: Option<&'static str>,
    ) -> (Result<()>, Vec<&'static str>) {
        let log = RefCell::new(Vec::new());
        let step = |name: &'static str| {
            log.borrow_mut().push(name);
            if fail_at == Some(name) {
                Err(anyhow!("{name} failed"))
            } else {
                Ok(())
            }
        };
        let result = resubmit(
            pending,
            || step("wait"),
            || step("record"),
            || step("reset"),
            || step("submit"),
        );
        (result, log.into_inner())
    }

    #[test]
    fn fence_reset_only_right_before_submit() {
        let pending = Cell::new(false);
        let (result, log) = run(&pending, None);
        assert!(result.is_ok());
        assert_eq!(log, ["record", "reset", "submit"]);
        assert!(pending.get());

        let (result, log) = run(&pending, None);
        assert!(result.is_ok());
        assert_eq!(log, ["wait", "record", "reset", "submit"]);
        assert!(pending.get());
    }

    #[test]
    fn failed_recording_leaves_fence_alone() {
        let pending = Cell::new(true);
        let (result, log) = run(&pending, Some("record"));
        assert!(result.is_err());
        assert_eq!(log, ["wait", "record"]);
        assert!(!pending.get());
    }

    #[test]
    fn failed_submit_is_not_waited_on() {
        let pending = Cell::new(true);
        let (result, log) = run(&pending, Some("submit"));
        assert!(result.is_err());
        assert_eq!(log, ["wait", "record", "reset", "submit"]);
        assert!(!pending.get());

        // next render must not wait on the unsignalled fence
        let (_, log) = run(&pending, Some("record"));
        assert_eq!(log, ["record"]);
    }
}
