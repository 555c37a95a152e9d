// SPDX-License-Identifier: CEPL-1.0
//! Immediate-mode UI bridge and the built-in textured-quad overlay.

use std::collections::HashMap;
use std::ffi::CStr;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use kestrel_render::{Rect, RenderSize};
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::shader::ShaderLibrary;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// What the frame driver needs from a UI library. Everything runs on the
/// render thread between `new_frame` and `render`.
pub trait UiOverlay {
    fn new_frame(&mut self, viewport: RenderSize);
    /// Shows a registered texture at `rect` (window pixels).
    fn image(&mut self, texture: TextureId, rect: Rect);
    /// Finalises the draw data for this frame.
    fn end_frame(&mut self);
    /// Records the draw data into `cmd`, inside the main render pass.
    fn render(&mut self, cmd: vk::CommandBuffer) -> Result<()>;
    fn register_texture(
        &mut self,
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) -> Result<TextureId>;
    /// The texture must no longer be referenced by pending GPU work.
    fn unregister_texture(&mut self, texture: TextureId);
    fn on_render_pass_changed(&mut self, render_pass: vk::RenderPass) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuadDraw {
    pub texture: TextureId,
    /// `x, y, width, height` in normalised device coordinates.
    pub ndc: [f32; 4],
}

/// Window pixels (origin top-left) to Vulkan NDC (origin centre, y down).
pub fn rect_to_ndc(rect: Rect, viewport: RenderSize) -> [f32; 4] {
    let w = viewport.width.max(1) as f32;
    let h = viewport.height.max(1) as f32;
    [
        rect.x / w * 2.0 - 1.0,
        rect.y / h * 2.0 - 1.0,
        rect.width / w * 2.0,
        rect.height / h * 2.0,
    ]
}

/// Per-frame list of image quads.
#[derive(Debug, Default)]
pub struct DrawList {
    viewport: RenderSize,
    pending: Vec<(TextureId, Rect)>,
    draws: Vec<QuadDraw>,
}

impl DrawList {
    pub fn begin(&mut self, viewport: RenderSize) {
        self.viewport = viewport;
        self.pending.clear();
        self.draws.clear();
    }

    pub fn push(&mut self, texture: TextureId, rect: Rect) {
        if rect.width > 0.0 && rect.height > 0.0 {
            self.pending.push((texture, rect));
        }
    }

    pub fn finish(&mut self) {
        let viewport = self.viewport;
        self.draws = self
            .pending
            .drain(..)
            .map(|(texture, rect)| QuadDraw {
                texture,
                ndc: rect_to_ndc(rect, viewport),
            })
            .collect();
    }

    pub fn viewport(&self) -> RenderSize {
        self.viewport
    }

    pub fn draws(&self) -> &[QuadDraw] {
        &self.draws
    }
}

const MAX_TEXTURES: u32 = 64;

/// Minimal overlay: one descriptor set per registered texture and a single
/// alpha-blended quad pipeline drawn inside the main render pass.
pub struct QuadOverlay {
    device: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    vert: vk::ShaderModule,
    frag: vk::ShaderModule,
    textures: HashMap<TextureId, vk::DescriptorSet>,
    next_id: u64,
    list: DrawList,
}

impl QuadOverlay {
    pub unsafe fn new(
        ctx: &DeviceContext,
        shaders: &ShaderLibrary,
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        let mut overlay = Self {
            device: ctx.device.clone(),
            set_layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            vert: vk::ShaderModule::null(),
            frag: vk::ShaderModule::null(),
            textures: HashMap::new(),
            next_id: 1,
            list: DrawList::default(),
        };
        if let Err(e) = overlay.build(shaders, render_pass) {
            overlay.destroy();
            return Err(e);
        }
        Ok(overlay)
    }

    unsafe fn build(&mut self, shaders: &ShaderLibrary, render_pass: vk::RenderPass) -> Result<()> {
        let d = &self.device;
        self.vert = shaders.create_module(d, "quad.vert")?;
        self.frag = shaders.create_module(d, "quad.frag")?;

        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        };
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        };
        self.set_layout = d
            .create_descriptor_set_layout(&set_layout_info, None)
            .context("create_descriptor_set_layout(overlay)")?;

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: MAX_TEXTURES,
        };
        let pool_info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            max_sets: MAX_TEXTURES,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        self.pool = d
            .create_descriptor_pool(&pool_info, None)
            .context("create_descriptor_pool(overlay)")?;

        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<[f32; 4]>() as u32,
        };
        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &self.set_layout,
            push_constant_range_count: 1,
            p_push_constant_ranges: &push_range,
            ..Default::default()
        };
        self.pipeline_layout = d
            .create_pipeline_layout(&layout_info, None)
            .context("create_pipeline_layout(overlay)")?;

        self.pipeline = self.create_pipeline(render_pass)?;
        Ok(())
    }

    unsafe fn create_pipeline(&self, render_pass: vk::RenderPass) -> Result<vk::Pipeline> {
        const ENTRY: &CStr = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: self.vert,
                p_name: ENTRY.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: self.frag,
                p_name: ENTRY.as_ptr(),
                ..Default::default()
            },
        ];

        // Corners come from gl_VertexIndex.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
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
        let blend_att = vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &blend_att,
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
            layout: self.pipeline_layout,
            render_pass,
            subpass: 0,
            ..Default::default()
        };

        let pipelines = match self.device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        ) {
            Ok(p) => p,
            Err((_, err)) => return Err(anyhow!("create_graphics_pipelines(overlay) failed: {err:?}")),
        };
        Ok(pipelines[0])
    }

    pub fn draw_list(&self) -> &DrawList {
        &self.list
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Descriptor sets go with the pool. Call once the device is idle.
    pub unsafe fn destroy(&mut self) {
        let d = &self.device;
        self.textures.clear();
        if self.pipeline != vk::Pipeline::null() {
            d.destroy_pipeline(self.pipeline, None);
        }
        if self.pipeline_layout != vk::PipelineLayout::null() {
            d.destroy_pipeline_layout(self.pipeline_layout, None);
        }
        if self.pool != vk::DescriptorPool::null() {
            d.destroy_descriptor_pool(self.pool, None);
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            d.destroy_descriptor_set_layout(self.set_layout, None);
        }
        for module in [self.vert, self.frag] {
            if module != vk::ShaderModule::null() {
                d.destroy_shader_module(module, None);
            }
        }
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.pool = vk::DescriptorPool::null();
        self.set_layout = vk::DescriptorSetLayout::null();
        self.vert = vk::ShaderModule::null();
        self.frag = vk::ShaderModule::null();
    }
}

impl UiOverlay for QuadOverlay {
    fn new_frame(&mut self, viewport: RenderSize) {
        self.list.begin(viewport);
    }

    fn image(&mut self, texture: TextureId, rect: Rect) {
        self.list.push(texture, rect);
    }

    fn end_frame(&mut self) {
        self.list.finish();
    }

    fn render(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        if self.list.draws().is_empty() {
            return Ok(());
        }
        let RenderSize { width, height } = self.list.viewport();
        let d = &self.device;
        unsafe {
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            };
            d.cmd_set_viewport(cmd, 0, &[viewport]);
            d.cmd_set_scissor(cmd, 0, &[scissor]);

            for draw in self.list.draws() {
                let Some(&set) = self.textures.get(&draw.texture) else {
                    warn!("overlay: texture {:?} is not registered", draw.texture);
                    continue;
                };
                d.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[set],
                    &[],
                );
                d.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&draw.ndc),
                );
                d.cmd_draw(cmd, 4, 1, 0, 0);
            }
        }
        Ok(())
    }

    fn register_texture(
        &mut self,
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) -> Result<TextureId> {
        let alloc_info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.pool,
            descriptor_set_count: 1,
            p_set_layouts: &self.set_layout,
            ..Default::default()
        };
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .context("allocate_descriptor_sets(overlay texture)")?[0];

        let image_info = vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &image_info,
            ..Default::default()
        };
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };

        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, set);
        debug!("overlay: registered texture {id:?}");
        Ok(id)
    }

    fn unregister_texture(&mut self, texture: TextureId) {
        if let Some(set) = self.textures.remove(&texture) {
            unsafe {
                self.device.free_descriptor_sets(self.pool, &[set]).ok();
            }
            debug!("overlay: unregistered texture {texture:?}");
        }
    }

    fn on_render_pass_changed(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        let pipeline = unsafe { self.create_pipeline(render_pass)? };
        unsafe { self.device.destroy_pipeline(self.pipeline, None) };
        self.pipeline = pipeline;
        Ok(())
    }
}
