// SPDX-License-Identifier: CEPL-1.0
//! Swapchain, its image views and framebuffers, and the main render pass.

use anyhow::{anyhow, Context, Result};
use ash::vk;
use kestrel_render::RenderSize;
use tracing::info;

use crate::device::DeviceContext;

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// Always FIFO; it is the one mode every surface supports.
pub fn choose_present_mode(_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    vk::PresentModeKHR::FIFO
}

/// `current_extent` is authoritative unless the surface reports the
/// `u32::MAX` sentinel, in which case the framebuffer size is clamped into
/// the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: framebuffer
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: framebuffer
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped when the surface has a maximum (0 = none).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

/// Builds one view and one framebuffer per image. On failure everything
/// created so far is handed to `destroy` and nothing is returned.
pub fn build_targets<I, V, F>(
    images: &[I],
    mut make_view: impl FnMut(I) -> Result<V>,
    mut make_framebuffer: impl FnMut(V) -> Result<F>,
    mut destroy: impl FnMut(&[V], &[F]),
) -> Result<(Vec<V>, Vec<F>)>
where
    I: Copy,
    V: Copy,
{
    let mut views = Vec::with_capacity(images.len());
    let mut framebuffers = Vec::with_capacity(images.len());
    for &image in images {
        let view = match make_view(image) {
            Ok(v) => v,
            Err(e) => {
                destroy(&views, &framebuffers);
                return Err(e);
            }
        };
        views.push(view);
        match make_framebuffer(view) {
            Ok(fb) => framebuffers.push(fb),
            Err(e) => {
                destroy(&views, &framebuffers);
                return Err(e);
            }
        }
    }
    Ok((views, framebuffers))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recreated {
    /// New chain in place. When the surface format changed the render pass was
    /// rebuilt too and pipelines built against it must follow.
    Rebuilt { format_changed: bool },
    /// The surface is zero-sized; the old chain was left untouched.
    Deferred,
}

pub struct PresentationChain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub render_pass: vk::RenderPass,
}

impl PresentationChain {
    pub unsafe fn create(ctx: &DeviceContext, framebuffer: RenderSize) -> Result<Self> {
        let support = ctx.swapchain_support()?;
        let extent = choose_extent(&support.capabilities, framebuffer);
        if extent.width == 0 || extent.height == 0 {
            return Err(anyhow!("surface has zero extent"));
        }
        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| anyhow!("surface reports no formats"))?;
        let min_image_count = choose_image_count(&support.capabilities);

        let render_pass = create_render_pass(&ctx.device, format.format)?;
        let mut chain = Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            format,
            extent,
            min_image_count,
            render_pass,
        };
        if let Err(e) = chain.build(ctx, &support.capabilities, &support.present_modes) {
            chain.destroy(ctx);
            return Err(e);
        }
        chain.log_ready();
        Ok(chain)
    }

    // STRICT ORDER (recreate):
    // 1) query support; zero extent => Deferred before touching anything
    // 2) framebuffers, then views of the OLD chain
    // 3) NEW swapchain with old_swapchain set, then retire the old handle
    // 4) render pass only if the surface format changed
    // 5) views + framebuffers for the new images
    // Caller has already waited for the device to go idle.
    pub unsafe fn recreate(
        &mut self,
        ctx: &DeviceContext,
        framebuffer: RenderSize,
    ) -> Result<Recreated> {
        let support = ctx.swapchain_support()?;
        let extent = choose_extent(&support.capabilities, framebuffer);
        if extent.width == 0 || extent.height == 0 {
            return Ok(Recreated::Deferred);
        }
        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| anyhow!("surface reports no formats"))?;

        self.destroy_targets(ctx);

        let format_changed = format.format != self.format.format;
        self.format = format;
        self.extent = extent;
        self.min_image_count = choose_image_count(&support.capabilities);

        if format_changed {
            ctx.device.destroy_render_pass(self.render_pass, None);
            self.render_pass = vk::RenderPass::null();
            self.render_pass = create_render_pass(&ctx.device, format.format)?;
        }

        self.build(ctx, &support.capabilities, &support.present_modes)?;
        self.log_ready();
        Ok(Recreated::Rebuilt { format_changed })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    unsafe fn build(
        &mut self,
        ctx: &DeviceContext,
        caps: &vk::SurfaceCapabilitiesKHR,
        modes: &[vk::PresentModeKHR],
    ) -> Result<()> {
        let (sharing_mode, family_indices) = ctx.queue_families.sharing_mode();
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let old_swapchain = self.swapchain;
        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: self.min_image_count,
            image_format: self.format.format,
            image_color_space: self.format.color_space,
            image_extent: self.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: choose_present_mode(modes),
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };

        let created = ctx.swapchain_loader.create_swapchain(&swap_info, None);
        if old_swapchain != vk::SwapchainKHR::null() {
            ctx.swapchain_loader.destroy_swapchain(old_swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.swapchain = created.context("create_swapchain")?;
        self.images = ctx
            .swapchain_loader
            .get_swapchain_images(self.swapchain)
            .context("get_swapchain_images")?;

        let device = &ctx.device;
        let format = self.format.format;
        let extent = self.extent;
        let render_pass = self.render_pass;
        let (views, framebuffers) = build_targets(
            &self.images,
            |image| {
                let iv_info = vk::ImageViewCreateInfo {
                    s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                    image,
                    view_type: vk::ImageViewType::TYPE_2D,
                    format,
                    subresource_range: COLOR_RANGE,
                    ..Default::default()
                };
                Ok(device
                    .create_image_view(&iv_info, None)
                    .context("create_image_view")?)
            },
            |view| {
                let fb_info = vk::FramebufferCreateInfo {
                    s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                    render_pass,
                    attachment_count: 1,
                    p_attachments: &view,
                    width: extent.width,
                    height: extent.height,
                    layers: 1,
                    ..Default::default()
                };
                Ok(device
                    .create_framebuffer(&fb_info, None)
                    .context("create_framebuffer")?)
            },
            |views, framebuffers| {
                for &fb in framebuffers {
                    device.destroy_framebuffer(fb, None);
                }
                for &iv in views {
                    device.destroy_image_view(iv, None);
                }
            },
        )?;
        self.views = views;
        self.framebuffers = framebuffers;
        Ok(())
    }

    unsafe fn destroy_targets(&mut self, ctx: &DeviceContext) {
        for fb in self.framebuffers.drain(..) {
            ctx.device.destroy_framebuffer(fb, None);
        }
        for iv in self.views.drain(..) {
            ctx.device.destroy_image_view(iv, None);
        }
    }

    // STRICT ORDER: framebuffers, views, swapchain, render pass.
    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        self.destroy_targets(ctx);
        if self.swapchain != vk::SwapchainKHR::null() {
            ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
        if self.render_pass != vk::RenderPass::null() {
            ctx.device.destroy_render_pass(self.render_pass, None);
            self.render_pass = vk::RenderPass::null();
        }
    }

    fn log_ready(&self) {
        info!(
            "swapchain ready: {}x{} fmt={:?}/{:?} images={} (min={})",
            self.extent.width,
            self.extent.height,
            self.format.format,
            self.format.color_space,
            self.images.len(),
            self.min_image_count
        );
    }
}

pub(crate) const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Single colour attachment, cleared on load and handed to the presentation
/// engine at the end.
unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
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
    // The acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT; the layout
    // transition must not run ahead of it.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    Ok(device
        .create_render_pass(&rp_info, None)
        .context("create_render_pass")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn caps(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        }
    }

    #[test]
    fn sentinel_extent_clamps_framebuffer() {
        let c = caps((u32::MAX, u32::MAX));
        let e = choose_extent(&c, RenderSize::new(8000, 10));
        assert_eq!((e.width, e.height), (4096, 64));
        let e = choose_extent(&c, RenderSize::new(800, 600));
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn concrete_extent_is_verbatim() {
        let c = caps((1280, 720));
        let e = choose_extent(&c, RenderSize::new(10, 10));
        assert_eq!((e.width, e.height), (1280, 720));
    }

    #[test]
    fn image_count_respects_max() {
        let mut c = caps((1, 1));
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);
        c.max_image_count = 0;
        c.min_image_count = 4;
        assert_eq!(choose_image_count(&c), 5);
    }

    #[test]
    fn surface_format_preference() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let bgra = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let pick = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(pick(&[srgb, bgra]), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(pick(&[srgb]), Some(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(pick(&[]), None);
    }

    #[test]
    fn present_mode_is_always_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn targets_match_images_one_to_one() {
        let images = [10u64, 20, 30];
        let (views, fbs) = build_targets(
            &images,
            |i| Ok(i + 1),
            |v| Ok(v * 100),
            |_, _| panic!("no cleanup on success"),
        )
        .unwrap();
        assert_eq!(views, vec![11, 21, 31]);
        assert_eq!(fbs, vec![1100, 2100, 3100]);
        assert!(views.iter().chain(fbs.iter()).all(|&h| h != 0));
    }

    #[test]
    fn failed_target_build_destroys_partial_work() {
        let images = [1u64, 2, 3];
        let destroyed = RefCell::new((Vec::new(), Vec::new()));
        let result = build_targets(
            &images,
            |i| Ok(i),
            |v| {
                if v == 3 {
                    Err(anyhow!("framebuffer {v}"))
                } else {
                    Ok(v + 100)
                }
            },
            |views, fbs| {
                let mut d = destroyed.borrow_mut();
                d.0.extend_from_slice(views);
                d.1.extend_from_slice(fbs);
            },
        );
        assert!(result.is_err());
        let d = destroyed.borrow();
        assert_eq!(d.0, vec![1, 2, 3]);
        assert_eq!(d.1, vec![101, 102]);
    }
}
