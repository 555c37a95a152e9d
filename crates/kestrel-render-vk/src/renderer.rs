// SPDX-License-Identifier: CEPL-1.0
//! The frame driver.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Context, Result};
use ash::vk;
use kestrel_render::{Event, FrameStatus, LayerStack, RenderSize, Renderer, SkipReason};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use crate::command::{record_render_pass, PassEncoder};
use crate::device::{DeviceContext, DevicePolicy, DeviceSettings};
use crate::instance::ValidationMode;
use crate::layer::{record_layers, Layer, RecordScope, UpdateContext};
use crate::offscreen::{DeferredRetirement, OffscreenTarget};
use crate::overlay::{QuadOverlay, UiOverlay};
use crate::shader::ShaderLibrary;
use crate::swapchain::{PresentationChain, Recreated};
use crate::sync::{Acquire, FrameRing, Presented, VkFrameQueue};

pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Clone, Debug)]
pub struct VkSettings {
    pub validation: ValidationMode,
    pub device_policy: DevicePolicy,
    /// Clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    /// Load `<name>.spv` from here instead of the embedded shaders.
    pub shader_dir: Option<PathBuf>,
}

impl Default for VkSettings {
    fn default() -> Self {
        Self {
            validation: ValidationMode::for_build(),
            device_policy: DevicePolicy::FirstSuitable,
            frames_in_flight: 2,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            shader_dir: None,
        }
    }
}

type Retained = Rc<OffscreenTarget>;

// Field order is irrelevant to teardown; Drop below releases everything
// explicitly.
pub struct VkRenderer {
    layers: LayerStack<dyn Layer>,
    overlay: QuadOverlay,
    retired: DeferredRetirement<Retained>,
    ring: FrameRing<Retained>,
    chain: PresentationChain,
    shaders: ShaderLibrary,
    ctx: DeviceContext,

    clear: [f32; 4],
    size: RenderSize,
    paused: bool,
    stale: bool,
    last_frame: Instant,
}

impl VkRenderer {
    pub fn push_layer(&mut self, layer: Box<dyn Layer>) {
        debug!("layer pushed: {}", layer.name());
        self.layers.push(layer);
    }

    pub fn device(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.chain.extent
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    unsafe fn build(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: VkSettings,
    ) -> Result<Self> {
        let mut ctx = DeviceContext::new(
            window,
            display,
            DeviceSettings {
                validation: settings.validation,
                policy: settings.device_policy,
            },
        )?;
        let shaders = match &settings.shader_dir {
            Some(dir) => ShaderLibrary::from_dir(dir),
            None => ShaderLibrary::embedded(),
        };

        let mut chain = match PresentationChain::create(&ctx, size) {
            Ok(c) => c,
            Err(e) => {
                ctx.destroy();
                return Err(e.context("create presentation chain"));
            }
        };

        let frames_in_flight = settings.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        let mut ring = match FrameRing::new(&ctx, frames_in_flight, chain.image_count()) {
            Ok(r) => r,
            Err(e) => {
                chain.destroy(&ctx);
                ctx.destroy();
                return Err(e.context("create frame ring"));
            }
        };

        let overlay = match QuadOverlay::new(&ctx, &shaders, chain.render_pass) {
            Ok(o) => o,
            Err(e) => {
                ring.destroy(&ctx);
                chain.destroy(&ctx);
                ctx.destroy();
                return Err(e.context("create overlay"));
            }
        };

        info!(
            "vk renderer ready: {} frame(s) in flight on {}",
            frames_in_flight, ctx.device_name
        );

        Ok(Self {
            layers: LayerStack::new(),
            overlay,
            retired: DeferredRetirement::new(chain.image_count()),
            ring,
            chain,
            shaders,
            ctx,
            clear: settings.clear_color,
            size,
            paused: size.is_empty(),
            stale: false,
            last_frame: Instant::now(),
        })
    }

    /// Rebuilds the chain for `self.size`. Returns false when the surface is
    /// zero-sized and drawing must wait for a positive resize.
    unsafe fn rebuild_chain(&mut self) -> Result<bool> {
        self.ctx.wait_idle();
        match self
            .chain
            .recreate(&self.ctx, self.size)
            .context("recreate presentation chain")?
        {
            Recreated::Deferred => {
                if !self.paused {
                    info!("vk: surface is 0x0 → paused=true");
                }
                self.paused = true;
                self.stale = true;
                Ok(false)
            }
            Recreated::Rebuilt { format_changed } => {
                let images = self.chain.image_count();
                self.ring
                    .recreate_image_semaphores(&self.ctx.device, images)?;
                self.retired.resize(images);
                if format_changed {
                    self.overlay
                        .on_render_pass_changed(self.chain.render_pass)?;
                }
                self.stale = false;
                Ok(true)
            }
        }
    }

    // STRICT PER-FRAME ORDER:
    // 1) overlay frame + layer updates (may rebuild off-screen targets)
    // 2) acquire (slot fence waited, slot dependencies released)
    // 3) retirements filed under the acquired image
    // 4) record layers topmost first, overlay last
    // 5) submit + present, slot advances
    unsafe fn draw_frame(&mut self) -> Result<FrameStatus> {
        let now = Instant::now();
        let delta = now.duration_since(self.last_frame);
        self.last_frame = now;

        let extent = self.chain.extent;
        self.overlay
            .new_frame(RenderSize::new(extent.width, extent.height));
        {
            let mut ctx = UpdateContext {
                device: &self.ctx,
                overlay: &mut self.overlay,
                retired: &mut self.retired,
                shaders: &self.shaders,
                viewport: RenderSize::new(extent.width, extent.height),
                delta,
            };
            for layer in self.layers.iter_mut() {
                layer
                    .on_update(&mut ctx)
                    .with_context(|| format!("layer `{}` update", layer.name()))?;
            }
        }
        self.overlay.end_frame();

        let mut queue = VkFrameQueue::new(&self.ctx, self.chain.swapchain);
        let frame = match self.ring.acquire(&mut queue)? {
            Acquire::Ready(frame) => frame,
            Acquire::Stale => {
                self.stale = true;
                self.rebuild_chain()?;
                return Ok(FrameStatus::Skipped(SkipReason::Stale));
            }
        };

        self.retired.commit(frame.image_index);

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear,
            },
        };
        let mut encoder = PassEncoder::new(
            &self.ctx.device,
            frame.command_buffer,
            self.chain.render_pass,
            clear,
        );
        let framebuffer = self.chain.framebuffers[frame.image_index as usize];
        let device = &self.ctx;
        let layers = &mut self.layers;
        let overlay = &mut self.overlay;
        let deps = self.ring.dependencies_mut(frame.slot);
        record_render_pass(&mut encoder, framebuffer, extent, || {
            let mut scope = RecordScope::new(
                device,
                frame.command_buffer,
                extent,
                frame.image_index,
                frame.slot,
                deps,
            );
            record_layers(
                layers,
                &mut scope,
                |layer, scope| {
                    layer
                        .on_record(scope)
                        .with_context(|| format!("layer `{}` record", layer.name()))
                },
                |_| overlay.render(frame.command_buffer),
            )
        })?;

        match self.ring.submit_and_present(&mut queue, &frame)? {
            Presented::Ok | Presented::Suboptimal => {}
            Presented::Stale => {
                debug!("present: swapchain out of date, rebuilding next frame");
                self.stale = true;
            }
        }
        Ok(FrameStatus::Presented)
    }
}

impl Renderer for VkRenderer {
    type Settings = VkSettings;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: VkSettings,
    ) -> Result<Self> {
        unsafe { Self::build(window, display, size, settings) }
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.size = size;
        if size.is_empty() {
            if !self.paused {
                info!("vk: resize to 0x0 → paused=true");
            }
            self.paused = true;
            return Ok(());
        }

        if self.paused {
            info!("vk: resize to {}x{} → paused=false", size.width, size.height);
        }
        self.paused = false;
        unsafe { self.rebuild_chain() }.map(|_| ())
    }

    fn render(&mut self) -> Result<FrameStatus> {
        if self.paused {
            return Ok(FrameStatus::Skipped(SkipReason::Paused));
        }
        unsafe {
            if self.stale && !self.rebuild_chain()? {
                return Ok(FrameStatus::Skipped(SkipReason::Deferred));
            }
            self.draw_frame()
        }
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    fn dispatch_event(&mut self, event: &Event) -> bool {
        self.layers.dispatch(|layer| layer.on_event(event)).is_some()
    }
}

// STRICT TEARDOWN ORDER:
// - device idle
// - layers detach, then drop (their targets wait on their own fences)
// - retired targets, then the ring (drops slot dependencies)
// - overlay, chain, and finally the device context
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.wait_idle();

            let mut ctx = UpdateContext {
                device: &self.ctx,
                overlay: &mut self.overlay,
                retired: &mut self.retired,
                shaders: &self.shaders,
                viewport: RenderSize::new(self.chain.extent.width, self.chain.extent.height),
                delta: std::time::Duration::ZERO,
            };
            for layer in self.layers.iter_top_down_mut() {
                layer.on_detach(&mut ctx);
            }
            self.layers.clear();

            self.retired.flush_all();
            self.ring.destroy(&self.ctx);
            self.overlay.destroy();
            self.chain.destroy(&self.ctx);
            self.ctx.destroy();
        }
        info!("vk renderer destroyed");
    }
}
