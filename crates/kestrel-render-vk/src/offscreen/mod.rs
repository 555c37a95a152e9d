// SPDX-License-Identifier: CEPL-1.0
//! Off-screen render targets embedded in the UI.

mod retire;
mod slot;
mod target;

use std::rc::Rc;

use anyhow::Result;
use kestrel_render::RenderSize;
use tracing::debug;

pub use retire::DeferredRetirement;
pub use slot::{OffscreenSlot, TargetState};
pub use target::{OffscreenTarget, OFFSCREEN_FORMAT, PUSH_CONSTANT_SIZE};

use crate::layer::UpdateContext;
use crate::overlay::{TextureId, UiOverlay};

/// A panel-sized render target owned by a layer. Resize requests are cheap
/// and coalesced; the GPU work happens in `flush`.
pub struct OffscreenView {
    slot: OffscreenSlot<Rc<OffscreenTarget>>,
    clear: [f32; 4],
}

impl OffscreenView {
    pub fn new(clear: [f32; 4]) -> Self {
        Self {
            slot: OffscreenSlot::new(),
            clear,
        }
    }

    pub fn request_resize(&mut self, size: RenderSize) -> bool {
        let marked = self.slot.request_resize(size);
        if marked {
            debug!("offscreen view dirty: {}x{}", size.width, size.height);
        }
        marked
    }

    pub fn state(&self) -> TargetState {
        self.slot.state()
    }

    pub fn target(&self) -> Option<&Rc<OffscreenTarget>> {
        self.slot.current()
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.slot.current().and_then(|t| t.texture())
    }

    /// Rebuilds the target when dirty, then renders into whatever target is
    /// current.
    pub fn flush(&mut self, ctx: &mut UpdateContext<'_>, push: &[u8]) -> Result<()> {
        rebuild_dirty(
            &mut self.slot,
            &mut LiveRebuild {
                ctx: &mut *ctx,
                clear: self.clear,
            },
        )?;

        if let Some(target) = self.slot.current() {
            unsafe { target.render(push)? };
        }
        Ok(())
    }

    /// Unregisters the texture and hands the target to the retirement list.
    pub fn destroy(
        &mut self,
        overlay: &mut dyn UiOverlay,
        retired: &mut DeferredRetirement<Rc<OffscreenTarget>>,
    ) {
        if let Some(target) = self.slot.destroy() {
            if let Some(id) = target.texture() {
                overlay.unregister_texture(id);
            }
            retired.retire(target);
        }
    }
}

/// What replacing a dirty target touches.
pub(crate) trait RebuildSteps<T> {
    fn wait_idle(&mut self);
    fn unregister(&mut self, old: &T);
    fn retire(&mut self, old: T);
    fn build(&mut self, size: RenderSize) -> Result<T>;
}

// STRICT ORDER when dirty:
// 1) device idle (old target may be sampled by frames in flight)
// 2) unregister the old texture
// 3) retire the old target
// 4) build the replacement
pub(crate) fn rebuild_dirty<T>(
    slot: &mut OffscreenSlot<T>,
    steps: &mut impl RebuildSteps<T>,
) -> Result<bool> {
    if !slot.needs_rebuild() {
        return Ok(false);
    }
    steps.wait_idle();
    slot.rebuild_with(|size, old| {
        if let Some(old) = old {
            steps.unregister(&old);
            steps.retire(old);
        }
        steps.build(size)
    })
}

struct LiveRebuild<'a, 'c> {
    ctx: &'a mut UpdateContext<'c>,
    clear: [f32; 4],
}

impl RebuildSteps<Rc<OffscreenTarget>> for LiveRebuild<'_, '_> {
    fn wait_idle(&mut self) {
        unsafe { self.ctx.device.wait_idle() };
    }

    fn unregister(&mut self, old: &Rc<OffscreenTarget>) {
        if let Some(id) = old.texture() {
            self.ctx.overlay.unregister_texture(id);
        }
    }

    fn retire(&mut self, old: Rc<OffscreenTarget>) {
        self.ctx.retired.retire(old);
    }

    fn build(&mut self, size: RenderSize) -> Result<Rc<OffscreenTarget>> {
        let ctx = &mut *self.ctx;
        let target = unsafe {
            OffscreenTarget::new(ctx.device, ctx.shaders, &mut *ctx.overlay, size, self.clear)?
        };
        Ok(Rc::new(target))
    }
}
