// SPDX-License-Identifier: CEPL-1.0
//! Layers as seen by the Vulkan frame driver.

use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use ash::vk;
use kestrel_render::{Event, LayerStack, RenderSize};

use crate::device::DeviceContext;
use crate::offscreen::{DeferredRetirement, OffscreenTarget};
use crate::overlay::UiOverlay;
use crate::shader::ShaderLibrary;

/// Handed to `on_update`, before the swapchain image is acquired.
pub struct UpdateContext<'a> {
    pub device: &'a DeviceContext,
    pub overlay: &'a mut dyn UiOverlay,
    pub retired: &'a mut DeferredRetirement<Rc<OffscreenTarget>>,
    pub shaders: &'a ShaderLibrary,
    /// Main framebuffer size in pixels.
    pub viewport: RenderSize,
    pub delta: Duration,
}

/// Handed to `on_record`, inside the main render pass.
pub struct RecordScope<'a> {
    pub device: &'a DeviceContext,
    pub cmd: vk::CommandBuffer,
    pub extent: vk::Extent2D,
    pub image_index: u32,
    pub slot: usize,
    deps: &'a mut Vec<Rc<OffscreenTarget>>,
}

impl<'a> RecordScope<'a> {
    pub fn new(
        device: &'a DeviceContext,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
        image_index: u32,
        slot: usize,
        deps: &'a mut Vec<Rc<OffscreenTarget>>,
    ) -> Self {
        Self {
            device,
            cmd,
            extent,
            image_index,
            slot,
            deps,
        }
    }

    /// Keeps `target` alive until this slot's fence next signals.
    pub fn keep_alive(&mut self, target: Rc<OffscreenTarget>) {
        if !self.deps.iter().any(|t| Rc::ptr_eq(t, &target)) {
            self.deps.push(target);
        }
    }
}

pub trait Layer {
    fn name(&self) -> &str;

    /// Per-frame logic and off-screen work. Runs in registration order.
    fn on_update(&mut self, _ctx: &mut UpdateContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Returns true to stop the event reaching layers below.
    fn on_event(&mut self, _event: &Event) -> bool {
        false
    }

    /// Records into the frame's command buffer. Runs topmost first.
    fn on_record(&mut self, _scope: &mut RecordScope<'_>) -> Result<()> {
        Ok(())
    }

    /// Releases GPU resources before the renderer shuts down. The device is
    /// idle.
    fn on_detach(&mut self, _ctx: &mut UpdateContext<'_>) {}
}

/// The body of the main render pass: every layer topmost first, then
/// `overlay` last so UI draws over the scene.
pub fn record_layers<L, S>(
    layers: &mut LayerStack<L>,
    scope: &mut S,
    mut record: impl FnMut(&mut L, &mut S) -> Result<()>,
    overlay: impl FnOnce(&mut S) -> Result<()>,
) -> Result<()>
where
    L: ?Sized,
{
    for layer in layers.iter_top_down_mut() {
        record(layer, scope)?;
    }
    overlay(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{record_render_pass, CommandEncoder};
    use anyhow::anyhow;
    use ash::prelude::VkResult;
    use std::cell::RefCell;

    trait Named {
        fn name(&self) -> &str;
    }

    struct Tag(&'static str);

    impl Named for Tag {
        fn name(&self) -> &str {
            self.0
        }
    }

    struct Encoder<'a>(&'a RefCell<Vec<String>>);

    impl CommandEncoder for Encoder<'_> {
        fn reset(&mut self) -> VkResult<()> {
            Ok(())
        }
        fn begin(&mut self) -> VkResult<()> {
            Ok(())
        }
        fn begin_render_pass(&mut self, _: vk::Framebuffer, _: vk::Extent2D) {
            self.0.borrow_mut().push("begin pass".into());
        }
        fn end_render_pass(&mut self) {
            self.0.borrow_mut().push("end pass".into());
        }
        fn end(&mut self) -> VkResult<()> {
            Ok(())
        }
    }

    fn stack() -> LayerStack<dyn Named> {
        let mut layers: LayerStack<dyn Named> = LayerStack::new();
        layers.push(Box::new(Tag("A")));
        layers.push(Box::new(Tag("B")));
        layers.push(Box::new(Tag("C")));
        layers
    }

    #[test]
    fn layers_top_down_then_overlay_inside_the_pass() {
        let log = RefCell::new(Vec::new());
        let mut layers = stack();
        let mut enc = Encoder(&log);
        let extent = vk::Extent2D {
            width: 8,
            height: 8,
        };
        record_render_pass(&mut enc, vk::Framebuffer::null(), extent, || {
            let mut scope = &log;
            record_layers(
                &mut layers,
                &mut scope,
                |layer, scope| {
                    scope.borrow_mut().push(layer.name().to_owned());
                    Ok(())
                },
                |scope| {
                    scope.borrow_mut().push("overlay".into());
                    Ok(())
                },
            )
        })
        .unwrap();
        assert_eq!(
            log.into_inner(),
            ["begin pass", "C", "B", "A", "overlay", "end pass"]
        );
    }

    #[test]
    fn failing_layer_skips_the_rest() {
        let mut seen = Vec::new();
        let mut overlay_ran = false;
        let result = record_layers(
            &mut stack(),
            &mut seen,
            |layer, seen| {
                seen.push(layer.name().to_owned());
                if layer.name() == "B" {
                    Err(anyhow!("bad layer"))
                } else {
                    Ok(())
                }
            },
            |_| {
                overlay_ran = true;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert_eq!(seen, ["C", "B"]);
        assert!(!overlay_ran);
    }
}
