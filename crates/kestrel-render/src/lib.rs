// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod event;
pub mod layer;

pub use event::{Event, EventCategory, Key, Modifiers, MouseButton};
pub use layer::LayerStack;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either side is zero (minimised window, collapsed panel).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Axis-aligned rectangle in window pixels, origin top-left.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    /// Pixel size rounded down, negative extents clamp to zero.
    pub fn pixel_size(&self) -> RenderSize {
        RenderSize {
            width: self.width.max(0.0) as u32,
            height: self.height.max(0.0) as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Framebuffer has zero area.
    Paused,
    /// The swapchain went out of date; it was rebuilt and this frame dropped.
    Stale,
    /// The surface reported a zero extent while rebuilding.
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    Skipped(SkipReason),
}

pub trait Renderer {
    type Settings;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: Self::Settings,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<FrameStatus>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);

    /// Offers `event` to the layer stack, topmost first. Returns true once a
    /// layer consumed it.
    fn dispatch_event(&mut self, event: &Event) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_size() {
        assert!(RenderSize::new(0, 720).is_empty());
        assert!(RenderSize::new(1280, 0).is_empty());
        assert!(!RenderSize::new(1, 1).is_empty());
    }

    #[test]
    fn rect_contains_is_half_open() {
        let r = Rect::new(10.0, 20.0, 100.0, 50.0);
        assert!(r.contains(10.0, 20.0));
        assert!(r.contains(109.9, 69.9));
        assert!(!r.contains(110.0, 30.0));
        assert!(!r.contains(50.0, 70.0));
    }

    #[test]
    fn rect_pixel_size_clamps() {
        assert_eq!(
            Rect::new(0.0, 0.0, 640.7, 480.2).pixel_size(),
            RenderSize::new(640, 480)
        );
        assert_eq!(
            Rect::new(0.0, 0.0, -5.0, 10.0).pixel_size(),
            RenderSize::new(0, 10)
        );
    }
}
