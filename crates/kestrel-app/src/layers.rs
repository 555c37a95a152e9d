// SPDX-License-Identifier: CEPL-1.0
//! Demo layers: a background strip drawn straight into the main pass and a
//! spinning triangle rendered off-screen and shown as an overlay panel.

use anyhow::Result;
use glam::{Mat4, Vec3};
use kestrel_render::{Event, Key, MouseButton, Rect, RenderSize};
use kestrel_render_vk::ash::vk;
use kestrel_render_vk::offscreen::OffscreenView;
use kestrel_render_vk::{Layer, RecordScope, UpdateContext};
use tracing::debug;

const STRIP_COLORS: [[f32; 4]; 4] = [
    [0.16, 0.20, 0.30, 1.0],
    [0.30, 0.16, 0.18, 1.0],
    [0.14, 0.28, 0.18, 1.0],
    [0.26, 0.24, 0.12, 1.0],
];

/// Top band of the framebuffer, an eighth of its height.
pub fn strip_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: extent.width,
            height: (extent.height / 8).max(1).min(extent.height),
        },
    }
}

pub struct BackgroundLayer {
    color: usize,
}

impl BackgroundLayer {
    pub fn new() -> Self {
        Self { color: 0 }
    }

    pub fn color(&self) -> [f32; 4] {
        STRIP_COLORS[self.color]
    }
}

impl Default for BackgroundLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for BackgroundLayer {
    fn name(&self) -> &str {
        "background"
    }

    fn on_event(&mut self, event: &Event) -> bool {
        match event {
            Event::KeyPressed {
                key: Key::Char('c'),
                repeat: false,
                ..
            } => {
                self.color = (self.color + 1) % STRIP_COLORS.len();
                debug!("background strip colour {}", self.color);
                true
            }
            _ => false,
        }
    }

    fn on_record(&mut self, scope: &mut RecordScope<'_>) -> Result<()> {
        if scope.extent.width == 0 || scope.extent.height == 0 {
            return Ok(());
        }
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.color(),
                },
            },
        };
        let rect = vk::ClearRect {
            rect: strip_rect(scope.extent),
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            scope
                .device
                .device
                .cmd_clear_attachments(scope.cmd, &[attachment], &[rect]);
        }
        Ok(())
    }
}

/// Right half of the window below the strip, with a margin.
pub fn panel_rect(viewport: RenderSize) -> Rect {
    const MARGIN: f32 = 16.0;
    let w = viewport.width as f32;
    let h = viewport.height as f32;
    let top = (viewport.height / 8) as f32 + MARGIN;
    Rect::new(
        w * 0.5,
        top,
        (w * 0.5 - MARGIN).max(0.0),
        (h - top - MARGIN).max(0.0),
    )
}

pub fn scene_transform(angle: f32, pitch: f32, size: RenderSize) -> Mat4 {
    let aspect = if size.is_empty() {
        1.0
    } else {
        size.width as f32 / size.height as f32
    };
    Mat4::from_scale(Vec3::new(1.0 / aspect.max(1e-3), 1.0, 1.0))
        * Mat4::from_rotation_x(pitch)
        * Mat4::from_rotation_y(angle)
}

pub struct SceneViewLayer {
    view: OffscreenView,
    panel: Rect,
    spin_speed: f32,
    angle: f32,
    pitch: f32,
    drag_from: Option<(f32, f32)>,
    cursor: (f32, f32),
}

impl SceneViewLayer {
    pub fn new(clear: [f32; 4], spin_speed: f32) -> Self {
        Self {
            view: OffscreenView::new(clear),
            panel: Rect::default(),
            spin_speed,
            angle: 0.0,
            pitch: 0.0,
            drag_from: None,
            cursor: (0.0, 0.0),
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.drag_from.is_some()
    }

    fn place(&mut self, viewport: RenderSize) {
        self.panel = panel_rect(viewport);
        self.view.request_resize(self.panel.pixel_size());
    }
}

impl Layer for SceneViewLayer {
    fn name(&self) -> &str {
        "scene view"
    }

    fn on_update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<()> {
        self.place(ctx.viewport);
        if self.drag_from.is_none() {
            self.angle =
                (self.angle + self.spin_speed * ctx.delta.as_secs_f32()) % std::f32::consts::TAU;
        }

        let size = self.panel.pixel_size();
        let transform = scene_transform(self.angle, self.pitch, size).to_cols_array();
        self.view.flush(ctx, bytemuck::bytes_of(&transform))?;

        if let Some(texture) = self.view.texture() {
            ctx.overlay.image(texture, self.panel);
        }
        Ok(())
    }

    fn on_event(&mut self, event: &Event) -> bool {
        match *event {
            Event::WindowResize { width, height } => {
                self.place(RenderSize::new(width, height));
                false
            }
            Event::MouseMoved { x, y } => {
                self.cursor = (x, y);
                match self.drag_from {
                    Some((fx, fy)) => {
                        self.angle += (x - fx) * 0.01;
                        self.pitch = (self.pitch + (y - fy) * 0.01).clamp(-1.5, 1.5);
                        self.drag_from = Some((x, y));
                        true
                    }
                    None => false,
                }
            }
            Event::MouseButtonPressed {
                button: MouseButton::Left,
                ..
            } if self.panel.contains(self.cursor.0, self.cursor.1) => {
                self.drag_from = Some(self.cursor);
                true
            }
            Event::MouseButtonReleased {
                button: MouseButton::Left,
                ..
            } if self.drag_from.is_some() => {
                self.drag_from = None;
                true
            }
            _ => false,
        }
    }

    fn on_record(&mut self, scope: &mut RecordScope<'_>) -> Result<()> {
        // The overlay samples this target later in the same command buffer.
        if let Some(target) = self.view.target() {
            scope.keep_alive(target.clone());
        }
        Ok(())
    }

    fn on_detach(&mut self, ctx: &mut UpdateContext<'_>) {
        self.view.destroy(&mut *ctx.overlay, &mut *ctx.retired);
    }
}
