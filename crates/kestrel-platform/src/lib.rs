// SPDX-License-Identifier: CEPL-1.0
//! Window ownership and event pumping.
//!
//! The event loop is pumped from the frame loop instead of owning it, so the
//! application keeps a plain `while !should_close()` driver.
#![deny(unsafe_op_in_unsafe_fn)]
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kestrel_render::{Event, Key, Modifiers, MouseButton, RenderSize};
use tracing::{debug, info};

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{self, NamedKey, NativeKeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

#[derive(Clone, Debug)]
pub struct WindowSpec {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            title: "Kestrel".to_owned(),
            width: 1920,
            height: 1080,
        }
    }
}

pub struct Platform {
    // Declared before the event loop so the window is dropped first.
    window: Window,
    host: WindowHost,
    event_loop: EventLoop<()>,
}

impl Platform {
    /// Opens the event loop and pumps it until the window exists.
    pub fn new(spec: WindowSpec) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("create event loop")?;
        let mut host = WindowHost::new(spec);

        while host.window.is_none() {
            if let Some(err) = host.create_error.take() {
                return Err(err);
            }
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::from_millis(16)), &mut host)
            {
                return Err(anyhow!("event loop exited ({code}) before the window opened"));
            }
        }

        let window = host
            .window
            .take()
            .ok_or_else(|| anyhow!("window vanished during startup"))?;
        host.window_id = Some(window.id());

        let size = window.inner_size();
        info!("window open: {}x{}", size.width, size.height);

        Ok(Self {
            window,
            host,
            event_loop,
        })
    }

    /// Processes pending OS events without blocking and queues translated ones.
    pub fn poll_events(&mut self) {
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.host)
        {
            debug!("event loop exit ({code})");
            self.host.should_close = true;
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.host.queue.drain(..)
    }

    pub fn should_close(&self) -> bool {
        self.host.should_close
    }

    pub fn request_close(&mut self) {
        self.host.should_close = true;
    }

    pub fn framebuffer_size(&self) -> RenderSize {
        let PhysicalSize { width, height } = self.window.inner_size();
        RenderSize::new(width, height)
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

struct WindowHost {
    spec: WindowSpec,
    window: Option<Window>,
    window_id: Option<WindowId>,
    create_error: Option<anyhow::Error>,
    queue: VecDeque<Event>,
    modifiers: Modifiers,
    should_close: bool,
}

impl WindowHost {
    fn new(spec: WindowSpec) -> Self {
        Self {
            spec,
            window: None,
            window_id: None,
            create_error: None,
            queue: VecDeque::new(),
            modifiers: Modifiers::empty(),
            should_close: false,
        }
    }

    fn push_key(&mut self, event: KeyEvent) {
        let key = translate_key(&event);
        match event.state {
            ElementState::Pressed => {
                self.queue.push_back(Event::KeyPressed {
                    key,
                    modifiers: self.modifiers,
                    repeat: event.repeat,
                });
                if let Some(text) = &event.text {
                    for c in text.chars().filter(|c| !c.is_control()) {
                        self.queue.push_back(Event::KeyTyped(c));
                    }
                }
            }
            ElementState::Released => self.queue.push_back(Event::KeyReleased {
                key,
                modifiers: self.modifiers,
            }),
        }
    }
}

impl ApplicationHandler for WindowHost {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.window_id.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.spec.title.clone())
            .with_inner_size(PhysicalSize::new(self.spec.width, self.spec.height));
        match event_loop.create_window(attrs) {
            Ok(window) => self.window = Some(window),
            Err(e) => self.create_error = Some(anyhow!(e).context("create window")),
        }
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(id) = self.window_id {
            if id != window_id {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.should_close = true;
                self.queue.push_back(Event::WindowClose);
            }
            WindowEvent::Resized(size) => self.queue.push_back(Event::WindowResize {
                width: size.width,
                height: size.height,
            }),
            WindowEvent::ModifiersChanged(m) => {
                let state = m.state();
                let mut mods = Modifiers::empty();
                mods.set(Modifiers::SHIFT, state.shift_key());
                mods.set(Modifiers::CONTROL, state.control_key());
                mods.set(Modifiers::ALT, state.alt_key());
                mods.set(Modifiers::SUPER, state.super_key());
                self.modifiers = mods;
            }
            WindowEvent::KeyboardInput { event, .. } => self.push_key(event),
            WindowEvent::MouseInput { state, button, .. } => {
                let button = translate_button(button);
                let modifiers = self.modifiers;
                self.queue.push_back(match state {
                    ElementState::Pressed => Event::MouseButtonPressed { button, modifiers },
                    ElementState::Released => Event::MouseButtonReleased { button, modifiers },
                });
            }
            WindowEvent::CursorMoved { position, .. } => self.queue.push_back(Event::MouseMoved {
                x: position.x as f32,
                y: position.y as f32,
            }),
            _ => {}
        }
    }
}

fn translate_key(event: &KeyEvent) -> Key {
    match &event.logical_key {
        keyboard::Key::Named(named) => match named {
            NamedKey::Escape => return Key::Escape,
            NamedKey::Enter => return Key::Enter,
            NamedKey::Space => return Key::Space,
            NamedKey::Tab => return Key::Tab,
            NamedKey::Backspace => return Key::Backspace,
            NamedKey::ArrowLeft => return Key::Left,
            NamedKey::ArrowRight => return Key::Right,
            NamedKey::ArrowUp => return Key::Up,
            NamedKey::ArrowDown => return Key::Down,
            _ => {}
        },
        keyboard::Key::Character(s) => {
            let mut chars = s.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if c.is_alphanumeric() {
                    return Key::Char(c.to_ascii_lowercase());
                }
            }
        }
        _ => {}
    }

    match event.physical_key {
        PhysicalKey::Unidentified(NativeKeyCode::Xkb(code)) => Key::Unknown(code),
        PhysicalKey::Unidentified(NativeKeyCode::Windows(code))
        | PhysicalKey::Unidentified(NativeKeyCode::MacOS(code)) => Key::Unknown(u32::from(code)),
        _ => Key::Unknown(0),
    }
}

fn translate_button(button: winit::event::MouseButton) -> MouseButton {
    use winit::event::MouseButton as W;
    match button {
        W::Left => MouseButton::Left,
        W::Right => MouseButton::Right,
        W::Middle => MouseButton::Middle,
        W::Back => MouseButton::Other(3),
        W::Forward => MouseButton::Other(4),
        W::Other(n) => MouseButton::Other(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_buttons_keep_their_index() {
        assert_eq!(translate_button(winit::event::MouseButton::Left), MouseButton::Left);
        assert_eq!(translate_button(winit::event::MouseButton::Back).index(), 3);
        assert_eq!(translate_button(winit::event::MouseButton::Forward).index(), 4);
        assert_eq!(translate_button(winit::event::MouseButton::Other(9)).index(), 9);
    }

    #[test]
    fn default_window_spec() {
        let spec = WindowSpec::default();
        assert_eq!((spec.width, spec.height), (1920, 1080));
        assert_eq!(spec.title, "Kestrel");
    }
}
