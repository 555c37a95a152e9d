// SPDX-License-Identifier: CEPL-1.0
//! Window and input events delivered to the layer stack.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EventCategory: u8 {
        const APPLICATION  = 1 << 0;
        const INPUT        = 1 << 1;
        const KEYBOARD     = 1 << 2;
        const MOUSE        = 1 << 3;
        const MOUSE_BUTTON = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Modifiers: u8 {
        const SHIFT   = 1 << 0;
        const CONTROL = 1 << 1;
        const ALT     = 1 << 2;
        const SUPER   = 1 << 3;
    }
}

/// Keys the application cares about by name; everything else keeps its
/// platform scancode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Escape,
    Enter,
    Space,
    Tab,
    Backspace,
    Left,
    Right,
    Up,
    Down,
    /// Letter and digit keys, lowercase.
    Char(char),
    Unknown(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other(u16),
}

impl MouseButton {
    pub fn index(&self) -> u16 {
        match self {
            MouseButton::Left => 0,
            MouseButton::Right => 1,
            MouseButton::Middle => 2,
            MouseButton::Other(n) => *n,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    WindowResize {
        width: u32,
        height: u32,
    },
    WindowClose,
    KeyPressed {
        key: Key,
        modifiers: Modifiers,
        repeat: bool,
    },
    KeyReleased {
        key: Key,
        modifiers: Modifiers,
    },
    KeyTyped(char),
    MouseButtonPressed {
        button: MouseButton,
        modifiers: Modifiers,
    },
    MouseButtonReleased {
        button: MouseButton,
        modifiers: Modifiers,
    },
    MouseMoved {
        x: f32,
        y: f32,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::WindowResize { .. } => "WindowResize",
            Event::WindowClose => "WindowClose",
            Event::KeyPressed { .. } => "KeyPressed",
            Event::KeyReleased { .. } => "KeyReleased",
            Event::KeyTyped(_) => "KeyTyped",
            Event::MouseButtonPressed { .. } => "MouseButtonPressed",
            Event::MouseButtonReleased { .. } => "MouseButtonReleased",
            Event::MouseMoved { .. } => "MouseMoved",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Event::WindowResize { .. } | Event::WindowClose => EventCategory::APPLICATION,
            Event::KeyPressed { .. } | Event::KeyReleased { .. } | Event::KeyTyped(_) => {
                EventCategory::INPUT | EventCategory::KEYBOARD
            }
            Event::MouseButtonPressed { .. } | Event::MouseButtonReleased { .. } => {
                EventCategory::INPUT | EventCategory::MOUSE | EventCategory::MOUSE_BUTTON
            }
            Event::MouseMoved { .. } => EventCategory::INPUT | EventCategory::MOUSE,
        }
    }

    pub fn is_in(&self, category: EventCategory) -> bool {
        self.category().intersects(category)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::WindowResize { width, height } => write!(f, "WindowResize: {width}, {height}"),
            Event::KeyPressed { key, repeat, .. } => {
                write!(f, "KeyPressed: {key:?} (repeat = {repeat})")
            }
            Event::KeyReleased { key, .. } => write!(f, "KeyReleased: {key:?}"),
            Event::KeyTyped(c) => write!(f, "KeyTyped: {c:?}"),
            Event::MouseButtonPressed { button, .. } => {
                write!(f, "MouseButtonPressed: {}", button.index())
            }
            Event::MouseButtonReleased { button, .. } => {
                write!(f, "MouseButtonReleased: {}", button.index())
            }
            Event::MouseMoved { x, y } => write!(f, "MouseMoved: {x}, {y}"),
            Event::WindowClose => f.write_str("WindowClose"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        let click = Event::MouseButtonPressed {
            button: MouseButton::Left,
            modifiers: Modifiers::empty(),
        };
        assert!(click.is_in(EventCategory::MOUSE_BUTTON));
        assert!(click.is_in(EventCategory::INPUT));
        assert!(!click.is_in(EventCategory::KEYBOARD));

        let moved = Event::MouseMoved { x: 1.0, y: 2.0 };
        assert!(moved.is_in(EventCategory::MOUSE));
        assert!(!moved.is_in(EventCategory::MOUSE_BUTTON));

        assert_eq!(Event::WindowClose.category(), EventCategory::APPLICATION);
        assert!(!Event::WindowClose.is_in(EventCategory::INPUT));
    }

    #[test]
    fn display_names() {
        let e = Event::WindowResize {
            width: 800,
            height: 600,
        };
        assert_eq!(e.name(), "WindowResize");
        assert_eq!(e.to_string(), "WindowResize: 800, 600");
        assert_eq!(
            Event::MouseButtonReleased {
                button: MouseButton::Other(7),
                modifiers: Modifiers::SHIFT,
            }
            .to_string(),
            "MouseButtonReleased: 7"
        );
    }
}
