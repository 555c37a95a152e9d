// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: presentation chain, frames in flight, layered recording,
//! off-screen targets and the textured-quad overlay.

pub mod command;
pub mod device;
pub mod error;
pub mod instance;
pub mod layer;
pub mod offscreen;
pub mod overlay;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use ash;

pub use device::{DeviceContext, DevicePolicy, DeviceSelector, FirstSuitable, PreferDiscrete};
pub use error::VkError;
pub use instance::ValidationMode;
pub use layer::{Layer, RecordScope, UpdateContext};
pub use offscreen::{DeferredRetirement, OffscreenTarget, OffscreenView, TargetState};
pub use overlay::{QuadOverlay, TextureId, UiOverlay};
pub use renderer::{VkRenderer, VkSettings, MAX_FRAMES_IN_FLIGHT};
pub use shader::ShaderLibrary;
