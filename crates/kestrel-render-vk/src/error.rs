// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Fatal conditions raised by the Vulkan backend. Call sites wrap these in
/// `anyhow` with context before they bubble up to `main`.
#[derive(Debug, Error)]
pub enum VkError {
    #[error("no Vulkan physical devices found")]
    NoDevices,
    #[error("none of the {0} physical device(s) can render to this surface")]
    NoSuitableDevice(usize),
    #[error("physical devices lack required extensions: {}", .0.join(", "))]
    MissingExtensions(Vec<String>),
    #[error("validation layers requested but unavailable: {}", .0.join(", "))]
    ValidationLayersUnavailable(Vec<String>),
    #[error("no memory type matches bits {type_bits:#b} with {flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },
    #[error("shader module `{name}`: {result}")]
    ShaderModule { name: String, result: vk::Result },
    #[error("command buffer {stage} failed: {result}")]
    CommandBuffer {
        stage: &'static str,
        result: vk::Result,
    },
}
