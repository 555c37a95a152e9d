// SPDX-License-Identifier: CEPL-1.0
//! Instance creation, validation layers and the debug messenger.

use std::ffi::{c_void, CStr, CString};

use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use crate::error::VkError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Whether to enable the Khronos validation layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValidationMode {
    Off,
    /// Enable when installed, warn otherwise.
    #[default]
    Optional,
    /// Refuse to start without it.
    Required,
}

impl ValidationMode {
    /// Debug builds ask for validation, release builds skip it.
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            ValidationMode::Optional
        } else {
            ValidationMode::Off
        }
    }
}

/// Decides whether the validation layer gets enabled given what the loader
/// reports.
pub fn resolve_validation(mode: ValidationMode, available: &[&CStr]) -> Result<bool, VkError> {
    let present = available.iter().any(|&l| l == VALIDATION_LAYER);
    match (mode, present) {
        (ValidationMode::Off, _) => Ok(false),
        (_, true) => Ok(true),
        (ValidationMode::Optional, false) => {
            warn!("validation layer not installed; continuing without it");
            Ok(false)
        }
        (ValidationMode::Required, false) => Err(VkError::ValidationLayersUnavailable(vec![
            VALIDATION_LAYER.to_string_lossy().into_owned(),
        ])),
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vk {types:?}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vk {types:?}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!("[vk {types:?}] {msg}");
    } else {
        debug!("[vk {types:?}] {msg}");
    }
    vk::FALSE
}

/// Messenger plus the loader needed to destroy it.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub unsafe fn new(entry: &Entry, instance: &Instance) -> Result<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            ..Default::default()
        };
        let messenger = loader
            .create_debug_utils_messenger(&ci, None)
            .context("create_debug_utils_messenger")?;
        Ok(Self { loader, messenger })
    }

    pub unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

/// Creates the instance with the platform WSI extensions, plus debug utils and
/// the validation layer when `mode` allows. Returns whether validation is on.
pub unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    mode: ValidationMode,
) -> Result<(Instance, bool)> {
    let app_name = CString::new("Kestrel")?;
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: 0,
        p_engine_name: app_name.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let layer_props = entry
        .enumerate_instance_layer_properties()
        .context("enumerate_instance_layer_properties")?;
    let available: Vec<&CStr> = layer_props
        .iter()
        .map(|l| CStr::from_ptr(l.layer_name.as_ptr()))
        .collect();
    let validation = resolve_validation(mode, &available)?;

    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
    }
    let layers = [VALIDATION_LAYER.as_ptr()];
    let (enabled_layer_count, pp_enabled_layer_names) = if validation {
        (layers.len() as u32, layers.as_ptr())
    } else {
        (0u32, std::ptr::null())
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count,
        pp_enabled_layer_names,
        ..Default::default()
    };

    let instance = entry
        .create_instance(&create_info, None)
        .context("create_instance")?;
    info!("vk instance ready (validation={validation})");
    Ok((instance, validation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_never_enables() {
        assert!(!resolve_validation(ValidationMode::Off, &[VALIDATION_LAYER]).unwrap());
    }

    #[test]
    fn optional_follows_availability() {
        assert!(resolve_validation(ValidationMode::Optional, &[VALIDATION_LAYER]).unwrap());
        assert!(!resolve_validation(ValidationMode::Optional, &[]).unwrap());
    }

    #[test]
    fn required_without_layer_is_fatal() {
        let other = c"VK_LAYER_MESA_overlay";
        match resolve_validation(ValidationMode::Required, &[other]) {
            Err(VkError::ValidationLayersUnavailable(names)) => {
                assert_eq!(names, vec!["VK_LAYER_KHRONOS_validation".to_owned()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
