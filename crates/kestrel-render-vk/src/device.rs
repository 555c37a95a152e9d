// SPDX-License-Identifier: CEPL-1.0
//! Physical device selection and the long-lived device context.

use std::ffi::CStr;

use anyhow::{anyhow, Context, Result};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info};

use crate::error::VkError;
use crate::instance::{create_instance, DebugMessenger, ValidationMode};

pub const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[swapchain::NAME];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.graphics.into_iter().collect();
        if let Some(p) = self.present {
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out
    }

    /// Sharing mode for images touched by both queues.
    pub fn sharing_mode(&self) -> (vk::SharingMode, Vec<u32>) {
        match (self.graphics, self.present) {
            (Some(g), Some(p)) if g != p => (vk::SharingMode::CONCURRENT, vec![g, p]),
            _ => (vk::SharingMode::EXCLUSIVE, Vec::new()),
        }
    }
}

/// Scans families in order; a later family with both capabilities replaces
/// an earlier graphics-only match.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    present_support: impl Fn(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    for (i, family) in props.iter().enumerate() {
        let i = i as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(i);
        }
        if present_support(i) {
            indices.present = Some(i);
        }
        if indices.is_complete() {
            break;
        }
    }
    indices
}

/// Surface capabilities as seen right now. Never cached across rebuilds.
#[derive(Clone, Debug, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn query(
        loader: &surface::Instance,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: loader
                .get_physical_device_surface_capabilities(physical, surface)
                .context("get_physical_device_surface_capabilities")?,
            formats: loader
                .get_physical_device_surface_formats(physical, surface)
                .context("get_physical_device_surface_formats")?,
            present_modes: loader
                .get_physical_device_surface_present_modes(physical, surface)
                .context("get_physical_device_surface_present_modes")?,
        })
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub fn missing_extensions(available: &[&CStr]) -> Vec<String> {
    REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .filter(|req| !available.contains(req))
        .map(|req| req.to_string_lossy().into_owned())
        .collect()
}

/// What selection needs to know about one physical device.
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: QueueFamilyIndices,
    pub missing_extensions: Vec<String>,
    pub format_count: usize,
    pub present_mode_count: usize,
}

impl DeviceCandidate {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_complete()
            && self.missing_extensions.is_empty()
            && self.format_count > 0
            && self.present_mode_count > 0
    }

    fn fails_only_on_extensions(&self) -> bool {
        self.queue_families.is_complete()
            && self.format_count > 0
            && self.present_mode_count > 0
            && !self.missing_extensions.is_empty()
    }
}

/// Ranking among devices that already passed the suitability check.
pub trait DeviceSelector {
    fn name(&self) -> &'static str;

    /// `suitable` holds `(enumeration index, candidate)` in enumeration order.
    fn choose(&self, suitable: &[(usize, &DeviceCandidate)]) -> Option<usize>;
}

/// Enumeration order, no ranking.
pub struct FirstSuitable;

impl DeviceSelector for FirstSuitable {
    fn name(&self) -> &'static str {
        "first-suitable"
    }

    fn choose(&self, suitable: &[(usize, &DeviceCandidate)]) -> Option<usize> {
        suitable.first().map(|&(i, _)| i)
    }
}

/// First discrete GPU, else the first suitable device.
pub struct PreferDiscrete;

impl DeviceSelector for PreferDiscrete {
    fn name(&self) -> &'static str {
        "prefer-discrete"
    }

    fn choose(&self, suitable: &[(usize, &DeviceCandidate)]) -> Option<usize> {
        suitable
            .iter()
            .find(|(_, c)| c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
            .or_else(|| suitable.first())
            .map(|&(i, _)| i)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePolicy {
    #[default]
    FirstSuitable,
    PreferDiscrete,
}

impl DevicePolicy {
    pub fn selector(self) -> Box<dyn DeviceSelector> {
        match self {
            DevicePolicy::FirstSuitable => Box::new(FirstSuitable),
            DevicePolicy::PreferDiscrete => Box::new(PreferDiscrete),
        }
    }
}

pub fn select_device(
    candidates: &[DeviceCandidate],
    selector: &dyn DeviceSelector,
) -> Result<usize, VkError> {
    if candidates.is_empty() {
        return Err(VkError::NoDevices);
    }

    let suitable: Vec<(usize, &DeviceCandidate)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_suitable())
        .collect();

    if let Some(i) = selector.choose(&suitable) {
        return Ok(i);
    }

    if candidates.iter().all(DeviceCandidate::fails_only_on_extensions) {
        let mut names: Vec<String> = candidates
            .iter()
            .flat_map(|c| c.missing_extensions.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        return Err(VkError::MissingExtensions(names));
    }
    Err(VkError::NoSuitableDevice(candidates.len()))
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, VkError> {
    (0..props.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
        .ok_or(VkError::NoSuitableMemoryType { type_bits, flags })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceSettings {
    pub validation: ValidationMode,
    pub policy: DevicePolicy,
}

/// Everything tied to the instance and logical device. Created once and
/// destroyed last, explicitly, by the renderer that owns it.
pub struct DeviceContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<DebugMessenger>,

    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub physical: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_families: QueueFamilyIndices,
    pub graphics_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub swapchain_loader: swapchain::Device,
    pub command_pool: vk::CommandPool,
    pub sampler: vk::Sampler,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device_name: String,
}

impl DeviceContext {
    // STRICT ORDER:
    // 1) instance (+ debug messenger)
    // 2) surface from THIS instance
    // 3) physical device judged against THIS surface
    // 4) logical device, queues, pool, sampler
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        settings: DeviceSettings,
    ) -> Result<Self> {
        let dh: RawDisplayHandle = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh: RawWindowHandle = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::load().context("load Vulkan loader")?;
        let (instance, validation) = create_instance(&entry, dh, settings.validation)?;

        let debug = if validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(d) => Some(d),
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let abort_instance = |instance: &Instance, debug: &Option<DebugMessenger>| {
            if let Some(d) = debug {
                d.destroy();
            }
            instance.destroy_instance(None);
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
            Ok(s) => s,
            Err(e) => {
                abort_instance(&instance, &debug);
                return Err(anyhow!(e).context("ash_window::create_surface"));
            }
        };

        let opened = open_device(&instance, &surface_loader, surface, settings.policy)
            .and_then(|(physical, families, name)| {
                let device = create_logical_device(&instance, physical, &families)?;
                Ok((physical, families, name, device))
            });
        let (physical, queue_families, device_name, device) = match opened {
            Ok(v) => v,
            Err(e) => {
                surface_loader.destroy_surface(surface, None);
                abort_instance(&instance, &debug);
                return Err(e);
            }
        };

        // open_device only returns complete families
        let graphics_family = queue_families.graphics.unwrap_or_default();
        let present_family = queue_families.present.unwrap_or(graphics_family);
        let graphics_queue = device.get_device_queue(graphics_family, 0);
        let present_queue = device.get_device_queue(present_family, 0);

        let (command_pool, sampler) = match create_pool_and_sampler(&device, graphics_family) {
            Ok(v) => v,
            Err(e) => {
                device.destroy_device(None);
                surface_loader.destroy_surface(surface, None);
                abort_instance(&instance, &debug);
                return Err(e);
            }
        };

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let memory_properties = instance.get_physical_device_memory_properties(physical);

        info!(
            "vk device: {device_name} (graphics={graphics_family}, present={present_family})"
        );

        Ok(Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            physical,
            device,
            queue_families,
            graphics_family,
            graphics_queue,
            present_queue,
            swapchain_loader,
            command_pool,
            sampler,
            memory_properties,
            device_name,
        })
    }

    pub unsafe fn swapchain_support(&self) -> Result<SwapchainSupport> {
        SwapchainSupport::query(&self.surface_loader, self.physical, self.surface)
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, VkError> {
        find_memory_type(&self.memory_properties, type_bits, flags)
    }

    pub unsafe fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        Ok(self
            .device
            .allocate_command_buffers(&alloc_info)
            .context("allocate_command_buffers")?)
    }

    pub unsafe fn wait_idle(&self) {
        self.device.device_wait_idle().ok();
    }

    /// Caller guarantees every child object is already gone.
    // STRICT ORDER: sampler, pool, device, surface, messenger, instance.
    pub unsafe fn destroy(&mut self) {
        let d = &self.device;
        d.destroy_sampler(self.sampler, None);
        d.destroy_command_pool(self.command_pool, None);
        d.destroy_device(None);
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some(debug) = self.debug.take() {
            debug.destroy();
        }
        self.instance.destroy_instance(None);
    }
}

unsafe fn describe_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    physical: vk::PhysicalDevice,
) -> Result<DeviceCandidate> {
    let props = instance.get_physical_device_properties(physical);
    let name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let families = instance.get_physical_device_queue_family_properties(physical);
    let queue_families = find_queue_families(&families, |i| {
        surface_loader
            .get_physical_device_surface_support(physical, i, surface)
            .unwrap_or(false)
    });

    let ext_props = instance
        .enumerate_device_extension_properties(physical)
        .context("enumerate_device_extension_properties")?;
    let available: Vec<&CStr> = ext_props
        .iter()
        .map(|e| CStr::from_ptr(e.extension_name.as_ptr()))
        .collect();
    let missing = missing_extensions(&available);

    // Only meaningful once the swapchain extension exists.
    let (format_count, present_mode_count) = if missing.is_empty() {
        let support = SwapchainSupport::query(surface_loader, physical, surface)?;
        (support.formats.len(), support.present_modes.len())
    } else {
        (0, 0)
    };

    Ok(DeviceCandidate {
        name,
        device_type: props.device_type,
        queue_families,
        missing_extensions: missing,
        format_count,
        present_mode_count,
    })
}

unsafe fn open_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    policy: DevicePolicy,
) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, String)> {
    let physicals = instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?;

    let mut candidates = Vec::with_capacity(physicals.len());
    for &phys in &physicals {
        let c = describe_device(instance, surface_loader, surface, phys)?;
        debug!(
            "candidate {:?} ({:?}): suitable={} families={:?} missing={:?}",
            c.name,
            c.device_type,
            c.is_suitable(),
            c.queue_families,
            c.missing_extensions
        );
        candidates.push(c);
    }

    let selector = policy.selector();
    let picked = select_device(&candidates, selector.as_ref())
        .context("select physical device")?;
    info!("device policy {} picked {:?}", selector.name(), candidates[picked].name);

    let c = &candidates[picked];
    Ok((physicals[picked], c.queue_families, c.name.clone()))
}

unsafe fn create_logical_device(
    instance: &Instance,
    physical: vk::PhysicalDevice,
    families: &QueueFamilyIndices,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let device_exts: Vec<*const std::ffi::c_char> = REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .map(|e| e.as_ptr())
        .collect();
    let features = vk::PhysicalDeviceFeatures::default();

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };

    Ok(instance
        .create_device(physical, &dinfo, None)
        .context("create_device")?)
}

unsafe fn create_pool_and_sampler(
    device: &ash::Device,
    graphics_family: u32,
) -> Result<(vk::CommandPool, vk::Sampler)> {
    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: graphics_family,
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        ..Default::default()
    };
    let pool = device
        .create_command_pool(&pool_info, None)
        .context("create_command_pool")?;

    let sampler_info = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        min_lod: -1000.0,
        max_lod: 1000.0,
        max_anisotropy: 1.0,
        ..Default::default()
    };
    match device.create_sampler(&sampler_info, None) {
        Ok(sampler) => Ok((pool, sampler)),
        Err(e) => {
            device.destroy_command_pool(pool, None);
            Err(anyhow!(e).context("create_sampler"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(name: &str, suitable: bool) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_owned(),
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: if suitable { Some(0) } else { None },
            },
            missing_extensions: Vec::new(),
            format_count: 1,
            present_mode_count: 1,
        }
    }

    #[test]
    fn queue_families_stop_once_complete() {
        let props = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let found = find_queue_families(&props, |i| i >= 2);
        assert_eq!(found.graphics, Some(2));
        assert_eq!(found.present, Some(2));
        assert!(found.is_complete());
    }

    #[test]
    fn split_families_share_concurrently() {
        let props = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let found = find_queue_families(&props, |i| i == 1);
        assert_eq!(found.unique(), vec![0, 1]);
        assert_eq!(found.sharing_mode(), (vk::SharingMode::CONCURRENT, vec![0, 1]));

        let same = QueueFamilyIndices {
            graphics: Some(3),
            present: Some(3),
        };
        assert_eq!(same.unique(), vec![3]);
        assert_eq!(same.sharing_mode().0, vk::SharingMode::EXCLUSIVE);
    }

    #[test]
    fn no_present_support_is_incomplete() {
        let props = [family(vk::QueueFlags::GRAPHICS)];
        let found = find_queue_families(&props, |_| false);
        assert!(!found.is_complete());
    }

    #[test]
    fn selection_ignores_position_of_unsuitable_devices() {
        let layouts = [
            vec![candidate("bad-a", false), candidate("good", true), candidate("bad-b", false)],
            vec![candidate("good", true), candidate("bad-a", false), candidate("bad-b", false)],
            vec![candidate("bad-b", false), candidate("bad-a", false), candidate("good", true)],
        ];
        for list in &layouts {
            let i = select_device(list, &FirstSuitable).unwrap();
            assert_eq!(list[i].name, "good");
        }
    }

    #[test]
    fn prefer_discrete_outranks_enumeration_order() {
        let mut discrete = candidate("dgpu", true);
        discrete.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
        let list = vec![candidate("igpu", true), discrete];
        assert_eq!(select_device(&list, &FirstSuitable).unwrap(), 0);
        assert_eq!(select_device(&list, &PreferDiscrete).unwrap(), 1);
    }

    #[test]
    fn selection_errors() {
        assert!(matches!(
            select_device(&[], &FirstSuitable),
            Err(VkError::NoDevices)
        ));
        assert!(matches!(
            select_device(&[candidate("a", false), candidate("b", false)], &FirstSuitable),
            Err(VkError::NoSuitableDevice(2))
        ));

        let mut no_swapchain = candidate("c", true);
        no_swapchain.missing_extensions = vec!["VK_KHR_swapchain".to_owned()];
        match select_device(&[no_swapchain], &FirstSuitable) {
            Err(VkError::MissingExtensions(names)) => assert_eq!(names, vec!["VK_KHR_swapchain"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn required_extension_detection() {
        assert!(missing_extensions(&[swapchain::NAME]).is_empty());
        assert_eq!(missing_extensions(&[]), vec!["VK_KHR_swapchain".to_owned()]);
    }

    #[test]
    fn memory_type_lookup() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&props, 0b111, local).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b100, local).unwrap(), 2);
        assert!(matches!(
            find_memory_type(&props, 0b001, local),
            Err(VkError::NoSuitableMemoryType { type_bits: 1, .. })
        ));
    }
}
