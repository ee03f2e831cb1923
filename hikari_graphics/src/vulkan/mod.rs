/*! Raw Vulkan wrapper layer.
 *
 * Owns the instance, enumerates and filters physical devices, and exposes the
 * per-GPU [`device::Device`] plus the multi-device [`context::Context`] that
 * drives the frame lifecycle. Raw `ash` structures are used directly wherever
 * possible.
 */

use std::{
    ffi::{c_void, CStr, CString},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use ash::{ext::debug_utils, khr, vk};

pub mod acceleration;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod reflection;
pub mod resource;
pub mod shader;
pub mod staged;
pub mod timer;

pub use context::{Context, ContextDescriptor};
pub use device::{Device, DeviceId, DeviceMask, PerDevice, MAX_FRAMES_IN_FLIGHT};

/// Required on every selected device.
pub(crate) const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[
    khr::multiview::NAME,
    khr::push_descriptor::NAME,
    khr::maintenance1::NAME,
];

/// Required when ray tracing is enabled. Ray queries are used by the
/// compute-based resampling kernels.
pub(crate) const RAY_TRACING_DEVICE_EXTENSIONS: &[&CStr] = &[
    khr::ray_tracing_pipeline::NAME,
    khr::acceleration_structure::NAME,
    khr::deferred_host_operations::NAME,
    khr::pipeline_library::NAME,
    khr::ray_query::NAME,
];

/// Used for cross-device sharing when more than one device participates.
pub(crate) const MULTI_DEVICE_EXTENSIONS: &[&CStr] = &[
    ash::ext::external_memory_host::NAME,
    khr::external_semaphore::NAME,
];

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    pub(crate) fn new(application_name: &str, enable_validation: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(application_name)?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_2);

        let mut extension_names = Vec::new();
        if enable_validation {
            extension_names.push(debug_utils::NAME.as_ptr());
        }

        let layer_strings = if enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation")?]
        } else {
            Vec::new()
        };
        let layer_names: Vec<*const i8> = layer_strings.iter().map(|s| s.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe {
            entry
                .create_instance(&instance_info, None)
                .with_context(|| "Failed to create Vulkan instance")?
        };

        let debug_utils = if enable_validation {
            let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));

            let instance = debug_utils::Instance::new(&entry, &raw);
            let messenger =
                unsafe { instance.create_debug_utils_messenger(&debug_utils_info, None)? };
            Some((instance, messenger))
        } else {
            None
        };

        Ok(Self {
            entry,
            raw,
            debug_utils,
        })
    }

    pub(crate) fn get_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|raw| PhysicalDevice::new_from_vulkan_handle(&self.raw, raw))
            .collect()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            if let Some((instance, messenger)) = self.debug_utils.take() {
                instance.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

#[derive(Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) device_type: vk::PhysicalDeviceType,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) queue_families: Vec<QueueFamily>,
    supported_extensions: Vec<String>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(instance: &ash::Instance, raw: vk::PhysicalDevice) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("unknown")
                .to_owned()
        };

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, properties)| QueueFamily {
                index: index as u32,
                properties,
            })
            .collect();

        let extension_properties = unsafe { instance.enumerate_device_extension_properties(raw)? };
        let supported_extensions = extension_properties
            .into_iter()
            .map(|prop| {
                let name = unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) };
                name.to_str().unwrap_or("").to_owned()
            })
            .collect();

        Ok(Self {
            raw,
            name,
            device_type: properties.device_type,
            properties,
            queue_families,
            supported_extensions,
        })
    }

    pub(crate) fn supports_extensions(&self, extensions: &[&CStr]) -> bool {
        extensions.iter().all(|ext| {
            let ext = ext.to_str().unwrap_or("");
            self.supported_extensions.iter().any(|s| s == ext)
        })
    }

    /// Device must support the targeted API version, the always-required
    /// extensions, and the ray tracing block unless ray tracing is disabled.
    pub(crate) fn meets_requirements(&self, require_ray_tracing: bool) -> bool {
        if self.properties.api_version < vk::API_VERSION_1_2 {
            return false;
        }
        if !self.supports_extensions(REQUIRED_DEVICE_EXTENSIONS) {
            return false;
        }
        if require_ray_tracing && !self.supports_extensions(RAY_TRACING_DEVICE_EXTENSIONS) {
            return false;
        }
        self.queue_families
            .iter()
            .any(|family| family.supports_graphics())
    }

    pub(crate) fn supports_ray_tracing(&self) -> bool {
        self.supports_extensions(RAY_TRACING_DEVICE_EXTENSIONS)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamily {
    pub(crate) index: u32,
    pub(crate) properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub(crate) fn supports_graphics(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
    }

    pub(crate) fn supports_compute(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::COMPUTE)
    }

    pub(crate) fn supports_transfer(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::TRANSFER)
    }

    pub(crate) fn _supports_timestamps(&self) -> bool {
        self.properties.timestamp_valid_bits > 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SemaphoreType {
    Binary,
    Timeline,
}

/// Small ownership wrapper for binary and timeline semaphores.
pub struct Semaphore {
    pub(crate) raw: vk::Semaphore,
    pub(crate) semaphore_type: SemaphoreType,
    device: Arc<Device>,
}

impl Semaphore {
    pub fn new(device: Arc<Device>, semaphore_type: SemaphoreType) -> Result<Self> {
        let mut semaphore_type_info =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(match semaphore_type {
                SemaphoreType::Binary => vk::SemaphoreType::BINARY,
                SemaphoreType::Timeline => vk::SemaphoreType::TIMELINE,
            });
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type_info);

        let raw = unsafe { device.raw.create_semaphore(&semaphore_info, None)? };

        Ok(Self {
            raw,
            semaphore_type,
            device,
        })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    /// Blocks until the timeline value has been signalled.
    pub fn wait_value(&self, value: u64) -> Result<()> {
        assert_eq!(self.semaphore_type, SemaphoreType::Timeline);
        let semaphores = [self.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.raw.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_semaphore(self.raw, None);
        }
    }
}
