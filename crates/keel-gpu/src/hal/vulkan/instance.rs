//! Instance, physical device and logical device creation.

use std::ffi::{CStr, c_void};

use ash::vk;

use crate::hal::{HalError, HalResult};

use super::descriptors::PUSH_CONSTANT_BYTES;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub(super) struct Instance {
    /// Keeps the loader library alive.
    #[allow(dead_code)]
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

fn creation(what: &str) -> impl FnOnce(vk::Result) -> HalError + '_ {
    move |e| HalError::DeviceCreation(format!("{what}: {e}"))
}

pub(super) fn create_instance(validation: bool) -> HalResult<Instance> {
    let entry = unsafe { ash::Entry::load() }
        .map_err(|e| HalError::DeviceCreation(format!("failed to load Vulkan: {e}")))?;

    let layer_available = unsafe { entry.enumerate_instance_layer_properties() }
        .map_err(creation("enumerating layers"))?
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
    let validation = if validation && !layer_available {
        log::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
        false
    } else {
        validation
    };

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"keel")
        .engine_name(c"keel")
        .api_version(vk::API_VERSION_1_3);
    let layers = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };
    let extensions = if validation {
        vec![ash::ext::debug_utils::NAME.as_ptr()]
    } else {
        Vec::new()
    };
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);
    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(creation("creating instance"))?;

    let debug = if validation {
        let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        match unsafe { debug_utils.create_debug_utils_messenger(&info, None) } {
            Ok(messenger) => Some((debug_utils, messenger)),
            Err(e) => {
                log::warn!("debug messenger unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    Ok(Instance {
        entry,
        instance,
        debug,
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let message = unsafe {
        if data.is_null() || (*data).p_message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!(target: "keel::vulkan", "{message}");
    } else {
        log::warn!(target: "keel::vulkan", "{message}");
    }
    vk::FALSE
}

pub(super) struct Adapter {
    pub physical: vk::PhysicalDevice,
    pub family: u32,
    pub properties: vk::PhysicalDeviceProperties,
}

/// Picks a Vulkan 1.3 device with a graphics+compute family, preferring
/// discrete GPUs.
pub(super) fn select_adapter(instance: &ash::Instance) -> HalResult<Adapter> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(creation("enumerating physical devices"))?;

    let mut best: Option<(u32, Adapter)> = None;
    for physical in devices {
        let properties = unsafe { instance.get_physical_device_properties(physical) };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if properties.api_version < vk::API_VERSION_1_3 {
            log::debug!("skipping '{name}': Vulkan 1.3 unsupported");
            continue;
        }
        if properties.limits.max_push_constants_size < PUSH_CONSTANT_BYTES {
            log::debug!("skipping '{name}': push constants too small");
            continue;
        }
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
        let Some(family) = families.iter().position(|f| {
            f.queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        }) else {
            continue;
        };
        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        };
        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((
                score,
                Adapter {
                    physical,
                    family: family as u32,
                    properties,
                },
            ));
        }
    }

    best.map(|(_, adapter)| adapter)
        .ok_or_else(|| HalError::DeviceCreation("no Vulkan 1.3 device found".to_string()))
}

/// Creates the logical device with bindless descriptors, timeline
/// semaphores, synchronization2 and dynamic rendering enabled.
pub(super) fn create_device(instance: &ash::Instance, adapter: &Adapter) -> HalResult<ash::Device> {
    let priorities = [1.0];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(adapter.family)
        .queue_priorities(&priorities);

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_update_unused_while_pending(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_features(&features)
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe { instance.create_device(adapter.physical, &create_info, None) }
        .map_err(creation("creating logical device"))
}
