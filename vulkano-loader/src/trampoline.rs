// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The public entry points, taking opaque handles.
//!
//! A trampoline unwraps its handle argument, which aborts the process if the handle isn't a live
//! one of the right type, looks the command up in the dispatch table the handle belongs to and
//! calls through with the real handle. Handles returned by the call are wrapped before they are
//! handed back.
//!
//! [`get_instance_proc_addr`] and [`get_device_proc_addr`] hand out trampolines as
//! [`Callable`]s. Looking the same name up twice gives the same callable.
//!
//! The functions that enumerate into a caller-provided buffer follow the two-call idiom: with no
//! buffer they return the number of elements available, with a buffer they fill it with as many
//! elements as fit and say whether that was all of them.

use crate::{
    capability::Resolution,
    command::{
        command_scope, Callable, Command, CommandScope, EnumerateDeviceExtensionProperties,
        EnumerateInstanceExtensionProperties, EnumerateInstanceLayerProperties,
        EnumerateInstanceVersion, EnumeratePhysicalDevices, GetDeviceQueue,
        GetPhysicalDeviceFeatures, GetPhysicalDeviceFeatures2, GetPhysicalDeviceFeatures2Khr,
        GetPhysicalDeviceProperties, GetPhysicalDeviceProperties2,
        GetPhysicalDeviceProperties2Khr, GetPhysicalDeviceQueueFamilyProperties, QueueWaitIdle,
        TrimCommandPool, TrimCommandPoolKhr,
    },
    device::physical::{PhysicalDeviceFeatures2, PhysicalDeviceProperties2},
    dispatch::DispatchTable,
    handle::unwrap_ref,
    loader::{self, Loader},
    macros::usage_violation,
    ExtensionProperties, VulkanError,
};
use ash::vk::{self, Handle};
use foldhash::fast::RandomState;
use std::{collections::HashMap, sync::OnceLock};

/// The outcome of a successful enumeration into a caller-provided buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Enumerated {
    /// Every available element was written, or, if no buffer was given, this many elements are
    /// available.
    Complete(usize),
    /// The buffer was too small. This many elements were written, which is the whole buffer.
    Incomplete(usize),
}

impl Enumerated {
    /// Returns the number of elements written, or available if no buffer was given.
    #[inline]
    pub fn count(self) -> usize {
        match self {
            Enumerated::Complete(count) | Enumerated::Incomplete(count) => count,
        }
    }
}

impl From<Enumerated> for vk::Result {
    #[inline]
    fn from(val: Enumerated) -> Self {
        match val {
            Enumerated::Complete(_) => vk::Result::SUCCESS,
            Enumerated::Incomplete(_) => vk::Result::INCOMPLETE,
        }
    }
}

fn fill<T: Clone>(items: &[T], output: Option<&mut [T]>) -> Enumerated {
    let Some(output) = output else {
        return Enumerated::Complete(items.len());
    };

    let written = output.len().min(items.len());
    output[..written].clone_from_slice(&items[..written]);

    if written < items.len() {
        Enumerated::Incomplete(written)
    } else {
        Enumerated::Complete(written)
    }
}

/// Returns the entry point for `name`.
///
/// Global commands are returned for any `instance`, including a null one, and are answered by
/// the [global loader](Loader::global). Instance-level commands are only returned for a live
/// instance whose version or enabled extensions allow them.
///
/// `vkCreateInstance`, `vkDestroyInstance`, `vkCreateDevice` and `vkDestroyDevice` are never
/// returned: scopes are created and destroyed through [`Instance`](crate::instance::Instance)
/// and [`Device`](crate::device::Device).
///
/// # Safety
///
/// - `instance` must be null, or a handle obtained from this loader.
pub unsafe fn get_instance_proc_addr(instance: vk::Instance, name: &str) -> Option<Callable> {
    match command_scope(name)? {
        CommandScope::Global => return trampolines().get(name).cloned(),
        CommandScope::Instance => (),
        CommandScope::Device => return None,
    }

    if instance.is_null() {
        return None;
    }

    let wrapper = unsafe { unwrap_ref(instance) };

    exposed(wrapper.dispatch(), name)
}

/// Returns the device-level entry point for `name`, if the device's version or enabled
/// extensions allow it.
///
/// # Safety
///
/// - `device` must be a handle obtained from this loader.
pub unsafe fn get_device_proc_addr(device: vk::Device, name: &str) -> Option<Callable> {
    let wrapper = unsafe { unwrap_ref(device) };

    if command_scope(name)? != CommandScope::Device {
        return None;
    }

    exposed(wrapper.dispatch(), name)
}

fn exposed(dispatch: &DispatchTable, name: &str) -> Option<Callable> {
    dispatch.get(name)?;

    trampolines().get(name).cloned()
}

/// Enumerates the physical devices of every driver.
///
/// The same physical device always gets the same handle.
///
/// # Safety
///
/// - `instance` must be a handle obtained from this loader.
pub unsafe fn enumerate_physical_devices(
    instance: vk::Instance,
    output: Option<&mut [vk::PhysicalDevice]>,
) -> Result<Enumerated, VulkanError> {
    let physical_devices = unsafe { enumerate_physical_devices_vec(instance) }?;

    Ok(fill(&physical_devices, output))
}

pub(crate) unsafe fn enumerate_physical_devices_vec(
    instance: vk::Instance,
) -> Result<Vec<vk::PhysicalDevice>, VulkanError> {
    let _state = loader::lock();
    let wrapper = unsafe { unwrap_ref(instance) };

    let enumerate = wrapper
        .dispatch()
        .command::<EnumeratePhysicalDevices>()
        .ok_or(VulkanError::InitializationFailed)?;
    let raw_handles = enumerate(wrapper.raw())?;

    let mut children = wrapper.children().lock();

    Ok(raw_handles
        .into_iter()
        .map(|raw| children.get_or_wrap(raw, wrapper.dispatch()))
        .collect())
}

// Physical device queries must find their command: the terminator defines all of them.
fn instance_command<C: Command>(dispatch: &DispatchTable) -> &C::Pfn {
    match dispatch.command::<C>() {
        Some(command) => &**command,
        None => usage_violation!("{} is missing from an instance dispatch table", C::NAME),
    }
}

/// # Safety
///
/// - `physical_device` must be a handle obtained from this loader.
pub unsafe fn get_physical_device_properties(
    physical_device: vk::PhysicalDevice,
) -> vk::PhysicalDeviceProperties {
    let wrapper = unsafe { unwrap_ref(physical_device) };

    instance_command::<GetPhysicalDeviceProperties>(wrapper.dispatch())(wrapper.raw())
}

/// # Safety
///
/// - `physical_device` must be a handle obtained from this loader.
pub unsafe fn get_physical_device_features(
    physical_device: vk::PhysicalDevice,
) -> vk::PhysicalDeviceFeatures {
    let wrapper = unsafe { unwrap_ref(physical_device) };

    instance_command::<GetPhysicalDeviceFeatures>(wrapper.dispatch())(wrapper.raw())
}

/// Queries the features of a physical device, through the form of `vkGetPhysicalDeviceFeatures2`
/// that the instance enabled.
///
/// Returns [`VulkanError::ExtensionNotPresent`] if the instance is version 1.0 and
/// `VK_KHR_get_physical_device_properties2` isn't enabled.
///
/// # Safety
///
/// - `physical_device` must be a handle obtained from this loader.
pub unsafe fn get_physical_device_features2(
    physical_device: vk::PhysicalDevice,
    features: &mut PhysicalDeviceFeatures2,
) -> Result<(), VulkanError> {
    let wrapper = unsafe { unwrap_ref(physical_device) };
    let dispatch = wrapper.dispatch();

    let get = match dispatch
        .registry()
        .resolve_versioned(GetPhysicalDeviceFeatures2::NAME)
    {
        Resolution::Core(_) => dispatch.command::<GetPhysicalDeviceFeatures2>(),
        Resolution::Extension(_) => dispatch.command::<GetPhysicalDeviceFeatures2Khr>(),
        Resolution::Unavailable => return Err(VulkanError::ExtensionNotPresent),
    }
    .ok_or(VulkanError::InitializationFailed)?;

    // Only cleared here. What a link writes on the way down is kept by the links below it.
    features.reset_chain();

    get(wrapper.raw(), features)
}

/// Same as [`get_physical_device_features2`], for properties.
///
/// # Safety
///
/// - `physical_device` must be a handle obtained from this loader.
pub unsafe fn get_physical_device_properties2(
    physical_device: vk::PhysicalDevice,
    properties: &mut PhysicalDeviceProperties2,
) -> Result<(), VulkanError> {
    let wrapper = unsafe { unwrap_ref(physical_device) };
    let dispatch = wrapper.dispatch();

    let get = match dispatch
        .registry()
        .resolve_versioned(GetPhysicalDeviceProperties2::NAME)
    {
        Resolution::Core(_) => dispatch.command::<GetPhysicalDeviceProperties2>(),
        Resolution::Extension(_) => dispatch.command::<GetPhysicalDeviceProperties2Khr>(),
        Resolution::Unavailable => return Err(VulkanError::ExtensionNotPresent),
    }
    .ok_or(VulkanError::InitializationFailed)?;

    properties.reset_chain();

    get(wrapper.raw(), properties)
}

/// # Safety
///
/// - `physical_device` must be a handle obtained from this loader.
pub unsafe fn get_physical_device_queue_family_properties(
    physical_device: vk::PhysicalDevice,
    output: Option<&mut [vk::QueueFamilyProperties]>,
) -> Enumerated {
    let properties = unsafe { queue_family_properties(physical_device) };

    fill(&properties, output)
}

pub(crate) unsafe fn queue_family_properties(
    physical_device: vk::PhysicalDevice,
) -> Vec<vk::QueueFamilyProperties> {
    let wrapper = unsafe { unwrap_ref(physical_device) };

    instance_command::<GetPhysicalDeviceQueueFamilyProperties>(wrapper.dispatch())(wrapper.raw())
}

/// # Safety
///
/// - `physical_device` must be a handle obtained from this loader.
pub unsafe fn enumerate_device_extension_properties(
    physical_device: vk::PhysicalDevice,
    output: Option<&mut [ExtensionProperties]>,
) -> Result<Enumerated, VulkanError> {
    let properties = unsafe { device_extension_properties(physical_device) }?;

    Ok(fill(&properties, output))
}

pub(crate) unsafe fn device_extension_properties(
    physical_device: vk::PhysicalDevice,
) -> Result<Vec<ExtensionProperties>, VulkanError> {
    let wrapper = unsafe { unwrap_ref(physical_device) };

    instance_command::<EnumerateDeviceExtensionProperties>(wrapper.dispatch())(wrapper.raw())
}

/// Returns a queue of a device.
///
/// The same queue always gets the same handle.
///
/// # Safety
///
/// - `device` must be a handle obtained from this loader.
pub unsafe fn get_device_queue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
) -> Result<vk::Queue, VulkanError> {
    let wrapper = unsafe { unwrap_ref(device) };

    let get = wrapper
        .dispatch()
        .command::<GetDeviceQueue>()
        .ok_or(VulkanError::InitializationFailed)?;
    let raw: vk::Queue = get(wrapper.raw(), queue_family_index, queue_index);

    if raw.is_null() {
        log::error!(
            "the driver returned no queue for family {} index {}",
            queue_family_index,
            queue_index,
        );
        return Err(VulkanError::InitializationFailed);
    }

    Ok(wrapper
        .children()
        .lock()
        .get_or_wrap(raw, wrapper.dispatch()))
}

/// Trims a command pool, through the form of `vkTrimCommandPool` that the device enabled.
///
/// Returns [`VulkanError::InitializationFailed`] if neither the device's version nor its
/// extensions provide a form, or if the driver implements none.
///
/// # Safety
///
/// - `device` must be a handle obtained from this loader.
pub unsafe fn trim_command_pool(
    device: vk::Device,
    command_pool: vk::CommandPool,
    flags: vk::CommandPoolTrimFlags,
) -> Result<(), VulkanError> {
    let wrapper = unsafe { unwrap_ref(device) };
    let dispatch = wrapper.dispatch();

    let trim = match dispatch.registry().resolve_versioned(TrimCommandPool::NAME) {
        Resolution::Core(_) => dispatch.command::<TrimCommandPool>(),
        Resolution::Extension(_) => dispatch.command::<TrimCommandPoolKhr>(),
        Resolution::Unavailable => None,
    }
    .ok_or(VulkanError::InitializationFailed)?;

    trim(wrapper.raw(), command_pool, flags)
}

/// # Safety
///
/// - `queue` must be a handle obtained from this loader.
pub unsafe fn queue_wait_idle(queue: vk::Queue) -> Result<(), VulkanError> {
    let wrapper = unsafe { unwrap_ref(queue) };

    let wait_idle = wrapper
        .dispatch()
        .command::<QueueWaitIdle>()
        .ok_or(VulkanError::InitializationFailed)?;

    wait_idle(wrapper.raw())
}

// One callable per trampoline, so that looking a name up always gives the same one.
fn trampolines() -> &'static HashMap<&'static str, Callable, RandomState> {
    static TRAMPOLINES: OnceLock<HashMap<&'static str, Callable, RandomState>> = OnceLock::new();

    TRAMPOLINES.get_or_init(|| {
        [
            EnumerateInstanceVersion::callable(|| Loader::global().api_version()),
            EnumerateInstanceExtensionProperties::callable(|layer_name| {
                Loader::global().extension_properties(layer_name)
            }),
            EnumerateInstanceLayerProperties::callable(|| Loader::global().layer_properties()),
            EnumeratePhysicalDevices::callable(|instance| unsafe {
                enumerate_physical_devices_vec(instance)
            }),
            GetPhysicalDeviceProperties::callable(|physical_device| unsafe {
                get_physical_device_properties(physical_device)
            }),
            GetPhysicalDeviceFeatures::callable(|physical_device| unsafe {
                get_physical_device_features(physical_device)
            }),
            GetPhysicalDeviceQueueFamilyProperties::callable(|physical_device| unsafe {
                queue_family_properties(physical_device)
            }),
            GetPhysicalDeviceFeatures2::callable(
                |physical_device, features: &mut PhysicalDeviceFeatures2| unsafe {
                    get_physical_device_features2(physical_device, features)
                },
            ),
            GetPhysicalDeviceFeatures2Khr::callable(
                |physical_device, features: &mut PhysicalDeviceFeatures2| unsafe {
                    get_physical_device_features2(physical_device, features)
                },
            ),
            GetPhysicalDeviceProperties2::callable(
                |physical_device, properties: &mut PhysicalDeviceProperties2| unsafe {
                    get_physical_device_properties2(physical_device, properties)
                },
            ),
            GetPhysicalDeviceProperties2Khr::callable(
                |physical_device, properties: &mut PhysicalDeviceProperties2| unsafe {
                    get_physical_device_properties2(physical_device, properties)
                },
            ),
            EnumerateDeviceExtensionProperties::callable(|physical_device| unsafe {
                device_extension_properties(physical_device)
            }),
            GetDeviceQueue::callable(|device, queue_family_index, queue_index| {
                unsafe { get_device_queue(device, queue_family_index, queue_index) }
                    .unwrap_or_else(|err| {
                        log::error!(
                            "vkGetDeviceQueue(family {}, index {}) returns a null queue: {}",
                            queue_family_index,
                            queue_index,
                            err,
                        );
                        vk::Queue::null()
                    })
            }),
            TrimCommandPool::callable(|device, command_pool, flags| unsafe {
                trim_command_pool(device, command_pool, flags)
            }),
            TrimCommandPoolKhr::callable(|device, command_pool, flags| unsafe {
                trim_command_pool(device, command_pool, flags)
            }),
            QueueWaitIdle::callable(|queue| unsafe { queue_wait_idle(queue) }),
        ]
        .into_iter()
        .map(|callable| (callable.name(), callable))
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::{
        enumerate_physical_devices, fill, get_instance_proc_addr,
        get_physical_device_queue_family_properties, Enumerated,
    };
    use crate::{
        command::{EnumerateInstanceVersion, GetDeviceQueue, KNOWN_COMMANDS},
        tests::{create_instance, MockDriver},
        Handle, Version, VulkanObject,
    };
    use ash::vk;

    #[test]
    fn fill_reports_incomplete() {
        let items = [1, 2, 3];

        assert_eq!(fill(&items, None), Enumerated::Complete(3));

        let mut small = [0; 2];
        let result = fill(&items, Some(&mut small));
        assert_eq!(result, Enumerated::Incomplete(2));
        assert_eq!(vk::Result::from(result), vk::Result::INCOMPLETE);
        assert_eq!(small, [1, 2]);

        let mut large = [0; 4];
        let result = fill(&items, Some(&mut large));
        assert_eq!(result, Enumerated::Complete(3));
        assert_eq!(vk::Result::from(result), vk::Result::SUCCESS);
        assert_eq!(large, [1, 2, 3, 0]);
    }

    #[test]
    fn null_instance_only_gives_global_commands() {
        let global =
            unsafe { get_instance_proc_addr(vk::Instance::null(), "vkEnumerateInstanceVersion") };
        assert!(global.unwrap().get::<EnumerateInstanceVersion>().is_some());

        assert!(unsafe {
            get_instance_proc_addr(vk::Instance::null(), "vkEnumeratePhysicalDevices")
        }
        .is_none());
        assert!(unsafe { get_instance_proc_addr(vk::Instance::null(), "vkCreateInstance") }
            .is_none());
        assert!(unsafe { get_instance_proc_addr(vk::Instance::null(), "vkCmdDraw") }.is_none());
    }

    #[test]
    fn every_trampoline_is_a_known_command() {
        for name in super::trampolines().keys() {
            assert!(KNOWN_COMMANDS.iter().any(|&(known, _)| known == *name));
        }
    }

    #[test]
    fn partial_physical_device_enumeration() {
        let instance = create_instance(
            vec![MockDriver::new("mock").with_physical_devices(3)],
            vec![],
            Version::V1_0,
        );

        let count = unsafe { enumerate_physical_devices(instance.handle(), None) }.unwrap();
        assert_eq!(count, Enumerated::Complete(3));

        let mut small = [vk::PhysicalDevice::null(); 2];
        let result =
            unsafe { enumerate_physical_devices(instance.handle(), Some(&mut small)) }.unwrap();
        assert_eq!(result, Enumerated::Incomplete(2));

        let mut all = [vk::PhysicalDevice::null(); 3];
        let result =
            unsafe { enumerate_physical_devices(instance.handle(), Some(&mut all)) }.unwrap();
        assert_eq!(result, Enumerated::Complete(3));
        assert_eq!(small[..], all[..2]);
        assert!(all.iter().all(|handle| !handle.is_null()));

        let objects: Vec<_> = instance
            .enumerate_physical_devices()
            .unwrap()
            .map(|physical_device| physical_device.handle())
            .collect();
        assert_eq!(objects[..], all[..]);
    }

    #[test]
    fn foreign_physical_device_aborts() {
        assert_aborts!("foreign_physical_device_aborts", {
            let foreign = Box::new([0u64; 8]);
            let handle = vk::PhysicalDevice::from_raw(foreign.as_ptr() as usize as u64);
            unsafe { get_physical_device_queue_family_properties(handle, None) };
        });
    }

    #[test]
    fn device_queue_through_proc_addr() {
        let (device, queue) = device_and_queue!(MockDriver::new("mock"));

        let callable = device.get_proc_addr("vkGetDeviceQueue").unwrap();
        let get = callable.get::<GetDeviceQueue>().unwrap();

        assert_eq!(get(device.handle(), 0, 0), queue.handle());
        // The driver has no such family: no wrapper is made for the null handle.
        assert!(get(device.handle(), 3, 0).is_null());
        assert!(get(device.handle(), 0, 5).is_null());
    }
}
