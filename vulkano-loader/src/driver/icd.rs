// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{Driver, ICD_INTERFACE_VERSION};
use crate::{
    command::{
        Callable, Command, DestroyDevice, DestroyInstance,
        EnumerateDeviceExtensionProperties, EnumeratePhysicalDevices, GetDeviceQueue,
        GetPhysicalDeviceFeatures, GetPhysicalDeviceFeatures2, GetPhysicalDeviceFeatures2Khr,
        GetPhysicalDeviceProperties, GetPhysicalDeviceProperties2,
        GetPhysicalDeviceProperties2Khr, GetPhysicalDeviceQueueFamilyProperties, QueueWaitIdle,
        TrimCommandPool, TrimCommandPoolKhr,
    },
    device::{
        physical::{
            native_struct_size, ChainedState, ChainedStruct, PhysicalDeviceFeatures2,
            PhysicalDeviceProperties2,
        },
        DeviceCreateInfo,
    },
    instance::InstanceCreateInfo,
    macros::usage_violation,
    ExtensionProperties, Version, VulkanError,
};
use ash::vk::{self, Handle};
use bytemuck::cast_slice;
use foldhash::fast::RandomState;
use libloading::{Error as LibloadingError, Library};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    error::Error,
    ffi::{c_char, c_void, CStr, CString},
    fmt::{Debug, Display, Error as FmtError, Formatter},
    mem::{size_of, transmute},
    path::Path,
    ptr::{self, addr_of_mut},
    sync::Arc,
};

type PfnNegotiateLoaderIcdInterfaceVersion =
    unsafe extern "system" fn(p_supported_version: *mut u32) -> vk::Result;

/// A driver implemented by a shared library following the installable client driver interface.
pub struct IcdLibrary {
    name: String,
    api_version: Version,
    entry: ash::EntryFnV1_0,
    negotiate_interface_version: Option<PfnNegotiateLoaderIcdInterfaceVersion>,
    shared: Arc<IcdShared>,
}

// What the callables handed out by the driver need. The library is only unloaded once every
// callable is gone.
struct IcdShared {
    get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    handles: Mutex<KnownHandles>,
    _library: Library,
}

// The function tables of every handle the driver created, keyed by raw handle.
#[derive(Default)]
struct KnownHandles {
    instances: HashMap<u64, Arc<InstanceTables>, RandomState>,
    physical_devices: HashMap<u64, Arc<InstanceTables>, RandomState>,
    devices: HashMap<u64, Arc<DeviceTables>, RandomState>,
    queues: HashMap<u64, Arc<DeviceTables>, RandomState>,
}

struct InstanceTables {
    handle: vk::Instance,
    v1_0: ash::InstanceFnV1_0,
    v1_1: ash::InstanceFnV1_1,
    khr_get_physical_device_properties2: ash::khr::get_physical_device_properties2::InstanceFn,
}

struct DeviceTables {
    v1_0: ash::DeviceFnV1_0,
    v1_1: ash::DeviceFnV1_1,
    khr_maintenance1: ash::khr::maintenance1::DeviceFn,
}

impl IcdLibrary {
    /// Loads the driver library at `path`.
    ///
    /// # Safety
    ///
    /// - The library must be a driver following the installable client driver interface. Its
    ///   initialization routines are run.
    pub unsafe fn new(path: impl AsRef<Path>) -> Result<IcdLibrary, LoadingError> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }.map_err(LoadingError::LibraryLoadFailure)?;

        let get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr =
            match unsafe { library.get(b"vk_icdGetInstanceProcAddr\0") } {
                Ok(symbol) => *symbol,
                Err(_) => *unsafe { library.get(b"vkGetInstanceProcAddr\0") }.map_err(|_| {
                    LoadingError::MissingEntryPoint("vk_icdGetInstanceProcAddr".to_owned())
                })?,
            };
        let negotiate_interface_version: Option<PfnNegotiateLoaderIcdInterfaceVersion> =
            unsafe { library.get(b"vk_icdNegotiateLoaderICDInterfaceVersion\0") }
                .ok()
                .map(|symbol| *symbol);

        let entry = ash::EntryFnV1_0::load(|name| unsafe {
            transmute::<vk::PFN_vkVoidFunction, *const c_void>(get_instance_proc_addr(
                vk::Instance::null(),
                name.as_ptr(),
            ))
        });
        let api_version = unsafe { get_api_version(get_instance_proc_addr) }?;

        log::debug!("loaded driver {} (Vulkan {})", path.display(), api_version);

        Ok(IcdLibrary {
            name: path.display().to_string(),
            api_version,
            entry,
            negotiate_interface_version,
            shared: Arc::new(IcdShared {
                get_instance_proc_addr,
                handles: Mutex::new(KnownHandles::default()),
                _library: library,
            }),
        })
    }
}

impl Debug for IcdLibrary {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("IcdLibrary")
            .field("name", &self.name)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

unsafe fn get_api_version(
    get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
) -> Result<Version, VulkanError> {
    // A driver that doesn't expose vkEnumerateInstanceVersion is a 1.0 driver.
    let func = unsafe {
        get_instance_proc_addr(vk::Instance::null(), c"vkEnumerateInstanceVersion".as_ptr())
    };

    let Some(func) = func else {
        return Ok(Version::V1_0);
    };

    let func: vk::PFN_vkEnumerateInstanceVersion = unsafe { transmute(func) };
    let mut api_version = 0;
    unsafe { func(&mut api_version) }
        .result()
        .map_err(VulkanError::from)?;

    Ok(Version::from(api_version))
}

impl Driver for IcdLibrary {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn api_version(&self) -> Version {
        self.api_version
    }

    fn negotiate_interface_version(&self, loader_version: u32) -> Result<u32, VulkanError> {
        let Some(negotiate) = self.negotiate_interface_version else {
            // Drivers predating negotiation speak version 1 at most.
            return Ok(1);
        };

        let mut version = loader_version.min(ICD_INTERFACE_VERSION);
        unsafe { negotiate(&mut version) }
            .result()
            .map_err(VulkanError::from)?;

        Ok(version)
    }

    fn instance_extension_properties(&self) -> Result<Vec<ExtensionProperties>, VulkanError> {
        let properties = unsafe {
            read_into_vec(|count, data| {
                (self.entry.enumerate_instance_extension_properties)(ptr::null(), count, data)
            })
        }?;

        Ok(properties.into_iter().map(Into::into).collect())
    }

    fn create_instance(
        &self,
        create_info: &InstanceCreateInfo,
    ) -> Result<vk::Instance, VulkanError> {
        let application_name = create_info
            .application_name
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| VulkanError::InitializationFailed)?;
        let extension_names = to_c_strings(create_info.enabled_extensions.iter())?;
        let extension_ptrs: SmallVec<[*const c_char; 8]> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let mut application_info = vk::ApplicationInfo::default()
            .application_version(
                u32::try_from(create_info.application_version)
                    .map_err(|_| VulkanError::InitializationFailed)?,
            )
            .api_version(
                u32::try_from(create_info.api_version)
                    .map_err(|_| VulkanError::IncompatibleDriver)?,
            );

        if let Some(application_name) = &application_name {
            application_info = application_info.application_name(application_name);
        }

        let create_info_vk = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_extension_names(&extension_ptrs);

        let mut output = vk::Instance::null();
        unsafe { (self.entry.create_instance)(&create_info_vk, ptr::null(), &mut output) }
            .result()
            .map_err(VulkanError::from)?;

        let tables = unsafe { InstanceTables::load(self.shared.get_instance_proc_addr, output) };
        self.shared
            .handles
            .lock()
            .instances
            .insert(output.as_raw(), Arc::new(tables));

        Ok(output)
    }

    fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &DeviceCreateInfo,
    ) -> Result<vk::Device, VulkanError> {
        let tables = self.shared.physical_device(physical_device);

        let extension_names = to_c_strings(create_info.enabled_extensions.iter())?;
        let extension_ptrs: SmallVec<[*const c_char; 8]> =
            extension_names.iter().map(|name| name.as_ptr()).collect();
        let queue_create_infos_vk: SmallVec<[vk::DeviceQueueCreateInfo<'_>; 4]> = create_info
            .queue_create_infos
            .iter()
            .map(|queue_create_info| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(queue_create_info.queue_family_index)
                    .queue_priorities(&queue_create_info.queues)
            })
            .collect();

        let create_info_vk = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos_vk)
            .enabled_extension_names(&extension_ptrs);

        let mut output = vk::Device::null();
        unsafe {
            (tables.v1_0.create_device)(physical_device, &create_info_vk, ptr::null(), &mut output)
        }
        .result()
        .map_err(VulkanError::from)?;

        let device_tables = unsafe { DeviceTables::load(&tables, output) };
        self.shared
            .handles
            .lock()
            .devices
            .insert(output.as_raw(), Arc::new(device_tables));

        Ok(output)
    }

    fn get_proc_addr(&self, name: &str) -> Option<Callable> {
        if !self.shared.exposes(name) {
            return None;
        }

        let shared = self.shared.clone();

        let callable = match name {
            DestroyInstance::NAME => {
                DestroyInstance::callable(move |instance| shared.destroy_instance(instance))
            }
            EnumeratePhysicalDevices::NAME => EnumeratePhysicalDevices::callable(move |instance| {
                shared.enumerate_physical_devices(instance)
            }),
            GetPhysicalDeviceProperties::NAME => {
                GetPhysicalDeviceProperties::callable(move |physical_device| {
                    let tables = shared.physical_device(physical_device);
                    let mut output = vk::PhysicalDeviceProperties::default();
                    unsafe {
                        (tables.v1_0.get_physical_device_properties)(physical_device, &mut output)
                    };

                    output
                })
            }
            GetPhysicalDeviceFeatures::NAME => {
                GetPhysicalDeviceFeatures::callable(move |physical_device| {
                    let tables = shared.physical_device(physical_device);
                    let mut output = vk::PhysicalDeviceFeatures::default();
                    unsafe {
                        (tables.v1_0.get_physical_device_features)(physical_device, &mut output)
                    };

                    output
                })
            }
            GetPhysicalDeviceQueueFamilyProperties::NAME => {
                GetPhysicalDeviceQueueFamilyProperties::callable(move |physical_device| {
                    shared.queue_family_properties(physical_device)
                })
            }
            GetPhysicalDeviceFeatures2::NAME => GetPhysicalDeviceFeatures2::callable(
                move |physical_device, features: &mut PhysicalDeviceFeatures2| {
                    shared.physical_device_features2(physical_device, features, false)
                },
            ),
            GetPhysicalDeviceFeatures2Khr::NAME => GetPhysicalDeviceFeatures2Khr::callable(
                move |physical_device, features: &mut PhysicalDeviceFeatures2| {
                    shared.physical_device_features2(physical_device, features, true)
                },
            ),
            GetPhysicalDeviceProperties2::NAME => GetPhysicalDeviceProperties2::callable(
                move |physical_device, properties: &mut PhysicalDeviceProperties2| {
                    shared.physical_device_properties2(physical_device, properties, false)
                },
            ),
            GetPhysicalDeviceProperties2Khr::NAME => GetPhysicalDeviceProperties2Khr::callable(
                move |physical_device, properties: &mut PhysicalDeviceProperties2| {
                    shared.physical_device_properties2(physical_device, properties, true)
                },
            ),
            EnumerateDeviceExtensionProperties::NAME => {
                EnumerateDeviceExtensionProperties::callable(move |physical_device| {
                    shared.device_extension_properties(physical_device)
                })
            }
            DestroyDevice::NAME => {
                DestroyDevice::callable(move |device| shared.destroy_device(device))
            }
            GetDeviceQueue::NAME => GetDeviceQueue::callable(move |device, family, index| {
                shared.get_device_queue(device, family, index)
            }),
            TrimCommandPool::NAME => {
                TrimCommandPool::callable(move |device, command_pool, flags| {
                    let tables = shared.device(device);
                    unsafe { (tables.v1_1.trim_command_pool)(device, command_pool, flags) };

                    Ok(())
                })
            }
            TrimCommandPoolKhr::NAME => {
                TrimCommandPoolKhr::callable(move |device, command_pool, flags| {
                    let tables = shared.device(device);
                    unsafe {
                        (tables.khr_maintenance1.trim_command_pool_khr)(device, command_pool, flags)
                    };

                    Ok(())
                })
            }
            QueueWaitIdle::NAME => QueueWaitIdle::callable(move |queue| {
                let tables = shared.queue(queue);
                unsafe { (tables.v1_0.queue_wait_idle)(queue) }
                    .result()
                    .map_err(VulkanError::from)
            }),
            // Instances and devices are created through the dedicated methods of `Driver`.
            _ => return None,
        };

        Some(callable)
    }
}

impl IcdShared {
    // Whether the driver has an implementation of `name`. Asked of any instance the driver
    // created, since some drivers only hand out instance-level entry points for a real instance.
    fn exposes(&self, name: &str) -> bool {
        let Ok(name) = CString::new(name) else {
            return false;
        };
        let instance = self
            .handles
            .lock()
            .instances
            .values()
            .next()
            .map_or(vk::Instance::null(), |tables| tables.handle);

        unsafe { (self.get_instance_proc_addr)(instance, name.as_ptr()) }.is_some()
    }

    fn instance(&self, instance: vk::Instance) -> Arc<InstanceTables> {
        match self.handles.lock().instances.get(&instance.as_raw()) {
            Some(tables) => tables.clone(),
            None => usage_violation!("driver received unknown instance {:#x}", instance.as_raw()),
        }
    }

    fn physical_device(&self, physical_device: vk::PhysicalDevice) -> Arc<InstanceTables> {
        match self
            .handles
            .lock()
            .physical_devices
            .get(&physical_device.as_raw())
        {
            Some(tables) => tables.clone(),
            None => usage_violation!(
                "driver received unknown physical device {:#x}",
                physical_device.as_raw(),
            ),
        }
    }

    fn device(&self, device: vk::Device) -> Arc<DeviceTables> {
        match self.handles.lock().devices.get(&device.as_raw()) {
            Some(tables) => tables.clone(),
            None => usage_violation!("driver received unknown device {:#x}", device.as_raw()),
        }
    }

    fn queue(&self, queue: vk::Queue) -> Arc<DeviceTables> {
        match self.handles.lock().queues.get(&queue.as_raw()) {
            Some(tables) => tables.clone(),
            None => usage_violation!("driver received unknown queue {:#x}", queue.as_raw()),
        }
    }

    fn destroy_instance(&self, instance: vk::Instance) {
        let tables = self.instance(instance);

        {
            let mut handles = self.handles.lock();
            handles.instances.remove(&instance.as_raw());
            handles
                .physical_devices
                .retain(|_, owner| !Arc::ptr_eq(owner, &tables));
        }

        unsafe { (tables.v1_0.destroy_instance)(instance, ptr::null()) };
    }

    fn enumerate_physical_devices(
        &self,
        instance: vk::Instance,
    ) -> Result<Vec<vk::PhysicalDevice>, VulkanError> {
        let tables = self.instance(instance);
        let physical_devices = unsafe {
            read_into_vec(|count, data| {
                (tables.v1_0.enumerate_physical_devices)(instance, count, data)
            })
        }?;

        let mut handles = self.handles.lock();

        for physical_device in &physical_devices {
            handles
                .physical_devices
                .insert(physical_device.as_raw(), tables.clone());
        }

        Ok(physical_devices)
    }

    fn queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        let tables = self.physical_device(physical_device);
        let func = tables.v1_0.get_physical_device_queue_family_properties;

        let mut count = 0;
        unsafe { func(physical_device, &mut count, ptr::null_mut()) };

        let mut output = Vec::with_capacity(count as usize);
        unsafe {
            func(physical_device, &mut count, output.as_mut_ptr());
            output.set_len(count as usize);
        }

        output
    }

    // Chained structures the driver doesn't know, by its version, are left for the terminator.
    fn physical_device_features2(
        &self,
        physical_device: vk::PhysicalDevice,
        features: &mut PhysicalDeviceFeatures2,
        khr: bool,
    ) -> Result<(), VulkanError> {
        let tables = self.physical_device(physical_device);
        let mut chain = OutputChain::new(&features.next, device_version(&tables, physical_device))?;
        let mut output = vk::PhysicalDeviceFeatures2::default();
        output.p_next = chain.head();

        unsafe {
            if khr {
                (tables
                    .khr_get_physical_device_properties2
                    .get_physical_device_features2_khr)(physical_device, &mut output)
            } else {
                (tables.v1_1.get_physical_device_features2)(physical_device, &mut output)
            }
        };

        features.features = output.features;
        chain.copy_back(&mut features.next);

        Ok(())
    }

    fn physical_device_properties2(
        &self,
        physical_device: vk::PhysicalDevice,
        properties: &mut PhysicalDeviceProperties2,
        khr: bool,
    ) -> Result<(), VulkanError> {
        let tables = self.physical_device(physical_device);
        let mut chain =
            OutputChain::new(&properties.next, device_version(&tables, physical_device))?;
        let mut output = vk::PhysicalDeviceProperties2::default();
        output.p_next = chain.head();

        unsafe {
            if khr {
                (tables
                    .khr_get_physical_device_properties2
                    .get_physical_device_properties2_khr)(physical_device, &mut output)
            } else {
                (tables.v1_1.get_physical_device_properties2)(physical_device, &mut output)
            }
        };

        properties.properties = output.properties;
        chain.copy_back(&mut properties.next);

        Ok(())
    }

    fn device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<ExtensionProperties>, VulkanError> {
        let tables = self.physical_device(physical_device);
        let properties = unsafe {
            read_into_vec(|count, data| {
                (tables.v1_0.enumerate_device_extension_properties)(
                    physical_device,
                    ptr::null(),
                    count,
                    data,
                )
            })
        }?;

        Ok(properties.into_iter().map(Into::into).collect())
    }

    fn destroy_device(&self, device: vk::Device) {
        let tables = self.device(device);

        {
            let mut handles = self.handles.lock();
            handles.devices.remove(&device.as_raw());
            handles.queues.retain(|_, owner| !Arc::ptr_eq(owner, &tables));
        }

        unsafe { (tables.v1_0.destroy_device)(device, ptr::null()) };
    }

    fn get_device_queue(&self, device: vk::Device, family: u32, index: u32) -> vk::Queue {
        let tables = self.device(device);
        let mut output = vk::Queue::null();
        unsafe { (tables.v1_0.get_device_queue)(device, family, index, &mut output) };

        self.handles
            .lock()
            .queues
            .insert(output.as_raw(), tables);

        output
    }
}

impl InstanceTables {
    unsafe fn load(
        get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
        handle: vk::Instance,
    ) -> Self {
        let load = move |name: &CStr| unsafe {
            transmute::<vk::PFN_vkVoidFunction, *const c_void>(get_instance_proc_addr(
                handle,
                name.as_ptr(),
            ))
        };

        InstanceTables {
            handle,
            v1_0: ash::InstanceFnV1_0::load(load),
            v1_1: ash::InstanceFnV1_1::load(load),
            khr_get_physical_device_properties2:
                ash::khr::get_physical_device_properties2::InstanceFn::load(load),
        }
    }
}

impl DeviceTables {
    unsafe fn load(instance: &InstanceTables, handle: vk::Device) -> Self {
        let get_device_proc_addr = instance.v1_0.get_device_proc_addr;
        let load = move |name: &CStr| unsafe {
            transmute::<vk::PFN_vkVoidFunction, *const c_void>(get_device_proc_addr(
                handle,
                name.as_ptr(),
            ))
        };

        DeviceTables {
            v1_0: ash::DeviceFnV1_0::load(load),
            v1_1: ash::DeviceFnV1_1::load(load),
            khr_maintenance1: ash::khr::maintenance1::DeviceFn::load(load),
        }
    }
}

fn device_version(tables: &InstanceTables, physical_device: vk::PhysicalDevice) -> Version {
    let mut properties = vk::PhysicalDeviceProperties::default();
    unsafe { (tables.v1_0.get_physical_device_properties)(physical_device, &mut properties) };

    Version::from(properties.api_version)
}

/// Native copies of the chained output structures of a `*2` query, linked through `pNext`.
///
/// Only structures still pending, and that the driver knows, are part of the chain.
struct OutputChain {
    // Index in the caller's chain, native structure, and its size in bytes. The structures are
    // stored as `u64`s to be aligned like any of them.
    structs: SmallVec<[(usize, Vec<u64>, usize); 4]>,
}

impl OutputChain {
    fn new(next: &[ChainedStruct], api_version: Version) -> Result<Self, VulkanError> {
        let mut structs: SmallVec<[(usize, Vec<u64>, usize); 4]> = SmallVec::new();

        for (index, chained) in next.iter().enumerate() {
            if chained.state() != ChainedState::Pending {
                continue;
            }

            let Some(size) = native_struct_size(chained.s_type(), api_version) else {
                continue;
            };

            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size.div_ceil(size_of::<u64>()))
                .map_err(|_| VulkanError::OutOfHostMemory)?;
            buffer.resize(size.div_ceil(size_of::<u64>()), 0);
            structs.push((index, buffer, size));
        }

        // Link from the last structure to the first. Moving a `Vec` doesn't move its contents.
        let mut p_next: *mut vk::BaseOutStructure<'static> = ptr::null_mut();

        for (index, buffer, _) in structs.iter_mut().rev() {
            let header = buffer.as_mut_ptr().cast::<vk::BaseOutStructure<'static>>();

            unsafe { addr_of_mut!((*header).s_type).write(next[*index].s_type()) };
            unsafe { addr_of_mut!((*header).p_next).write(p_next) };
            p_next = header;
        }

        Ok(OutputChain { structs })
    }

    fn head(&mut self) -> *mut c_void {
        self.structs
            .first_mut()
            .map_or(ptr::null_mut(), |(_, buffer, _)| buffer.as_mut_ptr().cast())
    }

    // Every structure in the chain is one the driver knows, and was filled in.
    fn copy_back(self, next: &mut [ChainedStruct]) {
        let header_size = size_of::<vk::BaseOutStructure<'static>>();

        for (index, buffer, size) in &self.structs {
            let bytes: &[u8] = cast_slice(buffer.as_slice());
            next[*index].write_bytes(&bytes[header_size..*size]);
        }
    }
}

// Calls an enumeration function until it returns everything at once.
unsafe fn read_into_vec<T>(
    mut func: impl FnMut(*mut u32, *mut T) -> vk::Result,
) -> Result<Vec<T>, VulkanError> {
    loop {
        let mut count = 0;
        func(&mut count, ptr::null_mut())
            .result()
            .map_err(VulkanError::from)?;

        let mut output = Vec::new();
        output
            .try_reserve_exact(count as usize)
            .map_err(|_| VulkanError::OutOfHostMemory)?;

        match func(&mut count, output.as_mut_ptr()) {
            vk::Result::SUCCESS => {
                unsafe { output.set_len(count as usize) };
                return Ok(output);
            }
            vk::Result::INCOMPLETE => (),
            err => return Err(VulkanError::from(err)),
        }
    }
}

fn to_c_strings<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<CString>, VulkanError> {
    names
        .map(|name| CString::new(name).map_err(|_| VulkanError::ExtensionNotPresent))
        .collect()
}

/// Error that can happen when loading a driver library.
#[derive(Debug)]
pub enum LoadingError {
    /// Failed to load the shared library.
    LibraryLoadFailure(LibloadingError),

    /// The library doesn't export an entry point every driver must export.
    MissingEntryPoint(String),

    /// The driver returned an error and was unable to complete the operation.
    VulkanError(VulkanError),
}

impl Error for LoadingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::LibraryLoadFailure(err) => Some(err),
            Self::VulkanError(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for LoadingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::LibraryLoadFailure(_) => write!(f, "failed to load the driver shared library"),
            Self::MissingEntryPoint(name) => {
                write!(f, "the driver library does not export `{name}`")
            }
            Self::VulkanError(err) => write!(f, "a runtime error occurred: {err}"),
        }
    }
}

impl From<VulkanError> for LoadingError {
    fn from(err: VulkanError) -> Self {
        Self::VulkanError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{IcdLibrary, LoadingError, OutputChain};
    use crate::{
        device::physical::{ChainedState, ChainedStruct},
        Version, VulkanError,
    };
    use ash::vk;
    use std::error::Error;

    #[test]
    fn dl_open_error() {
        match unsafe { IcdLibrary::new("_non_existing_driver.void") } {
            Err(LoadingError::LibraryLoadFailure(_)) => (),
            _ => panic!(),
        }
    }

    #[test]
    fn runtime_errors_keep_their_source() {
        let err = LoadingError::from(VulkanError::IncompatibleDriver);

        assert!(err.source().is_some());
        assert!(err.to_string().contains("runtime error"));
    }

    #[test]
    fn output_chain_links_what_the_driver_knows() {
        let mut next = vec![
            ChainedStruct::new(vk::StructureType::PHYSICAL_DEVICE_PROTECTED_MEMORY_FEATURES),
            ChainedStruct::new(vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES),
            ChainedStruct::new(vk::StructureType::PHYSICAL_DEVICE_ID_PROPERTIES),
            ChainedStruct::new(vk::StructureType::APPLICATION_INFO),
        ];
        // Already written by a layer.
        next[2].write(&42u32);

        // A 1.1 driver doesn't know the 1.2 structure.
        let mut chain = OutputChain::new(&next, Version::V1_1).unwrap();
        let head = chain.head().cast::<vk::BaseOutStructure<'static>>();

        // What the driver does with the chain.
        unsafe {
            assert_eq!(
                (*head).s_type,
                vk::StructureType::PHYSICAL_DEVICE_PROTECTED_MEMORY_FEATURES,
            );
            assert!((*head).p_next.is_null());
            (*head.cast::<vk::PhysicalDeviceProtectedMemoryFeatures<'static>>()).protected_memory =
                vk::TRUE;
        }

        chain.copy_back(&mut next);

        assert_eq!(next[0].read::<vk::Bool32>(), Some(vk::TRUE));
        assert_eq!(next[1].state(), ChainedState::Pending);
        assert_eq!(next[2].read::<u32>(), Some(42));
        assert_eq!(next[3].state(), ChainedState::Pending);
    }

    #[test]
    fn empty_output_chain() {
        let mut chain = OutputChain::new(&[], Version::V1_3).unwrap();

        assert!(chain.head().is_null());
    }
}
