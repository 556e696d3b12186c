// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The last link of every chain, which talks to the drivers.
//!
//! The instance terminator creates one driver-side instance per driver, and hands out its own
//! physical device handles. Each one is the address of a record naming the driver that owns the
//! physical device, so that finding the driver takes no lock. The device
//! terminator creates the device on the driver that owns the physical device, and forwards every
//! other device-level command straight to that driver.
//!
//! Where a command exists in several forms, the terminator picks the form the driver actually
//! supports. When the driver supports none:
//!
//! - `vkGetPhysicalDeviceFeatures2` and `vkGetPhysicalDeviceProperties2` are emulated with their
//!   1.0 counterparts. The emulation can't fill in chained output structures: those that no
//!   layer wrote on the way down are marked as ignored, with a warning.
//! - `vkTrimCommandPool` has no emulation and returns [`VulkanError::InitializationFailed`].

use crate::{
    capability::{
        CapabilityRegistry, Resolution, VersionedCommand, GET_PHYSICAL_DEVICE_FEATURES_2,
        GET_PHYSICAL_DEVICE_PROPERTIES_2, KHR_MAINTENANCE_1, TRIM_COMMAND_POOL,
    },
    command::{
        command_scope, Callable, Command, CommandScope, CreateDevice, CreateInstance,
        DestroyDevice, DestroyInstance, EnumerateDeviceExtensionProperties,
        EnumeratePhysicalDevices, GetPhysicalDeviceFeatures, GetPhysicalDeviceFeatures2,
        GetPhysicalDeviceFeatures2Khr, GetPhysicalDeviceProperties, GetPhysicalDeviceProperties2,
        GetPhysicalDeviceProperties2Khr, GetPhysicalDeviceQueueFamilyProperties,
        TrimCommandPool, TrimCommandPoolKhr, KNOWN_COMMANDS,
    },
    device::{
        physical::{PhysicalDeviceFeatures2, PhysicalDeviceProperties2},
        DeviceCreateInfo,
    },
    dispatch::{Link, NextLink},
    driver::Driver,
    instance::InstanceCreateInfo,
    macros::usage_violation,
    ExtensionProperties, Extensions, Version, VulkanError,
};
use ash::vk::{self, Handle};
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt::{Debug, Error as FmtError, Formatter},
    mem::align_of,
    ptr::{self, addr_of},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

type DriverProcs = Arc<HashMap<&'static str, Callable, RandomState>>;

/// The instance as the terminator sees it: one driver-side instance per driver.
pub struct TerminatorInstance {
    handle: vk::Instance,
    drivers: SmallVec<[DriverInstance; 2]>,
    physical_devices: Mutex<PhysicalDeviceOwners>,
    destroyed: AtomicBool,
}

struct DriverInstance {
    driver: Arc<dyn Driver>,
    instance: vk::Instance,
    // The version up to which core commands can be called on the driver.
    api_version: Version,
    enabled_extensions: Extensions,
    procs: DriverProcs,
}

/// Tag stored at the start of every live physical device record.
const PHYSICAL_DEVICE_MAGIC: u64 = 0x0FD0_C0DE;

// A physical device handle of the terminator is the address of one of these. Records are only
// created during enumeration, and live as long as the instance.
#[repr(C)]
struct PhysicalDeviceOwner {
    magic: u64,
    instance: vk::Instance,
    driver_index: usize,
    driver_handle: vk::PhysicalDevice,
}

impl Drop for PhysicalDeviceOwner {
    fn drop(&mut self) {
        unsafe { ptr::write_volatile(&mut self.magic, 0) };
    }
}

#[derive(Default)]
struct PhysicalDeviceOwners {
    // Keyed by (driver index, driver handle).
    owners: HashMap<(usize, u64), Box<PhysicalDeviceOwner>, RandomState>,
}

impl TerminatorInstance {
    fn create(
        registry: &CapabilityRegistry,
        drivers: &[Arc<dyn Driver>],
        create_info: &InstanceCreateInfo,
    ) -> Result<Self, VulkanError> {
        let mut created: SmallVec<[DriverInstance; 2]> = SmallVec::new();

        for driver in drivers {
            match DriverInstance::create(driver, registry, create_info) {
                Ok(driver_instance) => created.push(driver_instance),
                Err(VulkanError::IncompatibleDriver) => {
                    log::info!("driver {} is incompatible and was skipped", driver.name());
                }
                Err(err) => {
                    log::warn!("driver {} failed to create an instance: {}", driver.name(), err);

                    for driver_instance in created.iter().rev() {
                        driver_instance.destroy();
                    }

                    return Err(err);
                }
            }
        }

        if created.is_empty() {
            log::error!("no driver could create an instance");
            return Err(VulkanError::IncompatibleDriver);
        }

        Ok(TerminatorInstance {
            handle: vk::Instance::from_raw(next_handle()),
            drivers: created,
            physical_devices: Mutex::new(PhysicalDeviceOwners::default()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Returns the handle the terminator returned from `vkCreateInstance`.
    #[inline]
    pub fn handle(&self) -> vk::Instance {
        self.handle
    }

    /// Returns the number of drivers that have an instance.
    #[inline]
    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Destroys every driver-side instance, in reverse order of creation. Only the first call
    /// does anything.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        for driver_instance in self.drivers.iter().rev() {
            driver_instance.destroy();
        }
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, VulkanError> {
        let mut output = Vec::new();
        let mut physical_devices = self.physical_devices.lock();

        for (index, driver_instance) in self.drivers.iter().enumerate() {
            let Some(enumerate) = driver_instance.proc::<EnumeratePhysicalDevices>() else {
                log::warn!(
                    "driver {} has no vkEnumeratePhysicalDevices",
                    driver_instance.driver.name(),
                );
                continue;
            };

            let driver_handles = enumerate(driver_instance.instance)?;
            output
                .try_reserve(driver_handles.len())
                .map_err(|_| VulkanError::OutOfHostMemory)?;

            for driver_handle in driver_handles {
                output.push(physical_devices.get_or_insert(self.handle, index, driver_handle));
            }
        }

        Ok(output)
    }

    // Aborts if the handle wasn't enumerated from this instance. Takes no lock.
    fn owner(&self, physical_device: vk::PhysicalDevice) -> (&DriverInstance, vk::PhysicalDevice) {
        let address = physical_device.as_raw();

        if address == 0 || address % align_of::<PhysicalDeviceOwner>() as u64 != 0 {
            usage_violation!(
                "physical device {:#x} is not a handle of the terminator",
                address,
            );
        }

        // The links above the terminator only forward handles it handed out.
        let record = address as usize as *const PhysicalDeviceOwner;
        let magic = unsafe { addr_of!((*record).magic).read() };

        if magic != PHYSICAL_DEVICE_MAGIC {
            usage_violation!(
                "physical device {:#x} was not enumerated by the loader, or its instance was \
                destroyed",
                address,
            );
        }

        let record = unsafe { &*record };

        match self.drivers.get(record.driver_index) {
            Some(driver_instance) if record.instance == self.handle => {
                (driver_instance, record.driver_handle)
            }
            _ => usage_violation!(
                "physical device {:#x} was not enumerated from instance {:#x}",
                address,
                self.handle.as_raw(),
            ),
        }
    }

    fn physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        let (driver_instance, driver_handle) = self.owner(physical_device);

        match driver_instance.proc::<GetPhysicalDeviceProperties>() {
            Some(get) => get(driver_handle),
            None => {
                log::error!(
                    "driver {} has no vkGetPhysicalDeviceProperties",
                    driver_instance.driver.name(),
                );
                vk::PhysicalDeviceProperties::default()
            }
        }
    }

    fn physical_device_features(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceFeatures {
        let (driver_instance, driver_handle) = self.owner(physical_device);

        match driver_instance.proc::<GetPhysicalDeviceFeatures>() {
            Some(get) => get(driver_handle),
            None => {
                log::error!(
                    "driver {} has no vkGetPhysicalDeviceFeatures",
                    driver_instance.driver.name(),
                );
                vk::PhysicalDeviceFeatures::default()
            }
        }
    }

    fn queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        let (driver_instance, driver_handle) = self.owner(physical_device);

        match driver_instance.proc::<GetPhysicalDeviceQueueFamilyProperties>() {
            Some(get) => get(driver_handle),
            None => {
                log::error!(
                    "driver {} has no vkGetPhysicalDeviceQueueFamilyProperties",
                    driver_instance.driver.name(),
                );
                Vec::new()
            }
        }
    }

    fn physical_device_features2(
        &self,
        physical_device: vk::PhysicalDevice,
        features: &mut PhysicalDeviceFeatures2,
    ) -> Result<(), VulkanError> {
        let (driver_instance, driver_handle) = self.owner(physical_device);

        match driver_instance
            .select::<GetPhysicalDeviceFeatures2, GetPhysicalDeviceFeatures2Khr>(
                &GET_PHYSICAL_DEVICE_FEATURES_2,
            ) {
            Some(get) => get(driver_handle, features)?,
            None => {
                log::debug!(
                    "emulating vkGetPhysicalDeviceFeatures2 on driver {}",
                    driver_instance.driver.name(),
                );
                let get = driver_instance
                    .proc::<GetPhysicalDeviceFeatures>()
                    .ok_or(VulkanError::InitializationFailed)?;
                features.features = get(driver_handle);
            }
        }

        features.ignore_unwritten(GetPhysicalDeviceFeatures2::NAME);

        Ok(())
    }

    fn physical_device_properties2(
        &self,
        physical_device: vk::PhysicalDevice,
        properties: &mut PhysicalDeviceProperties2,
    ) -> Result<(), VulkanError> {
        let (driver_instance, driver_handle) = self.owner(physical_device);

        match driver_instance
            .select::<GetPhysicalDeviceProperties2, GetPhysicalDeviceProperties2Khr>(
                &GET_PHYSICAL_DEVICE_PROPERTIES_2,
            ) {
            Some(get) => get(driver_handle, properties)?,
            None => {
                log::debug!(
                    "emulating vkGetPhysicalDeviceProperties2 on driver {}",
                    driver_instance.driver.name(),
                );
                let get = driver_instance
                    .proc::<GetPhysicalDeviceProperties>()
                    .ok_or(VulkanError::InitializationFailed)?;
                properties.properties = get(driver_handle);
            }
        }

        properties.ignore_unwritten(GetPhysicalDeviceProperties2::NAME);

        Ok(())
    }

    fn device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<ExtensionProperties>, VulkanError> {
        let (driver_instance, driver_handle) = self.owner(physical_device);

        let enumerate = driver_instance
            .proc::<EnumerateDeviceExtensionProperties>()
            .ok_or(VulkanError::InitializationFailed)?;

        enumerate(driver_handle)
    }
}

impl Drop for TerminatorInstance {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Debug for TerminatorInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("TerminatorInstance")
            .field("handle", &self.handle)
            .field("drivers", &self.drivers.len())
            .finish_non_exhaustive()
    }
}

impl DriverInstance {
    fn create(
        driver: &Arc<dyn Driver>,
        registry: &CapabilityRegistry,
        create_info: &InstanceCreateInfo,
    ) -> Result<Self, VulkanError> {
        let supported: Extensions = match driver.instance_extension_properties() {
            Ok(properties) => properties.iter().collect(),
            Err(err) => {
                log::warn!(
                    "driver {} failed to report its instance extensions: {}",
                    driver.name(),
                    err,
                );
                Extensions::empty()
            }
        };

        // Extensions implemented by layers, or by another driver, are not passed down.
        let enabled_extensions = create_info.enabled_extensions.intersection(&supported);
        let driver_create_info = InstanceCreateInfo {
            enabled_layers: Vec::new(),
            enabled_extensions: enabled_extensions.clone(),
            ..create_info.clone()
        };

        let instance = driver.create_instance(&driver_create_info)?;

        let procs = match driver_procs(&**driver) {
            Ok(procs) => procs,
            Err(err) => {
                if let Some(destroy) = driver
                    .get_proc_addr(DestroyInstance::NAME)
                    .as_ref()
                    .and_then(Callable::get::<DestroyInstance>)
                {
                    destroy(instance);
                }

                return Err(err);
            }
        };

        let api_version = driver.api_version().min(registry.api_version());

        log::debug!(
            "driver {} created an instance (Vulkan {}, extensions {:?})",
            driver.name(),
            api_version,
            enabled_extensions,
        );

        Ok(DriverInstance {
            driver: driver.clone(),
            instance,
            api_version,
            enabled_extensions,
            procs,
        })
    }

    #[inline]
    fn proc<C: Command>(&self) -> Option<&Arc<C::Pfn>> {
        proc::<C>(&self.procs)
    }

    // Picks the form of a versioned command the driver supports.
    fn select<Core, Ext>(&self, command: &VersionedCommand) -> Option<&Arc<Core::Pfn>>
    where
        Core: Command,
        Ext: Command<Pfn = Core::Pfn>,
    {
        let core = if self.api_version >= command.core_version {
            self.proc::<Core>()
        } else {
            None
        };

        core.or_else(|| {
            if self.enabled_extensions.contains(command.extension) {
                self.proc::<Ext>()
            } else {
                None
            }
        })
    }

    fn destroy(&self) {
        match self.proc::<DestroyInstance>() {
            Some(destroy) => destroy(self.instance),
            None => log::warn!(
                "driver {} has no vkDestroyInstance, its instance is leaked",
                self.driver.name(),
            ),
        }
    }
}

impl PhysicalDeviceOwners {
    // The same driver handle always maps to the same terminator handle.
    fn get_or_insert(
        &mut self,
        instance: vk::Instance,
        driver_index: usize,
        driver_handle: vk::PhysicalDevice,
    ) -> vk::PhysicalDevice {
        let record = self
            .owners
            .entry((driver_index, driver_handle.as_raw()))
            .or_insert_with(|| {
                Box::new(PhysicalDeviceOwner {
                    magic: PHYSICAL_DEVICE_MAGIC,
                    instance,
                    driver_index,
                    driver_handle,
                })
            });

        vk::PhysicalDevice::from_raw(ptr::from_ref::<PhysicalDeviceOwner>(record) as usize as u64)
    }
}

/// The link at the end of an instance chain.
pub(crate) struct InstanceTerminator {
    drivers: Vec<Arc<dyn Driver>>,
    registry: Arc<CapabilityRegistry>,
    created: Arc<OnceLock<Arc<TerminatorInstance>>>,
}

impl InstanceTerminator {
    pub(crate) fn new(
        drivers: &[Arc<dyn Driver>],
        registry: Arc<CapabilityRegistry>,
        created: Arc<OnceLock<Arc<TerminatorInstance>>>,
    ) -> Self {
        InstanceTerminator {
            drivers: drivers.to_vec(),
            registry,
            created,
        }
    }
}

fn created_instance(created: &OnceLock<Arc<TerminatorInstance>>) -> &TerminatorInstance {
    match created.get() {
        Some(instance) => instance,
        None => usage_violation!("an instance command was called before the instance was created"),
    }
}

fn checked_instance(
    created: &OnceLock<Arc<TerminatorInstance>>,
    instance: vk::Instance,
) -> &TerminatorInstance {
    let terminator = created_instance(created);

    if terminator.handle != instance {
        usage_violation!(
            "instance {:#x} was passed to the terminator of instance {:#x}",
            instance.as_raw(),
            terminator.handle.as_raw(),
        );
    }

    terminator
}

impl Link for InstanceTerminator {
    fn proc_addr(&self, name: &str, _next: &NextLink<'_>) -> Option<Callable> {
        let created = self.created.clone();

        let callable = match name {
            CreateInstance::NAME => {
                let drivers = self.drivers.clone();
                let registry = self.registry.clone();

                CreateInstance::callable(move |create_info, unwind| {
                    let terminator = Arc::new(TerminatorInstance::create(
                        &registry,
                        &drivers,
                        create_info,
                    )?);
                    let handle = terminator.handle;

                    if created.set(terminator.clone()).is_err() {
                        log::error!("vkCreateInstance reached the terminator twice");
                        terminator.destroy();
                        return Err(VulkanError::InitializationFailed);
                    }

                    unwind.push(move || terminator.destroy());

                    Ok(handle)
                })
            }
            DestroyInstance::NAME => DestroyInstance::callable(move |instance| {
                checked_instance(&created, instance).destroy();
            }),
            EnumeratePhysicalDevices::NAME => EnumeratePhysicalDevices::callable(move |instance| {
                checked_instance(&created, instance).enumerate_physical_devices()
            }),
            GetPhysicalDeviceProperties::NAME => {
                GetPhysicalDeviceProperties::callable(move |physical_device| {
                    created_instance(&created).physical_device_properties(physical_device)
                })
            }
            GetPhysicalDeviceFeatures::NAME => {
                GetPhysicalDeviceFeatures::callable(move |physical_device| {
                    created_instance(&created).physical_device_features(physical_device)
                })
            }
            GetPhysicalDeviceQueueFamilyProperties::NAME => {
                GetPhysicalDeviceQueueFamilyProperties::callable(move |physical_device| {
                    created_instance(&created).queue_family_properties(physical_device)
                })
            }
            GetPhysicalDeviceFeatures2::NAME => GetPhysicalDeviceFeatures2::callable(
                move |physical_device, features: &mut PhysicalDeviceFeatures2| {
                    created_instance(&created).physical_device_features2(physical_device, features)
                },
            ),
            GetPhysicalDeviceFeatures2Khr::NAME => GetPhysicalDeviceFeatures2Khr::callable(
                move |physical_device, features: &mut PhysicalDeviceFeatures2| {
                    created_instance(&created).physical_device_features2(physical_device, features)
                },
            ),
            GetPhysicalDeviceProperties2::NAME => GetPhysicalDeviceProperties2::callable(
                move |physical_device, properties: &mut PhysicalDeviceProperties2| {
                    created_instance(&created)
                        .physical_device_properties2(physical_device, properties)
                },
            ),
            GetPhysicalDeviceProperties2Khr::NAME => GetPhysicalDeviceProperties2Khr::callable(
                move |physical_device, properties: &mut PhysicalDeviceProperties2| {
                    created_instance(&created)
                        .physical_device_properties2(physical_device, properties)
                },
            ),
            EnumerateDeviceExtensionProperties::NAME => {
                EnumerateDeviceExtensionProperties::callable(move |physical_device| {
                    created_instance(&created).device_extension_properties(physical_device)
                })
            }
            _ => return None,
        };

        Some(callable)
    }
}

/// The device as the terminator sees it: a device of the driver that owns the physical device.
pub struct TerminatorDevice {
    handle: vk::Device,
    driver: Arc<dyn Driver>,
    registry: Arc<CapabilityRegistry>,
    enabled_extensions: Extensions,
    procs: DriverProcs,
    destroyed: AtomicBool,
}

impl TerminatorDevice {
    fn create(
        instance: &TerminatorInstance,
        physical_device: vk::PhysicalDevice,
        registry: Arc<CapabilityRegistry>,
        create_info: &DeviceCreateInfo,
    ) -> Result<Self, VulkanError> {
        let (driver_instance, driver_handle) = instance.owner(physical_device);

        let enumerate = driver_instance.proc::<EnumerateDeviceExtensionProperties>();
        let supported: Extensions = match enumerate {
            Some(enumerate) => match enumerate(driver_handle) {
                Ok(properties) => properties.iter().collect(),
                Err(err) => {
                    log::warn!(
                        "driver {} failed to report its device extensions: {}",
                        driver_instance.driver.name(),
                        err,
                    );
                    Extensions::empty()
                }
            },
            None => Extensions::empty(),
        };

        // Extensions implemented by layers are not passed down.
        let enabled_extensions = create_info.enabled_extensions.intersection(&supported);
        let driver_create_info = DeviceCreateInfo {
            enabled_extensions: enabled_extensions.clone(),
            ..create_info.clone()
        };

        let handle = driver_instance
            .driver
            .create_device(driver_handle, &driver_create_info)?;

        log::debug!(
            "driver {} created a device (Vulkan {}, extensions {:?})",
            driver_instance.driver.name(),
            registry.api_version(),
            enabled_extensions,
        );

        Ok(TerminatorDevice {
            handle,
            driver: driver_instance.driver.clone(),
            registry,
            enabled_extensions,
            procs: driver_instance.procs.clone(),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Returns the handle the terminator returned from `vkCreateDevice`, which is the driver's.
    #[inline]
    pub fn handle(&self) -> vk::Device {
        self.handle
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        match proc::<DestroyDevice>(&self.procs) {
            Some(destroy) => destroy(self.handle),
            None => log::warn!(
                "driver {} has no vkDestroyDevice, its device is leaked",
                self.driver.name(),
            ),
        }
    }

    fn trim_command_pool(
        &self,
        command_pool: vk::CommandPool,
        flags: vk::CommandPoolTrimFlags,
    ) -> Result<(), VulkanError> {
        let extension_form = || {
            if self.enabled_extensions.contains(KHR_MAINTENANCE_1) {
                proc::<TrimCommandPoolKhr>(&self.procs)
            } else {
                None
            }
        };

        let trim = match self.registry.resolve_versioned(TRIM_COMMAND_POOL.core) {
            Resolution::Core(_) => proc::<TrimCommandPool>(&self.procs).or_else(extension_form),
            Resolution::Extension(_) => extension_form(),
            Resolution::Unavailable => None,
        };

        match trim {
            Some(trim) => trim(self.handle, command_pool, flags),
            None => {
                log::warn!(
                    "driver {} supports no form of vkTrimCommandPool",
                    self.driver.name(),
                );
                Err(VulkanError::InitializationFailed)
            }
        }
    }
}

impl Debug for TerminatorDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("TerminatorDevice")
            .field("handle", &self.handle)
            .field("driver", &self.driver.name())
            .finish_non_exhaustive()
    }
}

impl Drop for TerminatorDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The link at the end of a device chain.
pub(crate) struct DeviceTerminator {
    instance: Arc<TerminatorInstance>,
    registry: Arc<CapabilityRegistry>,
    created: Arc<OnceLock<Arc<TerminatorDevice>>>,
}

impl DeviceTerminator {
    pub(crate) fn new(
        instance: Arc<TerminatorInstance>,
        registry: Arc<CapabilityRegistry>,
        created: Arc<OnceLock<Arc<TerminatorDevice>>>,
    ) -> Self {
        DeviceTerminator {
            instance,
            registry,
            created,
        }
    }
}

fn checked_device(
    created: &OnceLock<Arc<TerminatorDevice>>,
    device: vk::Device,
) -> &TerminatorDevice {
    match created.get() {
        Some(terminator) if terminator.handle == device => terminator,
        Some(terminator) => usage_violation!(
            "device {:#x} was passed to the terminator of device {:#x}",
            device.as_raw(),
            terminator.handle.as_raw(),
        ),
        None => usage_violation!("a device command was called before the device was created"),
    }
}

impl Link for DeviceTerminator {
    fn proc_addr(&self, name: &str, _next: &NextLink<'_>) -> Option<Callable> {
        let created = self.created.clone();

        let callable = match name {
            CreateDevice::NAME => {
                let instance = self.instance.clone();
                let registry = self.registry.clone();

                CreateDevice::callable(move |physical_device, create_info, unwind| {
                    let terminator = Arc::new(TerminatorDevice::create(
                        &instance,
                        physical_device,
                        registry.clone(),
                        create_info,
                    )?);
                    let handle = terminator.handle;

                    if created.set(terminator.clone()).is_err() {
                        log::error!("vkCreateDevice reached the terminator twice");
                        terminator.destroy();
                        return Err(VulkanError::InitializationFailed);
                    }

                    unwind.push(move || terminator.destroy());

                    Ok(handle)
                })
            }
            DestroyDevice::NAME => DestroyDevice::callable(move |device| {
                checked_device(&created, device).destroy();
            }),
            TrimCommandPool::NAME => TrimCommandPool::callable(move |device, command_pool, flags| {
                checked_device(&created, device).trim_command_pool(command_pool, flags)
            }),
            TrimCommandPoolKhr::NAME => {
                TrimCommandPoolKhr::callable(move |device, command_pool, flags| {
                    checked_device(&created, device).trim_command_pool(command_pool, flags)
                })
            }
            // Everything else goes straight to the driver, which gets its own handles.
            _ if command_scope(name) == Some(CommandScope::Device) => {
                let Some(terminator) = created.get() else {
                    log::debug!("{} was resolved before the device was created", name);
                    return None;
                };

                return terminator.procs.get(name).cloned();
            }
            _ => return None,
        };

        Some(callable)
    }
}

fn driver_procs(driver: &dyn Driver) -> Result<DriverProcs, VulkanError> {
    let mut procs = HashMap::with_hasher(RandomState::default());
    procs
        .try_reserve(KNOWN_COMMANDS.len())
        .map_err(|_| VulkanError::OutOfHostMemory)?;

    for &(name, scope) in KNOWN_COMMANDS {
        if scope == CommandScope::Global {
            continue;
        }

        if let Some(callable) = driver.get_proc_addr(name) {
            procs.insert(name, callable);
        }
    }

    Ok(Arc::new(procs))
}

#[inline]
fn proc<C: Command>(procs: &DriverProcs) -> Option<&Arc<C::Pfn>> {
    procs.get(C::NAME).and_then(Callable::get::<C>)
}

// Handles handed out by the terminators. Never zero.
fn next_handle() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0x1000);

    COUNTER.fetch_add(0x10, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use crate::{
        tests::{create_instance, MockDriver},
        Handle, Version,
    };
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn physical_device_records() {
        let instance = create_instance(
            vec![
                MockDriver::new("first").with_physical_devices(2),
                MockDriver::new("second"),
            ],
            vec![],
            Version::V1_0,
        );
        let terminator = instance.terminator();

        let first = terminator.enumerate_physical_devices().unwrap();
        let second = terminator.enumerate_physical_devices().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let (driver_instance, driver_handle) = terminator.owner(first[2]);
        assert_eq!(driver_instance.driver.name(), "second");
        assert_eq!(driver_handle.as_raw(), driver_instance.instance.as_raw() + 1);
    }

    #[test]
    fn physical_device_queries_take_no_lock() {
        let instance = create_instance(vec![MockDriver::new("mock")], vec![], Version::V1_0);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();

        // Held by enumeration only.
        let _owners = instance.terminator().physical_devices.lock();

        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let _ = sender.send(physical_device.features());
        });

        assert!(receiver.recv_timeout(Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn physical_device_of_another_instance_aborts() {
        assert_aborts!("physical_device_of_another_instance_aborts", {
            let first = create_instance(vec![MockDriver::new("first")], vec![], Version::V1_0);
            let second = create_instance(vec![MockDriver::new("second")], vec![], Version::V1_0);
            let foreign = second.terminator().enumerate_physical_devices().unwrap()[0];

            first.terminator().physical_device_features(foreign);
        });
    }
}
