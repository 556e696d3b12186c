// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Drivers: the implementations that ultimately satisfy a call.
//!
//! A driver exposes a small set of entry points every driver must have, and looks up everything
//! else by name. An entry point a driver doesn't expose is absent, not an error: the terminators
//! use that absence to decide whether to pick another form of a command or to emulate it.
//!
//! Finding drivers on the system is not the business of this crate. Whoever discovered them
//! hands them to a [`Loader`](crate::Loader). [`IcdLibrary`] wraps a driver shared library whose
//! path is already known.

pub use self::icd::{IcdLibrary, LoadingError};
use crate::{
    command::Callable, device::DeviceCreateInfo, instance::InstanceCreateInfo,
    ExtensionProperties, Version, VulkanError,
};
use ash::vk;
use std::fmt::{Debug, Error as FmtError, Formatter};

mod icd;

/// The newest driver interface version the loader speaks.
pub const ICD_INTERFACE_VERSION: u32 = 7;

/// The oldest driver interface version the loader still accepts.
pub const MIN_ICD_INTERFACE_VERSION: u32 = 2;

/// Implemented on the drivers a loader can route calls to.
///
/// # Reentrancy
///
/// Creation, destruction and physical device enumeration call into drivers while holding the
/// loader's process-wide lock. Calling back into the loader from there (through
/// [`Loader::global`], [`Instance::new`] or [`Device::new`] for example) would need that lock
/// again, and aborts the process.
///
/// [`Loader::global`]: crate::loader::Loader::global
/// [`Instance::new`]: crate::instance::Instance::new
/// [`Device::new`]: crate::device::Device::new
pub trait Driver: Send + Sync {
    /// Returns a name for the driver, used in log messages.
    fn name(&self) -> &str;

    /// Returns the highest API version the driver supports.
    fn api_version(&self) -> Version;

    /// Agrees on an interface version. Called once, when the driver is handed to a loader.
    ///
    /// `loader_version` is the newest version the loader speaks. Returns the version the driver
    /// will use, which must not be newer.
    fn negotiate_interface_version(&self, loader_version: u32) -> Result<u32, VulkanError> {
        Ok(loader_version.min(ICD_INTERFACE_VERSION))
    }

    /// Returns the instance extensions the driver supports.
    fn instance_extension_properties(&self) -> Result<Vec<ExtensionProperties>, VulkanError>;

    /// Creates a driver-side instance.
    ///
    /// `create_info` only lists the extensions this driver supports, and no layers.
    fn create_instance(&self, create_info: &InstanceCreateInfo)
        -> Result<vk::Instance, VulkanError>;

    /// Creates a driver-side device on one of the driver's physical devices.
    ///
    /// `create_info` only lists the extensions this physical device supports.
    fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &DeviceCreateInfo,
    ) -> Result<vk::Device, VulkanError>;

    /// Looks up any other entry point of the driver. Implementations take the driver's own
    /// handles.
    fn get_proc_addr(&self, name: &str) -> Option<Callable>;
}

impl Debug for dyn Driver {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Driver")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
