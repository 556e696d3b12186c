// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Dispatch resolution and call chaining for layered Vulkan-style APIs.
//!
//! A single entry point ("give me the function for this name") is resolved at runtime to the
//! right concrete function among zero or more *layers* spliced into a call chain and one or more
//! underlying *drivers*, while honoring API-version and extension gating.
//!
//! # Brief summary
//!
//! - The [`Loader`](crate::loader::Loader) holds the drivers and layers handed to it by whatever
//!   discovered them, negotiates an interface version with each of them once, and tracks the
//!   instances that are alive. There is a process-wide loader available through
//!   [`Loader::global`](crate::loader::Loader::global).
//!
//! - An [`Instance`](crate::instance::Instance) is created through a chain of the requested
//!   layers ending in the instance *terminator*, which talks to every driver. Once created, the
//!   instance owns a read-only [`DispatchTable`](crate::dispatch::DispatchTable) in which every
//!   known command has been resolved exactly once.
//!
//! - [`PhysicalDevice`](crate::device::physical::PhysicalDevice)s are enumerated from an
//!   instance and keep a stable identity across enumerations.
//!
//! - A [`Device`](crate::device::Device) is created from a physical device through the chain of
//!   device-scoped layers, and owns its own dispatch table.
//!
//! - Every object hands out an opaque handle. The functions of the
//!   [`trampoline`](crate::trampoline) module take such handles, check them, find the dispatch
//!   table they belong to and forward the call down the chain. A handle that fails the check
//!   aborts the process.

pub use crate::{
    extensions::{ExtensionProperties, Extensions},
    loader::Loader,
    version::Version,
};
pub use ash::vk::Handle;
use ash::vk;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    ops::Deref,
    sync::Arc,
};

mod macros;

pub mod capability;
pub mod chain;
pub mod command;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod extensions;
pub mod handle;
pub mod instance;
pub mod loader;
pub mod terminator;
pub mod trampoline;
mod version;

/// Alternative to the `Deref` trait. Contrary to `Deref`, must always return the same object.
pub unsafe trait SafeDeref: Deref {}
unsafe impl<T: ?Sized> SafeDeref for &T {}
unsafe impl<T: ?Sized> SafeDeref for Arc<T> {}
unsafe impl<T: ?Sized> SafeDeref for Box<T> {}

/// Gives access to the opaque handle of an object.
///
/// The handle can be passed to the functions of the [`trampoline`] module.
pub unsafe trait VulkanObject {
    /// The type of the handle.
    type Handle: Handle;

    /// Returns the opaque handle of the object.
    fn handle(&self) -> Self::Handle;
}

unsafe impl<T> VulkanObject for T
where
    T: SafeDeref,
    T::Target: VulkanObject,
{
    type Handle = <T::Target as VulkanObject>::Handle;

    #[inline]
    fn handle(&self) -> Self::Handle {
        (**self).handle()
    }
}

/// Error type returned by the loader, the layers and the drivers.
///
/// Errors reported by a layer or driver are propagated up the chain unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    LayerNotPresent,
    ExtensionNotPresent,
    FeatureNotPresent,
    IncompatibleDriver,
    TooManyObjects,
    Unknown,
    /// An error code that has no variant of its own.
    Unnamed(vk::Result),
}

impl From<vk::Result> for VulkanError {
    fn from(val: vk::Result) -> Self {
        match val {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_LAYER_NOT_PRESENT => Self::LayerNotPresent,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => Self::ExtensionNotPresent,
            vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureNotPresent,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::IncompatibleDriver,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_UNKNOWN => Self::Unknown,
            _ => Self::Unnamed(val),
        }
    }
}

impl From<VulkanError> for vk::Result {
    fn from(val: VulkanError) -> Self {
        match val {
            VulkanError::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            VulkanError::OutOfDeviceMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            VulkanError::InitializationFailed => vk::Result::ERROR_INITIALIZATION_FAILED,
            VulkanError::DeviceLost => vk::Result::ERROR_DEVICE_LOST,
            VulkanError::LayerNotPresent => vk::Result::ERROR_LAYER_NOT_PRESENT,
            VulkanError::ExtensionNotPresent => vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            VulkanError::FeatureNotPresent => vk::Result::ERROR_FEATURE_NOT_PRESENT,
            VulkanError::IncompatibleDriver => vk::Result::ERROR_INCOMPATIBLE_DRIVER,
            VulkanError::TooManyObjects => vk::Result::ERROR_TOO_MANY_OBJECTS,
            VulkanError::Unknown => vk::Result::ERROR_UNKNOWN,
            VulkanError::Unnamed(result) => result,
        }
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            VulkanError::OutOfDeviceMemory => write!(f, "A device memory allocation has failed."),
            VulkanError::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific \
                reasons.",
            ),
            VulkanError::DeviceLost => write!(f, "The logical or physical device has been lost."),
            VulkanError::LayerNotPresent => write!(
                f,
                "A requested layer is not present or could not be loaded.",
            ),
            VulkanError::ExtensionNotPresent => {
                write!(f, "A requested extension is not supported.")
            }
            VulkanError::FeatureNotPresent => write!(f, "A requested feature is not supported."),
            VulkanError::IncompatibleDriver => write!(
                f,
                "The requested version of Vulkan is not supported by the driver or is otherwise \
                incompatible for implementation-specific reasons.",
            ),
            VulkanError::TooManyObjects => write!(
                f,
                "Too many objects of the type have already been created.",
            ),
            VulkanError::Unknown => write!(
                f,
                "An unknown error has occurred; either the application has provided invalid \
                input, or an implementation failure has occurred.",
            ),
            VulkanError::Unnamed(result) => {
                write!(f, "Unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

#[cfg(test)]
mod error_tests {
    use super::VulkanError;
    use ash::vk;

    #[test]
    fn result_round_trip_keeps_unnamed_codes() {
        let err = VulkanError::from(vk::Result::ERROR_FRAGMENTED_POOL);
        assert_eq!(err, VulkanError::Unnamed(vk::Result::ERROR_FRAGMENTED_POOL));
        assert_eq!(vk::Result::from(err), vk::Result::ERROR_FRAGMENTED_POOL);
    }

    #[test]
    fn named_codes_map_to_variants() {
        assert_eq!(
            VulkanError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            VulkanError::InitializationFailed,
        );
        assert_eq!(
            vk::Result::from(VulkanError::LayerNotPresent),
            vk::Result::ERROR_LAYER_NOT_PRESENT,
        );
    }
}
