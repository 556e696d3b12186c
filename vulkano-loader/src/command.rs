// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The entry points that flow through a chain.
//!
//! Every entry point is a zero-sized type implementing [`Command`], which ties its name to the
//! Rust signature of its implementations. Implementations are stored type-erased as
//! [`Callable`]s, so that a [`DispatchTable`](crate::dispatch::DispatchTable) is a plain map from
//! name to callable, and are recovered with [`Callable::get`].
//!
//! The handles passed to an implementation are the *real* handles of the link below the
//! loader's trampolines, never the opaque handles given to the application.

use crate::{
    chain::Unwind,
    device::{
        physical::{PhysicalDeviceFeatures2, PhysicalDeviceProperties2},
        DeviceCreateInfo,
    },
    instance::{layers::LayerProperties, InstanceCreateInfo},
    ExtensionProperties, Version, VulkanError,
};
use ash::vk;
use std::{
    any::Any,
    fmt::{Debug, Error as FmtError, Formatter},
    sync::Arc,
};

/// The kind of handle an entry point is dispatched on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandScope {
    /// Not dispatched on any handle.
    Global,
    /// Dispatched on an instance or a physical device.
    Instance,
    /// Dispatched on a device or a queue.
    Device,
}

/// A named entry point and the signature of its implementations.
pub trait Command: 'static {
    /// The name of the entry point, as it is looked up.
    const NAME: &'static str;

    /// The kind of handle the entry point is dispatched on.
    const SCOPE: CommandScope;

    /// The type of an implementation.
    type Pfn: ?Sized + Send + Sync + 'static;
}

/// A type-erased implementation of an entry point.
///
/// Cloning a `Callable` is cheap and preserves its identity, see [`Callable::ptr_eq`].
#[derive(Clone)]
pub struct Callable {
    name: &'static str,
    func: Arc<dyn Any + Send + Sync>,
}

impl Callable {
    /// Erases the type of an implementation of `C`.
    #[inline]
    pub fn new<C: Command>(func: Arc<C::Pfn>) -> Self {
        Callable {
            name: C::NAME,
            func: Arc::new(func),
        }
    }

    /// Returns the name of the entry point this implements.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Recovers the implementation, if this callable implements `C`.
    #[inline]
    pub fn get<C: Command>(&self) -> Option<&Arc<C::Pfn>> {
        if self.name != C::NAME {
            return None;
        }

        self.func.downcast_ref::<Arc<C::Pfn>>()
    }

    /// Returns whether both callables are the very same implementation.
    #[inline]
    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl Debug for Callable {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

macro_rules! commands {
    ($(
        $(#[doc = $doc:literal])*
        $ty:ident = $name:literal, $scope:ident, fn($($arg:ty),* $(,)?) -> $ret:ty;
    )+) => {
        $(
            $(#[doc = $doc])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
            pub struct $ty;

            impl Command for $ty {
                const NAME: &'static str = $name;
                const SCOPE: CommandScope = CommandScope::$scope;
                type Pfn = dyn Fn($($arg),*) -> $ret + Send + Sync;
            }

            impl $ty {
                #[doc = concat!("Wraps an implementation of `", $name, "` into a `Callable`.")]
                #[inline]
                pub fn callable(func: impl Fn($($arg),*) -> $ret + Send + Sync + 'static) -> Callable {
                    let func: Arc<dyn Fn($($arg),*) -> $ret + Send + Sync> = Arc::new(func);

                    Callable::new::<$ty>(func)
                }
            }
        )+

        /// Every entry point known to the loader, with its scope.
        pub const KNOWN_COMMANDS: &[(&str, CommandScope)] = &[
            $(($name, CommandScope::$scope),)+
        ];
    };
}

commands! {
    /// Returns the highest version supported for instances.
    EnumerateInstanceVersion = "vkEnumerateInstanceVersion", Global,
        fn() -> Version;

    /// Lists the instance extensions of the loader and its drivers, or of a single layer.
    EnumerateInstanceExtensionProperties = "vkEnumerateInstanceExtensionProperties", Global,
        fn(Option<&str>) -> Result<Vec<ExtensionProperties>, VulkanError>;

    /// Lists the layers that can be enabled.
    EnumerateInstanceLayerProperties = "vkEnumerateInstanceLayerProperties", Global,
        fn() -> Vec<LayerProperties>;

    /// Creates an instance. Each link registers the teardown of what it created in the `Unwind`.
    CreateInstance = "vkCreateInstance", Global,
        fn(&InstanceCreateInfo, &Unwind) -> Result<vk::Instance, VulkanError>;

    DestroyInstance = "vkDestroyInstance", Instance,
        fn(vk::Instance) -> ();

    EnumeratePhysicalDevices = "vkEnumeratePhysicalDevices", Instance,
        fn(vk::Instance) -> Result<Vec<vk::PhysicalDevice>, VulkanError>;

    GetPhysicalDeviceProperties = "vkGetPhysicalDeviceProperties", Instance,
        fn(vk::PhysicalDevice) -> vk::PhysicalDeviceProperties;

    GetPhysicalDeviceFeatures = "vkGetPhysicalDeviceFeatures", Instance,
        fn(vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures;

    GetPhysicalDeviceQueueFamilyProperties = "vkGetPhysicalDeviceQueueFamilyProperties", Instance,
        fn(vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;

    /// Core in 1.1.
    GetPhysicalDeviceFeatures2 = "vkGetPhysicalDeviceFeatures2", Instance,
        fn(vk::PhysicalDevice, &mut PhysicalDeviceFeatures2) -> Result<(), VulkanError>;

    /// Provided by `VK_KHR_get_physical_device_properties2`.
    GetPhysicalDeviceFeatures2Khr = "vkGetPhysicalDeviceFeatures2KHR", Instance,
        fn(vk::PhysicalDevice, &mut PhysicalDeviceFeatures2) -> Result<(), VulkanError>;

    /// Core in 1.1.
    GetPhysicalDeviceProperties2 = "vkGetPhysicalDeviceProperties2", Instance,
        fn(vk::PhysicalDevice, &mut PhysicalDeviceProperties2) -> Result<(), VulkanError>;

    /// Provided by `VK_KHR_get_physical_device_properties2`.
    GetPhysicalDeviceProperties2Khr = "vkGetPhysicalDeviceProperties2KHR", Instance,
        fn(vk::PhysicalDevice, &mut PhysicalDeviceProperties2) -> Result<(), VulkanError>;

    EnumerateDeviceExtensionProperties = "vkEnumerateDeviceExtensionProperties", Instance,
        fn(vk::PhysicalDevice) -> Result<Vec<ExtensionProperties>, VulkanError>;

    /// Creates a device. Each link registers the teardown of what it created in the `Unwind`.
    CreateDevice = "vkCreateDevice", Instance,
        fn(vk::PhysicalDevice, &DeviceCreateInfo, &Unwind) -> Result<vk::Device, VulkanError>;

    DestroyDevice = "vkDestroyDevice", Device,
        fn(vk::Device) -> ();

    GetDeviceQueue = "vkGetDeviceQueue", Device,
        fn(vk::Device, u32, u32) -> vk::Queue;

    /// Core in 1.1.
    TrimCommandPool = "vkTrimCommandPool", Device,
        fn(vk::Device, vk::CommandPool, vk::CommandPoolTrimFlags) -> Result<(), VulkanError>;

    /// Provided by `VK_KHR_maintenance1`.
    TrimCommandPoolKhr = "vkTrimCommandPoolKHR", Device,
        fn(vk::Device, vk::CommandPool, vk::CommandPoolTrimFlags) -> Result<(), VulkanError>;

    QueueWaitIdle = "vkQueueWaitIdle", Device,
        fn(vk::Queue) -> Result<(), VulkanError>;
}

/// Returns the scope of a known entry point.
pub fn command_scope(name: &str) -> Option<CommandScope> {
    KNOWN_COMMANDS
        .iter()
        .find(|&&(known, _)| known == name)
        .map(|&(_, scope)| scope)
}

#[cfg(test)]
mod tests {
    use super::{
        command_scope, Command, CommandScope, DestroyInstance, EnumeratePhysicalDevices,
        GetDeviceQueue,
    };
    use ash::vk::{self, Handle};

    #[test]
    fn callable_recovers_its_own_signature_only() {
        let callable = GetDeviceQueue::callable(|_device: vk::Device, family: u32, index: u32| {
            vk::Queue::from_raw(u64::from(family) << 32 | u64::from(index))
        });

        assert_eq!(callable.name(), "vkGetDeviceQueue");
        assert!(callable.get::<DestroyInstance>().is_none());

        let func = callable.get::<GetDeviceQueue>().unwrap();
        assert_eq!(func(vk::Device::null(), 1, 2).as_raw(), (1 << 32) | 2);
    }

    #[test]
    fn clones_share_identity() {
        let a = DestroyInstance::callable(|_: vk::Instance| ());
        let b = DestroyInstance::callable(|_: vk::Instance| ());

        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn scopes() {
        assert_eq!(
            command_scope(EnumeratePhysicalDevices::NAME),
            Some(CommandScope::Instance),
        );
        assert_eq!(command_scope("vkQueueWaitIdle"), Some(CommandScope::Device));
        assert_eq!(command_scope("vkCmdDraw"), None);
    }
}
