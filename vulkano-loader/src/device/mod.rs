// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Communication channel with a physical device.
//!
//! A [`Device`] is created from a [`PhysicalDevice`] through the chain of the instance's layers
//! that take part in device chains, and owns a dispatch table of its own. The version of the
//! device is the lower of the version requested for the instance and the version of the physical
//! device; device-level commands introduced in a later version are not available on it, even
//! when the physical device supports them.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use vulkano_loader::device::physical::PhysicalDevice;
//! # let physical_device: Arc<PhysicalDevice> = return;
//! use vulkano_loader::device::{Device, DeviceCreateInfo, QueueCreateInfo};
//!
//! let (device, mut queues) = Device::new(
//!     physical_device,
//!     DeviceCreateInfo {
//!         queue_create_infos: vec![QueueCreateInfo {
//!             queue_family_index: 0,
//!             ..Default::default()
//!         }],
//!         ..Default::default()
//!     },
//! )
//! .unwrap();
//! let queue = queues.next().unwrap();
//! ```

use self::physical::PhysicalDevice;
use crate::{
    capability::CapabilityRegistry,
    chain::build_device_chain,
    command::{Callable, DestroyDevice},
    dispatch::DispatchTable,
    handle::{unwrap_ref, wrap, WrappedHandle},
    instance::Instance,
    loader,
    macros::impl_id_counter,
    terminator::TerminatorDevice,
    trampoline, Extensions, NonExhaustive, Version, VulkanError, VulkanObject,
};
use ash::vk;
use smallvec::SmallVec;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

pub mod physical;

/// Represents a Vulkan context.
pub struct Device {
    handle: WrappedHandle,
    physical_device: Arc<PhysicalDevice>,
    id: NonZero<u64>,

    api_version: Version,
    enabled_extensions: Extensions,
    registry: Arc<CapabilityRegistry>,
    dispatch: Arc<DispatchTable>,
    terminator: Arc<TerminatorDevice>,
}

impl Device {
    /// Creates a new `Device`, and returns the queues that were requested.
    ///
    /// Returns [`VulkanError::InitializationFailed`] if a queue family doesn't exist, is
    /// requested twice, or has fewer queues than requested.
    pub fn new(
        physical_device: Arc<PhysicalDevice>,
        create_info: DeviceCreateInfo,
    ) -> Result<(Arc<Device>, impl ExactSizeIterator<Item = Arc<Queue>>), VulkanError> {
        validate_queue_create_infos(&physical_device, &create_info.queue_create_infos)?;

        let instance = physical_device.instance();

        let chain = {
            let _state = loader::lock();
            let physical_device_raw = unsafe { unwrap_ref(physical_device.handle()) }.raw();

            build_device_chain(
                instance.layers(),
                instance.dispatch(),
                instance.terminator(),
                physical_device_raw,
                &create_info,
            )?
        };

        let handle = wrap(chain.raw, chain.dispatch.clone());

        let device = Arc::new(Device {
            handle,
            physical_device: physical_device.clone(),
            id: Self::next_id(),
            api_version: chain.registry.api_version(),
            enabled_extensions: chain.registry.enabled_extensions().clone(),
            registry: chain.registry,
            dispatch: chain.dispatch,
            terminator: chain.terminator,
        });

        let mut queues = Vec::new();

        for queue_create_info in &create_info.queue_create_infos {
            for queue_index in 0..queue_create_info.queues.len() as u32 {
                let handle = unsafe {
                    trampoline::get_device_queue(
                        device.handle(),
                        queue_create_info.queue_family_index,
                        queue_index,
                    )
                }?;

                queues.push(Arc::new(Queue {
                    handle,
                    device: device.clone(),
                    id: Queue::next_id(),
                    queue_family_index: queue_create_info.queue_family_index,
                    queue_index,
                }));
            }
        }

        Ok((device, queues.into_iter()))
    }

    /// Returns the physical device that was used to create this device.
    #[inline]
    pub fn physical_device(&self) -> &Arc<PhysicalDevice> {
        &self.physical_device
    }

    /// Returns the instance that owns the device.
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        self.physical_device.instance()
    }

    /// Returns the version up to which core device commands can be used.
    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    /// Returns the device extensions that ended up enabled.
    #[inline]
    pub fn enabled_extensions(&self) -> &Extensions {
        &self.enabled_extensions
    }

    #[inline]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Returns the device's dispatch table.
    #[inline]
    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    /// Returns the device-level entry point for `name`, taking opaque handles, or `None` if it
    /// isn't available on this device.
    #[inline]
    pub fn get_proc_addr(&self, name: &str) -> Option<Callable> {
        unsafe { trampoline::get_device_proc_addr(self.handle(), name) }
    }

    /// Returns a queue of the device, by family and index.
    ///
    /// Returns the same opaque handle as the corresponding [`Queue`] returned by
    /// [`Device::new`].
    #[inline]
    pub fn queue_handle(
        &self,
        queue_family_index: u32,
        queue_index: u32,
    ) -> Result<vk::Queue, VulkanError> {
        unsafe { trampoline::get_device_queue(self.handle(), queue_family_index, queue_index) }
    }

    /// Trims a command pool of the device.
    ///
    /// Uses `vkTrimCommandPool` on a 1.1 device, `vkTrimCommandPoolKHR` if
    /// `VK_KHR_maintenance1` is enabled, and returns [`VulkanError::InitializationFailed`]
    /// otherwise.
    ///
    /// # Safety
    ///
    /// - `command_pool` must be a command pool of the driver-side device.
    #[inline]
    pub unsafe fn trim_command_pool(
        &self,
        command_pool: vk::CommandPool,
        flags: vk::CommandPoolTrimFlags,
    ) -> Result<(), VulkanError> {
        unsafe { trampoline::trim_command_pool(self.handle(), command_pool, flags) }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _state = loader::lock();

        if let Some(destroy) = self.dispatch.command::<DestroyDevice>() {
            destroy(self.handle.get().raw());
        }

        log::debug!("destroyed {:?}", self.terminator);
    }
}

unsafe impl VulkanObject for Device {
    type Handle = vk::Device;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle.handle()
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("physical_device", &self.physical_device)
            .field("api_version", &self.api_version)
            .field("enabled_extensions", &self.enabled_extensions)
            .finish_non_exhaustive()
    }
}

impl_id_counter!(Device);

fn validate_queue_create_infos(
    physical_device: &PhysicalDevice,
    queue_create_infos: &[QueueCreateInfo],
) -> Result<(), VulkanError> {
    let queue_family_properties = physical_device.queue_family_properties();
    let mut seen: SmallVec<[u32; 4]> = SmallVec::new();

    for queue_create_info in queue_create_infos {
        let &QueueCreateInfo {
            queue_family_index,
            ref queues,
            _ne: _,
        } = queue_create_info;

        let Some(properties) = queue_family_properties.get(queue_family_index as usize) else {
            log::error!("queue family {} does not exist", queue_family_index);
            return Err(VulkanError::InitializationFailed);
        };

        if seen.contains(&queue_family_index) {
            log::error!("queue family {} was requested twice", queue_family_index);
            return Err(VulkanError::InitializationFailed);
        }

        if queues.is_empty() || queues.len() > properties.queue_count as usize {
            log::error!(
                "{} queues requested from family {}, which has {}",
                queues.len(),
                queue_family_index,
                properties.queue_count,
            );
            return Err(VulkanError::InitializationFailed);
        }

        seen.push(queue_family_index);
    }

    Ok(())
}

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The queues to create along with the device.
    ///
    /// The default value is empty.
    pub queue_create_infos: Vec<QueueCreateInfo>,

    /// The extensions to enable. Those that neither the physical device nor a device-scoped
    /// layer provides are dropped, with a warning.
    ///
    /// The default value is empty.
    pub enabled_extensions: Extensions,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            queue_create_infos: Vec::new(),
            enabled_extensions: Extensions::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Parameters to create queues in a new `Device`.
#[derive(Clone, Debug)]
pub struct QueueCreateInfo {
    /// The index of the queue family to create queues for.
    ///
    /// The default value is `0`.
    pub queue_family_index: u32,

    /// The queues to create for the given queue family, each with a relative priority.
    ///
    /// The default value is a single queue, with a priority of 0.5.
    pub queues: Vec<f32>,

    pub _ne: NonExhaustive,
}

impl Default for QueueCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            queue_family_index: 0,
            queues: vec![0.5],
            _ne: NonExhaustive(()),
        }
    }
}

/// Represents a queue where commands can be submitted.
pub struct Queue {
    handle: vk::Queue,
    device: Arc<Device>,
    id: NonZero<u64>,

    queue_family_index: u32,
    queue_index: u32,
}

impl Queue {
    /// Returns the device that this queue belongs to.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns the index of the queue family that this queue belongs to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Returns the index of this queue within its queue family.
    #[inline]
    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    /// Waits until all work on this queue has finished.
    #[inline]
    pub fn wait_idle(&self) -> Result<(), VulkanError> {
        unsafe { trampoline::queue_wait_idle(self.handle) }
    }
}

unsafe impl VulkanObject for Queue {
    type Handle = vk::Queue;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Debug for Queue {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("queue_family_index", &self.queue_family_index)
            .field("queue_index", &self.queue_index)
            .finish_non_exhaustive()
    }
}

impl_id_counter!(Queue);

#[cfg(test)]
mod tests {
    use super::{Device, DeviceCreateInfo, QueueCreateInfo};
    use crate::{
        tests::{MockDriver, RecordingLayer},
        Version, VulkanError, VulkanObject,
    };
    use ash::vk;
    use std::sync::Arc;

    #[test]
    fn create_and_destroy() {
        let driver = MockDriver::new("mock");
        let counters = driver.counters();
        let (device, queue) = device_and_queue!(driver);

        assert_eq!(counters.devices_created(), 1);
        assert_eq!(queue.queue_family_index(), 0);
        queue.wait_idle().unwrap();

        drop(queue);
        drop(device);
        assert_eq!(counters.devices_destroyed(), 1);
    }

    #[test]
    fn queues_keep_their_identity() {
        let (device, queue) = device_and_queue!(MockDriver::new("mock"));

        assert_eq!(device.queue_handle(0, 0).unwrap(), queue.handle());
        assert_eq!(device.queue_handle(0, 0).unwrap(), queue.handle());
        assert_ne!(device.queue_handle(0, 1).unwrap(), queue.handle());
    }

    #[test]
    fn invalid_queue_requests() {
        let instance = instance!(MockDriver::new("mock"));
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();

        for queue_create_infos in [
            vec![QueueCreateInfo {
                queue_family_index: 7,
                ..Default::default()
            }],
            vec![QueueCreateInfo::default(), QueueCreateInfo::default()],
            vec![QueueCreateInfo {
                queues: vec![0.5; 3],
                ..Default::default()
            }],
        ] {
            let result = Device::new(
                physical_device.clone(),
                DeviceCreateInfo {
                    queue_create_infos,
                    ..Default::default()
                },
            );
            assert_eq!(result.err(), Some(VulkanError::InitializationFailed));
        }
    }

    #[test]
    fn version_is_capped_by_the_instance() {
        let (device, _queue) = device_and_queue!(
            MockDriver::new("mock").with_api_version(Version::V1_3),
            Version::V1_0,
        );

        assert_eq!(device.physical_device().api_version(), Version::V1_3);
        assert_eq!(device.api_version(), Version::V1_0);
        assert_eq!(
            device.registry().parent().unwrap().api_version(),
            Version::V1_0,
        );
    }

    #[test]
    fn trim_without_any_form_fails() {
        let driver = MockDriver::new("mock")
            .with_api_version(Version::V1_1)
            .with_trim()
            .with_trim_khr()
            .with_device_extensions(&[("VK_KHR_maintenance1", 2)]);
        let (device, _queue) = device_and_queue!(driver, Version::V1_0);

        // A 1.0 device without VK_KHR_maintenance1.
        assert!(device.get_proc_addr("vkTrimCommandPool").is_none());
        assert!(device.get_proc_addr("vkTrimCommandPoolKHR").is_none());
        assert_eq!(
            unsafe { device.trim_command_pool(vk::CommandPool::null(), Default::default()) },
            Err(VulkanError::InitializationFailed),
        );
    }

    #[test]
    fn trim_uses_the_form_the_device_enabled() {
        let driver = MockDriver::new("mock")
            .with_api_version(Version::V1_1)
            .with_trim()
            .with_trim_khr()
            .with_device_extensions(&[("VK_KHR_maintenance1", 2)]);
        let calls = driver.call_log();
        let instance = instance!(driver);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
        let (device, _queues) = Device::new(
            physical_device,
            DeviceCreateInfo {
                queue_create_infos: vec![QueueCreateInfo::default()],
                enabled_extensions: ["VK_KHR_maintenance1"].into_iter().collect(),
                ..Default::default()
            },
        )
        .unwrap();

        // Version 1.0 instance, so the extension form is the one that's used.
        assert!(device.get_proc_addr("vkTrimCommandPool").is_none());
        assert!(device.get_proc_addr("vkTrimCommandPoolKHR").is_some());
        calls.take();
        unsafe { device.trim_command_pool(vk::CommandPool::null(), Default::default()) }.unwrap();
        assert_eq!(calls.take(), ["mock:vkTrimCommandPoolKHR"]);
    }

    #[test]
    fn trim_driver_without_any_form() {
        let (device, _queue) = device_and_queue!(
            MockDriver::new("mock").with_api_version(Version::V1_1),
            Version::V1_1,
        );

        // The device allows the core form, but the driver has neither.
        assert!(device.get_proc_addr("vkTrimCommandPool").is_some());
        assert_eq!(
            unsafe { device.trim_command_pool(vk::CommandPool::null(), Default::default()) },
            Err(VulkanError::InitializationFailed),
        );
    }

    #[test]
    fn device_layers_wrap_device_commands() {
        let driver = MockDriver::new("mock");
        let calls = driver.call_log();
        let layer = RecordingLayer::new("VK_LAYER_device")
            .device_scoped()
            .with_call_log(calls.clone());
        let instance_only = RecordingLayer::new("VK_LAYER_instance").with_call_log(calls.clone());
        let instance = instance!(driver; layer, instance_only);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
        calls.take();

        let (device, mut queues) = Device::new(
            physical_device,
            DeviceCreateInfo {
                queue_create_infos: vec![QueueCreateInfo::default()],
                ..Default::default()
            },
        )
        .unwrap();
        let queue = queues.next().unwrap();
        queue.wait_idle().unwrap();

        assert_eq!(
            calls.take(),
            [
                "VK_LAYER_device:vkCreateDevice",
                "mock:vkCreateDevice",
                "VK_LAYER_device:vkQueueWaitIdle",
                "mock:vkQueueWaitIdle",
            ],
        );

        drop(queue);
        drop(device);
        assert_eq!(
            calls.take(),
            ["VK_LAYER_device:vkDestroyDevice", "mock:vkDestroyDevice"],
        );
        assert!(Arc::strong_count(&instance) >= 1);
    }
}
