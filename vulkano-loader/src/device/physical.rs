// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Physical devices, and the output structures of the `*2` queries.
//!
//! The `*2` queries fill a core structure and a chain of extension structures. Here the chain is
//! a list of [`ChainedStruct`]s, each identified by its structure type and carrying the bytes
//! that follow the `sType`/`pNext` header of the structure. After a query, every chained
//! structure is either [`Written`](ChainedState::Written) by some link, or
//! [`Ignored`](ChainedState::Ignored) because nothing down the chain recognized it. A structure
//! is never left in its initial state.

use crate::{
    instance::Instance, macros::impl_id_counter, trampoline, ExtensionProperties, Extensions,
    Version, VulkanError, VulkanObject,
};
use ash::vk;
use bytemuck::{bytes_of, try_pod_read_unaligned, Pod};
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    mem::size_of,
    num::NonZero,
    sync::Arc,
};

/// Represents one of the available physical devices on this machine.
///
/// Enumerating the physical devices of an instance twice gives back the same objects.
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    instance: Arc<Instance>,
    id: NonZero<u64>,

    api_version: Version,
    properties: vk::PhysicalDeviceProperties,
    extension_properties: Vec<ExtensionProperties>,
    supported_extensions: Extensions,
    queue_family_properties: Vec<vk::QueueFamilyProperties>,
}

impl PhysicalDevice {
    /// # Safety
    ///
    /// - `handle` must be an opaque handle enumerated from `instance`.
    pub(crate) unsafe fn from_handle(
        instance: &Arc<Instance>,
        handle: vk::PhysicalDevice,
    ) -> Result<Arc<Self>, VulkanError> {
        let properties = unsafe { trampoline::get_physical_device_properties(handle) };
        let extension_properties = unsafe { trampoline::device_extension_properties(handle) }?;
        let queue_family_properties = unsafe { trampoline::queue_family_properties(handle) };

        Ok(Arc::new(PhysicalDevice {
            handle,
            instance: instance.clone(),
            id: Self::next_id(),
            api_version: Version::from(properties.api_version),
            supported_extensions: extension_properties.iter().collect(),
            properties,
            extension_properties,
            queue_family_properties,
        }))
    }

    /// Returns the instance that owns the physical device.
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Returns the version of the API that the physical device supports.
    ///
    /// Devices created from it can use core commands up to the lower of this version and the
    /// version requested for the instance.
    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Returns the device extensions reported by the drivers and layers.
    #[inline]
    pub fn extension_properties(&self) -> &[ExtensionProperties] {
        &self.extension_properties
    }

    /// Returns the device extensions that can be enabled on a device created from this one.
    #[inline]
    pub fn supported_extensions(&self) -> &Extensions {
        &self.supported_extensions
    }

    #[inline]
    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_family_properties
    }

    /// Queries the core features of the physical device.
    #[inline]
    pub fn features(&self) -> vk::PhysicalDeviceFeatures {
        unsafe { trampoline::get_physical_device_features(self.handle) }
    }

    /// Queries the core features of the physical device, and every chained structure of
    /// `features`.
    ///
    /// Works on every driver: when the driver has no `vkGetPhysicalDeviceFeatures2`, the core
    /// structure is filled in from `vkGetPhysicalDeviceFeatures`, and the chained structures are
    /// marked as ignored.
    ///
    /// Returns [`VulkanError::ExtensionNotPresent`] if the instance neither is version 1.1 nor
    /// has `VK_KHR_get_physical_device_properties2` enabled.
    #[inline]
    pub fn features2(&self, features: &mut PhysicalDeviceFeatures2) -> Result<(), VulkanError> {
        unsafe { trampoline::get_physical_device_features2(self.handle, features) }
    }

    /// Same as [`features2`](Self::features2), for properties.
    #[inline]
    pub fn properties2(
        &self,
        properties: &mut PhysicalDeviceProperties2,
    ) -> Result<(), VulkanError> {
        unsafe { trampoline::get_physical_device_properties2(self.handle, properties) }
    }
}

unsafe impl VulkanObject for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Debug for PhysicalDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("PhysicalDevice")
            .field("handle", &self.handle)
            .field("api_version", &self.api_version)
            .field("supported_extensions", &self.supported_extensions)
            .finish_non_exhaustive()
    }
}

impl_id_counter!(PhysicalDevice);

/// What happened to a chained output structure during a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainedState {
    /// Not yet handled. Only observable by the links of a chain during a query.
    Pending,
    /// A link recognized the structure and wrote it.
    Written,
    /// Nothing down the chain recognized the structure. Its contents are unspecified.
    Ignored,
}

/// An extension structure chained onto the output of a `*2` query.
#[derive(Clone, PartialEq, Eq)]
pub struct ChainedStruct {
    s_type: vk::StructureType,
    data: Vec<u8>,
    state: ChainedState,
}

impl ChainedStruct {
    /// Returns an empty structure of the given type, to be filled in by a query.
    #[inline]
    pub fn new(s_type: vk::StructureType) -> Self {
        ChainedStruct {
            s_type,
            data: Vec::new(),
            state: ChainedState::Pending,
        }
    }

    #[inline]
    pub fn s_type(&self) -> vk::StructureType {
        self.s_type
    }

    #[inline]
    pub fn state(&self) -> ChainedState {
        self.state
    }

    /// Stores the contents of the structure. Called by the link that recognized it.
    #[inline]
    pub fn write<T: Pod>(&mut self, value: &T) {
        self.write_bytes(bytes_of(value));
    }

    /// Stores the contents of the structure as raw bytes, everything after its header.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.state = ChainedState::Written;
    }

    /// Returns the leading bytes of the contents as a `T`, if the structure was written and is
    /// at least as large as `T`.
    ///
    /// A structure filled in by a driver includes the padding of the native structure.
    #[inline]
    pub fn read<T: Pod>(&self) -> Option<T> {
        if self.state != ChainedState::Written {
            return None;
        }

        try_pod_read_unaligned(self.data.get(..size_of::<T>())?).ok()
    }

    /// Returns the contents, if the structure was written.
    #[inline]
    pub fn bytes(&self) -> Option<&[u8]> {
        (self.state == ChainedState::Written).then_some(self.data.as_slice())
    }

    fn reset(&mut self) {
        self.data.clear();
        self.state = ChainedState::Pending;
    }
}

impl Debug for ChainedStruct {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ChainedStruct")
            .field("s_type", &self.s_type)
            .field("state", &self.state)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Output of `vkGetPhysicalDeviceFeatures2`.
#[derive(Clone, Debug, Default)]
pub struct PhysicalDeviceFeatures2 {
    pub features: vk::PhysicalDeviceFeatures,
    pub next: Vec<ChainedStruct>,
}

impl PhysicalDeviceFeatures2 {
    /// Returns an output with one chained structure per given type.
    pub fn with_next(s_types: impl IntoIterator<Item = vk::StructureType>) -> Self {
        PhysicalDeviceFeatures2 {
            features: vk::PhysicalDeviceFeatures::default(),
            next: s_types.into_iter().map(ChainedStruct::new).collect(),
        }
    }

    /// Returns the chained structure of the given type.
    #[inline]
    pub fn get(&self, s_type: vk::StructureType) -> Option<&ChainedStruct> {
        self.next.iter().find(|chained| chained.s_type == s_type)
    }

    #[inline]
    pub fn get_mut(&mut self, s_type: vk::StructureType) -> Option<&mut ChainedStruct> {
        self.next.iter_mut().find(|chained| chained.s_type == s_type)
    }

    pub(crate) fn reset_chain(&mut self) {
        self.next.iter_mut().for_each(ChainedStruct::reset);
    }

    pub(crate) fn ignore_unwritten(&mut self, query: &str) {
        ignore_unwritten(&mut self.next, query);
    }
}

/// Output of `vkGetPhysicalDeviceProperties2`.
#[derive(Clone, Debug, Default)]
pub struct PhysicalDeviceProperties2 {
    pub properties: vk::PhysicalDeviceProperties,
    pub next: Vec<ChainedStruct>,
}

impl PhysicalDeviceProperties2 {
    /// Returns an output with one chained structure per given type.
    pub fn with_next(s_types: impl IntoIterator<Item = vk::StructureType>) -> Self {
        PhysicalDeviceProperties2 {
            properties: vk::PhysicalDeviceProperties::default(),
            next: s_types.into_iter().map(ChainedStruct::new).collect(),
        }
    }

    /// Returns the chained structure of the given type.
    #[inline]
    pub fn get(&self, s_type: vk::StructureType) -> Option<&ChainedStruct> {
        self.next.iter().find(|chained| chained.s_type == s_type)
    }

    #[inline]
    pub fn get_mut(&mut self, s_type: vk::StructureType) -> Option<&mut ChainedStruct> {
        self.next.iter_mut().find(|chained| chained.s_type == s_type)
    }

    pub(crate) fn reset_chain(&mut self) {
        self.next.iter_mut().for_each(ChainedStruct::reset);
    }

    pub(crate) fn ignore_unwritten(&mut self, query: &str) {
        ignore_unwritten(&mut self.next, query);
    }
}

/// Returns the size of the native structure of type `s_type`, header included, if it is one
/// that a driver of version `api_version` knows.
pub(crate) fn native_struct_size(s_type: vk::StructureType, api_version: Version) -> Option<usize> {
    let (size, version) = match s_type {
        vk::StructureType::PHYSICAL_DEVICE_PROTECTED_MEMORY_FEATURES => (
            size_of::<vk::PhysicalDeviceProtectedMemoryFeatures<'static>>(),
            Version::V1_1,
        ),
        vk::StructureType::PHYSICAL_DEVICE_16BIT_STORAGE_FEATURES => (
            size_of::<vk::PhysicalDevice16BitStorageFeatures<'static>>(),
            Version::V1_1,
        ),
        vk::StructureType::PHYSICAL_DEVICE_MULTIVIEW_FEATURES => (
            size_of::<vk::PhysicalDeviceMultiviewFeatures<'static>>(),
            Version::V1_1,
        ),
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_1_FEATURES => (
            size_of::<vk::PhysicalDeviceVulkan11Features<'static>>(),
            Version::V1_2,
        ),
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES => (
            size_of::<vk::PhysicalDeviceVulkan12Features<'static>>(),
            Version::V1_2,
        ),
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES => (
            size_of::<vk::PhysicalDeviceVulkan13Features<'static>>(),
            Version::V1_3,
        ),
        vk::StructureType::PHYSICAL_DEVICE_ID_PROPERTIES => (
            size_of::<vk::PhysicalDeviceIDProperties<'static>>(),
            Version::V1_1,
        ),
        vk::StructureType::PHYSICAL_DEVICE_MAINTENANCE_3_PROPERTIES => (
            size_of::<vk::PhysicalDeviceMaintenance3Properties<'static>>(),
            Version::V1_1,
        ),
        vk::StructureType::PHYSICAL_DEVICE_SUBGROUP_PROPERTIES => (
            size_of::<vk::PhysicalDeviceSubgroupProperties<'static>>(),
            Version::V1_1,
        ),
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_1_PROPERTIES => (
            size_of::<vk::PhysicalDeviceVulkan11Properties<'static>>(),
            Version::V1_2,
        ),
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_PROPERTIES => (
            size_of::<vk::PhysicalDeviceVulkan12Properties<'static>>(),
            Version::V1_2,
        ),
        vk::StructureType::PHYSICAL_DEVICE_DRIVER_PROPERTIES => (
            size_of::<vk::PhysicalDeviceDriverProperties<'static>>(),
            Version::V1_2,
        ),
        _ => return None,
    };

    (api_version >= version).then_some(size)
}

fn ignore_unwritten(next: &mut [ChainedStruct], query: &str) {
    for chained in next
        .iter_mut()
        .filter(|chained| chained.state == ChainedState::Pending)
    {
        log::warn!(
            "{}: unrecognized chained structure {:?} will be ignored",
            query,
            chained.s_type,
        );
        chained.data.clear();
        chained.state = ChainedState::Ignored;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        native_struct_size, ChainedState, ChainedStruct, PhysicalDeviceFeatures2,
        PhysicalDeviceProperties2,
    };
    use crate::{
        instance::{Instance, InstanceCreateInfo},
        tests::{create_instance, create_loader, MockDriver, RecordingLayer},
        Version, VulkanError,
    };
    use ash::vk;

    #[test]
    fn written_structs_read_back() {
        let mut chained = ChainedStruct::new(vk::StructureType::PHYSICAL_DEVICE_ID_PROPERTIES);
        assert_eq!(chained.read::<[u32; 4]>(), None);

        chained.write(&[1u32, 2, 3, 4]);
        assert_eq!(chained.state(), ChainedState::Written);
        assert_eq!(chained.read::<[u32; 4]>(), Some([1, 2, 3, 4]));
        assert_eq!(chained.read::<[u32; 2]>(), Some([1, 2]));
        // Larger than what was written.
        assert_eq!(chained.read::<[u32; 8]>(), None);
        assert_eq!(chained.bytes().map(<[u8]>::len), Some(16));
    }

    #[test]
    fn unwritten_structs_are_ignored() {
        let mut features = PhysicalDeviceFeatures2::with_next([
            vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_1_FEATURES,
            vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        ]);
        features.next[0].write(&7u32);

        features.ignore_unwritten("vkGetPhysicalDeviceFeatures2");

        assert_eq!(features.next[0].state(), ChainedState::Written);
        assert_eq!(features.next[1].state(), ChainedState::Ignored);
        assert_eq!(features.next[1].read::<u32>(), None);

        features.reset_chain();
        assert!(features
            .next
            .iter()
            .all(|chained| chained.state() == ChainedState::Pending));
    }

    fn features2_output() -> PhysicalDeviceFeatures2 {
        PhysicalDeviceFeatures2::with_next([
            vk::StructureType::PHYSICAL_DEVICE_PROTECTED_MEMORY_FEATURES,
            vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        ])
    }

    #[test]
    fn emulated_features2_match_features() {
        let driver = MockDriver::new("old").with_api_version(Version::V1_0);
        let expected = driver.features();
        let instance = create_instance(vec![driver], vec![], Version::V1_1);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();

        let mut features = features2_output();
        physical_device.features2(&mut features).unwrap();

        assert_eq!(
            format!("{:?}", features.features),
            format!("{:?}", physical_device.features()),
        );
        assert_eq!(format!("{:?}", features.features), format!("{:?}", expected));
        assert!(features
            .next
            .iter()
            .all(|chained| chained.state() == ChainedState::Ignored));

        let mut properties = PhysicalDeviceProperties2::with_next([
            vk::StructureType::PHYSICAL_DEVICE_ID_PROPERTIES,
        ]);
        physical_device.properties2(&mut properties).unwrap();
        assert_eq!(
            properties.properties.device_id,
            physical_device.properties().device_id,
        );
        assert_eq!(properties.next[0].state(), ChainedState::Ignored);
    }

    #[test]
    fn native_features2_only_ignore_what_the_driver_skipped() {
        let driver = MockDriver::new("new")
            .with_api_version(Version::V1_1)
            .with_queries2();
        let calls = driver.call_log();
        let instance = create_instance(vec![driver], vec![], Version::V1_1);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
        calls.take();

        let mut features = features2_output();
        physical_device.features2(&mut features).unwrap();

        assert_eq!(calls.take(), ["new:vkGetPhysicalDeviceFeatures2"]);
        let protected_memory = features
            .get(vk::StructureType::PHYSICAL_DEVICE_PROTECTED_MEMORY_FEATURES)
            .unwrap();
        assert_eq!(protected_memory.read::<vk::Bool32>(), Some(vk::TRUE));
        assert_eq!(
            features
                .get(vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES)
                .unwrap()
                .state(),
            ChainedState::Ignored,
        );

        // Querying again starts from a clean chain.
        physical_device.features2(&mut features).unwrap();
        assert_eq!(features.next[0].state(), ChainedState::Written);
    }

    #[test]
    fn features2_form_follows_the_instance_version() {
        let new_driver = || {
            MockDriver::new("both")
                .with_api_version(Version::V1_1)
                .with_queries2()
                .with_queries2_khr()
        };

        // 1.1: the core form.
        let driver = new_driver();
        let calls = driver.call_log();
        let instance = create_instance(vec![driver], vec![], Version::V1_1);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
        assert!(instance.get_proc_addr("vkGetPhysicalDeviceFeatures2").is_some());
        assert!(instance.get_proc_addr("vkGetPhysicalDeviceFeatures2KHR").is_none());
        calls.take();
        physical_device.features2(&mut features2_output()).unwrap();
        assert_eq!(calls.take(), ["both:vkGetPhysicalDeviceFeatures2"]);

        // 1.0 with the extension: the extension form.
        let driver = new_driver();
        let calls = driver.call_log();
        let instance = Instance::new(
            create_loader(vec![driver], vec![]),
            InstanceCreateInfo {
                api_version: Version::V1_0,
                enabled_extensions: ["VK_KHR_get_physical_device_properties2"]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        )
        .unwrap();
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
        assert!(instance.get_proc_addr("vkGetPhysicalDeviceFeatures2").is_none());
        assert!(instance.get_proc_addr("vkGetPhysicalDeviceFeatures2KHR").is_some());
        calls.take();
        physical_device.features2(&mut features2_output()).unwrap();
        assert_eq!(calls.take(), ["both:vkGetPhysicalDeviceFeatures2KHR"]);

        // 1.0 without the extension: neither.
        let instance = create_instance(vec![new_driver()], vec![], Version::V1_0);
        let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();
        assert!(instance.get_proc_addr("vkGetPhysicalDeviceFeatures2").is_none());
        assert!(instance.get_proc_addr("vkGetPhysicalDeviceFeatures2KHR").is_none());
        assert_eq!(
            physical_device.features2(&mut features2_output()),
            Err(VulkanError::ExtensionNotPresent),
        );
    }

    #[test]
    fn layers_write_chained_structures_on_the_way_down() {
        for native in [true, false] {
            let driver = if native {
                MockDriver::new("new")
                    .with_api_version(Version::V1_1)
                    .with_queries2()
            } else {
                MockDriver::new("old").with_api_version(Version::V1_0)
            };
            let layer = RecordingLayer::new("VK_LAYER_filler")
                .with_chained_output(vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES, 42);
            let instance = create_instance(vec![driver], vec![layer], Version::V1_1);
            let physical_device = instance.enumerate_physical_devices().unwrap().next().unwrap();

            let mut features = features2_output();
            // Left over from an earlier use of the output.
            features.next[0].write(&7u32);
            physical_device.features2(&mut features).unwrap();

            let vulkan_12 = features
                .get(vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES)
                .unwrap();
            assert_eq!(vulkan_12.state(), ChainedState::Written);
            assert_eq!(vulkan_12.read::<u32>(), Some(42));

            let protected_memory = features
                .get(vk::StructureType::PHYSICAL_DEVICE_PROTECTED_MEMORY_FEATURES)
                .unwrap();

            if native {
                assert_eq!(protected_memory.read::<vk::Bool32>(), Some(vk::TRUE));
            } else {
                assert_eq!(protected_memory.state(), ChainedState::Ignored);
            }
        }
    }

    #[test]
    fn native_struct_sizes_follow_the_driver_version() {
        let s_type = vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES;

        assert_eq!(native_struct_size(s_type, Version::V1_1), None);
        assert_eq!(
            native_struct_size(s_type, Version::V1_2),
            Some(std::mem::size_of::<vk::PhysicalDeviceVulkan12Features<'static>>()),
        );
        assert_eq!(
            native_struct_size(vk::StructureType::APPLICATION_INFO, Version::V1_3),
            None,
        );
    }
}
