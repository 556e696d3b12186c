// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The instance: the top-level scope.
//!
//! Creating an [`Instance`] builds the chain of the requested layers, creates an instance on
//! every compatible driver through it, and resolves the instance's dispatch table once.
//!
//! ```no_run
//! use vulkano_loader::{
//!     instance::{Instance, InstanceCreateInfo},
//!     Loader, Version,
//! };
//!
//! let instance = Instance::new(
//!     Loader::global(),
//!     InstanceCreateInfo {
//!         api_version: Version::V1_1,
//!         ..Default::default()
//!     },
//! )
//! .unwrap_or_else(|err| panic!("couldn't create instance: {:?}", err));
//!
//! for physical_device in instance.enumerate_physical_devices().unwrap() {
//!     println!("{:?}", physical_device.properties().device_type);
//! }
//! ```
//!
//! # Layers
//!
//! Layers are enabled by name, in order: the first one requested is the outermost link of the
//! chain. A layer that the loader excluded because it failed interface negotiation is skipped
//! with a warning; a layer the loader never heard of fails creation with
//! [`VulkanError::LayerNotPresent`].
//!
//! # Destruction
//!
//! Physical devices hold their instance alive, and devices hold their physical device alive. An
//! instance is therefore only destroyed once every device created from it is.

use self::layers::Layer;
use crate::{
    capability::CapabilityRegistry,
    chain::build_instance_chain,
    command::{Callable, DestroyInstance},
    device::physical::PhysicalDevice,
    dispatch::DispatchTable,
    handle::{wrap, WrappedHandle},
    loader::{self, Loader},
    macros::impl_id_counter,
    terminator::TerminatorInstance,
    trampoline, Extensions, NonExhaustive, Version, VulkanError, VulkanObject,
};
use ash::vk;
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt::{Debug, Error as FmtError, Formatter},
    num::NonZero,
    sync::{Arc, Weak},
};

pub mod layers;

/// An instance of the API.
pub struct Instance {
    handle: WrappedHandle,
    loader: Arc<Loader>,
    id: NonZero<u64>,

    api_version: Version,
    enabled_extensions: Extensions,
    enabled_layers: Vec<String>,
    layers: Vec<Arc<dyn Layer>>,
    registry: Arc<CapabilityRegistry>,
    dispatch: Arc<DispatchTable>,
    terminator: Arc<TerminatorInstance>,

    physical_devices: Mutex<HashMap<vk::PhysicalDevice, Weak<PhysicalDevice>, RandomState>>,
}

impl Instance {
    /// Creates a new `Instance`.
    pub fn new(
        loader: Arc<Loader>,
        create_info: InstanceCreateInfo,
    ) -> Result<Arc<Instance>, VulkanError> {
        let mut layers: SmallVec<[Arc<dyn Layer>; 4]> = SmallVec::new();
        let mut enabled_layers = Vec::new();

        for name in &create_info.enabled_layers {
            match loader.layer(name) {
                Some(layer) => {
                    layers.push(layer.clone());
                    enabled_layers.push(name.clone());
                }
                None if loader.is_excluded(name) => {
                    log::warn!("layer {} failed negotiation and is skipped", name);
                }
                None => {
                    log::error!("layer {} is not present", name);
                    return Err(VulkanError::LayerNotPresent);
                }
            }
        }

        let mut state = loader::lock();
        let chain = build_instance_chain(&layers, loader.drivers(), &create_info)?;
        let handle = wrap(chain.raw, chain.dispatch.clone());

        let instance = Arc::new(Instance {
            handle,
            loader: loader.clone(),
            id: Self::next_id(),
            api_version: chain.registry.api_version(),
            enabled_extensions: chain.registry.enabled_extensions().clone(),
            enabled_layers,
            layers: layers.into_vec(),
            registry: chain.registry,
            dispatch: chain.dispatch,
            terminator: chain.terminator,
            physical_devices: Mutex::new(HashMap::default()),
        });
        state.register_instance(instance.id, loader.id());

        Ok(instance)
    }

    /// Returns the loader the instance was created from.
    #[inline]
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// Returns the version up to which core instance commands can be used.
    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    /// Returns the extensions that ended up enabled: the ones requested that a driver or an
    /// enabled layer provides.
    #[inline]
    pub fn enabled_extensions(&self) -> &Extensions {
        &self.enabled_extensions
    }

    /// Returns the names of the layers in the chain, outermost first.
    #[inline]
    pub fn enabled_layers(&self) -> &[String] {
        &self.enabled_layers
    }

    #[inline]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Returns the instance's dispatch table.
    #[inline]
    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    #[inline]
    pub(crate) fn layers(&self) -> &[Arc<dyn Layer>] {
        &self.layers
    }

    #[inline]
    pub(crate) fn terminator(&self) -> &Arc<TerminatorInstance> {
        &self.terminator
    }

    /// Returns the entry point for `name`, taking opaque handles, or `None` if it isn't
    /// available on this instance.
    #[inline]
    pub fn get_proc_addr(&self, name: &str) -> Option<Callable> {
        unsafe { trampoline::get_instance_proc_addr(self.handle(), name) }
    }

    /// Returns the physical devices of every driver.
    ///
    /// Enumerating again returns the same objects, for the physical devices that are still
    /// alive.
    pub fn enumerate_physical_devices(
        self: &Arc<Self>,
    ) -> Result<impl ExactSizeIterator<Item = Arc<PhysicalDevice>>, VulkanError> {
        let handles = unsafe { trampoline::enumerate_physical_devices_vec(self.handle()) }?;

        let mut physical_devices = self.physical_devices.lock();
        let mut output = Vec::with_capacity(handles.len());

        for handle in handles {
            if let Some(physical_device) = physical_devices.get(&handle).and_then(Weak::upgrade) {
                output.push(physical_device);
                continue;
            }

            let physical_device = unsafe { PhysicalDevice::from_handle(self, handle) }?;
            physical_devices.insert(handle, Arc::downgrade(&physical_device));
            output.push(physical_device);
        }

        Ok(output.into_iter())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let mut state = loader::lock();

        if let Some(destroy) = self.dispatch.command::<DestroyInstance>() {
            destroy(self.handle.get().raw());
        }

        state.unregister_instance(self.id);
    }
}

unsafe impl VulkanObject for Instance {
    type Handle = vk::Instance;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle.handle()
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Instance")
            .field("handle", &self.handle)
            .field("api_version", &self.api_version)
            .field("enabled_extensions", &self.enabled_extensions)
            .field("enabled_layers", &self.enabled_layers)
            .finish_non_exhaustive()
    }
}

impl_id_counter!(Instance);

/// Parameters to create a new `Instance`.
#[derive(Clone, Debug)]
pub struct InstanceCreateInfo {
    /// A string of your choice stating the name of your application.
    ///
    /// The default value is `None`.
    pub application_name: Option<String>,

    /// A version number of your choice specifying the version of your application.
    ///
    /// The default value is zero.
    pub application_version: Version,

    /// The highest API version the application will use.
    ///
    /// Core commands are available up to this version, on every driver that supports it.
    ///
    /// The default value is [`Version::V1_0`].
    pub api_version: Version,

    /// The names of the layers to enable, outermost first.
    ///
    /// The default value is empty.
    pub enabled_layers: Vec<String>,

    /// The extensions to enable. Those that no driver or enabled layer provides are dropped,
    /// with a warning.
    ///
    /// The default value is empty.
    pub enabled_extensions: Extensions,

    pub _ne: NonExhaustive,
}

impl Default for InstanceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            application_name: None,
            application_version: Version::major_minor(0, 0),
            api_version: Version::V1_0,
            enabled_layers: Vec::new(),
            enabled_extensions: Extensions::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Instance, InstanceCreateInfo};
    use crate::{
        tests::{create_loader as loader, MockDriver, RecordingLayer},
        Handle, Version, VulkanError, VulkanObject,
    };
    use std::sync::Arc;

    #[test]
    fn create_and_destroy() {
        let driver = MockDriver::new("mock");
        let counters = driver.counters();
        let loader = loader(vec![driver], vec![]);

        let instance = Instance::new(loader.clone(), InstanceCreateInfo::default()).unwrap();
        assert!(!instance.handle().is_null());
        assert_eq!(loader.live_instance_count(), 1);
        assert_eq!(counters.instances_created(), 1);

        drop(instance);
        assert_eq!(loader.live_instance_count(), 0);
        assert_eq!(counters.instances_destroyed(), 1);
    }

    #[test]
    fn unknown_layer() {
        let loader = loader(vec![MockDriver::new("mock")], vec![]);

        let result = Instance::new(
            loader,
            InstanceCreateInfo {
                enabled_layers: vec!["VK_LAYER_missing".to_owned()],
                ..Default::default()
            },
        );
        assert_eq!(result.unwrap_err(), VulkanError::LayerNotPresent);
    }

    #[test]
    fn excluded_layer_is_skipped() {
        let loader = loader(
            vec![MockDriver::new("mock")],
            vec![RecordingLayer::new("VK_LAYER_refuses").refusing_negotiation()],
        );

        let instance = Instance::new(
            loader,
            InstanceCreateInfo {
                enabled_layers: vec!["VK_LAYER_refuses".to_owned()],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(instance.enabled_layers().is_empty());
    }

    #[test]
    fn unavailable_extensions_are_dropped() {
        let loader = loader(
            vec![MockDriver::new("mock").with_instance_extensions(&[("VK_KHR_surface", 25)])],
            vec![],
        );

        let instance = Instance::new(
            loader,
            InstanceCreateInfo {
                api_version: Version::V1_1,
                enabled_extensions: ["VK_KHR_surface", "VK_KHR_unheard_of"]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(instance.enabled_extensions().contains("VK_KHR_surface"));
        assert!(!instance.enabled_extensions().contains("VK_KHR_unheard_of"));
        assert!(instance.registry().is_enabled("VK_VERSION_1_1"));
    }

    #[test]
    fn physical_devices_keep_their_identity() {
        let loader = loader(
            vec![
                MockDriver::new("first").with_physical_devices(2),
                MockDriver::new("second").with_physical_devices(1),
            ],
            vec![],
        );
        let instance = Instance::new(loader, InstanceCreateInfo::default()).unwrap();

        let first: Vec<_> = instance.enumerate_physical_devices().unwrap().collect();
        let second: Vec<_> = instance.enumerate_physical_devices().unwrap().collect();

        assert_eq!(first.len(), 3);
        for (a, b) in first.iter().zip(&second) {
            assert!(Arc::ptr_eq(a, b));
            assert_eq!(a.handle(), b.handle());
        }
    }
}
