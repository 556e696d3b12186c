// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The process-wide state of the loader.
//!
//! A [`Loader`] holds the drivers and layers it was given, after negotiating an interface version
//! with each of them. Drivers and layers that fail negotiation are excluded for good.
//!
//! Creating and destroying instances and devices, and enumerating physical devices, happen under
//! one process-wide lock, which also guards the list of live instances and the global loader.
//! Dispatching a call through an existing object never takes it. The lock is held while layers
//! and drivers run their part of creation and enumeration, so these must not call back into the
//! loader from there.

use crate::{
    driver::{Driver, ICD_INTERFACE_VERSION, MIN_ICD_INTERFACE_VERSION},
    instance::layers::{
        Layer, LayerProperties, NegotiateLayerInterface, LAYER_INTERFACE_VERSION,
        MIN_LAYER_INTERFACE_VERSION,
    },
    macros::{impl_id_counter, usage_violation},
    ExtensionProperties, NonExhaustive, Version, VulkanError,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    cell::Cell,
    collections::BTreeMap,
    fmt::{Debug, Error as FmtError, Formatter},
    num::NonZero,
    ops::{Deref, DerefMut},
    sync::Arc,
};

static STATE: Mutex<LoaderState> = Mutex::new(LoaderState {
    global: None,
    live_instances: Vec::new(),
});

/// What the process-wide lock guards.
pub(crate) struct LoaderState {
    global: Option<Arc<Loader>>,
    // (instance, loader it was created from)
    live_instances: Vec<(NonZero<u64>, NonZero<u64>)>,
}

impl LoaderState {
    pub(crate) fn register_instance(&mut self, instance: NonZero<u64>, loader: NonZero<u64>) {
        self.live_instances.push((instance, loader));
    }

    pub(crate) fn unregister_instance(&mut self, instance: NonZero<u64>) {
        self.live_instances.retain(|&(live, _)| live != instance);
    }

    fn live_instances_of(&self, loader: NonZero<u64>) -> usize {
        self.live_instances
            .iter()
            .filter(|&&(_, owner)| owner == loader)
            .count()
    }
}

thread_local! {
    static HELD: Cell<bool> = const { Cell::new(false) };
}

/// The process-wide lock, held by the current thread.
pub(crate) struct StateGuard(MutexGuard<'static, LoaderState>);

impl Deref for StateGuard {
    type Target = LoaderState;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for StateGuard {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for StateGuard {
    #[inline]
    fn drop(&mut self) {
        HELD.set(false);
    }
}

/// Takes the process-wide lock.
///
/// # Aborts
///
/// The lock isn't reentrant. Aborts the process if the current thread already holds it, which
/// happens when a layer or a driver calls back into the loader while an object is being created
/// or physical devices are being enumerated.
pub(crate) fn lock() -> StateGuard {
    if HELD.get() {
        usage_violation!(
            "the loader was called from a layer or a driver while it was creating objects or \
            enumerating physical devices",
        );
    }

    let guard = STATE.lock();
    HELD.set(true);

    StateGuard(guard)
}

/// Parameters to create a new `Loader`.
#[derive(Clone)]
pub struct LoaderCreateInfo {
    /// The drivers calls can end up in, in the order physical devices are enumerated.
    ///
    /// The default value is empty.
    pub drivers: Vec<Arc<dyn Driver>>,

    /// The layers that can be enabled on an instance.
    ///
    /// The default value is empty.
    pub layers: Vec<Arc<dyn Layer>>,

    pub _ne: NonExhaustive,
}

impl Default for LoaderCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            drivers: Vec::new(),
            layers: Vec::new(),
            _ne: NonExhaustive(()),
        }
    }
}

impl Debug for LoaderCreateInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("LoaderCreateInfo")
            .field("drivers", &self.drivers)
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

/// The drivers and layers instances can be created with.
pub struct Loader {
    id: NonZero<u64>,
    drivers: Vec<Arc<dyn Driver>>,
    layers: Vec<NegotiatedLayer>,
    excluded_layers: Vec<String>,
}

struct NegotiatedLayer {
    properties: LayerProperties,
    layer: Arc<dyn Layer>,
}

impl Loader {
    /// Creates a loader, negotiating an interface version with each driver and layer.
    pub fn new(create_info: LoaderCreateInfo) -> Arc<Self> {
        let LoaderCreateInfo {
            drivers,
            layers,
            _ne: _,
        } = create_info;

        let drivers = drivers
            .into_iter()
            .filter(|driver| {
                match driver.negotiate_interface_version(ICD_INTERFACE_VERSION) {
                    Ok(version)
                        if (MIN_ICD_INTERFACE_VERSION..=ICD_INTERFACE_VERSION)
                            .contains(&version) =>
                    {
                        log::info!(
                            "driver {} uses interface version {}",
                            driver.name(),
                            version,
                        );
                        true
                    }
                    Ok(version) => {
                        log::warn!(
                            "driver {} wants unsupported interface version {}, excluding it",
                            driver.name(),
                            version,
                        );
                        false
                    }
                    Err(err) => {
                        log::warn!(
                            "interface negotiation with driver {} failed ({}), excluding it",
                            driver.name(),
                            err,
                        );
                        false
                    }
                }
            })
            .collect();

        let mut negotiated = Vec::with_capacity(layers.len());
        let mut excluded_layers = Vec::new();

        for layer in layers {
            let properties = layer.properties();
            let mut request = NegotiateLayerInterface {
                loader_layer_interface_version: LAYER_INTERFACE_VERSION,
            };

            match layer.negotiate_interface_version(&mut request) {
                Ok(())
                    if (MIN_LAYER_INTERFACE_VERSION..=LAYER_INTERFACE_VERSION)
                        .contains(&request.loader_layer_interface_version) =>
                {
                    log::info!(
                        "layer {} uses interface version {}",
                        properties.layer_name,
                        request.loader_layer_interface_version,
                    );
                    negotiated.push(NegotiatedLayer { properties, layer });
                }
                Ok(()) => {
                    log::warn!(
                        "layer {} wants unsupported interface version {}, excluding it",
                        properties.layer_name,
                        request.loader_layer_interface_version,
                    );
                    excluded_layers.push(properties.layer_name);
                }
                Err(err) => {
                    log::warn!(
                        "interface negotiation with layer {} failed ({}), excluding it",
                        properties.layer_name,
                        err,
                    );
                    excluded_layers.push(properties.layer_name);
                }
            }
        }

        Arc::new(Loader {
            id: Self::next_id(),
            drivers,
            layers: negotiated,
            excluded_layers,
        })
    }

    /// Returns the process-wide loader, creating an empty one on first use if
    /// [`init_global`](Self::init_global) wasn't called.
    pub fn global() -> Arc<Loader> {
        let mut state = lock();

        state
            .global
            .get_or_insert_with(|| Loader::new(LoaderCreateInfo::default()))
            .clone()
    }

    /// Creates the process-wide loader.
    ///
    /// Returns [`VulkanError::InitializationFailed`] if it already exists.
    pub fn init_global(create_info: LoaderCreateInfo) -> Result<Arc<Loader>, VulkanError> {
        let mut state = lock();

        if state.global.is_some() {
            return Err(VulkanError::InitializationFailed);
        }

        let loader = Loader::new(create_info);
        state.global = Some(loader.clone());

        Ok(loader)
    }

    /// Drops the process-wide loader. The next call to [`global`](Self::global) creates a new
    /// one.
    ///
    /// Returns [`VulkanError::TooManyObjects`] if instances created from it are still alive.
    pub fn shutdown_global() -> Result<(), VulkanError> {
        let mut state = lock();

        if let Some(global) = &state.global {
            let live = state.live_instances_of(global.id);

            if live != 0 {
                log::error!("cannot shut the loader down, {} instances are alive", live);
                return Err(VulkanError::TooManyObjects);
            }
        }

        state.global = None;

        Ok(())
    }

    /// Returns the highest version that instances can request.
    #[inline]
    pub fn api_version(&self) -> Version {
        Version::HEADER_VERSION
    }

    /// Returns the drivers that passed negotiation.
    #[inline]
    pub fn drivers(&self) -> &[Arc<dyn Driver>] {
        &self.drivers
    }

    /// Returns the layers that passed negotiation.
    #[inline]
    pub fn layers(&self) -> impl ExactSizeIterator<Item = &Arc<dyn Layer>> {
        self.layers.iter().map(|negotiated| &negotiated.layer)
    }

    /// Returns the layer with the given name, if it passed negotiation.
    pub fn layer(&self, name: &str) -> Option<&Arc<dyn Layer>> {
        self.layers
            .iter()
            .find(|negotiated| negotiated.properties.layer_name == name)
            .map(|negotiated| &negotiated.layer)
    }

    /// Returns whether a layer with the given name was handed to the loader, but failed
    /// negotiation.
    #[inline]
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_layers.iter().any(|excluded| excluded == name)
    }

    /// Returns the instance extensions of every driver, or of a single layer.
    ///
    /// Returns [`VulkanError::LayerNotPresent`] if `layer_name` doesn't name an available layer.
    pub fn extension_properties(
        &self,
        layer_name: Option<&str>,
    ) -> Result<Vec<ExtensionProperties>, VulkanError> {
        if let Some(layer_name) = layer_name {
            return self
                .layers
                .iter()
                .find(|negotiated| negotiated.properties.layer_name == layer_name)
                .map(|negotiated| negotiated.properties.instance_extensions.clone())
                .ok_or(VulkanError::LayerNotPresent);
        }

        let mut extensions = BTreeMap::new();

        for driver in &self.drivers {
            match driver.instance_extension_properties() {
                Ok(properties) => {
                    for property in properties {
                        let spec_version = extensions
                            .entry(property.extension_name)
                            .or_insert(property.spec_version);
                        *spec_version = (*spec_version).max(property.spec_version);
                    }
                }
                Err(err) => log::warn!(
                    "driver {} failed to report its instance extensions: {}",
                    driver.name(),
                    err,
                ),
            }
        }

        Ok(extensions
            .into_iter()
            .map(|(extension_name, spec_version)| {
                ExtensionProperties::new(extension_name, spec_version)
            })
            .collect())
    }

    /// Returns the properties of the layers that passed negotiation.
    pub fn layer_properties(&self) -> Vec<LayerProperties> {
        self.layers
            .iter()
            .map(|negotiated| negotiated.properties.clone())
            .collect()
    }

    /// Returns the number of instances created from this loader that are alive.
    pub fn live_instance_count(&self) -> usize {
        lock().live_instances_of(self.id)
    }
}

impl Debug for Loader {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Loader")
            .field("drivers", &self.drivers)
            .field(
                "layers",
                &self
                    .layers
                    .iter()
                    .map(|negotiated| &negotiated.properties.layer_name)
                    .collect::<Vec<_>>(),
            )
            .field("excluded_layers", &self.excluded_layers)
            .finish_non_exhaustive()
    }
}

impl_id_counter!(Loader);

#[cfg(test)]
mod tests {
    use super::{lock, Loader, LoaderCreateInfo};
    use crate::{
        command::EnumerateInstanceExtensionProperties,
        instance::{Instance, InstanceCreateInfo},
        tests::{create_instance, MockDriver, RecordingLayer},
        trampoline, ExtensionProperties, Version, VulkanError,
    };
    use ash::vk;
    use std::sync::Arc;

    #[test]
    fn failed_negotiation_excludes() {
        let loader = Loader::new(LoaderCreateInfo {
            drivers: vec![
                Arc::new(MockDriver::new("good")),
                Arc::new(MockDriver::new("old").with_interface_version(1)),
            ],
            layers: vec![
                Arc::new(RecordingLayer::new("VK_LAYER_good")),
                Arc::new(RecordingLayer::new("VK_LAYER_refuses").refusing_negotiation()),
            ],
            ..Default::default()
        });

        assert_eq!(loader.drivers().len(), 1);
        assert_eq!(loader.drivers()[0].name(), "good");
        assert_eq!(loader.layers().len(), 1);
        assert!(loader.layer("VK_LAYER_good").is_some());
        assert!(loader.layer("VK_LAYER_refuses").is_none());
        assert!(loader.is_excluded("VK_LAYER_refuses"));
    }

    #[test]
    fn extension_properties_merge_drivers() {
        let loader = Loader::new(LoaderCreateInfo {
            drivers: vec![
                Arc::new(MockDriver::new("a").with_instance_extensions(&[("VK_KHR_a", 1)])),
                Arc::new(
                    MockDriver::new("b")
                        .with_instance_extensions(&[("VK_KHR_a", 3), ("VK_KHR_b", 1)]),
                ),
            ],
            layers: vec![Arc::new(
                RecordingLayer::new("VK_LAYER_ext").with_instance_extensions(&["VK_EXT_layer"]),
            )],
            ..Default::default()
        });

        assert_eq!(
            loader.extension_properties(None).unwrap(),
            [
                ExtensionProperties::new("VK_KHR_a", 3),
                ExtensionProperties::new("VK_KHR_b", 1),
            ],
        );
        assert_eq!(
            loader.extension_properties(Some("VK_LAYER_ext")).unwrap(),
            [ExtensionProperties::new("VK_EXT_layer", 1)],
        );
        assert_eq!(
            loader.extension_properties(Some("VK_LAYER_missing")),
            Err(VulkanError::LayerNotPresent),
        );
    }

    // The process-wide loader is shared by every test, so its whole lifecycle is checked here.
    #[test]
    fn global_loader_lifecycle() {
        Loader::shutdown_global().unwrap();

        let loader = Loader::init_global(LoaderCreateInfo {
            drivers: vec![Arc::new(
                MockDriver::new("global").with_instance_extensions(&[("VK_KHR_surface", 25)]),
            )],
            ..Default::default()
        })
        .unwrap();
        assert!(Arc::ptr_eq(&loader, &Loader::global()));
        assert_eq!(
            Loader::init_global(LoaderCreateInfo::default()).unwrap_err(),
            VulkanError::InitializationFailed,
        );

        let enumerate = unsafe {
            trampoline::get_instance_proc_addr(
                vk::Instance::null(),
                "vkEnumerateInstanceExtensionProperties",
            )
        }
        .unwrap();
        let enumerate = enumerate
            .get::<EnumerateInstanceExtensionProperties>()
            .unwrap();
        assert_eq!(
            enumerate(None).unwrap(),
            [ExtensionProperties::new("VK_KHR_surface", 25)],
        );

        let instance = Instance::new(Loader::global(), InstanceCreateInfo::default()).unwrap();
        assert_eq!(
            Loader::shutdown_global().unwrap_err(),
            VulkanError::TooManyObjects,
        );

        drop(instance);
        Loader::shutdown_global().unwrap();
        assert!(!Arc::ptr_eq(&loader, &Loader::global()));
        Loader::shutdown_global().unwrap();
    }

    #[test]
    fn lock_is_released_with_its_guard() {
        drop(lock());
        drop(lock());

        let instance = create_instance(vec![MockDriver::new("mock")], vec![], Version::V1_0);
        assert_eq!(instance.loader().live_instance_count(), 1);
    }

    #[test]
    fn layer_reentering_the_loader_aborts() {
        assert_aborts!("layer_reentering_the_loader_aborts", {
            let _ = create_instance(
                vec![MockDriver::new("mock")],
                vec![RecordingLayer::new("VK_LAYER_reentrant").reentering_the_loader()],
                Version::V1_0,
            );
        });
    }
}
