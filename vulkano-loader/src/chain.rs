// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Construction of the call chains of instances and devices.
//!
//! A chain is the ordered list of enabled layers followed by a terminator. The first layer is
//! the outermost one: its code runs first on the way in, and last on the way out. Building a
//! chain goes through the same steps for both scopes:
//!
//! 1. Decide which extensions are enabled: those requested that some driver or layer provides.
//! 2. Check that every layer intercepts the create command.
//! 3. Call the create command of the outermost link, which calls the next one, down to the
//!    terminator.
//! 4. Resolve every known command of the scope once, into a read-only
//!    [`DispatchTable`](crate::dispatch::DispatchTable).
//!
//! If any step fails, whatever the links created is torn down in reverse order through the
//! [`Unwind`] they registered their teardown in, and the error is returned.

use crate::{
    capability::CapabilityRegistry,
    command::{
        Command, CreateDevice, CreateInstance, EnumerateDeviceExtensionProperties,
        GetPhysicalDeviceProperties,
    },
    device::DeviceCreateInfo,
    dispatch::{ChainResolver, DispatchTable, Link},
    driver::Driver,
    instance::{
        layers::{DeviceLayerLink, InstanceLayerLink, Layer, LayerScope},
        InstanceCreateInfo,
    },
    terminator::{DeviceTerminator, InstanceTerminator, TerminatorDevice, TerminatorInstance},
    Extensions, Version, VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{
    cell::RefCell,
    fmt::{Debug, Error as FmtError, Formatter},
    mem::take,
    sync::{Arc, OnceLock},
};

/// Teardown steps registered while a scope is being created.
///
/// Every link that creates something during a create call registers how to destroy it, after
/// the links below it have returned successfully. If the creation as a whole fails, the steps
/// run in reverse order of registration when the `Unwind` is dropped, so that what was created
/// last is destroyed first. Once the scope is fully created, the steps are discarded.
#[derive(Default)]
pub struct Unwind {
    steps: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Unwind {
    /// Registers a teardown step.
    #[inline]
    pub fn push(&self, step: impl FnOnce() + 'static) {
        self.steps.borrow_mut().push(Box::new(step));
    }

    /// Returns the number of steps registered so far.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.steps.borrow().len()
    }

    /// Discards the steps: the scope was created.
    pub(crate) fn commit(self) {
        self.steps.borrow_mut().clear();
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        let steps = take(self.steps.get_mut());

        if !steps.is_empty() {
            log::debug!("unwinding {} partially created objects", steps.len());
        }

        for step in steps.into_iter().rev() {
            step();
        }
    }
}

impl Debug for Unwind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Unwind")
            .field("len", &self.len())
            .finish()
    }
}

/// The result of building an instance chain.
#[derive(Debug)]
pub struct InstanceChain {
    /// The handle returned by the outermost link.
    pub raw: vk::Instance,
    pub registry: Arc<CapabilityRegistry>,
    pub dispatch: Arc<DispatchTable>,
    pub terminator: Arc<TerminatorInstance>,
}

/// Builds the chain of a new instance, and creates the instance through it.
///
/// `layers` are in the order they were requested; the first is the outermost.
pub fn build_instance_chain(
    layers: &[Arc<dyn Layer>],
    drivers: &[Arc<dyn Driver>],
    create_info: &InstanceCreateInfo,
) -> Result<InstanceChain, VulkanError> {
    let available = available_instance_extensions(layers, drivers);
    let enabled_extensions =
        enabled_extensions(&create_info.enabled_extensions, &available, "instance");
    let registry = Arc::new(CapabilityRegistry::for_instance(
        create_info.api_version,
        enabled_extensions.clone(),
    ));

    log::debug!(
        "building instance chain: {} layers, {} drivers, Vulkan {}, extensions {:?}",
        layers.len(),
        drivers.len(),
        registry.api_version(),
        enabled_extensions,
    );

    let layer_links: SmallVec<[InstanceLayerLink<'_>; 4]> = layers
        .iter()
        .map(|layer| InstanceLayerLink(&**layer))
        .collect();
    let created = Arc::new(OnceLock::new());
    let terminator = InstanceTerminator::new(drivers, registry.clone(), created.clone());
    let resolver = ChainResolver::new(
        layer_links
            .iter()
            .map(|link| link as &dyn Link)
            .chain([&terminator as &dyn Link]),
    );

    check_layers_intercept(&resolver, layers, CreateInstance::NAME)?;

    let create = resolver
        .resolve(CreateInstance::NAME)
        .and_then(|callable| callable.get::<CreateInstance>().cloned())
        .ok_or(VulkanError::InitializationFailed)?;
    let effective_info = InstanceCreateInfo {
        enabled_extensions,
        ..create_info.clone()
    };

    let unwind = Unwind::default();
    let raw = create(&effective_info, &unwind)?;

    let Some(terminator_instance) = created.get().cloned() else {
        log::error!("vkCreateInstance succeeded without reaching the terminator");
        return Err(VulkanError::InitializationFailed);
    };

    let dispatch = Arc::new(DispatchTable::build(registry.clone(), &resolver)?);
    unwind.commit();

    log::debug!("instance chain built, {} commands resolved", dispatch.len());

    Ok(InstanceChain {
        raw,
        registry,
        dispatch,
        terminator: terminator_instance,
    })
}

/// The result of building a device chain.
#[derive(Debug)]
pub struct DeviceChain {
    /// The handle returned by the outermost link.
    pub raw: vk::Device,
    pub registry: Arc<CapabilityRegistry>,
    pub dispatch: Arc<DispatchTable>,
    pub terminator: Arc<TerminatorDevice>,
}

/// Builds the chain of a new device, and creates the device through it.
///
/// Only the layers of `instance_layers` whose scope includes devices take part.
/// `physical_device` is the handle as the instance chain hands it out, and `instance_dispatch`
/// is the dispatch table of the parent instance, through which the physical device is queried.
pub fn build_device_chain(
    instance_layers: &[Arc<dyn Layer>],
    instance_dispatch: &DispatchTable,
    terminator_instance: &Arc<TerminatorInstance>,
    physical_device: vk::PhysicalDevice,
    create_info: &DeviceCreateInfo,
) -> Result<DeviceChain, VulkanError> {
    let layers: SmallVec<[Arc<dyn Layer>; 4]> = instance_layers
        .iter()
        .filter(|layer| layer.properties().scope == LayerScope::InstanceAndDevice)
        .cloned()
        .collect();

    let physical_device_version = instance_dispatch
        .command::<GetPhysicalDeviceProperties>()
        .map_or(Version::V1_0, |get| {
            Version::from(get(physical_device).api_version)
        });
    let mut available: Extensions = match instance_dispatch
        .command::<EnumerateDeviceExtensionProperties>()
    {
        Some(enumerate) => enumerate(physical_device)?.iter().collect(),
        None => Extensions::empty(),
    };

    for layer in &layers {
        available = available.union(&layer.properties().device_extensions.iter().collect());
    }

    let enabled_extensions =
        enabled_extensions(&create_info.enabled_extensions, &available, "device");
    let parent = instance_dispatch.registry().clone();
    let registry = Arc::new(CapabilityRegistry::for_device(
        parent,
        physical_device_version,
        enabled_extensions.clone(),
    ));

    log::debug!(
        "building device chain: {} layers, Vulkan {}, extensions {:?}",
        layers.len(),
        registry.api_version(),
        enabled_extensions,
    );

    let layer_links: SmallVec<[DeviceLayerLink<'_>; 4]> = layers
        .iter()
        .map(|layer| DeviceLayerLink(&**layer))
        .collect();
    let created = Arc::new(OnceLock::new());
    let terminator = DeviceTerminator::new(
        terminator_instance.clone(),
        registry.clone(),
        created.clone(),
    );
    let resolver = ChainResolver::new(
        layer_links
            .iter()
            .map(|link| link as &dyn Link)
            .chain([&terminator as &dyn Link]),
    );

    check_layers_intercept(&resolver, &layers, CreateDevice::NAME)?;

    let create = resolver
        .resolve(CreateDevice::NAME)
        .and_then(|callable| callable.get::<CreateDevice>().cloned())
        .ok_or(VulkanError::InitializationFailed)?;
    let effective_info = DeviceCreateInfo {
        enabled_extensions,
        ..create_info.clone()
    };

    let unwind = Unwind::default();
    let raw = create(physical_device, &effective_info, &unwind)?;

    let Some(terminator_device) = created.get().cloned() else {
        log::error!("vkCreateDevice succeeded without reaching the terminator");
        return Err(VulkanError::InitializationFailed);
    };

    let dispatch = Arc::new(DispatchTable::build(registry.clone(), &resolver)?);
    unwind.commit();

    log::debug!("device chain built, {} commands resolved", dispatch.len());

    Ok(DeviceChain {
        raw,
        registry,
        dispatch,
        terminator: terminator_device,
    })
}

fn available_instance_extensions(
    layers: &[Arc<dyn Layer>],
    drivers: &[Arc<dyn Driver>],
) -> Extensions {
    let mut available = Extensions::empty();

    for driver in drivers {
        match driver.instance_extension_properties() {
            Ok(properties) => available = available.union(&properties.iter().collect()),
            Err(err) => log::warn!(
                "driver {} failed to report its instance extensions: {}",
                driver.name(),
                err,
            ),
        }
    }

    for layer in layers {
        available = available.union(&layer.properties().instance_extensions.iter().collect());
    }

    available
}

fn enabled_extensions(requested: &Extensions, available: &Extensions, scope: &str) -> Extensions {
    for name in requested.difference(available).iter() {
        log::warn!("{} extension {} is not available and will not be enabled", scope, name);
    }

    requested.intersection(available)
}

fn check_layers_intercept(
    resolver: &ChainResolver<'_>,
    layers: &[Arc<dyn Layer>],
    create: &str,
) -> Result<(), VulkanError> {
    for (index, layer) in layers.iter().enumerate() {
        if !resolver.defines(index, create) {
            log::error!(
                "layer {} does not intercept {}",
                layer.properties().layer_name,
                create,
            );

            return Err(VulkanError::LayerNotPresent);
        }
    }

    Ok(())
}
