// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    command::{Callable, Command, CreateDevice},
    dispatch::{Link, NextLink},
    ExtensionProperties, NonExhaustive, Version, VulkanError,
};
use std::fmt::{Debug, Error as FmtError, Formatter};

/// The newest layer interface version the loader speaks.
pub const LAYER_INTERFACE_VERSION: u32 = 2;

/// The oldest layer interface version the loader still accepts.
pub const MIN_LAYER_INTERFACE_VERSION: u32 = 1;

/// Implemented on the layers that can be spliced into a chain.
///
/// A layer only defines the entry points it is interested in. For every other name it returns
/// `None` from the proc address functions, and calls flow straight to the next link.
///
/// A layer that wraps an entry point obtains the implementation to forward to from the
/// [`NextLink`] it is given, and calls it from its own implementation.
///
/// # Reentrancy
///
/// Creation, destruction and physical device enumeration call into layers while holding the
/// loader's process-wide lock. Calling back into the loader from there (through
/// [`Loader::global`], [`Instance::new`] or [`Device::new`] for example) would need that lock
/// again, and aborts the process.
///
/// [`Loader::global`]: crate::loader::Loader::global
/// [`Instance::new`]: crate::instance::Instance::new
/// [`Device::new`]: crate::device::Device::new
pub trait Layer: Send + Sync {
    /// Returns the properties of the layer.
    fn properties(&self) -> LayerProperties;

    /// Agrees on an interface version. Called once, when the layer is handed to a loader.
    ///
    /// The loader fills in the newest version it speaks; the layer lowers it to the version it
    /// will use. A layer that returns an error, or a version outside of what the loader accepts,
    /// is excluded from every chain.
    fn negotiate_interface_version(
        &self,
        request: &mut NegotiateLayerInterface,
    ) -> Result<(), VulkanError> {
        request.loader_layer_interface_version = request
            .loader_layer_interface_version
            .min(LAYER_INTERFACE_VERSION);

        Ok(())
    }

    /// Returns the layer's implementation of an instance-level entry point, including
    /// `vkCreateInstance` and `vkCreateDevice`.
    fn get_instance_proc_addr(&self, name: &str, next: &NextLink<'_>) -> Option<Callable>;

    /// Returns the layer's implementation of a device-level entry point.
    ///
    /// Only called for layers whose scope includes devices.
    fn get_device_proc_addr(&self, name: &str, next: &NextLink<'_>) -> Option<Callable> {
        let _ = (name, next);

        None
    }
}

impl Debug for dyn Layer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Layer")
            .field("layer_name", &self.properties().layer_name)
            .finish_non_exhaustive()
    }
}

/// Exchanged with a layer during negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiateLayerInterface {
    pub loader_layer_interface_version: u32,
}

/// Which chains a layer takes part in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LayerScope {
    /// Only the instance chain.
    #[default]
    Instance,
    /// The instance chain, and the chain of every device created from the instance.
    InstanceAndDevice,
}

/// Properties of a layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerProperties {
    /// The name to pass when enabling the layer.
    pub layer_name: String,

    /// The API version the layer was written against.
    pub spec_version: Version,

    /// An implementation-specific version number, chosen by the layer itself.
    pub implementation_version: u32,

    /// A description, chosen by the layer itself.
    pub description: String,

    pub scope: LayerScope,

    /// Instance extensions the layer implements on its own.
    pub instance_extensions: Vec<ExtensionProperties>,

    /// Device extensions the layer implements on its own.
    pub device_extensions: Vec<ExtensionProperties>,

    pub _ne: NonExhaustive,
}

impl LayerProperties {
    /// Returns properties with the given name, and every other field left empty.
    #[inline]
    pub fn new(layer_name: impl Into<String>) -> Self {
        LayerProperties {
            layer_name: layer_name.into(),
            spec_version: Version::V1_0,
            implementation_version: 1,
            description: String::new(),
            scope: LayerScope::Instance,
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            _ne: NonExhaustive(()),
        }
    }
}

/// A layer as a link of an instance chain.
pub(crate) struct InstanceLayerLink<'a>(pub(crate) &'a dyn Layer);

impl Link for InstanceLayerLink<'_> {
    #[inline]
    fn proc_addr(&self, name: &str, next: &NextLink<'_>) -> Option<Callable> {
        self.0.get_instance_proc_addr(name, next)
    }
}

/// A layer as a link of a device chain.
///
/// `vkCreateDevice` is an instance-level entry point, every other entry point of a device chain
/// is device-level.
pub(crate) struct DeviceLayerLink<'a>(pub(crate) &'a dyn Layer);

impl Link for DeviceLayerLink<'_> {
    #[inline]
    fn proc_addr(&self, name: &str, next: &NextLink<'_>) -> Option<Callable> {
        if name == CreateDevice::NAME {
            self.0.get_instance_proc_addr(name, next)
        } else {
            self.0.get_device_proc_addr(name, next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Layer, LayerProperties, NegotiateLayerInterface, LAYER_INTERFACE_VERSION,
    };
    use crate::{command::Callable, dispatch::NextLink};

    struct Minimal;

    impl Layer for Minimal {
        fn properties(&self) -> LayerProperties {
            LayerProperties::new("VK_LAYER_minimal")
        }

        fn get_instance_proc_addr(&self, _: &str, _: &NextLink<'_>) -> Option<Callable> {
            None
        }
    }

    #[test]
    fn default_negotiation_caps_the_version() {
        let mut request = NegotiateLayerInterface {
            loader_layer_interface_version: LAYER_INTERFACE_VERSION + 3,
        };
        Minimal.negotiate_interface_version(&mut request).unwrap();
        assert_eq!(request.loader_layer_interface_version, LAYER_INTERFACE_VERSION);
    }

    #[test]
    fn debug_uses_the_layer_name() {
        let layer: &dyn Layer = &Minimal;
        assert!(format!("{:?}", layer).contains("VK_LAYER_minimal"));
    }
}
