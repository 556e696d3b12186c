// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Which optional capabilities are enabled in a scope.
//!
//! A capability is either an extension, named as usual (`VK_KHR_maintenance1`), or an API
//! version, named `VK_VERSION_<major>_<minor>`. The set of enabled capabilities is decided once
//! when the scope is created and never changes afterwards, so a [`CapabilityRegistry`] can be
//! read from any thread without locking.

use crate::{
    command::{
        command_scope, Command, CommandScope, GetPhysicalDeviceFeatures2,
        GetPhysicalDeviceFeatures2Khr, GetPhysicalDeviceProperties2,
        GetPhysicalDeviceProperties2Khr, TrimCommandPool, TrimCommandPoolKhr,
    },
    Extensions, Version,
};
use std::sync::Arc;

/// An entry point that exists both as a core command and as an extension command with the same
/// behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionedCommand {
    /// Name of the core form.
    pub core: &'static str,
    /// The version that introduced the core form.
    pub core_version: Version,
    /// The extension that provides the extension form.
    pub extension: &'static str,
    /// Name of the extension form.
    pub extension_form: &'static str,
}

pub const KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2: &str = "VK_KHR_get_physical_device_properties2";
pub const KHR_MAINTENANCE_1: &str = "VK_KHR_maintenance1";

pub const GET_PHYSICAL_DEVICE_FEATURES_2: VersionedCommand = VersionedCommand {
    core: GetPhysicalDeviceFeatures2::NAME,
    core_version: Version::V1_1,
    extension: KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2,
    extension_form: GetPhysicalDeviceFeatures2Khr::NAME,
};

pub const GET_PHYSICAL_DEVICE_PROPERTIES_2: VersionedCommand = VersionedCommand {
    core: GetPhysicalDeviceProperties2::NAME,
    core_version: Version::V1_1,
    extension: KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2,
    extension_form: GetPhysicalDeviceProperties2Khr::NAME,
};

pub const TRIM_COMMAND_POOL: VersionedCommand = VersionedCommand {
    core: TrimCommandPool::NAME,
    core_version: Version::V1_1,
    extension: KHR_MAINTENANCE_1,
    extension_form: TrimCommandPoolKhr::NAME,
};

/// Every versioned entry point known to the loader.
pub const VERSIONED_COMMANDS: &[VersionedCommand] = &[
    GET_PHYSICAL_DEVICE_FEATURES_2,
    GET_PHYSICAL_DEVICE_PROPERTIES_2,
    TRIM_COMMAND_POOL,
];

/// Returns the versioned entry point that `name` is either form of.
pub fn versioned_command(name: &str) -> Option<&'static VersionedCommand> {
    VERSIONED_COMMANDS
        .iter()
        .find(|command| command.core == name || command.extension_form == name)
}

/// Which form of an entry point should be invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The core form, or the only form of an unversioned entry point.
    Core(&'static str),
    /// The extension form.
    Extension(&'static str),
    /// Neither form may be used in this scope.
    ///
    /// This is not an error by itself; the caller decides whether to emulate, to return a
    /// default, or to report the capability as missing.
    Unavailable,
}

/// The capabilities enabled in one scope.
#[derive(Debug)]
pub struct CapabilityRegistry {
    scope: CommandScope,
    api_version: Version,
    enabled_extensions: Extensions,
    parent: Option<Arc<CapabilityRegistry>>,
}

impl CapabilityRegistry {
    /// Creates the registry of an instance, from the version the application requested and the
    /// extensions that ended up enabled.
    pub fn for_instance(api_version: Version, enabled_extensions: Extensions) -> Self {
        CapabilityRegistry {
            scope: CommandScope::Instance,
            api_version: api_version.without_patch(),
            enabled_extensions,
            parent: None,
        }
    }

    /// Creates the registry of a device.
    ///
    /// Core device commands are available up to the lower of the version requested for the
    /// parent instance and the version of the physical device.
    pub fn for_device(
        parent: Arc<CapabilityRegistry>,
        physical_device_version: Version,
        enabled_extensions: Extensions,
    ) -> Self {
        let api_version = parent
            .api_version
            .min(physical_device_version.without_patch());

        CapabilityRegistry {
            scope: CommandScope::Device,
            api_version,
            enabled_extensions,
            parent: Some(parent),
        }
    }

    /// Returns the kind of scope this registry belongs to.
    #[inline]
    pub fn scope(&self) -> CommandScope {
        self.scope
    }

    /// Returns the version up to which core commands may be used in this scope.
    #[inline]
    pub fn api_version(&self) -> Version {
        self.api_version
    }

    #[inline]
    pub fn enabled_extensions(&self) -> &Extensions {
        &self.enabled_extensions
    }

    /// Returns the registry of the parent instance, for a device.
    #[inline]
    pub fn parent(&self) -> Option<&Arc<CapabilityRegistry>> {
        self.parent.as_ref()
    }

    /// Returns whether `capability` is enabled in this scope.
    pub fn is_enabled(&self, capability: &str) -> bool {
        match parse_version_capability(capability) {
            Some(version) => self.api_version >= version,
            None => self.enabled_extensions.contains(capability),
        }
    }

    /// Selects the form of `base_name` to invoke.
    ///
    /// The core form is selected if the scope's version reaches the version that introduced it,
    /// otherwise the extension form if its extension is enabled. Either form's name may be given.
    /// Known unversioned entry points always resolve to themselves.
    pub fn resolve_versioned(&self, base_name: &str) -> Resolution {
        let Some(command) = versioned_command(base_name) else {
            return match crate::command::KNOWN_COMMANDS
                .iter()
                .find(|&&(name, _)| name == base_name)
            {
                Some(&(name, _)) => Resolution::Core(name),
                None => Resolution::Unavailable,
            };
        };

        if self.api_version >= command.core_version {
            Resolution::Core(command.core)
        } else if self.is_enabled(command.extension) {
            Resolution::Extension(command.extension_form)
        } else {
            Resolution::Unavailable
        }
    }

    /// Returns whether the proc address of `name` may be handed out in this scope.
    ///
    /// A core form needs the version that introduced it, an extension form needs its extension.
    /// Entry points of another scope are never available.
    pub fn is_command_available(&self, name: &str) -> bool {
        match command_scope(name) {
            Some(CommandScope::Global) | None => return false,
            Some(scope) if scope != self.scope => return false,
            Some(_) => (),
        }

        match versioned_command(name) {
            Some(command) if command.core == name => self.api_version >= command.core_version,
            Some(command) => self.is_enabled(command.extension),
            None => true,
        }
    }
}

fn parse_version_capability(capability: &str) -> Option<Version> {
    let rest = capability.strip_prefix("VK_VERSION_")?;
    let (major, minor) = rest.split_once('_')?;

    Some(Version::major_minor(major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::{CapabilityRegistry, Resolution, KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2};
    use crate::{Extensions, Version};
    use std::sync::Arc;

    fn registry(version: Version, extensions: &[&str]) -> CapabilityRegistry {
        CapabilityRegistry::for_instance(version, extensions.iter().copied().collect())
    }

    #[test]
    fn is_enabled_is_a_pure_lookup() {
        let registry = registry(Version::V1_0, &[KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2]);

        assert!(registry.is_enabled(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2));
        assert!(!registry.is_enabled("VK_KHR_surface"));
        assert!(registry.is_enabled("VK_VERSION_1_0"));
        assert!(!registry.is_enabled("VK_VERSION_1_1"));
    }

    #[test]
    fn core_form_when_version_is_met() {
        let registry = registry(Version::V1_1, &[]);

        assert_eq!(
            registry.resolve_versioned("vkGetPhysicalDeviceFeatures2"),
            Resolution::Core("vkGetPhysicalDeviceFeatures2"),
        );
        // Asking with the extension name still prefers the core form.
        assert_eq!(
            registry.resolve_versioned("vkGetPhysicalDeviceFeatures2KHR"),
            Resolution::Core("vkGetPhysicalDeviceFeatures2"),
        );
    }

    #[test]
    fn extension_form_below_version() {
        let registry = registry(Version::V1_0, &[KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2]);

        assert_eq!(
            registry.resolve_versioned("vkGetPhysicalDeviceFeatures2"),
            Resolution::Extension("vkGetPhysicalDeviceFeatures2KHR"),
        );
    }

    #[test]
    fn unavailable_without_version_or_extension() {
        let registry = registry(Version::V1_0, &[]);

        assert_eq!(
            registry.resolve_versioned("vkGetPhysicalDeviceFeatures2"),
            Resolution::Unavailable,
        );
        assert_eq!(registry.resolve_versioned("vkNotACommand"), Resolution::Unavailable);
        assert_eq!(
            registry.resolve_versioned("vkGetPhysicalDeviceFeatures"),
            Resolution::Core("vkGetPhysicalDeviceFeatures"),
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let registry = registry(Version::V1_0, &[KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2]);
        let first = registry.resolve_versioned("vkGetPhysicalDeviceProperties2");

        for _ in 0..4 {
            assert_eq!(registry.resolve_versioned("vkGetPhysicalDeviceProperties2"), first);
        }
    }

    #[test]
    fn device_version_is_capped_by_parent() {
        let parent = Arc::new(registry(Version::V1_0, &[]));
        let device = CapabilityRegistry::for_device(
            parent.clone(),
            Version::V1_3,
            ["VK_KHR_maintenance1"].into_iter().collect::<Extensions>(),
        );

        assert_eq!(device.api_version(), Version::V1_0);
        assert_eq!(
            device.resolve_versioned("vkTrimCommandPool"),
            Resolution::Extension("vkTrimCommandPoolKHR"),
        );

        let parent = Arc::new(registry(Version::V1_2, &[]));
        let device = CapabilityRegistry::for_device(parent, Version::V1_1, Extensions::empty());
        assert_eq!(device.api_version(), Version::V1_1);
        assert_eq!(
            device.resolve_versioned("vkTrimCommandPoolKHR"),
            Resolution::Core("vkTrimCommandPool"),
        );
    }

    #[test]
    fn command_availability() {
        let registry = registry(Version::V1_0, &[KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2]);

        assert!(registry.is_command_available("vkGetPhysicalDeviceFeatures"));
        assert!(registry.is_command_available("vkGetPhysicalDeviceFeatures2KHR"));
        assert!(!registry.is_command_available("vkGetPhysicalDeviceFeatures2"));
        // Device commands are not handed out by an instance.
        assert!(!registry.is_command_available("vkQueueWaitIdle"));
        assert!(!registry.is_command_available("vkCreateInstance"));
    }
}
