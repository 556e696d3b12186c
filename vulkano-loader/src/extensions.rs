// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use bytemuck::cast_slice;
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Properties of an extension advertised by a driver, a layer or a physical device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionProperties {
    /// The name of the extension.
    pub extension_name: String,

    /// The version of the extension.
    pub spec_version: u32,
}

impl ExtensionProperties {
    #[inline]
    pub fn new(extension_name: impl Into<String>, spec_version: u32) -> Self {
        ExtensionProperties {
            extension_name: extension_name.into(),
            spec_version,
        }
    }
}

impl From<ash::vk::ExtensionProperties> for ExtensionProperties {
    #[inline]
    fn from(val: ash::vk::ExtensionProperties) -> Self {
        Self {
            extension_name: {
                let bytes = cast_slice(val.extension_name.as_slice());
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                String::from_utf8_lossy(&bytes[0..end]).into()
            },
            spec_version: val.spec_version,
        }
    }
}

/// A set of extension names.
///
/// Used both for what was requested, what is available, and what ended up enabled. Iteration is
/// in name order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extensions {
    names: BTreeSet<String>,
}

impl Extensions {
    /// Returns an empty set.
    #[inline]
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    #[inline]
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.names.insert(name.into())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Returns the extensions that are in `self` or in `other`.
    pub fn union(&self, other: &Self) -> Self {
        Extensions {
            names: self.names.union(&other.names).cloned().collect(),
        }
    }

    /// Returns the extensions that are both in `self` and in `other`.
    pub fn intersection(&self, other: &Self) -> Self {
        Extensions {
            names: self.names.intersection(&other.names).cloned().collect(),
        }
    }

    /// Returns the extensions of `self` that are not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        Extensions {
            names: self.names.difference(&other.names).cloned().collect(),
        }
    }

    /// Returns the names as a list, in name order.
    pub(crate) fn to_names(&self) -> SmallVec<[&str; 8]> {
        self.iter().collect()
    }
}

impl<'a> FromIterator<&'a str> for Extensions {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Extensions {
            names: iter.into_iter().map(str::to_owned).collect(),
        }
    }
}

impl FromIterator<String> for Extensions {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Extensions {
            names: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a ExtensionProperties> for Extensions {
    fn from_iter<I: IntoIterator<Item = &'a ExtensionProperties>>(iter: I) -> Self {
        iter.into_iter()
            .map(|property| property.extension_name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExtensionProperties, Extensions};

    #[test]
    fn from_vk_properties_stops_at_nul() {
        let mut raw = ash::vk::ExtensionProperties::default();
        for (dst, src) in raw.extension_name.iter_mut().zip(b"VK_KHR_surface\0garbage") {
            *dst = *src as _;
        }
        raw.spec_version = 25;

        let properties = ExtensionProperties::from(raw);
        assert_eq!(properties.extension_name, "VK_KHR_surface");
        assert_eq!(properties.spec_version, 25);
    }

    #[test]
    fn set_operations() {
        let requested: Extensions = ["VK_A", "VK_B", "VK_C"].into_iter().collect();
        let available: Extensions = ["VK_B", "VK_C", "VK_D"].into_iter().collect();

        let enabled = requested.intersection(&available);
        assert_eq!(enabled.to_names().as_slice(), &["VK_B", "VK_C"]);
        assert_eq!(requested.difference(&available).to_names().as_slice(), &["VK_A"]);
        assert_eq!(requested.union(&available).len(), 4);
    }
}
