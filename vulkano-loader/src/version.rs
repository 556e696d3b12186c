// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

// The `Version` object is reexported from the crate root.

use std::{
    cmp::Ordering,
    fmt::{Debug, Display, Error as FmtError, Formatter},
};

/// Represents an API version.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version number.
    pub major: u32,
    /// Minor version number.
    pub minor: u32,
    /// Patch version number.
    pub patch: u32,
}

impl Version {
    pub const V1_0: Version = Version::major_minor(1, 0);
    pub const V1_1: Version = Version::major_minor(1, 1);
    pub const V1_2: Version = Version::major_minor(1, 2);
    pub const V1_3: Version = Version::major_minor(1, 3);

    /// The highest version this loader knows how to route.
    pub const HEADER_VERSION: Version = Version::V1_3;

    /// Constructs a `Version` from the given major and minor version numbers.
    #[inline]
    pub const fn major_minor(major: u32, minor: u32) -> Version {
        Version {
            major,
            minor,
            patch: 0,
        }
    }

    /// Returns the same version, without its patch number.
    ///
    /// Version gating only ever looks at the major and minor numbers.
    #[inline]
    pub const fn without_patch(self) -> Version {
        Version::major_minor(self.major, self.minor)
    }
}

impl Default for Version {
    #[inline]
    fn default() -> Self {
        Version::V1_0
    }
}

impl From<u32> for Version {
    #[inline]
    fn from(val: u32) -> Self {
        Version {
            major: ash::vk::api_version_major(val),
            minor: ash::vk::api_version_minor(val),
            patch: ash::vk::api_version_patch(val),
        }
    }
}

impl TryFrom<Version> for u32 {
    type Error = ();

    #[inline]
    fn try_from(val: Version) -> Result<Self, Self::Error> {
        if val.major <= 0x7f && val.minor <= 0x3ff && val.patch <= 0xfff {
            Ok(ash::vk::make_api_version(0, val.major, val.minor, val.patch))
        } else {
            Err(())
        }
    }
}

impl PartialOrd for Version {
    #[inline]
    fn partial_cmp(&self, other: &Version) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Version) -> Ordering {
        match self.major.cmp(&other.major) {
            Ordering::Equal => (),
            o => return o,
        };

        match self.minor.cmp(&other.minor) {
            Ordering::Equal => (),
            o => return o,
        };

        self.patch.cmp(&other.patch)
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::Version;

    #[test]
    fn into_vk_version() {
        let version = Version::major_minor(1, 0);
        assert_eq!(u32::try_from(version).unwrap(), 0x400000);
    }

    #[test]
    fn from_vk_version() {
        let version = Version::from(ash::vk::API_VERSION_1_1);
        assert_eq!(version, Version::V1_1);
    }

    #[test]
    fn out_of_range_does_not_pack() {
        let version = Version {
            major: 0x80,
            minor: 0,
            patch: 0,
        };
        assert!(u32::try_from(version).is_err());
    }

    #[test]
    fn greater_minor() {
        let v1 = Version::V1_0;
        let v2 = Version::V1_1;
        assert!(v2 > v1);
    }

    #[test]
    fn patch_is_ignored_for_gating() {
        let v1 = Version {
            major: 1,
            minor: 0,
            patch: 250,
        };
        assert!(v1.without_patch() < Version::V1_1);
        assert_eq!(v1.without_patch(), Version::V1_0);
    }
}
