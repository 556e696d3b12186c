// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Opaque handles that know which dispatch table they belong to.
//!
//! Every handle given to the application is the address of a wrapper owned by the loader. The
//! wrapper holds a tag, the real handle of the link below the trampolines, and a reference to the
//! dispatch table of its scope, so that dispatching on a handle never needs a side-table lookup.
//!
//! Unwrapping something that is not one of our wrappers, or a wrapper of the wrong type, is a
//! violation of the API contract and aborts the process.

use crate::{dispatch::DispatchTable, macros::usage_violation};
use ash::vk::{self, Handle};
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::{Debug, Error as FmtError, Formatter},
    mem::align_of,
    ptr::{addr_of, addr_of_mut, NonNull},
    sync::Arc,
};

/// Tag stored at the start of every live wrapper.
pub const LOADER_MAGIC: u64 = 0x01CD_C0DE;

#[repr(C)]
pub(crate) struct DispatchableHandle {
    magic: u64,
    object_type: vk::ObjectType,
    raw: u64,
    dispatch: Arc<DispatchTable>,
    children: Mutex<IdentityMap>,
}

impl DispatchableHandle {
    /// Returns the real handle.
    #[inline]
    pub(crate) fn raw<H: Handle>(&self) -> H {
        H::from_raw(self.raw)
    }

    #[inline]
    pub(crate) fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    /// Returns the wrappers handed out for the enumerable handles obtained from this one
    /// (physical devices of an instance, queues of a device).
    #[inline]
    pub(crate) fn children(&self) -> &Mutex<IdentityMap> {
        &self.children
    }
}

/// Owns the wrapper behind an opaque handle. Dropping it frees the wrapper and every child
/// wrapper.
pub(crate) struct WrappedHandle {
    ptr: NonNull<DispatchableHandle>,
}

// The wrapper is immutable apart from its `children`, which are behind a mutex.
unsafe impl Send for WrappedHandle {}
unsafe impl Sync for WrappedHandle {}

impl WrappedHandle {
    #[inline]
    pub(crate) fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.ptr.as_ptr() as usize as u64)
    }

    #[inline]
    pub(crate) fn get(&self) -> &DispatchableHandle {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for WrappedHandle {
    fn drop(&mut self) {
        // Stale copies of the handle must not pass the check while the memory is still ours.
        unsafe { addr_of_mut!((*self.ptr.as_ptr()).magic).write(0) };
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

impl Debug for WrappedHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let wrapper = self.get();

        f.debug_struct("WrappedHandle")
            .field("object_type", &wrapper.object_type)
            .field("raw", &format_args!("{:#x}", wrapper.raw))
            .finish_non_exhaustive()
    }
}

/// Allocates a wrapper for `raw`, dispatching through `dispatch`.
///
/// The opaque handle is obtained with [`WrappedHandle::handle`] and stays valid until the
/// returned value is dropped.
pub(crate) fn wrap<H: Handle>(raw: H, dispatch: Arc<DispatchTable>) -> WrappedHandle {
    let wrapper = Box::new(DispatchableHandle {
        magic: LOADER_MAGIC,
        object_type: H::TYPE,
        raw: raw.as_raw(),
        dispatch,
        children: Mutex::new(IdentityMap::default()),
    });

    WrappedHandle {
        ptr: NonNull::from(Box::leak(wrapper)),
    }
}

/// Recovers the real handle and the dispatch table of an opaque handle.
///
/// # Safety
///
/// - `handle` must be null, or the address of readable memory at least as large as a wrapper.
///
/// # Aborts
///
/// Aborts the process if `handle` is null, is not a live wrapper created by this loader, or is a
/// wrapper for another type of handle.
#[inline]
pub unsafe fn unwrap<H: Handle>(handle: H) -> (H, Arc<DispatchTable>) {
    let wrapper = unsafe { unwrap_ref(handle) };

    (wrapper.raw(), wrapper.dispatch.clone())
}

/// Same as [`unwrap`], but returns the wrapper itself.
pub(crate) unsafe fn unwrap_ref<'a, H: Handle>(handle: H) -> &'a DispatchableHandle {
    let address = handle.as_raw();

    if address == 0 {
        usage_violation!("a null {:?} handle was passed to the loader", H::TYPE);
    }

    if address % align_of::<DispatchableHandle>() as u64 != 0 {
        usage_violation!(
            "{:?} handle {:#x} is not aligned like a loader handle",
            H::TYPE,
            address,
        );
    }

    let ptr = address as usize as *const DispatchableHandle;
    let magic = unsafe { addr_of!((*ptr).magic).read() };

    if magic != LOADER_MAGIC {
        usage_violation!(
            "{:?} handle {:#x} was not created by this loader, or was already destroyed",
            H::TYPE,
            address,
        );
    }

    let object_type = unsafe { addr_of!((*ptr).object_type).read() };

    if object_type != H::TYPE {
        usage_violation!(
            "a {:?} handle was passed where a {:?} handle was expected",
            object_type,
            H::TYPE,
        );
    }

    unsafe { &*ptr }
}

/// The wrappers handed out for enumerable handles, keyed by real handle.
///
/// Asking twice for the same real handle gives back the same opaque handle, so that enumerating
/// twice doesn't allocate (and leak) a second wrapper per object.
#[derive(Default)]
pub(crate) struct IdentityMap {
    wrappers: HashMap<u64, WrappedHandle, RandomState>,
}

impl IdentityMap {
    /// Returns the opaque handle for `raw`, wrapping it on first sight.
    pub(crate) fn get_or_wrap<H: Handle>(&mut self, raw: H, dispatch: &Arc<DispatchTable>) -> H {
        let raw = raw.as_raw();

        self.wrappers
            .entry(raw)
            .or_insert_with(|| wrap(H::from_raw(raw), dispatch.clone()))
            .handle()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.wrappers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{unwrap, wrap, IdentityMap};
    use crate::{
        capability::CapabilityRegistry,
        dispatch::{ChainResolver, DispatchTable},
        Extensions, Version,
    };
    use ash::vk::{self, Handle};
    use std::sync::Arc;

    fn empty_table() -> Arc<DispatchTable> {
        let registry = Arc::new(CapabilityRegistry::for_instance(
            Version::V1_0,
            Extensions::empty(),
        ));

        Arc::new(DispatchTable::build(registry, &ChainResolver::new([])).unwrap())
    }

    #[test]
    fn round_trip() {
        let table = empty_table();
        let wrapped = wrap(vk::Instance::from_raw(0x1234), table.clone());

        let (raw, dispatch) = unsafe { unwrap(wrapped.handle::<vk::Instance>()) };
        assert_eq!(raw.as_raw(), 0x1234);
        assert!(Arc::ptr_eq(&dispatch, &table));
    }

    #[test]
    fn opaque_handle_is_not_the_real_one() {
        let wrapped = wrap(vk::Device::from_raw(0x10), empty_table());

        assert_ne!(wrapped.handle::<vk::Device>().as_raw(), 0x10);
    }

    #[test]
    fn stable_identity() {
        let table = empty_table();
        let mut map = IdentityMap::default();

        let first: Vec<vk::PhysicalDevice> = [1, 2, 3]
            .into_iter()
            .map(|raw| map.get_or_wrap(vk::PhysicalDevice::from_raw(raw), &table))
            .collect();
        let second: Vec<vk::PhysicalDevice> = [3, 1, 2]
            .into_iter()
            .map(|raw| map.get_or_wrap(vk::PhysicalDevice::from_raw(raw), &table))
            .collect();

        assert_eq!(first[0], second[1]);
        assert_eq!(first[1], second[2]);
        assert_eq!(first[2], second[0]);
        assert_eq!(map.len(), 3);

        let (raw, _) = unsafe { unwrap(second[0]) };
        assert_eq!(raw.as_raw(), 3);
    }

    #[test]
    fn foreign_handle_aborts() {
        assert_aborts!("foreign_handle_aborts", {
            // Readable and aligned, but not one of ours.
            let foreign = Box::new([0u64; 16]);
            let handle = vk::Instance::from_raw(foreign.as_ptr() as usize as u64);
            let _ = unsafe { unwrap(handle) };
        });
    }

    #[test]
    fn null_handle_aborts() {
        assert_aborts!("null_handle_aborts", {
            let _ = unsafe { unwrap(vk::Device::null()) };
        });
    }

    #[test]
    fn wrong_type_aborts() {
        assert_aborts!("wrong_type_aborts", {
            let wrapped = wrap(vk::Instance::from_raw(1), empty_table());
            let handle = vk::Device::from_raw(wrapped.handle::<vk::Instance>().as_raw());
            let _ = unsafe { unwrap(handle) };
        });
    }
}
