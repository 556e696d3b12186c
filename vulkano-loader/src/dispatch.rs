// Copyright (c) 2023 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-scope dispatch tables and the resolution that fills them.
//!
//! Resolution of a name walks the chain outermost link first. Each link is asked for its
//! implementation and is given a [`NextLink`] through which it can obtain the implementations of
//! the links below it. A link that doesn't define the name is skipped. Every `(link, name)` pair
//! goes through `Unresolved -> Resolving -> Resolved` exactly once per chain, and the result of
//! the outermost link is stored in the [`DispatchTable`], which is never modified afterwards.

use crate::{
    capability::CapabilityRegistry,
    command::{Callable, Command, CommandScope, KNOWN_COMMANDS},
    VulkanError,
};
use foldhash::fast::RandomState;
use smallvec::SmallVec;
use std::{cell::RefCell, collections::HashMap, sync::Arc};

/// The resolved entry points of one scope.
#[derive(Debug)]
pub struct DispatchTable {
    scope: CommandScope,
    entries: HashMap<&'static str, Callable, RandomState>,
    registry: Arc<CapabilityRegistry>,
}

impl DispatchTable {
    /// Resolves every known entry point of the registry's scope that the registry allows.
    ///
    /// Entry points that no link defines are left out of the table.
    pub fn build(
        registry: Arc<CapabilityRegistry>,
        resolver: &ChainResolver<'_>,
    ) -> Result<Self, VulkanError> {
        let scope = registry.scope();
        let names: SmallVec<[&'static str; 32]> = KNOWN_COMMANDS
            .iter()
            .filter(|&&(name, _)| registry.is_command_available(name))
            .map(|&(name, _)| name)
            .collect();

        let mut entries = HashMap::with_hasher(RandomState::default());
        entries.try_reserve(reservation(names.len())).map_err(|err| {
            log::error!("{:?} dispatch: cannot allocate the table: {}", scope, err);
            VulkanError::OutOfHostMemory
        })?;

        for name in names {
            match resolver.resolve(name) {
                Some(callable) => {
                    entries.insert(name, callable);
                }
                None => log::debug!("{:?} dispatch: no link defines {}", scope, name),
            }
        }

        Ok(DispatchTable {
            scope,
            entries,
            registry,
        })
    }

    /// Returns the kind of scope this table belongs to.
    #[inline]
    pub fn scope(&self) -> CommandScope {
        self.scope
    }

    /// Returns the capabilities of the scope.
    #[inline]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Returns the resolved implementation of `name`.
    ///
    /// The same callable is returned every time for a given name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.entries.get(name)
    }

    /// Returns the resolved implementation of `C`.
    #[inline]
    pub fn command<C: Command>(&self) -> Option<&Arc<C::Pfn>> {
        self.entries.get(C::NAME).and_then(Callable::get::<C>)
    }

    /// Returns the number of resolved entry points.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(not(test))]
#[inline]
fn reservation(len: usize) -> usize {
    len
}

// Tests can make the next table built on their thread fail to allocate.
#[cfg(test)]
fn reservation(len: usize) -> usize {
    if tests::FAIL_NEXT_TABLE.take() {
        usize::MAX
    } else {
        len
    }
}

/// A participant of a chain, as seen by resolution.
pub trait Link {
    /// Returns this link's implementation of `name`, or `None` to let the name fall through to
    /// the next link.
    fn proc_addr(&self, name: &str, next: &NextLink<'_>) -> Option<Callable>;
}

impl<F> Link for F
where
    F: Fn(&str, &NextLink<'_>) -> Option<Callable>,
{
    #[inline]
    fn proc_addr(&self, name: &str, next: &NextLink<'_>) -> Option<Callable> {
        self(name, next)
    }
}

enum Slot {
    Resolving,
    Resolved {
        callable: Option<Callable>,
        own: bool,
    },
}

/// Resolves names over an ordered list of links, outermost first.
pub struct ChainResolver<'a> {
    links: Vec<&'a dyn Link>,
    slots: Vec<RefCell<HashMap<String, Slot, RandomState>>>,
}

impl<'a> ChainResolver<'a> {
    /// Creates a resolver. The last link is expected to be the terminator.
    pub fn new(links: impl IntoIterator<Item = &'a dyn Link>) -> Self {
        let links: Vec<&'a dyn Link> = links.into_iter().collect();
        let slots = links
            .iter()
            .map(|_| RefCell::new(HashMap::with_hasher(RandomState::default())))
            .collect();

        ChainResolver { links, slots }
    }

    /// Resolves `name` from the outermost link.
    #[inline]
    pub fn resolve(&self, name: &str) -> Option<Callable> {
        self.resolve_from(0, name)
    }

    /// Returns whether the link at `index` defines `name` itself, rather than letting it fall
    /// through.
    pub fn defines(&self, index: usize, name: &str) -> bool {
        self.resolve_from(index, name);

        matches!(
            self.slots.get(index).and_then(|slots| match slots.borrow().get(name) {
                Some(Slot::Resolved { own, .. }) => Some(*own),
                _ => None,
            }),
            Some(true),
        )
    }

    fn resolve_from(&self, index: usize, name: &str) -> Option<Callable> {
        let (link, slots) = (self.links.get(index)?, &self.slots[index]);

        match slots.borrow().get(name) {
            Some(Slot::Resolved { callable, .. }) => return callable.clone(),
            Some(Slot::Resolving) => {
                log::error!("link {} asked for its own {} while resolving it", index, name);
                return None;
            }
            None => (),
        }

        slots.borrow_mut().insert(name.to_owned(), Slot::Resolving);

        let next = NextLink {
            resolver: self,
            index: index + 1,
        };
        let own = link.proc_addr(name, &next);
        let defined = own.is_some();
        let resolved = own.or_else(|| self.resolve_from(index + 1, name));

        slots.borrow_mut().insert(
            name.to_owned(),
            Slot::Resolved {
                callable: resolved.clone(),
                own: defined,
            },
        );

        resolved
    }
}

/// Gives a link access to the implementations of the links below it.
pub struct NextLink<'r> {
    resolver: &'r ChainResolver<'r>,
    index: usize,
}

impl NextLink<'_> {
    /// Returns the next implementation of `name` down the chain.
    #[inline]
    pub fn get(&self, name: &str) -> Option<Callable> {
        self.resolver.resolve_from(self.index, name)
    }

    /// Returns the next implementation of `C` down the chain.
    #[inline]
    pub fn command<C: Command>(&self) -> Option<Arc<C::Pfn>> {
        self.get(C::NAME)
            .and_then(|callable| callable.get::<C>().cloned())
    }
}
