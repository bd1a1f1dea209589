// Copyright (c) 2025 Zensical and contributors

// SPDX-License-Identifier: MIT
// Third-party contributions licensed under DCO

// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:

// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

// ----------------------------------------------------------------------------
//! Watch registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use super::backend::Handle;
use super::dispatch::Listener;
use super::options::WatchOptions;
use super::symlink::Policy;
use super::{Error, Result};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Watch identifier.
///
/// Identifiers are allocated from a process-wide counter in strictly
/// increasing order, starting at `1`, and are never reused, so identifiers of
/// distinct watchers never collide. Negative values are reserved for the error
/// codes returned by [`Error::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(i64);

// ----------------------------------------------------------------------------

/// Watch entry.
///
/// There's exactly one entry per subscribed directory. Entries spawned beneath
/// a root to realize recursion share the listener, options and link policy of
/// the root, and are linked to it via their parent identifiers.
#[derive(Clone)]
pub struct WatchEntry {
    /// Watch identifier.
    pub(crate) id: WatchId,
    /// Real path of the directory.
    pub(crate) directory: PathBuf,
    /// Path through which the directory was discovered.
    pub(crate) origin: PathBuf,
    /// Whether the original request was recursive.
    pub(crate) recursive: bool,
    /// Listener shared by the entire subtree.
    pub(crate) listener: Arc<dyn Listener>,
    /// Parent identifier, unless the entry is a root.
    pub(crate) parent: Option<WatchId>,
    /// Child identifiers.
    pub(crate) children: BTreeSet<WatchId>,
    /// Backend subscription handle.
    pub(crate) handle: Option<Handle>,
    /// Symbolic link policy.
    pub(crate) policy: Policy,
    /// Real path of the root, which is the scope boundary.
    pub(crate) root: Arc<PathBuf>,
    /// Watch options.
    pub(crate) options: Arc<WatchOptions>,
}

// ----------------------------------------------------------------------------

/// Watch registry.
///
/// The registry owns the mapping from identifiers to entries, as well as the
/// mapping from real directory paths to identifiers, and keeps both mutually
/// consistent. Entries form an arena, in which parents and children refer to
/// each other by identifier, so subtree walks are simple lookups.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use treewatch::{Registry, WatchId};
///
/// // Create registry and allocate identifier
/// let registry = Registry::new();
/// let id = WatchId::allocate();
/// assert!(id.get() > 0);
/// assert!(registry.lookup_by_path(&PathBuf::from("/docs")).is_none());
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    /// Entries by identifier.
    entries: BTreeMap<WatchId, WatchEntry>,
    /// Identifiers by real directory path.
    paths: BTreeMap<PathBuf, WatchId>,
    /// Revision, advanced whenever directories leave or move.
    revision: u64,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl WatchId {
    /// Allocates the next identifier from the process-wide counter.
    #[must_use]
    pub fn allocate() -> Self {
        static NEXT: AtomicI64 = AtomicI64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Creates a watch identifier from a raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value of the watch identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

// ----------------------------------------------------------------------------

impl WatchEntry {
    /// Creates a root entry.
    pub(crate) fn new_root(
        id: WatchId, directory: PathBuf, recursive: bool,
        listener: Arc<dyn Listener>, policy: Policy, options: WatchOptions,
    ) -> Self {
        Self {
            id,
            origin: directory.clone(),
            root: Arc::new(directory.clone()),
            directory,
            recursive,
            listener,
            parent: None,
            children: BTreeSet::new(),
            handle: None,
            policy,
            options: Arc::new(options),
        }
    }

    /// Creates a child entry, inheriting everything but the paths.
    pub(crate) fn child(
        &self, id: WatchId, directory: PathBuf, origin: PathBuf,
    ) -> Self {
        Self {
            id,
            directory,
            origin,
            recursive: self.recursive,
            listener: Arc::clone(&self.listener),
            parent: Some(self.id),
            children: BTreeSet::new(),
            handle: None,
            policy: self.policy,
            root: Arc::clone(&self.root),
            options: Arc::clone(&self.options),
        }
    }

    /// Returns the watch identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Returns the real path of the directory.
    #[inline]
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the path through which the directory was discovered, which
    /// differs from the real path for followed symbolic links.
    #[inline]
    #[must_use]
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Returns whether the original request was recursive.
    #[inline]
    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Returns whether the entry is a root.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns the parent identifier.
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<WatchId> {
        self.parent
    }

    /// Returns the child identifiers.
    #[inline]
    #[must_use]
    pub fn children(&self) -> &BTreeSet<WatchId> {
        &self.children
    }

    /// Returns the symbolic link policy.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Returns the real path of the root.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the watch options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &WatchOptions {
        &self.options
    }
}

// ----------------------------------------------------------------------------

impl Registry {
    /// Creates a registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry, linking it into the children of its parent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyWatched`] if the directory is already a key.
    pub fn register(&mut self, entry: WatchEntry) -> Result<WatchId> {
        if self.paths.contains_key(&entry.directory) {
            return Err(Error::AlreadyWatched(entry.directory));
        }

        // Link entry into parent, if any
        let id = entry.id;
        if let Some(parent) = entry.parent.and_then(|id| self.entries.get_mut(&id)) {
            parent.children.insert(id);
        }
        self.paths.insert(entry.directory.clone(), id);
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Unregisters an entry, and returns it.
    ///
    /// Descendants must be unregistered first, see [`Registry::subtree`].
    pub fn unregister(&mut self, id: WatchId) -> Option<WatchEntry> {
        let entry = self.entries.remove(&id)?;
        self.paths.remove(&entry.directory);
        if let Some(parent) = entry.parent.and_then(|id| self.entries.get_mut(&id)) {
            parent.children.remove(&id);
        }
        self.revision += 1;
        Some(entry)
    }

    /// Returns the identifier of the entry for the given real path.
    #[must_use]
    pub fn lookup_by_path(&self, path: &Path) -> Option<WatchId> {
        self.paths.get(path).copied()
    }

    /// Returns the entry for the given identifier.
    #[must_use]
    pub fn lookup_by_id(&self, id: WatchId) -> Option<&WatchEntry> {
        self.entries.get(&id)
    }

    /// Returns a mutable reference to the entry for the given identifier.
    pub(crate) fn get_mut(&mut self, id: WatchId) -> Option<&mut WatchEntry> {
        self.entries.get_mut(&id)
    }

    /// Finds the entry for the given directory by scanning all entries.
    ///
    /// Unlike [`Registry::lookup_by_path`], this also matches the paths that
    /// directories were discovered through, preferring roots, which is why
    /// it must scan every entry.
    #[must_use]
    pub fn find_by_directory(&self, path: &Path) -> Option<WatchId> {
        let mut found = None;
        for entry in self.entries.values() {
            if entry.directory == path || entry.origin == path {
                if entry.is_root() {
                    return Some(entry.id);
                }
                found.get_or_insert(entry.id);
            }
        }
        found
    }

    /// Returns the identifiers of the subtree of the given entry, children
    /// before their parents, ending with the entry itself.
    #[must_use]
    pub fn subtree(&self, id: WatchId) -> Vec<WatchId> {
        let mut ids = Vec::new();
        if self.entries.contains_key(&id) {
            self.collect(id, &mut ids);
        }
        ids
    }

    /// Collects the subtree in post-order.
    fn collect(&self, id: WatchId, ids: &mut Vec<WatchId>) {
        if let Some(entry) = self.entries.get(&id) {
            for &child in &entry.children {
                self.collect(child, ids);
            }
        }
        ids.push(id);
    }

    /// Returns the real paths of the chain of directories from the root down
    /// to the given entry, including it.
    #[must_use]
    pub fn ancestors(&self, id: WatchId) -> Vec<PathBuf> {
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(entry) = next.and_then(|id| self.entries.get(&id)) {
            chain.push(entry.directory.clone());
            next = entry.parent;
        }
        chain.reverse();
        chain
    }

    /// Returns the root identifier of the given entry.
    #[must_use]
    pub fn root_of(&self, id: WatchId) -> Option<WatchId> {
        let mut entry = self.entries.get(&id)?;
        while let Some(parent) = entry.parent.and_then(|id| self.entries.get(&id)) {
            entry = parent;
        }
        Some(entry.id)
    }

    /// Returns the identifier of the entry owning events for the given path.
    ///
    /// This is the entry of the directory containing the path. With native
    /// recursion, subdirectories are not registered, so the nearest recursive
    /// entry above the path owns it.
    #[must_use]
    pub fn owner(&self, path: &Path, native: bool) -> Option<WatchId> {
        let parent = path.parent()?;
        if !native {
            return self.lookup_by_path(parent);
        }
        parent.ancestors().find_map(|dir| {
            self.lookup_by_path(dir).filter(|id| {
                dir == parent || self.entries.get(id).is_some_and(|e| e.recursive)
            })
        })
    }

    /// Moves the subtree of the given entry to a new path, rewriting the
    /// directories of all descendants located beneath the old path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyWatched`] if any rewritten path is taken.
    pub fn relocate(&mut self, id: WatchId, to: &Path) -> Result {
        let Some(from) = self.entries.get(&id).map(|e| e.directory.clone())
        else {
            return Err(Error::UnknownWatch(id));
        };

        // Compute all rewrites first, so nothing is changed on conflicts
        let mut moves = Vec::new();
        for sub in self.subtree(id) {
            let Some(entry) = self.entries.get(&sub) else {
                continue;
            };
            if let Ok(rest) = entry.directory.strip_prefix(&from) {
                let path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                if self.paths.get(&path).is_some_and(|&other| other != sub) {
                    return Err(Error::AlreadyWatched(path));
                }
                moves.push((sub, path));
            }
        }

        // Rekey all entries, removing all old keys before inserting new ones,
        // as old and new paths of different entries might overlap
        for (sub, _) in &moves {
            if let Some(entry) = self.entries.get(sub) {
                self.paths.remove(&entry.directory);
            }
        }
        for (sub, path) in moves {
            if let Some(entry) = self.entries.get_mut(&sub) {
                if let Ok(rest) = entry.origin.strip_prefix(&from) {
                    entry.origin = if rest.as_os_str().is_empty() {
                        to.to_path_buf()
                    } else {
                        to.join(rest)
                    };
                }
                entry.directory.clone_from(&path);
                self.paths.insert(path, sub);
            }
        }
        self.revision += 1;
        Ok(())
    }

    /// Moves the given entry beneath a new parent.
    pub(crate) fn reparent(&mut self, id: WatchId, parent: WatchId) {
        let Some(prev) = self.entries.get(&id).and_then(|e| e.parent) else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&prev) {
            entry.children.remove(&id);
        }
        if let Some(entry) = self.entries.get_mut(&parent) {
            entry.children.insert(id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.parent = Some(parent);
        }
    }

    /// Returns the real paths of all root directories.
    #[must_use]
    pub fn directories(&self) -> Vec<PathBuf> {
        self.entries
            .values()
            .filter(|entry| entry.is_root())
            .map(|entry| entry.directory.clone())
            .collect()
    }

    /// Returns an iterator over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &WatchEntry> {
        self.entries.values()
    }

    /// Returns the number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether there are any entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the revision.
    #[inline]
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl fmt::Display for WatchId {
    /// Formats the watch identifier for display.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for WatchEntry {
    /// Formats the watch entry for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WatchEntry")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .field("recursive", &self.recursive)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
