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
//! Recursive tree manager.

use crossbeam::channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use walkdir::{DirEntry, WalkDir};

use super::backend::{Backend, Capabilities, Signal};
use super::dispatch::Listener;
use super::lock;
use super::options::{Opt, WatchOptions};
use super::registry::{Registry, WatchEntry, WatchId};
use super::symlink::{Decision, Policy, Resolver};
use super::{Error, Result};

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Result of relocating a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Relocation {
    /// Subtree was moved along with the directory.
    Renamed,
    /// Subtree was removed, as it can't be watched at the new path.
    Pruned,
    /// Directory wasn't watched.
    Untracked,
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Recursive tree manager.
///
/// The tree manager realizes recursive watches on top of the registry and the
/// backend, which together form the single mutual exclusion domain that is
/// shared between the public entry points and the background thread. The lock
/// is only held to register or unregister entries, and never while walking
/// the file system.
pub(crate) struct Tree {
    /// Registry and backend.
    state: Mutex<State>,
    /// Backend capabilities.
    capabilities: Capabilities,
    /// Signal receiver.
    receiver: Receiver<Signal>,
}

/// Registry and backend.
struct State {
    /// Watch registry.
    registry: Registry,
    /// Primitive backend.
    backend: Box<dyn Backend>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Tree {
    /// Creates a tree manager for the given backend.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            capabilities: backend.capabilities(),
            receiver: backend.signals(),
            state: Mutex::new(State { registry: Registry::new(), backend }),
        }
    }

    /// Returns the capabilities of the backend.
    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Returns the receiver for signals of the backend.
    #[inline]
    pub fn signals(&self) -> Receiver<Signal> {
        self.receiver.clone()
    }

    /// Runs the given function with the registry.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Registry) -> R,
    {
        f(&self.lock().registry)
    }

    /// Adds a root watch for the given real directory path.
    ///
    /// The root is registered and subscribed first, and if the watch is
    /// recursive, its subdirectories are registered and subscribed after.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyWatched`] if the directory is already watched,
    /// and [`Error::Backend`] if the backend rejects the subscription.
    pub fn add_root(
        &self, directory: PathBuf, recursive: bool, listener: Arc<dyn Listener>,
        policy: Policy, options: WatchOptions,
    ) -> Result<WatchId> {
        let native = self.capabilities.native_recursion;
        let id = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let id = WatchId::allocate();
            let entry = WatchEntry::new_root(
                id,
                directory.clone(),
                recursive,
                listener,
                policy,
                options,
            );
            let options = Arc::clone(&entry.options);
            state.registry.register(entry)?;

            // Subscribe to root, and roll back registration on failure
            match state.backend.subscribe(&directory, recursive && native, &options)
            {
                Ok(handle) => {
                    if let Some(entry) = state.registry.get_mut(id) {
                        entry.handle = Some(handle);
                    }
                }
                Err(err) => {
                    state.registry.unregister(id);
                    return Err(Error::Backend {
                        path: directory,
                        source: Box::new(err),
                    });
                }
            }
            id
        };

        // Populate subtree without holding the lock
        tracing::debug!(%id, ?directory, recursive, "watch added");
        if recursive {
            self.populate(id);
        }
        Ok(id)
    }

    /// Populates the subtree of the given entry by walking the file system,
    /// depth-first, registering and subscribing every directory that passes
    /// the symbolic link resolver.
    ///
    /// Directories that cannot be read are skipped, and subscription failures
    /// only remove the failed entry. With native recursion, only followed
    /// symbolic links are registered, as all other directories are covered.
    fn populate(&self, id: WatchId) {
        let native = self.capabilities.native_recursion;
        let Some((root, policy, ancestors)) = self.with(|registry| {
            let entry = registry.lookup_by_id(id)?;
            Some((Arc::clone(&entry.root), entry.policy, registry.ancestors(id)))
        }) else {
            return;
        };
        if native && !policy.follow_symlinks {
            return;
        }

        // Walk the tree with an explicit stack, keeping the chain of real paths
        // for each directory, so the resolver can detect cycles
        let resolver = Resolver::new(policy, &root);
        let mut stack = vec![(id, ancestors)];
        while let Some((parent, ancestors)) = stack.pop() {
            let Some(directory) = ancestors.last() else {
                continue;
            };
            let mut next = Vec::new();
            for candidate in subdirectories(directory) {
                let real = match resolver.check(&candidate, &ancestors) {
                    Decision::Enter(real) => real,
                    Decision::Skip(reason) => {
                        tracing::debug!(?candidate, ?reason, "directory skipped");
                        continue;
                    }
                };

                // With native recursion, plain directories are only walked
                let mut chain = ancestors.clone();
                chain.push(real.clone());
                if native && real == candidate {
                    next.push((parent, chain));
                } else if let Some(child) = self.spawn(parent, candidate, real) {
                    next.push((child, chain));
                }
            }
            stack.extend(next.into_iter().rev());
        }
    }

    /// Registers and subscribes a directory beneath the given parent.
    fn spawn(
        &self, parent: WatchId, origin: PathBuf, directory: PathBuf,
    ) -> Option<WatchId> {
        let native = self.capabilities.native_recursion;
        let mut guard = self.lock();
        let state = &mut *guard;

        // The parent might have been removed while walking
        let id = WatchId::allocate();
        let entry =
            state.registry.lookup_by_id(parent)?.child(id, directory, origin);
        let recursive = entry.recursive && native;
        let options = Arc::clone(&entry.options);
        let directory = entry.directory.clone();
        if let Err(err) = state.registry.register(entry) {
            tracing::trace!(%err, "directory already watched");
            return None;
        }

        // Subscribe, and remove only the failed entry on failure
        match state.backend.subscribe(&directory, recursive, &options) {
            Ok(handle) => {
                if let Some(entry) = state.registry.get_mut(id) {
                    entry.handle = Some(handle);
                }
                tracing::debug!(%id, %parent, ?directory, "directory registered");
                Some(id)
            }
            Err(err) => {
                state.registry.unregister(id);
                tracing::debug!(?directory, %err, "subscription failed");
                None
            }
        }
    }

    /// Grows the subtree of the given owner by a newly created directory.
    ///
    /// The directory is registered and subscribed before its contents are
    /// enumerated, so nothing created in between is missed. If synthetic
    /// events are enabled, the paths of its contents are returned, so they
    /// can be reported as additions, and grown in turn if they are folders.
    /// Otherwise, the entire subtree is populated at once.
    pub fn grow(&self, owner: WatchId, path: &Path, synthetic: bool) -> Vec<PathBuf> {
        let native = self.capabilities.native_recursion;
        let Some((root, policy, mut ancestors)) = self.with(|registry| {
            let entry = registry.lookup_by_id(owner).filter(|e| e.recursive)?;
            Some((Arc::clone(&entry.root), entry.policy, registry.ancestors(owner)))
        }) else {
            return Vec::new();
        };
        if let Some(parent) = path.parent() {
            if ancestors.last().is_none_or(|last| last != parent) {
                ancestors.push(parent.to_path_buf());
            }
        }

        // Check directory with the resolver, as it might be a symbolic link
        let real = match Resolver::new(policy, &root).check(path, &ancestors) {
            Decision::Enter(real) => real,
            Decision::Skip(reason) => {
                tracing::debug!(?path, ?reason, "directory skipped");
                return Vec::new();
            }
        };
        if native && real == path {
            return Vec::new();
        }
        let Some(id) = self.spawn(owner, path.to_path_buf(), real.clone()) else {
            return Vec::new();
        };

        // Enumerate contents only after the directory is subscribed
        if synthetic {
            entries(&real)
                .into_iter()
                .map(|entry| real.join(entry.file_name()))
                .collect()
        } else {
            self.populate(id);
            Vec::new()
        }
    }

    /// Removes the subtree of the given entry, children before parents, and
    /// releases all subscriptions, returning the number of removed entries.
    pub fn prune(&self, id: WatchId) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let ids = state.registry.subtree(id);
        for &id in &ids {
            let Some(entry) = state.registry.unregister(id) else {
                continue;
            };
            if let Some(handle) = entry.handle {
                if let Err(err) = state.backend.unsubscribe(handle) {
                    tracing::debug!(directory = ?entry.directory, %err, "releasing subscription failed");
                }
            }
            tracing::debug!(%id, directory = ?entry.directory, "directory pruned");
        }
        ids.len()
    }

    /// Removes the subtree of the given entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownWatch`] if the entry doesn't exist.
    pub fn remove(&self, id: WatchId) -> Result<usize> {
        match self.prune(id) {
            0 => Err(Error::UnknownWatch(id)),
            n => Ok(n),
        }
    }

    /// Removes the subtree of the entry for the given directory, which is
    /// looked up by scanning all entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no entry matches.
    pub fn remove_by_path(&self, path: &Path) -> Result<usize> {
        let real = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let id = self.with(|registry| {
            registry
                .find_by_directory(&real)
                .or_else(|| registry.find_by_directory(path))
        });
        match id {
            Some(id) => self.remove(id),
            None => Err(Error::NotFound(path.to_path_buf())),
        }
    }

    /// Relocates the subtree of a renamed directory.
    ///
    /// Roots are renamed in place. Other directories stay watched only if the
    /// new location is beneath a recursive entry of the same root and inside
    /// its scope, otherwise their subtree is pruned. All subscriptions of the
    /// subtree are moved, and entries failing to move are pruned.
    pub fn relocate(&self, from: &Path, to: &Path) -> Relocation {
        let native = self.capabilities.native_recursion;
        let mut guard = self.lock();
        let state = &mut *guard;

        // Renaming a followed symbolic link leaves its target untouched
        let Some(id) = state.registry.lookup_by_path(from) else {
            let link = state.registry.iter().find(|e| e.origin == from).map(|e| e.id);
            if let Some(entry) = link.and_then(|id| state.registry.get_mut(id)) {
                entry.origin = to.to_path_buf();
                return Relocation::Renamed;
            }
            return Relocation::Untracked;
        };
        let Some(entry) = state.registry.lookup_by_id(id) else {
            return Relocation::Untracked;
        };

        // Determine the new parent for all but roots
        let root = Arc::clone(&entry.root);
        let policy = entry.policy;
        let parent = if entry.is_root() {
            None
        } else {
            let parent = state
                .registry
                .owner(to, native)
                .and_then(|id| state.registry.lookup_by_id(id))
                .filter(|parent| parent.recursive && parent.root == root)
                .map(WatchEntry::id);
            let in_scope = policy.allow_out_of_scope_links || to.starts_with(&*root);
            match parent {
                Some(parent) if in_scope => Some(parent),
                _ => {
                    drop(guard);
                    self.prune(id);
                    return Relocation::Pruned;
                }
            }
        };

        // Rewrite paths of the subtree, and pick up the new scope for roots
        if let Err(err) = state.registry.relocate(id, to) {
            tracing::debug!(%err, "relocation failed");
            drop(guard);
            self.prune(id);
            return Relocation::Pruned;
        }
        let subtree = state.registry.subtree(id);
        match parent {
            Some(parent) => state.registry.reparent(id, parent),
            None => {
                let root = Arc::new(to.to_path_buf());
                for &sub in &subtree {
                    if let Some(entry) = state.registry.get_mut(sub) {
                        entry.root = Arc::clone(&root);
                    }
                }
            }
        }

        // Move subscriptions, collecting entries that failed to move
        let mut failed = Vec::new();
        for &sub in &subtree {
            let Some(entry) = state.registry.get_mut(sub) else {
                continue;
            };
            let Some(handle) = entry.handle else {
                continue;
            };
            let recursive = entry.recursive && native;
            match state.backend.relocate(handle, &entry.directory, recursive, &entry.options) {
                Ok(handle) => entry.handle = Some(handle),
                Err(err) => {
                    tracing::debug!(directory = ?entry.directory, %err, "resubscription failed");
                    entry.handle = None;
                    failed.push(sub);
                }
            }
        }
        drop(guard);
        for sub in failed {
            self.prune(sub);
        }
        tracing::debug!(%id, ?from, ?to, "directory relocated");
        Relocation::Renamed
    }

    /// Returns the real paths of all root directories.
    pub fn directories(&self) -> Vec<PathBuf> {
        self.with(Registry::directories)
    }

    /// Returns whether the given option is enabled for the owner of a path.
    pub fn is_enabled(&self, path: &Path, opt: Opt, default: bool) -> bool {
        let native = self.capabilities.native_recursion;
        self.with(|registry| {
            registry
                .owner(path, native)
                .and_then(|id| registry.lookup_by_id(id))
                .map_or(default, |entry| entry.options.is_enabled(opt, default))
        })
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.with(Registry::len)
    }

    /// Returns the revision of the registry.
    pub fn revision(&self) -> u64 {
        self.with(Registry::revision)
    }

    /// Locks the registry and backend.
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Returns the entries of a directory in ascending order.
fn entries(directory: &Path) -> Vec<DirEntry> {
    WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|res| {
            res.inspect_err(|err| {
                tracing::debug!(?directory, %err, "entry skipped");
            })
            .ok()
        })
        .collect()
}

/// Returns the subdirectories of a directory in ascending order, including
/// symbolic links pointing to directories.
fn subdirectories(directory: &Path) -> Vec<PathBuf> {
    entries(directory)
        .into_iter()
        .filter(|entry| {
            entry.file_type().is_dir()
                || (entry.path_is_symlink() && entry.path().is_dir())
        })
        .map(DirEntry::into_path)
        .collect()
}
