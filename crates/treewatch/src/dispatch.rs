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
//! Event dispatcher.

use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::thread::{self, ThreadId};

use super::event::{Action, Event};
use super::lock;
use super::normalize::Change;
use super::registry::{Registry, WatchId};
use super::tree::Tree;

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// Event listener.
///
/// Listeners are invoked on the watcher's background thread, and must not
/// block indefinitely, as this delays delivery of all subsequent events. Any
/// user data is simply captured by the listener.
///
/// This trait is implemented for all functions and closures taking an event.
///
/// # Examples
///
/// ```
/// use treewatch::{Event, Listener};
///
/// // Create listener
/// struct Printer;
///
/// impl Listener for Printer {
///     fn handle_file_action(&self, event: &Event) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait Listener: Send + Sync {
    /// Handles an event.
    fn handle_file_action(&self, event: &Event);
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Event dispatcher.
///
/// Delivery happens while holding the delivery lock, which removals acquire
/// before unregistering, so once a removal returns, no listener of the removed
/// subtree is invoked anymore. Listeners may remove watches themselves, which
/// is why removals on the background thread skip the delivery lock.
#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    /// Delivery lock.
    delivery: Mutex<()>,
    /// Background thread.
    worker: OnceLock<ThreadId>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Dispatcher {
    /// Binds the dispatcher to the current thread, which delivers events.
    pub fn bind(&self) {
        let _ = self.worker.set(thread::current().id());
    }

    /// Runs the given function exclusively with respect to delivery.
    pub fn exclusive<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if self.worker.get() == Some(&thread::current().id()) {
            f()
        } else {
            let _guard = lock(&self.delivery);
            f()
        }
    }

    /// Dispatches a change to the watch owning it, and returns its identifier.
    ///
    /// If no watch owns the change, which happens for the directory of a root
    /// itself, e.g., when it was deleted or renamed, and the directory is a
    /// registered root, the change is dispatched to that root.
    pub fn dispatch(&self, tree: &Tree, change: &Change) -> Option<WatchId> {
        let native = tree.capabilities().native_recursion;
        let _guard = lock(&self.delivery);
        let (id, listener, event) = tree.with(|registry| {
            let id = registry
                .owner(&change.path, native)
                .or_else(|| root(registry, &change.path))?;
            let entry = registry.lookup_by_id(id)?;
            Some((id, entry.listener.clone(), event(id, change)?))
        })?;

        // Deliver event without holding the registry lock
        tracing::trace!(%id, action = ?event.action, path = ?event.path(), "dispatch");
        listener.handle_file_action(&event);
        Some(id)
    }

    /// Dispatches a change to the given watch.
    pub fn dispatch_to(&self, tree: &Tree, id: WatchId, change: &Change) -> bool {
        let _guard = lock(&self.delivery);
        let found = tree.with(|registry| {
            let entry = registry.lookup_by_id(id)?;
            Some((entry.listener.clone(), event(id, change)?))
        });
        let Some((listener, event)) = found else {
            return false;
        };
        tracing::trace!(%id, action = ?event.action, path = ?event.path(), "dispatch");
        listener.handle_file_action(&event);
        true
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    #[inline]
    fn handle_file_action(&self, event: &Event) {
        self(event);
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Returns the identifier of the root registered for the given path.
fn root(registry: &Registry, path: &Path) -> Option<WatchId> {
    registry
        .lookup_by_path(path)
        .filter(|&id| registry.lookup_by_id(id).is_some_and(|e| e.is_root()))
}

/// Creates an event for a change.
///
/// The previous name of a rename is only reported as a name if the directory
/// didn't change, and as the full previous path otherwise.
fn event(id: WatchId, change: &Change) -> Option<Event> {
    let directory = change.path.parent()?;
    let filename = change.path.file_name()?;
    let old_filename = match (&change.action, &change.from) {
        (Action::Moved, Some(from)) => Some(if from.parent() == Some(directory) {
            from.file_name().map_or_else(|| from.clone(), Into::into)
        } else {
            from.clone()
        }),
        _ => None,
    };
    Some(Event {
        id,
        directory: directory.to_path_buf(),
        filename: filename.into(),
        action: change.action,
        old_filename,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_event_same_directory() {
        let change = Change::moved("/a/old.txt", "/a/new.txt");
        let event = event(WatchId::new(1), &change).unwrap();
        assert_eq!(event.directory, PathBuf::from("/a"));
        assert_eq!(event.filename, PathBuf::from("new.txt"));
        assert_eq!(event.old_filename, Some(PathBuf::from("old.txt")));
    }

    #[test]
    fn test_event_other_directory() {
        let change = Change::moved("/b/old.txt", "/a/new.txt");
        let event = event(WatchId::new(1), &change).unwrap();
        assert_eq!(event.old_filename, Some(PathBuf::from("/b/old.txt")));
        assert_eq!(event.old_path(), Some(PathBuf::from("/b/old.txt")));
    }

    #[test]
    fn test_event_without_rename() {
        let change = Change::new(Action::Add, "/a/x.txt");
        let event = event(WatchId::new(2), &change).unwrap();
        assert_eq!(event.action, Action::Add);
        assert!(event.old_filename.is_none());
        assert!(super::event(WatchId::new(2), &Change::new(Action::Add, "/")).is_none());
    }
}
