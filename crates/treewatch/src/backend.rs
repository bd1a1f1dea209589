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
//! Primitive backends.

use crossbeam::channel::Receiver;
use std::fmt;
use std::path::{Path, PathBuf};

use super::fingerprint::Snapshot;
use super::options::WatchOptions;
use super::Result;

mod manual;
mod native;
mod poll;

pub use manual::{Injector, Manual};
pub use native::Native;
pub use poll::Poll;

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Raw backend signal.
///
/// Signals are the vocabulary in which backends report what they observed,
/// before events are paired, diffed and sanitized. Backends emit whichever
/// subset of signals their primitive mechanism is able to produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// File or folder was created.
    Create(PathBuf),
    /// File or folder was removed.
    Delete(PathBuf),
    /// File or folder was modified.
    Modify(PathBuf),
    /// File or folder was renamed, and this is the previous path.
    RenameFrom {
        /// Previous path.
        path: PathBuf,
        /// Pairing token shared with the matching [`Signal::RenameTo`].
        token: Option<usize>,
    },
    /// File or folder was renamed, and this is the next path.
    RenameTo {
        /// Next path.
        path: PathBuf,
        /// Pairing token shared with the matching [`Signal::RenameFrom`].
        token: Option<usize>,
    },
    /// File or folder was renamed, and both paths are known.
    Rename {
        /// Previous path.
        from: PathBuf,
        /// Next path.
        to: PathBuf,
    },
    /// File or folder was renamed, but the direction is unknown.
    Renamed(PathBuf),
    /// Full snapshot of a directory.
    Snapshot {
        /// Directory path.
        directory: PathBuf,
        /// Directory snapshot.
        snapshot: Snapshot,
        /// Whether the snapshot replaces previous state without diffing.
        baseline: bool,
    },
    /// Events were dropped, e.g., due to an overflowing queue.
    Overflow(Option<PathBuf>),
    /// Backend failed.
    Failure {
        /// Affected path, if known.
        path: Option<PathBuf>,
        /// Error message.
        message: String,
    },
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Backend subscription handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

// ----------------------------------------------------------------------------

/// Backend capabilities.
///
/// The watcher is written entirely against these capabilities, and decides
/// how to realize recursion, pair renames and sanitize events based on them.
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Subscribing to a directory covers its entire subtree.
    pub native_recursion: bool,
    /// Renames are reported with a pairing token.
    pub rename_token: bool,
    /// Changes are reported as full directory snapshots.
    pub snapshots: bool,
    /// Duplicate or contradictory signals are emitted.
    pub over_reports: bool,
    /// Change detection is reliable on network file systems.
    pub remote: bool,
}

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// Primitive backend.
///
/// A backend owns the resources of the operating system's change notification
/// mechanism. Subscriptions are made per directory, and non-recursive unless
/// the backend supports native recursion, in which case the watcher requests
/// recursive subscriptions. Signals are drained from the receiver returned by
/// [`Backend::signals`] on the watcher's background thread.
pub trait Backend: Send {
    /// Returns the capabilities of the backend.
    fn capabilities(&self) -> Capabilities;

    /// Subscribes to the directory at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the primitive mechanism rejects the directory.
    fn subscribe(
        &mut self, path: &Path, recursive: bool, options: &WatchOptions,
    ) -> Result<Handle>;

    /// Releases a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the primitive mechanism fails to release it, which
    /// is common for directories that were already removed.
    fn unsubscribe(&mut self, handle: Handle) -> Result;

    /// Moves a subscription to the new path of a renamed directory.
    ///
    /// # Errors
    ///
    /// Returns an error if subscribing to the new path fails.
    fn relocate(
        &mut self, handle: Handle, path: &Path, recursive: bool,
        options: &WatchOptions,
    ) -> Result<Handle> {
        if let Err(err) = self.unsubscribe(handle) {
            tracing::debug!(?handle, %err, "releasing stale subscription failed");
        }
        self.subscribe(path, recursive, options)
    }

    /// Returns the receiver for signals.
    fn signals(&self) -> Receiver<Signal>;
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Handle {
    /// Creates a handle from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of the handle.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Advances the given counter and returns the next handle.
    fn next(counter: &mut u64) -> Self {
        *counter += 1;
        Self(*counter)
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl fmt::Debug for dyn Backend {
    /// Formats the backend for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Backend")
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}
