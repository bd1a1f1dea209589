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
//! Recursive directory watcher with normalized events.
//!
//! The watcher turns a request to watch a directory, optionally recursively,
//! into a set of per-directory subscriptions of a primitive backend, keeps it
//! in sync as directories are created, removed and renamed, and converts the
//! raw signals of the backend into a uniform set of actions, i.e., additions,
//! removals, modifications and renames, which are delivered to listeners.
//!
//! # Examples
//!
//! ```no_run
//! # use std::error::Error;
//! # fn main() -> Result<(), Box<dyn Error>> {
//! use treewatch::{Event, Watcher};
//!
//! // Create watcher and watch directory recursively
//! let mut watcher = Watcher::builder().build()?;
//! watcher.add_watch("docs", true, |event: &Event| {
//!     println!("{:?} {}", event.action, event.path().display());
//! })?;
//! watcher.watch()?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
mod dispatch;
mod error;
mod event;
pub mod fingerprint;
pub mod mount;
mod normalize;
mod options;
mod registry;
pub mod symlink;
mod tree;
mod watcher;

pub use dispatch::Listener;
pub use error::{Error, Result};
pub use event::{Action, Event, Kind};
pub use options::{
    DEFAULT_BUFFER_SIZE, MODIFIED_CONTENT, MODIFIED_METADATA, Opt, WatchOptions,
};
pub use registry::{Registry, WatchEntry, WatchId};
pub use watcher::{Builder, Watcher};

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Locks the given mutex, recovering from poisoning, as all state guarded by
/// mutexes in this crate is consistent between individual operations.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
