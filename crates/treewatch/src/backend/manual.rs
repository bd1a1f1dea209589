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
//! Manual backend.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::options::WatchOptions;
use crate::{Error, Result};

use super::{Backend, Capabilities, Handle, Signal};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Manual backend.
///
/// The manual backend doesn't observe the file system at all. Instead, signals
/// are injected through the [`Injector`] returned alongside it, which makes it
/// possible to emulate any primitive mechanism by choosing its capabilities,
/// and to reproduce races deterministically.
///
/// # Examples
///
/// ```
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// use std::path::PathBuf;
/// use treewatch::backend::{Capabilities, Manual, Signal};
///
/// // Create manual backend and inject signal
/// let (backend, injector) = Manual::new(Capabilities::default());
/// injector.send(Signal::Create(PathBuf::from("docs/index.md")))?;
/// # drop(backend);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Manual {
    /// Backend capabilities.
    capabilities: Capabilities,
    /// Shared state.
    shared: Arc<Mutex<Shared>>,
    /// Handle counter.
    next: u64,
    /// Signal receiver.
    receiver: Receiver<Signal>,
}

/// Signal injector.
#[derive(Clone, Debug)]
pub struct Injector {
    /// Shared state.
    shared: Arc<Mutex<Shared>>,
    /// Signal sender.
    sender: Sender<Signal>,
}

/// Shared state.
#[derive(Debug, Default)]
struct Shared {
    /// Subscribed paths.
    subscriptions: BTreeMap<Handle, PathBuf>,
    /// Paths to reject on subscription.
    rejected: BTreeSet<PathBuf>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Manual {
    /// Creates a manual backend with the given capabilities.
    #[must_use]
    pub fn new(capabilities: Capabilities) -> (Self, Injector) {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let injector = Injector {
            shared: Arc::clone(&shared),
            sender,
        };
        let backend = Self {
            capabilities,
            shared,
            next: 0,
            receiver,
        };
        (backend, injector)
    }
}

impl Injector {
    /// Injects a signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the backend was dropped.
    pub fn send(&self, signal: Signal) -> Result {
        self.sender.send(signal).map_err(Into::into)
    }

    /// Returns the currently subscribed paths, in ascending order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> =
            lock(&self.shared).subscriptions.values().cloned().collect();
        paths.sort();
        paths
    }

    /// Makes subscriptions to the given path fail from now on.
    pub fn reject<P>(&self, path: P)
    where
        P: AsRef<Path>,
    {
        lock(&self.shared)
            .rejected
            .insert(path.as_ref().to_path_buf());
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Backend for Manual {
    #[inline]
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn subscribe(
        &mut self, path: &Path, _recursive: bool, _options: &WatchOptions,
    ) -> Result<Handle> {
        let mut shared = lock(&self.shared);
        if shared.rejected.contains(path) {
            return Err(Error::Unspecified(format!(
                "subscription rejected ({})",
                path.display()
            )));
        }
        let handle = Handle::next(&mut self.next);
        shared.subscriptions.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: Handle) -> Result {
        lock(&self.shared).subscriptions.remove(&handle);
        Ok(())
    }

    #[inline]
    fn signals(&self) -> Receiver<Signal> {
        self.receiver.clone()
    }
}
