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
//! Directory watcher builder.

use std::time::Duration;

use crate::backend::{Backend, Native, Poll};
use crate::symlink::Policy;
use crate::tree::Tree;
use crate::Result;

use super::{Shared, Watcher, DEFAULT_BATCH_WINDOW, DEFAULT_POLL_INTERVAL};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Directory watcher builder.
pub struct Builder {
    /// Whether to use the polling backend.
    generic: bool,
    /// Symbolic link policy.
    policy: Policy,
    /// Window for batching signals.
    batch_window: Duration,
    /// Window for pairing renames.
    rename_window: Option<Duration>,
    /// Interval of the polling backend.
    poll_interval: Duration,
    /// Primitive backend.
    backend: Option<Box<dyn Backend>>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Builder {
    /// Creates a directory watcher builder.
    ///
    /// Note that the canonical way to create a [`Watcher`] is to invoke the
    /// [`Watcher::builder`] method, which creates an instance of [`Builder`].
    ///
    /// # Examples
    ///
    /// ```
    /// use treewatch::Watcher;
    ///
    /// // Create directory watcher builder
    /// let builder = Watcher::builder();
    /// ```
    #[allow(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            generic: false,
            policy: Policy::default(),
            batch_window: DEFAULT_BATCH_WINDOW,
            rename_window: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backend: None,
        }
    }

    /// Sets whether to use the polling backend instead of the native one,
    /// which is necessary for network file systems.
    #[must_use]
    pub fn generic(mut self, value: bool) -> Self {
        self.generic = value;
        self
    }

    /// Sets whether symbolic links are followed.
    #[must_use]
    pub fn follow_symlinks(mut self, value: bool) -> Self {
        self.policy.follow_symlinks = value;
        self
    }

    /// Sets whether followed links may leave the scope of a watch.
    #[must_use]
    pub fn allow_out_of_scope_links(mut self, value: bool) -> Self {
        self.policy.allow_out_of_scope_links = value;
        self
    }

    /// Sets the window for batching signals.
    #[must_use]
    pub fn batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Sets the window for pairing renames across batches.
    #[must_use]
    pub fn rename_window(mut self, window: Duration) -> Self {
        self.rename_window = Some(window);
        self
    }

    /// Sets the interval of the polling backend.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the primitive backend, taking precedence over all others.
    #[must_use]
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Builds the directory watcher.
    ///
    /// If the native backend cannot be created, e.g., because the limit of
    /// instances is exhausted, the polling backend is used instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the polling backend cannot be created.
    pub fn build(self) -> Result<Watcher> {
        let backend: Box<dyn Backend> = match self.backend {
            Some(backend) => backend,
            None if self.generic => Box::new(Poll::new(self.poll_interval)?),
            None => match Native::recommended() {
                Ok(backend) => Box::new(backend),
                Err(err) => {
                    tracing::warn!(%err, "native backend unavailable, polling");
                    Box::new(Poll::new(self.poll_interval)?)
                }
            },
        };
        tracing::debug!(?backend, "backend selected");

        // Create shared state and worker
        let shared = Shared::new(Tree::new(backend), self.policy);
        Ok(Watcher::from_parts(
            shared,
            self.batch_window,
            self.rename_window,
        ))
    }
}
