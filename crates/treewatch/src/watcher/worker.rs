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
//! Background worker.

use ahash::HashSet;
use crossbeam::channel::{after, never, select_biased, Receiver};
use std::collections::VecDeque;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::Signal;
use crate::event::Action;
use crate::normalize::{Change, Normalizer, Outcome};
use crate::options::Opt;
use crate::registry::WatchEntry;
use crate::tree::Relocation;
use crate::Result;

use super::Shared;

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Background worker.
///
/// The worker drains the signals of the backend, batches them, and processes
/// each batch by normalizing it, updating the tree for structural changes and
/// dispatching events to the listeners.
pub(crate) struct Worker {
    /// Shared state.
    shared: Arc<Shared>,
    /// Signal receiver.
    receiver: Receiver<Signal>,
    /// Event normalizer.
    normalizer: Normalizer,
    /// Window for batching signals.
    window: Duration,
    /// Queue for signals of the current batch.
    queue: Vec<Signal>,
    /// Deadline of the current batch.
    deadline: Option<Instant>,
    /// Last seen revision of the registry.
    revision: u64,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Worker {
    /// Creates a worker.
    pub fn new(shared: Arc<Shared>, window: Duration, rename: Option<Duration>) -> Self {
        Self {
            receiver: shared.tree.signals(),
            revision: shared.tree.revision(),
            shared,
            normalizer: Normalizer::new(rename),
            window,
            queue: Vec::new(),
            deadline: None,
        }
    }

    /// Runs the event loop until the stop receiver disconnects.
    pub fn run(&mut self, stop: &Receiver<()>) -> Result {
        self.shared.dispatcher.bind();
        loop {
            // A batch is processed once its window elapsed, counted from its
            // first signal, or when a pending rename expires
            let deadline = match (self.deadline, self.normalizer.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let wait = deadline.map(|at| at.saturating_duration_since(Instant::now()));

            // Select over the stop receiver, the backend and the timeout, and
            // prioritize stopping over processing
            let mut flush = false;
            select_biased! {
                recv(stop) -> _ => return Ok(()),
                recv(self.receiver) -> message => {
                    let signal = message?;
                    if self.deadline.is_none() {
                        self.deadline = Some(Instant::now() + self.window);
                    }
                    self.queue.push(signal);
                }
                recv(wait.map_or_else(never, after)) -> _ => flush = true,
            }

            // Process batch after leaving select
            if flush {
                self.deadline = None;
                let batch = mem::take(&mut self.queue);
                self.process(batch);
            }
        }
    }

    /// Processes a batch of signals.
    #[tracing::instrument(level = "debug", skip_all, fields(signals = batch.len()))]
    pub fn process(&mut self, batch: Vec<Signal>) {
        let outcomes = self.normalizer.normalize(batch, Instant::now());

        // Failures are handled in order, after all changes preceding them
        let mut changes = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Change(change) => changes.push(change),
                Outcome::Failure { path, message } => {
                    self.apply(mem::take(&mut changes));
                    self.fail(path, &message);
                }
            }
        }
        self.apply(changes);

        // Drop state of directories that are no longer watched
        let revision = self.shared.tree.revision();
        if revision != self.revision {
            self.revision = revision;
            let directories: HashSet<PathBuf> = self.shared.tree.with(|registry| {
                registry.iter().map(|e| e.directory().to_path_buf()).collect()
            });
            self.normalizer.retain(|directory| directories.contains(directory));
        }
        if self.normalizer.has_pending() {
            tracing::trace!("renames pending");
        }
    }

    /// Applies changes to the tree, and dispatches them.
    fn apply(&mut self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let shared = &self.shared;
        let tree = &shared.tree;
        let capabilities = tree.capabilities();
        let native = capabilities.native_recursion;

        // Sanitize changes for backends that over-report, or if requested
        let changes = self.normalizer.sanitize(changes, |path| {
            tree.is_enabled(path, Opt::SanitizeEvents, capabilities.over_reports)
        });

        // Process changes in order, where synthesized changes for the contents
        // of new directories are processed right after the directory
        let mut queue = VecDeque::from(changes);
        while let Some(change) = queue.pop_front() {
            match change.action {
                Action::Add => {
                    let Some(id) = shared.dispatcher.dispatch(tree, &change) else {
                        continue;
                    };
                    if change.path.is_dir() {
                        let synthetic =
                            tree.is_enabled(&change.path, Opt::SyntheticEvents, true);
                        let paths = tree.grow(id, &change.path, synthetic);
                        for path in paths.into_iter().rev() {
                            queue.push_front(Change::new(Action::Add, path));
                        }
                    }
                }

                // Removals are dispatched before pruning, so removals of roots
                // can still be delivered to them
                Action::Delete => {
                    shared.dispatcher.dispatch(tree, &change);
                    let target = tree.with(|registry| {
                        registry.lookup_by_path(&change.path).or_else(|| {
                            registry
                                .iter()
                                .find(|entry| entry.origin() == change.path)
                                .map(WatchEntry::id)
                        })
                    });
                    if let Some(id) = target {
                        tree.prune(id);
                    }
                }

                // Renames are only reported as such if both paths are watched
                // by the same root, and otherwise downgraded to a removal, an
                // addition, or both
                Action::Moved => {
                    let Some(from) = change.from.clone() else {
                        continue;
                    };
                    let (owner, previous, root, across) = tree.with(|registry| {
                        let root = registry.lookup_by_path(&from).filter(|&id| {
                            registry.lookup_by_id(id).is_some_and(WatchEntry::is_root)
                        });
                        let owner = registry.owner(&change.path, native);
                        let previous = registry.owner(&from, native);
                        let across = match (owner, previous) {
                            (Some(owner), Some(previous)) => {
                                registry.root_of(owner) != registry.root_of(previous)
                            }
                            _ => false,
                        };
                        (owner, previous, root, across)
                    });
                    if root.is_none() {
                        if across {
                            queue.push_front(Change::new(Action::Add, change.path));
                            queue.push_front(Change::new(Action::Delete, from));
                            continue;
                        }
                        if owner.is_none() {
                            if previous.is_some() {
                                queue.push_front(Change::new(Action::Delete, from));
                            }
                            continue;
                        }
                        if previous.is_none() {
                            queue.push_front(Change::new(Action::Add, change.path));
                            continue;
                        }
                    }

                    // Relocate before dispatching, so renamed roots are found
                    let relocation = tree.relocate(&from, &change.path);
                    let id = shared.dispatcher.dispatch(tree, &change);
                    if let Some(id) = id {
                        if relocation != Relocation::Renamed && change.path.is_dir() {
                            let synthetic = tree.is_enabled(
                                &change.path,
                                Opt::SyntheticEvents,
                                true,
                            );
                            let paths = tree.grow(id, &change.path, synthetic);
                            for path in paths.into_iter().rev() {
                                queue.push_front(Change::new(Action::Add, path));
                            }
                        }
                    }
                }
                Action::Modified => {
                    shared.dispatcher.dispatch(tree, &change);
                }
            }
        }
    }

    /// Handles a failure of the backend.
    ///
    /// If the failure affects a root, a removal is dispatched to it, and the
    /// watch is torn down. Other watched directories are pruned silently.
    fn fail(&mut self, path: Option<PathBuf>, message: &str) {
        let shared = &self.shared;
        tracing::warn!(?path, message, "backend failure");
        shared.record(match &path {
            Some(path) => format!("backend failed ({}): {message}", path.display()),
            None => format!("backend failed: {message}"),
        });

        // Determine whether the failure affects a watched directory
        let Some(path) = path else {
            return;
        };
        let target = shared.tree.with(|registry| {
            let id = registry.lookup_by_path(&path)?;
            registry.lookup_by_id(id).map(|entry| (id, entry.is_root()))
        });
        match target {
            Some((id, true)) => {
                let change = Change::new(Action::Delete, &path);
                shared.dispatcher.dispatch_to(&shared.tree, id, &change);
                shared.tree.prune(id);
            }
            Some((id, false)) => {
                shared.tree.prune(id);
            }
            None => {}
        }
    }
}
