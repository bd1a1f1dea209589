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
//! Event normalizer.

use ahash::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::backend::Signal;
use super::event::{Action, Kind};
use super::fingerprint::{Difference, Fingerprint, Snapshot};

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Normalization outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Normalized change.
    Change(Change),
    /// Backend failure.
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

/// Normalized change, which is not yet bound to a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Change {
    /// Change action.
    pub action: Action,
    /// Path of the file or folder.
    pub path: PathBuf,
    /// Previous path, only set for [`Action::Moved`].
    pub from: Option<PathBuf>,
}

/// Rename awaiting its counterpart.
#[derive(Clone, Debug)]
struct Pending {
    /// Previous path.
    path: PathBuf,
    /// Time of arrival.
    at: Instant,
}

// ----------------------------------------------------------------------------

/// Event normalizer.
///
/// The normalizer turns the raw signals of a backend into the uniform action
/// vocabulary, pairing renames by token or adjacency, and diffing snapshots.
/// All state is private to the watcher's background thread.
#[derive(Debug, Default)]
pub(crate) struct Normalizer {
    /// Rename window, or end of batch if none.
    window: Option<Duration>,
    /// Pending renames by token.
    pending: HashMap<usize, Pending>,
    /// Pending rename without token.
    untokened: Option<Pending>,
    /// Last snapshot of each directory.
    snapshots: HashMap<PathBuf, Snapshot>,
    /// Last modified entry of each directory and its fingerprint.
    modified: HashMap<PathBuf, (OsString, Fingerprint)>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Change {
    /// Creates a change.
    pub fn new<P>(action: Action, path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { action, path: path.into(), from: None }
    }

    /// Creates a change for a rename.
    pub fn moved<P, Q>(from: P, to: Q) -> Self
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        Self {
            action: Action::Moved,
            path: to.into(),
            from: Some(from.into()),
        }
    }
}

// ----------------------------------------------------------------------------

impl Normalizer {
    /// Creates a normalizer with the given rename window.
    pub fn new(window: Option<Duration>) -> Self {
        Self { window, ..Self::default() }
    }

    /// Normalizes a batch of signals.
    ///
    /// Unpaired rename halves are flushed at the end of the batch, unless a
    /// rename window is set, in which case they are kept until it elapses, as
    /// their counterpart might arrive with the next batch. A pending half whose
    /// path is touched by a later signal is flushed right before that signal.
    pub fn normalize(&mut self, signals: Vec<Signal>, now: Instant) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        for signal in signals {
            // A rename without token can only be paired with the very next
            // signal, so anything else in between flushes it
            if !matches!(signal, Signal::RenameTo { token: None, .. }) {
                if let Some(pending) = self.untokened.take() {
                    outcomes.push(delete(pending.path));
                }
            }
            self.settle(&signal, &mut outcomes);
            self.handle(signal, now, &mut outcomes);
        }

        // Flush renames that can't be paired anymore
        let expired = |pending: &Pending| {
            self.window
                .is_none_or(|window| now.duration_since(pending.at) >= window)
        };
        let mut flushed = Vec::new();
        if self.untokened.as_ref().is_some_and(expired) {
            flushed.extend(self.untokened.take());
        }
        let tokens: Vec<usize> = self
            .pending
            .iter()
            .filter(|&(_, pending)| expired(pending))
            .map(|(&token, _)| token)
            .collect();
        flushed.extend(tokens.into_iter().filter_map(|t| self.pending.remove(&t)));
        flushed.sort_by_key(|pending| pending.at);
        outcomes.extend(flushed.into_iter().map(|pending| delete(pending.path)));
        outcomes
    }

    /// Flushes pending renames with token whose path the signal touches, as
    /// the renamed entry has left before anything else appeared there.
    fn settle(&mut self, signal: &Signal, outcomes: &mut Vec<Outcome>) {
        if self.pending.is_empty() {
            return;
        }

        // The counterpart of a pending half pairs with it instead
        let (paths, token) = match signal {
            Signal::Create(path)
            | Signal::Delete(path)
            | Signal::Modify(path)
            | Signal::Renamed(path) => (vec![path.as_path()], None),
            Signal::RenameFrom { path, token } | Signal::RenameTo { path, token } => {
                (vec![path.as_path()], *token)
            }
            Signal::Rename { from, to } => (vec![from.as_path(), to.as_path()], None),
            _ => return,
        };
        let tokens: Vec<usize> = self
            .pending
            .iter()
            .filter(|&(&t, pending)| {
                Some(t) != token
                    && paths.iter().any(|path| path.starts_with(&pending.path))
            })
            .map(|(&t, _)| t)
            .collect();
        let mut flushed: Vec<Pending> = tokens
            .into_iter()
            .filter_map(|t| self.pending.remove(&t))
            .collect();
        flushed.sort_by_key(|pending| pending.at);
        outcomes.extend(flushed.into_iter().map(|pending| delete(pending.path)));
    }

    /// Handles a single signal.
    fn handle(&mut self, signal: Signal, now: Instant, outcomes: &mut Vec<Outcome>) {
        match signal {
            Signal::Create(path) => outcomes.push(change(Action::Add, path)),
            Signal::Delete(path) => outcomes.push(delete(path)),
            Signal::Modify(path) => outcomes.push(change(Action::Modified, path)),

            // Renames with token are buffered until their counterpart arrives,
            // and a second rename with the same token replaces the first one
            Signal::RenameFrom { path, token: Some(token) } => {
                let pending = Pending { path, at: now };
                if let Some(prev) = self.pending.insert(token, pending) {
                    outcomes.push(delete(prev.path));
                }
            }
            Signal::RenameFrom { path, token: None } => {
                self.untokened = Some(Pending { path, at: now });
            }
            Signal::RenameTo { path, token } => {
                let pending = match token {
                    Some(token) => self.pending.remove(&token),
                    None => self.untokened.take(),
                };
                outcomes.push(match pending {
                    Some(pending) => moved(pending.path, path),
                    None => change(Action::Add, path),
                });
            }
            Signal::Rename { from, to } => outcomes.push(moved(from, to)),

            // Without any direction, the only thing to determine is whether the
            // path still exists, so it's either the next or the previous path
            Signal::Renamed(path) => {
                if Kind::of(&path).is_some() {
                    outcomes.push(change(Action::Add, path));
                } else {
                    outcomes.push(delete(path));
                }
            }

            // Snapshots are compared to the previous one of the directory, but
            // baselines just replace it, as they represent a new subscription
            Signal::Snapshot { directory, snapshot, baseline } => {
                let prev = self.snapshots.insert(directory.clone(), snapshot);
                if baseline {
                    return;
                }
                if let (Some(prev), Some(next)) = (prev, self.snapshots.get(&directory)) {
                    outcomes.extend(prev.diff(next).into_iter().map(|difference| {
                        Outcome::Change(differ(&directory, difference))
                    }));
                }
            }
            Signal::Overflow(path) => outcomes.push(Outcome::Failure {
                path,
                message: String::from("event queue overflowed"),
            }),
            Signal::Failure { path, message } => {
                outcomes.push(Outcome::Failure { path, message });
            }
        }
    }

    /// Returns when the earliest pending rename expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let window = self.window?;
        self.pending
            .values()
            .chain(&self.untokened)
            .map(|pending| pending.at + window)
            .min()
    }

    /// Returns whether renames are pending.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.untokened.is_some()
    }

    /// Retains the state of all directories satisfying the given predicate.
    pub fn retain<F>(&mut self, f: F)
    where
        F: Fn(&Path) -> bool,
    {
        self.snapshots.retain(|directory, _| f(directory));
        self.modified.retain(|directory, _| f(directory));
    }

    /// Collapses duplicate and contradictory changes of the same path.
    ///
    /// Only changes of paths satisfying the given predicate are sanitized:
    ///
    /// - an addition followed by modifications is an addition
    /// - an addition followed by a removal cancels out
    /// - a modification followed by a removal is a removal
    /// - repeated changes are reported once
    /// - modifications of folders are dropped
    /// - modifications that leave the fingerprint unchanged are dropped
    ///
    /// A rename resets the history of both of its paths.
    pub fn sanitize<F>(&mut self, changes: Vec<Change>, f: F) -> Vec<Change>
    where
        F: Fn(&Path) -> bool,
    {
        let mut slots: Vec<Option<Change>> = Vec::with_capacity(changes.len());
        let mut index: HashMap<PathBuf, usize> = HashMap::default();
        for change in changes {
            if !f(&change.path) {
                slots.push(Some(change));
                continue;
            }

            // Determine the previous action for the same path in this batch
            let prev = index
                .get(&change.path)
                .and_then(|&i| slots[i].as_ref().map(|prev| (i, prev.action)));
            match (change.action, prev) {
                (Action::Moved, _) => {
                    index.remove(&change.path);
                    if let Some(from) = &change.from {
                        index.remove(from);
                    }
                    slots.push(Some(change));
                    continue;
                }
                (Action::Add, Some((_, Action::Add)))
                | (Action::Modified, Some((_, Action::Add | Action::Modified)))
                | (Action::Delete, Some((_, Action::Delete))) => continue,
                (Action::Delete, Some((i, Action::Add))) => {
                    slots[i] = None;
                    index.remove(&change.path);
                    continue;
                }
                (Action::Delete, Some((i, Action::Modified))) => slots[i] = None,
                (Action::Modified, _) => {
                    if !self.is_modified(&change.path) {
                        continue;
                    }
                }
                _ => {}
            }

            // Keep change and remember its position
            index.insert(change.path.clone(), slots.len());
            slots.push(Some(change));
        }
        slots.into_iter().flatten().collect()
    }

    /// Checks whether a modification changed the fingerprint of the path, and
    /// records the fingerprint for subsequent checks.
    fn is_modified(&mut self, path: &Path) -> bool {
        let Ok(fingerprint) = Fingerprint::read(path) else {
            return true;
        };
        if fingerprint.kind == Kind::Folder {
            return false;
        }
        let (Some(directory), Some(name)) = (path.parent(), path.file_name())
        else {
            return true;
        };
        let next = (name.to_os_string(), fingerprint);
        let prev = self.modified.insert(directory.to_path_buf(), next);
        prev.is_none_or(|(prev, last)| prev != name || last != fingerprint)
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Creates an outcome for a change.
#[inline]
fn change(action: Action, path: PathBuf) -> Outcome {
    Outcome::Change(Change::new(action, path))
}

/// Creates an outcome for a removal.
#[inline]
fn delete(path: PathBuf) -> Outcome {
    change(Action::Delete, path)
}

/// Creates an outcome for a rename.
#[inline]
fn moved(from: PathBuf, to: PathBuf) -> Outcome {
    Outcome::Change(Change::moved(from, to))
}

/// Converts a snapshot difference into a change.
fn differ(directory: &Path, difference: Difference) -> Change {
    match difference {
        Difference::Added(name, _) => Change::new(Action::Add, directory.join(name)),
        Difference::Removed(name, _) => {
            Change::new(Action::Delete, directory.join(name))
        }
        Difference::Modified(name, _) => {
            Change::new(Action::Modified, directory.join(name))
        }
        Difference::Moved { from, to, .. } => {
            Change::moved(directory.join(from), directory.join(to))
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn changes(outcomes: Vec<Outcome>) -> Vec<Change> {
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Outcome::Change(change) => Some(change),
                Outcome::Failure { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_token_pairing() {
        let mut normalizer = Normalizer::new(None);
        let outcomes = normalizer.normalize(
            vec![
                Signal::RenameFrom { path: PathBuf::from("/a/old.txt"), token: Some(1) },
                Signal::RenameTo { path: PathBuf::from("/a/new.txt"), token: Some(1) },
            ],
            Instant::now(),
        );
        assert_eq!(changes(outcomes), vec![Change::moved("/a/old.txt", "/a/new.txt")]);
        assert!(!normalizer.has_pending());
    }

    #[test]
    fn test_token_unpaired() {
        let mut normalizer = Normalizer::new(None);
        let outcomes = normalizer.normalize(
            vec![
                Signal::RenameFrom { path: PathBuf::from("/a/gone.txt"), token: Some(1) },
                Signal::RenameTo { path: PathBuf::from("/a/came.txt"), token: Some(2) },
            ],
            Instant::now(),
        );
        assert_eq!(
            changes(outcomes),
            vec![
                Change::new(Action::Add, "/a/came.txt"),
                Change::new(Action::Delete, "/a/gone.txt"),
            ]
        );
    }

    #[test]
    fn test_token_unpaired_then_recreated() {
        let mut normalizer = Normalizer::new(Some(Duration::from_millis(50)));
        let outcomes = normalizer.normalize(
            vec![
                Signal::RenameFrom { path: PathBuf::from("/a/sub"), token: Some(7) },
                Signal::Create(PathBuf::from("/a/sub")),
                Signal::Create(PathBuf::from("/a/sub/x.txt")),
            ],
            Instant::now(),
        );
        assert_eq!(
            changes(outcomes),
            vec![
                Change::new(Action::Delete, "/a/sub"),
                Change::new(Action::Add, "/a/sub"),
                Change::new(Action::Add, "/a/sub/x.txt"),
            ]
        );
        assert!(!normalizer.has_pending());
    }

    #[test]
    fn test_token_rename_window() {
        let mut normalizer = Normalizer::new(Some(Duration::from_millis(50)));
        let start = Instant::now();
        let outcomes = normalizer.normalize(
            vec![Signal::RenameFrom { path: PathBuf::from("/a/x"), token: Some(3) }],
            start,
        );
        assert!(outcomes.is_empty());
        assert_eq!(normalizer.deadline(), Some(start + Duration::from_millis(50)));

        // Counterpart arrives with the next batch
        let outcomes = normalizer.normalize(
            vec![Signal::RenameTo { path: PathBuf::from("/b/x"), token: Some(3) }],
            start + Duration::from_millis(10),
        );
        assert_eq!(changes(outcomes), vec![Change::moved("/a/x", "/b/x")]);

        // Unpaired renames expire once the window elapsed
        normalizer.normalize(
            vec![Signal::RenameFrom { path: PathBuf::from("/a/y"), token: Some(4) }],
            start,
        );
        let outcomes = normalizer.normalize(Vec::new(), start + Duration::from_millis(60));
        assert_eq!(changes(outcomes), vec![Change::new(Action::Delete, "/a/y")]);
    }

    #[test]
    fn test_adjacency_pairing() {
        let mut normalizer = Normalizer::new(None);
        let outcomes = normalizer.normalize(
            vec![
                Signal::RenameFrom { path: PathBuf::from("/a/x"), token: None },
                Signal::RenameTo { path: PathBuf::from("/a/y"), token: None },
                Signal::RenameFrom { path: PathBuf::from("/a/z"), token: None },
                Signal::Modify(PathBuf::from("/a/w")),
            ],
            Instant::now(),
        );
        assert_eq!(
            changes(outcomes),
            vec![
                Change::moved("/a/x", "/a/y"),
                Change::new(Action::Delete, "/a/z"),
                Change::new(Action::Modified, "/a/w"),
            ]
        );
    }

    #[test]
    fn test_snapshot_diff() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("old.txt"), "content").unwrap();

        let mut normalizer = Normalizer::new(None);
        let baseline = Snapshot::read(&root).unwrap();
        let outcomes = normalizer.normalize(
            vec![Signal::Snapshot { directory: root.clone(), snapshot: baseline, baseline: true }],
            Instant::now(),
        );
        assert!(outcomes.is_empty());

        // Renaming keeps the fingerprint, so it's paired into a move
        fs::rename(root.join("old.txt"), root.join("new.txt")).unwrap();
        let next = Snapshot::read(&root).unwrap();
        let outcomes = normalizer.normalize(
            vec![Signal::Snapshot { directory: root.clone(), snapshot: next, baseline: false }],
            Instant::now(),
        );
        assert_eq!(
            changes(outcomes),
            vec![Change::moved(root.join("old.txt"), root.join("new.txt"))]
        );
    }

    #[test]
    fn test_failure_passthrough() {
        let mut normalizer = Normalizer::new(None);
        let outcomes = normalizer.normalize(
            vec![Signal::Overflow(None)],
            Instant::now(),
        );
        assert!(matches!(outcomes[..], [Outcome::Failure { path: None, .. }]));
    }

    #[test]
    fn test_sanitize_collapses() {
        let mut normalizer = Normalizer::new(None);
        let changes = vec![
            Change::new(Action::Add, "/missing/a"),
            Change::new(Action::Modified, "/missing/a"),
            Change::new(Action::Add, "/missing/a"),
            Change::new(Action::Add, "/missing/b"),
            Change::new(Action::Delete, "/missing/b"),
            Change::new(Action::Modified, "/missing/c"),
            Change::new(Action::Delete, "/missing/c"),
            Change::new(Action::Delete, "/missing/c"),
            Change::new(Action::Delete, "/missing/d"),
            Change::new(Action::Add, "/missing/d"),
        ];
        assert_eq!(
            normalizer.sanitize(changes, |_| true),
            vec![
                Change::new(Action::Add, "/missing/a"),
                Change::new(Action::Delete, "/missing/c"),
                Change::new(Action::Delete, "/missing/d"),
                Change::new(Action::Add, "/missing/d"),
            ]
        );
    }

    #[test]
    fn test_sanitize_unchanged_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "a").unwrap();

        let mut normalizer = Normalizer::new(None);
        let first = normalizer.sanitize(vec![Change::new(Action::Modified, &path)], |_| true);
        assert_eq!(first.len(), 1);
        let second = normalizer.sanitize(vec![Change::new(Action::Modified, &path)], |_| true);
        assert!(second.is_empty());

        // Folders are never reported as modified
        let folder = normalizer.sanitize(vec![Change::new(Action::Modified, dir.path())], |_| true);
        assert!(folder.is_empty());

        // Sanitization is skipped if the predicate rejects the path
        let raw = normalizer.sanitize(vec![Change::new(Action::Modified, &path)], |_| false);
        assert_eq!(raw.len(), 1);
    }
}
