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
//! Polling backend.

use crossbeam::channel::{select, unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::fingerprint::Snapshot;
use crate::lock;
use crate::options::WatchOptions;
use crate::{Error, Result};

use super::{Backend, Capabilities, Handle, Signal};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Polling backend.
///
/// The polling backend periodically reads a [`Snapshot`] of every subscribed
/// directory on a dedicated thread, and emits it as a signal, leaving it to
/// the watcher to compute the differences to the previous snapshot. When a
/// directory is subscribed, a baseline snapshot is emitted synchronously, so
/// changes happening right after subscribing are not lost.
///
/// This is the generic backend, which works on all file systems, including
/// network file systems, at the cost of latency and resource usage.
pub struct Poll {
    /// Subscribed paths.
    subscriptions: Arc<Mutex<BTreeMap<Handle, PathBuf>>>,
    /// Handle counter.
    next: u64,
    /// Signal sender.
    sender: Sender<Signal>,
    /// Signal receiver.
    receiver: Receiver<Signal>,
    /// Stop sender.
    stop: Option<Sender<()>>,
    /// Join handle of polling thread.
    thread: Option<JoinHandle<()>>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Poll {
    /// Creates a polling backend with the given interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the polling thread cannot be spawned.
    pub fn new(interval: Duration) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let (stop, signal) = unbounded::<()>();
        let subscriptions = Arc::new(Mutex::new(BTreeMap::new()));

        // Spawn polling thread, which exits once the stop sender is dropped
        let thread = thread::Builder::new()
            .name(String::from("treewatch/poll"))
            .spawn({
                let subscriptions = Arc::clone(&subscriptions);
                let sender = sender.clone();
                move || loop {
                    select! {
                        recv(signal) -> _ => break,
                        default(interval) => {
                            if !poll(&subscriptions, &sender) {
                                break;
                            }
                        }
                    }
                }
            })?;

        // Return polling backend
        Ok(Self {
            subscriptions,
            next: 0,
            sender,
            receiver,
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Backend for Poll {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: true,
            remote: true,
            ..Capabilities::default()
        }
    }

    fn subscribe(
        &mut self, path: &Path, _recursive: bool, _options: &WatchOptions,
    ) -> Result<Handle> {
        let snapshot = Snapshot::read(path)?;
        self.sender.send(Signal::Snapshot {
            directory: path.to_path_buf(),
            snapshot,
            baseline: true,
        })?;

        // Register subscription for the next tick
        let handle = Handle::next(&mut self.next);
        lock(&self.subscriptions).insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: Handle) -> Result {
        lock(&self.subscriptions).remove(&handle);
        Ok(())
    }

    #[inline]
    fn signals(&self) -> Receiver<Signal> {
        self.receiver.clone()
    }
}

// ----------------------------------------------------------------------------

impl Drop for Poll {
    /// Stops the polling thread and waits for it to exit.
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for Poll {
    /// Formats the polling backend for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Poll")
            .field("subscriptions", &self.subscriptions)
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Reads and emits a snapshot of every subscribed directory, returning whether
/// the receiving end is still connected.
fn poll(
    subscriptions: &Mutex<BTreeMap<Handle, PathBuf>>, sender: &Sender<Signal>,
) -> bool {
    let directories: Vec<PathBuf> =
        lock(subscriptions).values().cloned().collect();
    for directory in &directories {
        let signal = match Snapshot::read(directory) {
            Ok(snapshot) => Signal::Snapshot {
                directory: directory.clone(),
                snapshot,
                baseline: false,
            },

            // A directory that vanished was removed, which the snapshot of its
            // parent reports, if the parent is subscribed as well
            Err(Error::NotFound(_)) => {
                let parent = directory.parent();
                if directories.iter().any(|dir| Some(dir.as_path()) == parent) {
                    continue;
                }
                Signal::Delete(directory.clone())
            }
            Err(err) => Signal::Failure {
                message: err.to_string(),
                path: Some(directory.clone()),
            },
        };
        if sender.send(signal).is_err() {
            return false;
        }
    }
    true
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_subscribe_emits_baseline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let mut backend = Poll::new(Duration::from_secs(60)).unwrap();
        let signals = backend.signals();
        backend.subscribe(dir.path(), false, &WatchOptions::new()).unwrap();
        match signals.try_recv().unwrap() {
            Signal::Snapshot { directory, snapshot, baseline } => {
                assert_eq!(directory, dir.path());
                assert_eq!(snapshot.len(), 1);
                assert!(baseline);
            }
            signal => panic!("unexpected signal: {signal:?}"),
        }
    }

    #[test]
    fn test_poll_reports_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub");
        fs::create_dir(&path).unwrap();

        let subscriptions = Mutex::new(BTreeMap::from([(Handle::new(1), path.clone())]));
        let (sender, receiver) = unbounded();
        fs::remove_dir(&path).unwrap();
        assert!(poll(&subscriptions, &sender));
        assert_eq!(receiver.try_recv().unwrap(), Signal::Delete(path));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_poll_missing_directory_reported_by_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub");
        fs::create_dir(&path).unwrap();

        let subscriptions = Mutex::new(BTreeMap::from([
            (Handle::new(1), dir.path().to_path_buf()),
            (Handle::new(2), path.clone()),
        ]));
        let (sender, receiver) = unbounded();
        fs::remove_dir(&path).unwrap();
        assert!(poll(&subscriptions, &sender));
        let signals: Vec<Signal> = receiver.try_iter().collect();
        assert_eq!(signals.len(), 1);
        assert!(matches!(
            &signals[0],
            Signal::Snapshot { directory, snapshot, .. }
                if directory == dir.path() && snapshot.is_empty()
        ));
    }

    #[test]
    fn test_subscribe_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = Poll::new(Duration::from_secs(60)).unwrap();
        let res = backend.subscribe(&dir.path().join("missing"), false, &WatchOptions::new());
        assert!(res.is_err());
    }
}
