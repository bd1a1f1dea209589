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
//! Directory watcher.

use crossbeam::channel::{unbounded, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::fmt;

use super::backend::Capabilities;
use super::dispatch::{Dispatcher, Listener};
use super::lock;
use super::mount;
use super::options::WatchOptions;
use super::registry::{WatchEntry, WatchId};
use super::symlink::{self, Policy};
use super::tree::Tree;
use super::{Error, Result};

mod builder;
mod worker;

pub use builder::Builder;
use worker::Worker;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default window for batching signals.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(20);

/// Default interval of the polling backend.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Directory watcher.
///
/// The watcher manages a set of watches, each created from a request to watch
/// a directory, optionally recursively, and delivers events to the listener
/// of each watch on a background thread, which is started by [`Watcher::watch`].
/// Watches can be added and removed at any time, before and after starting.
/// Dropping the watcher stops the background thread and releases all watches.
///
/// Errors of requests are returned and recorded as the last error, which can
/// be retrieved with [`Watcher::last_error`]. Failures of the backend at run
/// time are recorded there as well, and, if a watched root is affected, are
/// reported as a removal of the root, after which the watch is gone. The last
/// error is a best effort diagnostic, where the last write wins.
///
/// # Examples
///
/// ```
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// use treewatch::{Event, Watcher};
///
/// // Create watcher and watch directory
/// let mut watcher = Watcher::builder().generic(true).build()?;
/// let id = watcher.add_watch(".", false, |event: &Event| {
///     println!("{:?}", event);
/// })?;
/// watcher.watch()?;
///
/// // Stop watching
/// watcher.remove_watch(id)?;
/// # Ok(())
/// # }
/// ```
pub struct Watcher {
    /// Shared state.
    shared: Arc<Shared>,
    /// Background worker, until started.
    worker: Option<Worker>,
    /// Stop sender.
    stop: Option<Sender<()>>,
    /// Join handle of background thread.
    thread: Option<JoinHandle<Result>>,
}

/// State shared with the background thread.
pub(crate) struct Shared {
    /// Tree manager.
    pub tree: Tree,
    /// Event dispatcher.
    pub dispatcher: Dispatcher,
    /// Whether symbolic links are followed.
    follow_symlinks: AtomicBool,
    /// Whether followed links may leave the scope of a watch.
    allow_out_of_scope_links: AtomicBool,
    /// Last error message.
    last_error: Mutex<Option<String>>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Watcher {
    /// Creates a watcher builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use treewatch::Watcher;
    ///
    /// // Create watcher builder
    /// let builder = Watcher::builder();
    /// ```
    #[inline]
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Creates a watcher with the native backend.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend can be created.
    pub fn new() -> Result<Self> {
        Builder::new().build()
    }

    /// Creates a watcher from the given parts.
    fn from_parts(shared: Shared, window: Duration, rename: Option<Duration>) -> Self {
        let shared = Arc::new(shared);
        let worker = Worker::new(Arc::clone(&shared), window, rename);
        Self {
            shared,
            worker: Some(worker),
            stop: None,
            thread: None,
        }
    }

    /// Starts the background thread, which processes signals of the backend.
    ///
    /// Signals observed before are queued, and processed once the thread is
    /// started. Calling this method more than once has no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn watch(&mut self) -> Result {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        let (stop, signal) = unbounded();
        let thread = thread::Builder::new()
            .name(String::from("treewatch/worker"))
            .spawn(move || worker.run(&signal))?;

        // Store handles for shutdown
        self.stop = Some(stop);
        self.thread = Some(thread);
        Ok(())
    }

    /// Adds a watch for the given directory.
    ///
    /// If the watch is recursive, all subdirectories are watched as well,
    /// including those created later on. The returned identifier is passed to
    /// the listener with every event.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`]: the directory doesn't exist
    /// - [`Error::AlreadyWatched`]: the directory is already watched
    /// - [`Error::OutOfScope`]: the directory is a link violating the policy
    /// - [`Error::NotReadable`]: the directory cannot be read
    /// - [`Error::RemoteFilesystem`]: the directory is on a network mount
    /// - [`Error::Backend`]: the backend rejected the directory
    pub fn add_watch<P, L>(&self, directory: P, recursive: bool, listener: L) -> Result<WatchId>
    where
        P: AsRef<Path>,
        L: Listener + 'static,
    {
        self.add_watch_with_options(directory, recursive, listener, WatchOptions::new())
    }

    /// Adds a watch for the given directory with options.
    ///
    /// Options are passed to the backend when subscribing to each directory
    /// of the watch, and options unknown to the backend are ignored.
    ///
    /// # Errors
    ///
    /// See [`Watcher::add_watch`].
    pub fn add_watch_with_options<P, L>(
        &self, directory: P, recursive: bool, listener: L, options: WatchOptions,
    ) -> Result<WatchId>
    where
        P: AsRef<Path>,
        L: Listener + 'static,
    {
        let directory = directory.as_ref();
        let listener: Arc<dyn Listener> = Arc::new(listener);
        let policy = self.shared.policy();
        let res = resolve(directory, policy, self.shared.tree.capabilities())
            .and_then(|real| {
                self.shared.tree.add_root(real, recursive, listener, policy, options)
            });
        self.shared.check(res)
    }

    /// Removes the watch with the given identifier, including all directories
    /// that were watched to realize it.
    ///
    /// Once this method returns, the listener of the watch is not invoked
    /// anymore, unless it is called from the listener itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownWatch`] if the watch doesn't exist.
    pub fn remove_watch(&self, id: WatchId) -> Result {
        let shared = &self.shared;
        let res = shared.dispatcher.exclusive(|| shared.tree.remove(id));
        shared.check(res).map(|count| {
            tracing::debug!(%id, count, "watch removed");
        })
    }

    /// Removes the watch for the given directory.
    ///
    /// Unlike [`Watcher::remove_watch`], this scans all watched directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the directory isn't watched.
    pub fn remove_watch_by_path<P>(&self, directory: P) -> Result
    where
        P: AsRef<Path>,
    {
        let shared = &self.shared;
        let directory = directory.as_ref();
        let res = shared
            .dispatcher
            .exclusive(|| shared.tree.remove_by_path(directory));
        shared.check(res).map(|count| {
            tracing::debug!(?directory, count, "watch removed");
        })
    }

    /// Returns the identifier of the watch for the given real directory path.
    #[must_use]
    pub fn lookup_by_path<P>(&self, directory: P) -> Option<WatchId>
    where
        P: AsRef<Path>,
    {
        let directory = directory.as_ref();
        self.shared.tree.with(|registry| registry.lookup_by_path(directory))
    }

    /// Returns a copy of the entry for the given identifier.
    #[must_use]
    pub fn entry(&self, id: WatchId) -> Option<WatchEntry> {
        self.shared.tree.with(|registry| registry.lookup_by_id(id).cloned())
    }

    /// Returns the real paths of all watched root directories.
    #[must_use]
    pub fn directories(&self) -> Vec<PathBuf> {
        self.shared.tree.directories()
    }

    /// Returns the capabilities of the backend.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.shared.tree.capabilities()
    }

    /// Returns whether symbolic links are followed.
    #[must_use]
    pub fn follow_symlinks(&self) -> bool {
        self.shared.follow_symlinks.load(Ordering::Relaxed)
    }

    /// Sets whether symbolic links are followed, which only affects watches
    /// that are added afterwards.
    pub fn set_follow_symlinks(&self, value: bool) {
        self.shared.follow_symlinks.store(value, Ordering::Relaxed);
    }

    /// Returns whether followed links may leave the scope of a watch.
    #[must_use]
    pub fn allow_out_of_scope_links(&self) -> bool {
        self.shared.allow_out_of_scope_links.load(Ordering::Relaxed)
    }

    /// Sets whether followed links may leave the scope of a watch, which only
    /// affects watches that are added afterwards.
    pub fn set_allow_out_of_scope_links(&self, value: bool) {
        self.shared
            .allow_out_of_scope_links
            .store(value, Ordering::Relaxed);
    }

    /// Returns the last error message, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Clears the last error message.
    pub fn clear_last_error(&self) {
        lock(&self.shared.last_error).take();
    }

    /// Checks whether the background thread has terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.thread.as_ref().is_some_and(JoinHandle::is_finished)
    }
}

// ----------------------------------------------------------------------------

impl Shared {
    /// Creates the shared state.
    fn new(tree: Tree, policy: Policy) -> Self {
        Self {
            tree,
            dispatcher: Dispatcher::default(),
            follow_symlinks: AtomicBool::new(policy.follow_symlinks),
            allow_out_of_scope_links: AtomicBool::new(
                policy.allow_out_of_scope_links,
            ),
            last_error: Mutex::new(None),
        }
    }

    /// Returns the current symbolic link policy.
    fn policy(&self) -> Policy {
        Policy {
            follow_symlinks: self.follow_symlinks.load(Ordering::Relaxed),
            allow_out_of_scope_links: self
                .allow_out_of_scope_links
                .load(Ordering::Relaxed),
        }
    }

    /// Records the given message as the last error.
    pub fn record(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }

    /// Records the error of a result as the last error, if any.
    fn check<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            tracing::debug!(%err, code = err.code(), "request failed");
            self.record(err.to_string());
        }
        res
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Drop for Watcher {
    /// Stops the background thread and releases all watches.
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }

        // Release all remaining watches, children before parents
        let roots: Vec<WatchId> = self.shared.tree.with(|registry| {
            registry
                .iter()
                .filter(|entry| entry.is_root())
                .map(WatchEntry::id)
                .collect()
        });
        for id in roots {
            self.shared.tree.prune(id);
        }
    }
}

impl fmt::Debug for Watcher {
    /// Formats the watcher for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("capabilities", &self.shared.tree.capabilities())
            .field("watches", &self.shared.tree.len())
            .field("started", &self.worker.is_none())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Resolves and validates the directory of a watch request.
fn resolve(
    directory: &Path, policy: Policy, capabilities: Capabilities,
) -> Result<PathBuf> {
    let real = symlink::resolve_root(directory, policy)?;
    if !real.is_dir() {
        return Err(Error::NotFound(directory.to_path_buf()));
    }

    // Ensure directory can be read, as subscribing might succeed regardless
    fs::read_dir(&real).map_err(|err| Error::from_io(err, directory))?;
    if !capabilities.remote && mount::is_remote(&real) {
        return Err(Error::RemoteFilesystem(directory.to_path_buf()));
    }
    Ok(real)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::backend::{Injector, Manual, Signal};
    use crate::{Action, Event, Opt};

    type Log = Arc<Mutex<Vec<Event>>>;

    fn setup() -> (Watcher, Injector) {
        let capabilities = Capabilities { remote: true, ..Capabilities::default() };
        let (backend, injector) = Manual::new(capabilities);
        let watcher = Watcher::builder().backend(Box::new(backend)).build().unwrap();
        (watcher, injector)
    }

    fn listener(log: &Log) -> impl Fn(&Event) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event: &Event| log.lock().unwrap().push(event.clone())
    }

    fn process(watcher: &mut Watcher, signals: Vec<Signal>) {
        watcher.worker.as_mut().unwrap().process(signals);
    }

    fn tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_add_watch_lookup() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("a/b")).unwrap();
        let (watcher, injector) = setup();

        let id = watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        assert_eq!(watcher.lookup_by_path(&root), Some(id));
        assert_eq!(watcher.entry(id).unwrap().directory(), root.as_path());
        assert_eq!(watcher.directories(), vec![root.clone()]);
        assert_eq!(
            injector.subscriptions(),
            vec![root.clone(), root.join("a"), root.join("a/b")]
        );

        // Subdirectories share the root's identity as parent
        let a = watcher.lookup_by_path(root.join("a")).unwrap();
        assert_eq!(watcher.entry(a).unwrap().parent(), Some(id));
    }

    #[test]
    fn test_add_watch_non_recursive() {
        let (_dir, root) = tempdir();
        fs::create_dir(root.join("a")).unwrap();
        let (watcher, injector) = setup();

        watcher.add_watch(&root, false, |_: &Event| {}).unwrap();
        assert_eq!(injector.subscriptions(), vec![root.clone()]);
    }

    #[test]
    fn test_add_watch_errors() {
        let (_dir, root) = tempdir();
        fs::write(root.join("file.txt"), "").unwrap();
        let (watcher, _injector) = setup();

        let err = watcher.add_watch(root.join("missing"), true, |_: &Event| {}).unwrap_err();
        assert_eq!(err.code(), -1);
        assert!(watcher.last_error().unwrap().contains("missing"));
        let err = watcher.add_watch(root.join("file.txt"), true, |_: &Event| {}).unwrap_err();
        assert_eq!(err.code(), -1);

        // Adding the same directory twice fails
        watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        let err = watcher.add_watch(&root, false, |_: &Event| {}).unwrap_err();
        assert_eq!(err.code(), -2);
        watcher.clear_last_error();
        assert!(watcher.last_error().is_none());
    }

    #[test]
    fn test_add_watch_backend_failure() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        let (watcher, injector) = setup();

        // Failing subdirectories only remove themselves
        injector.reject(root.join("a"));
        watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        assert_eq!(injector.subscriptions(), vec![root.clone(), root.join("b")]);

        // Failing roots fail the request
        let (_other, other) = tempdir();
        injector.reject(&other);
        let err = watcher.add_watch(&other, true, |_: &Event| {}).unwrap_err();
        assert_eq!(err.code(), -6);
        assert!(watcher.lookup_by_path(&other).is_none());
    }

    #[test]
    fn test_remove_watch_subtree() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("c")).unwrap();
        let (_other, other) = tempdir();
        let (watcher, injector) = setup();

        let id = watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        watcher.add_watch(&other, true, |_: &Event| {}).unwrap();
        assert_eq!(watcher.shared.tree.len(), 5);

        // Removing the watch removes the entire subtree
        watcher.remove_watch(id).unwrap();
        assert_eq!(watcher.shared.tree.len(), 1);
        assert_eq!(injector.subscriptions(), vec![other.clone()]);
        assert!(watcher.lookup_by_path(root.join("a/b")).is_none());

        // Removing it again fails without side effects
        let err = watcher.remove_watch(id).unwrap_err();
        assert_eq!(err.code(), -1);
        assert_eq!(watcher.shared.tree.len(), 1);
    }

    #[test]
    fn test_remove_watch_by_path() {
        let (_dir, root) = tempdir();
        fs::create_dir(root.join("a")).unwrap();
        let (watcher, injector) = setup();

        watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        watcher.remove_watch_by_path(&root).unwrap();
        assert!(injector.subscriptions().is_empty());
        assert!(watcher.remove_watch_by_path(&root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle() {
        let (_dir, root) = tempdir();
        std::os::unix::fs::symlink(&root, root.join("link")).unwrap();
        let (watcher, _injector) = setup();

        watcher.set_follow_symlinks(true);
        watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        assert_eq!(watcher.shared.tree.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_scope() {
        let (_dir, root) = tempdir();
        std::os::unix::fs::symlink("/", root.join("link")).unwrap();
        let (watcher, injector) = setup();

        watcher.set_follow_symlinks(true);
        watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        assert_eq!(injector.subscriptions(), vec![root.clone()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_followed() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("a/b")).unwrap();
        std::os::unix::fs::symlink(root.join("a/b"), root.join("link")).unwrap();
        fs::create_dir(root.join("c")).unwrap();
        std::os::unix::fs::symlink(root.join("c"), root.join("a/b/link")).unwrap();
        let (watcher, injector) = setup();

        // Targets are watched once, under their real paths
        watcher.set_follow_symlinks(true);
        watcher.add_watch(&root, true, |_: &Event| {}).unwrap();
        assert_eq!(
            injector.subscriptions(),
            vec![root.clone(), root.join("a"), root.join("a/b"), root.join("c")]
        );
    }

    #[test]
    fn test_token_move() {
        let (_dir, root) = tempdir();
        let (mut watcher, _injector) = setup();
        let log = Log::default();

        let id = watcher.add_watch(&root, true, listener(&log)).unwrap();
        process(&mut watcher, vec![
            Signal::RenameFrom { path: root.join("old.txt"), token: Some(9) },
            Signal::RenameTo { path: root.join("new.txt"), token: Some(9) },
        ]);
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].action, Action::Moved);
        assert_eq!(events[0].filename, PathBuf::from("new.txt"));
        assert_eq!(events[0].old_filename, Some(PathBuf::from("old.txt")));
    }

    #[test]
    fn test_creation_race() {
        let (_dir, root) = tempdir();
        let (mut watcher, injector) = setup();
        let log = Log::default();

        watcher.add_watch(&root, true, listener(&log)).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/file.txt"), "").unwrap();

        // Only the directory is reported, and its contents are backfilled
        process(&mut watcher, vec![Signal::Create(root.join("sub"))]);
        let sub = watcher.lookup_by_path(root.join("sub")).unwrap();
        assert!(injector.subscriptions().contains(&root.join("sub")));
        let events = log.lock().unwrap();
        let paths: Vec<_> = events.iter().map(|e| (e.action, e.path())).collect();
        assert_eq!(paths, vec![
            (Action::Add, root.join("sub")),
            (Action::Add, root.join("sub/file.txt")),
        ]);
        assert_eq!(events[1].id, sub);
    }

    #[test]
    fn test_creation_nested() {
        let (_dir, root) = tempdir();
        let (mut watcher, _injector) = setup();
        let log = Log::default();

        watcher.add_watch(&root, true, listener(&log)).unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file.txt"), "").unwrap();
        process(&mut watcher, vec![Signal::Create(root.join("a"))]);

        let paths: Vec<_> = log.lock().unwrap().iter().map(Event::path).collect();
        assert_eq!(paths, vec![root.join("a"), root.join("a/b"), root.join("a/b/file.txt")]);
        assert!(watcher.lookup_by_path(root.join("a/b")).is_some());
    }

    #[test]
    fn test_creation_without_synthetic_events() {
        let (_dir, root) = tempdir();
        let (mut watcher, _injector) = setup();
        let log = Log::default();

        let options = WatchOptions::new().with(Opt::SyntheticEvents, 0);
        watcher
            .add_watch_with_options(&root, true, listener(&log), options)
            .unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        process(&mut watcher, vec![Signal::Create(root.join("a"))]);

        // Subtree is registered, but only the reported directory is delivered
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(watcher.lookup_by_path(root.join("a/b")).is_some());
    }

    #[test]
    fn test_delete_prunes() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("sub/inner")).unwrap();
        let (mut watcher, injector) = setup();
        let log = Log::default();

        let id = watcher.add_watch(&root, true, listener(&log)).unwrap();
        fs::remove_dir_all(root.join("sub")).unwrap();
        process(&mut watcher, vec![Signal::Delete(root.join("sub"))]);

        assert_eq!(injector.subscriptions(), vec![root.clone()]);
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].id, events[0].action), (id, Action::Delete));
    }

    #[test]
    fn test_move_relocates() {
        let (_dir, root) = tempdir();
        fs::create_dir_all(root.join("sub/inner")).unwrap();
        let (mut watcher, injector) = setup();
        let log = Log::default();

        watcher.add_watch(&root, true, listener(&log)).unwrap();
        let inner = watcher.lookup_by_path(root.join("sub/inner")).unwrap();
        fs::rename(root.join("sub"), root.join("moved")).unwrap();
        process(&mut watcher, vec![Signal::Rename {
            from: root.join("sub"),
            to: root.join("moved"),
        }]);

        // Identifiers are kept, and paths rewritten
        assert_eq!(watcher.lookup_by_path(root.join("moved/inner")), Some(inner));
        assert!(watcher.lookup_by_path(root.join("sub")).is_none());
        assert_eq!(
            injector.subscriptions(),
            vec![root.clone(), root.join("moved"), root.join("moved/inner")]
        );
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_filename, Some(PathBuf::from("sub")));
    }

    #[test]
    fn test_move_out_of_watch() {
        let (_dir, root) = tempdir();
        let (_other, other) = tempdir();
        fs::create_dir(root.join("sub")).unwrap();
        let (mut watcher, injector) = setup();
        let log = Log::default();

        watcher.add_watch(&root, true, listener(&log)).unwrap();
        fs::rename(root.join("sub"), other.join("sub")).unwrap();
        process(&mut watcher, vec![Signal::Rename {
            from: root.join("sub"),
            to: other.join("sub"),
        }]);

        // Leaving all watches is a removal
        assert_eq!(injector.subscriptions(), vec![root.clone()]);
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, Action::Delete);
        assert_eq!(events[0].path(), root.join("sub"));
    }

    #[test]
    fn test_move_across_roots() {
        let (_a, a) = tempdir();
        let (_b, b) = tempdir();
        fs::create_dir(a.join("sub")).unwrap();
        let (mut watcher, injector) = setup();
        let (log_a, log_b) = (Log::default(), Log::default());

        let id_a = watcher.add_watch(&a, true, listener(&log_a)).unwrap();
        let id_b = watcher.add_watch(&b, true, listener(&log_b)).unwrap();
        fs::write(b.join("f.txt"), "").unwrap();
        fs::rename(a.join("sub"), b.join("sub")).unwrap();
        process(&mut watcher, vec![
            Signal::Rename { from: a.join("f.txt"), to: b.join("f.txt") },
            Signal::Rename { from: a.join("sub"), to: b.join("sub") },
        ]);

        // Each watch learns about its side of the move
        let events: Vec<_> = log_a.lock().unwrap().iter()
            .map(|e| (e.id, e.action, e.path()))
            .collect();
        assert_eq!(events, vec![
            (id_a, Action::Delete, a.join("f.txt")),
            (id_a, Action::Delete, a.join("sub")),
        ]);
        let events: Vec<_> = log_b.lock().unwrap().iter()
            .map(|e| (e.id, e.action, e.path()))
            .collect();
        assert_eq!(events, vec![
            (id_b, Action::Add, b.join("f.txt")),
            (id_b, Action::Add, b.join("sub")),
        ]);
        assert!(watcher.lookup_by_path(a.join("sub")).is_none());
        assert!(watcher.lookup_by_path(b.join("sub")).is_some());
        assert!(!injector.subscriptions().contains(&a.join("sub")));
    }

    #[test]
    fn test_move_away_and_recreate() {
        let (_dir, root) = tempdir();
        let (_other, other) = tempdir();
        fs::create_dir(root.join("sub")).unwrap();
        let (mut watcher, injector) = setup();
        let log = Log::default();

        watcher.add_watch(&root, true, listener(&log)).unwrap();
        let old = watcher.lookup_by_path(root.join("sub")).unwrap();
        fs::rename(root.join("sub"), other.join("sub")).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        process(&mut watcher, vec![
            Signal::RenameFrom { path: root.join("sub"), token: Some(7) },
            Signal::Create(root.join("sub")),
        ]);

        // Removal is delivered first, and the new directory stays watched
        let events: Vec<_> = log.lock().unwrap().iter()
            .map(|e| (e.action, e.path()))
            .collect();
        assert_eq!(events, vec![
            (Action::Delete, root.join("sub")),
            (Action::Add, root.join("sub")),
        ]);
        let sub = watcher.lookup_by_path(root.join("sub")).unwrap();
        assert_ne!(sub, old);
        assert_eq!(injector.subscriptions(), vec![root.clone(), root.join("sub")]);
    }

    #[test]
    fn test_watch_ids_unique_across_watchers() {
        let (_a, a) = tempdir();
        let (_b, b) = tempdir();
        let (first, _first) = setup();
        let (second, _second) = setup();

        let id_a = first.add_watch(&a, false, |_: &Event| {}).unwrap();
        let id_b = second.add_watch(&b, false, |_: &Event| {}).unwrap();
        assert_ne!(id_a, id_b);
        assert!(id_a.get() > 0 && id_b.get() > 0);
        assert!(second.entry(id_a).is_none());
    }

    #[test]
    fn test_root_removal_is_not_a_failure() {
        let (_dir, root) = tempdir();
        let (mut watcher, _injector) = setup();
        let log = Log::default();

        let id = watcher.add_watch(&root, true, listener(&log)).unwrap();
        process(&mut watcher, vec![Signal::Delete(root.clone())]);

        // Removed roots are torn down without recording an error
        assert!(watcher.directories().is_empty());
        assert!(watcher.last_error().is_none());
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].id, events[0].action), (id, Action::Delete));
    }

    #[test]
    fn test_failure_tears_down_root() {
        let (_dir, root) = tempdir();
        fs::create_dir(root.join("sub")).unwrap();
        let (mut watcher, injector) = setup();
        let log = Log::default();

        let id = watcher.add_watch(&root, true, listener(&log)).unwrap();
        process(&mut watcher, vec![Signal::Failure {
            path: Some(root.clone()),
            message: String::from("watch lost"),
        }]);

        assert!(watcher.directories().is_empty());
        assert!(injector.subscriptions().is_empty());
        assert!(watcher.last_error().unwrap().contains("watch lost"));
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].id, events[0].action), (id, Action::Delete));
        assert_eq!(events[0].path(), root);
    }

    #[test]
    fn test_removed_watch_is_silent() {
        let (_dir, root) = tempdir();
        let (mut watcher, _injector) = setup();
        let log = Log::default();

        let id = watcher.add_watch(&root, true, listener(&log)).unwrap();
        watcher.remove_watch(id).unwrap();
        process(&mut watcher, vec![Signal::Create(root.join("file.txt"))]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_watch_delivers_events() {
        let (_dir, root) = tempdir();
        let (mut watcher, injector) = setup();
        let (sender, receiver) = unbounded();

        watcher
            .add_watch(&root, false, move |event: &Event| {
                let _ = sender.send(event.clone());
            })
            .unwrap();
        watcher.watch().unwrap();
        injector.send(Signal::Modify(root.join("file.txt"))).unwrap();

        let event = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.action, Action::Modified);
        assert_eq!(event.filename, PathBuf::from("file.txt"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_native_directory_rename() {
        let (_dir, root) = tempdir();
        fs::create_dir(root.join("sub")).unwrap();
        let mut watcher = Watcher::builder().build().unwrap();
        let (sender, receiver) = unbounded();

        watcher
            .add_watch(&root, true, move |event: &Event| {
                let _ = sender.send(event.clone());
            })
            .unwrap();
        watcher.watch().unwrap();
        fs::rename(root.join("sub"), root.join("moved")).unwrap();

        // Collect everything until the watcher settles
        let mut events = vec![receiver.recv_timeout(Duration::from_secs(5)).unwrap()];
        while let Ok(event) = receiver.recv_timeout(Duration::from_millis(500)) {
            events.push(event);
        }
        let events: Vec<_> = events
            .iter()
            .map(|e| (e.action, e.path(), e.old_filename.clone()))
            .collect();
        assert_eq!(events, vec![(
            Action::Moved,
            root.join("moved"),
            Some(PathBuf::from("sub")),
        )]);
        assert!(watcher.lookup_by_path(root.join("moved")).is_some());
    }
}
