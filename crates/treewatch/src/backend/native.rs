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
//! Native backend.

use crossbeam::channel::{unbounded, Receiver};
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher, WatcherKind,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{fmt, fs};

use crate::lock;
use crate::options::{MODIFIED_CONTENT, MODIFIED_METADATA, Opt, WatchOptions};
use crate::Result;

use super::{Backend, Capabilities, Handle, Signal};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Native backend.
///
/// This is a wrapper around the [`notify`] crate, which selects the primitive
/// mechanism of the operating system, i.e., `inotify` on Linux, `FSEvents` on
/// macOS, `kqueue` on BSDs, and `ReadDirectoryChangesW` on Windows, and uses a
/// [`crossbeam`] channel to hand signals over to the watcher's thread.
///
/// The capabilities differ per mechanism: `inotify` and `kqueue` don't support
/// native recursion, which is why the watcher subscribes to every directory
/// individually, while `FSEvents` and `ReadDirectoryChangesW` do. Only renames
/// reported by `inotify` carry a pairing token (the cookie), all others must
/// be paired by adjacency or not at all. All mechanisms are known to report
/// duplicate events, e.g., a removal of a watched folder is reported both by
/// the folder itself and the folder containing it.
///
/// Symbolic links are never followed by the mechanism itself, as the watcher
/// decides which links to follow, and subscribes to their targets explicitly.
///
/// # Examples
///
/// ```
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// use std::path::Path;
/// use treewatch::backend::{Backend, Native};
/// use treewatch::WatchOptions;
///
/// // Create native backend and subscribe to directory
/// let mut backend = Native::recommended()?;
/// let handle = backend.subscribe(Path::new("."), false, &WatchOptions::new())?;
/// backend.unsubscribe(handle)?;
/// # Ok(())
/// # }
/// ```
pub struct Native {
    /// File watcher.
    watcher: Box<dyn Watcher + Send>,
    /// File watcher backend.
    kind: WatcherKind,
    /// Subscribed paths.
    subscriptions: BTreeMap<Handle, PathBuf>,
    /// Modification filters of all subscribed paths.
    filters: Arc<Mutex<BTreeMap<PathBuf, i32>>>,
    /// Handle counter.
    next: u64,
    /// Signal receiver.
    receiver: Receiver<Signal>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Native {
    /// Creates a native backend with the given watcher.
    ///
    /// Normally, [`Native::recommended`] should be used. However, if you want
    /// to use a specific watcher, e.g., the [`PollWatcher`][], this function
    /// creates a backend with it.
    ///
    /// [`PollWatcher`]: notify::PollWatcher
    ///
    /// # Errors
    ///
    /// Errors returned by [`notify`] on watcher creation are forwarded.
    pub fn new<W>(config: Config) -> Result<Self>
    where
        W: 'static + Watcher + Send,
    {
        let (sender, receiver) = unbounded();
        let filters = Arc::new(Mutex::new(BTreeMap::new()));

        // Disable following of symbolic links, as the watcher tracks them
        // separately to enforce its link policy
        let config = config.with_follow_symlinks(false);
        let cookies = W::kind() == WatcherKind::Inotify;
        let h = {
            let filters = Arc::clone(&filters);
            move |res: notify::Result<notify::Event>| {
                let signals = match res {
                    Ok(event) => filter::<W>(event)
                        .map(|event| translate(event, &filters, cookies))
                        .unwrap_or_default(),
                    Err(err) => vec![Signal::Failure {
                        path: err.paths.first().cloned(),
                        message: err.to_string(),
                    }],
                };
                for signal in signals {
                    let _ = sender.send(signal);
                }
            }
        };

        // Return native backend
        Ok(Self {
            watcher: Box::new(W::new(h, config)?),
            kind: W::kind(),
            subscriptions: BTreeMap::new(),
            filters,
            next: 0,
            receiver,
        })
    }

    /// Creates a native backend with the recommended watcher.
    ///
    /// # Errors
    ///
    /// Errors returned by [`notify`] on watcher creation are forwarded.
    pub fn recommended() -> Result<Self> {
        Self::new::<RecommendedWatcher>(Config::default())
    }

    /// Returns the file watcher backend.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> WatcherKind {
        self.kind
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl Backend for Native {
    fn capabilities(&self) -> Capabilities {
        match self.kind {
            WatcherKind::Inotify => Capabilities {
                rename_token: true,
                over_reports: true,
                ..Capabilities::default()
            },
            WatcherKind::Fsevent | WatcherKind::ReadDirectoryChangesWatcher => {
                Capabilities {
                    native_recursion: true,
                    over_reports: true,
                    ..Capabilities::default()
                }
            }
            WatcherKind::Kqueue => Capabilities {
                over_reports: true,
                ..Capabilities::default()
            },
            WatcherKind::PollWatcher => Capabilities {
                remote: true,
                ..Capabilities::default()
            },
            _ => Capabilities::default(),
        }
    }

    fn subscribe(
        &mut self, path: &Path, recursive: bool, options: &WatchOptions,
    ) -> Result<Handle> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher.watch(path, mode)?;

        // Record modification filter, so the event handler can check it for
        // all events of paths inside the subscribed directory
        let filter = options
            .get(Opt::ModifiedFilter)
            .unwrap_or(MODIFIED_CONTENT | MODIFIED_METADATA);
        lock(&self.filters).insert(path.to_path_buf(), filter);
        let handle = Handle::next(&mut self.next);
        self.subscriptions.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: Handle) -> Result {
        let Some(path) = self.subscriptions.remove(&handle) else {
            return Ok(());
        };
        lock(&self.filters).remove(&path);

        // If the file watcher backend is `kqueue`, we must ignore the return
        // value of the unwatch operation, because it might fail with a false
        // positive saying that the watched directory does not exist.
        //
        // Related issue on GitHub:
        // https://github.com/notify-rs/notify/issues/665
        if self.kind == WatcherKind::Kqueue {
            let _ = self.watcher.unwatch(&path);
        } else {
            self.watcher.unwatch(&path)?;
        }
        Ok(())
    }

    #[inline]
    fn signals(&self) -> Receiver<Signal> {
        self.receiver.clone()
    }
}

// ----------------------------------------------------------------------------

impl fmt::Debug for Native {
    /// Formats the native backend for debugging.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Native")
            .field("kind", &self.kind)
            .field("subscriptions", &self.subscriptions)
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Filters an event, checking whether it should be forwarded or not. This
/// function is parametrized over the watcher, so the compiler can optimize it.
#[inline]
fn filter<W>(event: notify::Event) -> Option<notify::Event>
where
    W: 'static + Watcher,
{
    // Unfortunately, the `kqueue` file watcher backend spuriously emits paths
    // that were not actually touched if changes are detected inside symbolic
    // links, which is why we must check for them and ignore them.
    //
    // Related issue on GitHub:
    // https://github.com/notify-rs/notify/issues/644
    if let WatcherKind::Kqueue = W::kind() {
        let mut iter = event.paths.iter();
        iter.all(|path| {
            path.is_symlink()
                || fs::canonicalize(path).map_or(true, |check| check == *path)
        })
    } else {
        true
    }
    .then_some(event)
}

/// Translates an event into signals.
///
/// With `cookies` set, the mechanism pairs renames with tokens, and reports
/// the rename of a subscribed directory a second time from the directory's
/// own subscription, without token. If the parent is subscribed, it reports
/// the rename with token, so the untokened duplicate is dropped.
fn translate(
    event: notify::Event, filters: &Mutex<BTreeMap<PathBuf, i32>>,
    cookies: bool,
) -> Vec<Signal> {
    let token = event.tracker();
    let rescan = event.need_rescan();
    let notify::Event { kind, paths, .. } = event;
    if rescan {
        return vec![Signal::Overflow(paths.into_iter().next())];
    }

    // Access events and all other events are dropped, as only creations,
    // modifications, renames and removals are relevant
    match kind {
        EventKind::Create(_) => paths.into_iter().map(Signal::Create).collect(),
        EventKind::Remove(_) => paths.into_iter().map(Signal::Delete).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From))
            if cookies && token.is_none() =>
        {
            let filters = lock(filters);
            paths
                .into_iter()
                .filter(|path| {
                    path.parent().is_none_or(|dir| !filters.contains_key(dir))
                })
                .map(|path| Signal::RenameFrom { path, token })
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(mode)) => rename(mode, paths, token),
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            modify(paths, filters, MODIFIED_METADATA)
        }
        EventKind::Modify(_) => modify(paths, filters, MODIFIED_CONTENT),
        _ => Vec::new(),
    }
}

/// Translates a rename into signals.
fn rename(
    mode: RenameMode, paths: Vec<PathBuf>, token: Option<usize>,
) -> Vec<Signal> {
    let mut iter = paths.into_iter();
    match mode {
        RenameMode::From => {
            iter.map(|path| Signal::RenameFrom { path, token }).collect()
        }
        RenameMode::To => {
            iter.map(|path| Signal::RenameTo { path, token }).collect()
        }

        // When a token is present, both halves of the rename were already
        // emitted separately, so the combined event would be a duplicate
        RenameMode::Both if token.is_some() => Vec::new(),
        RenameMode::Both => match (iter.next(), iter.next()) {
            (Some(from), Some(to)) => vec![Signal::Rename { from, to }],
            (Some(path), None) => vec![Signal::Renamed(path)],
            _ => Vec::new(),
        },
        _ => iter.map(Signal::Renamed).collect(),
    }
}

/// Translates a modification into signals, applying modification filters.
fn modify(
    paths: Vec<PathBuf>, filters: &Mutex<BTreeMap<PathBuf, i32>>, bit: i32,
) -> Vec<Signal> {
    let filters = lock(filters);
    paths
        .into_iter()
        .filter(|path| {
            path.ancestors()
                .skip(1)
                .find_map(|dir| filters.get(dir))
                .is_none_or(|filter| filter & bit != 0)
        })
        .map(Signal::Modify)
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use notify::event::{CreateKind, DataChange, MetadataKind};

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[test]
    fn test_translate_rename_with_token() {
        let filters = Mutex::default();
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/a/x"])
            .set_tracker(7);
        let both = event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/a/x", "/a/y"])
            .set_tracker(7);
        assert_eq!(
            translate(from, &filters, true),
            vec![Signal::RenameFrom { path: PathBuf::from("/a/x"), token: Some(7) }]
        );
        assert!(translate(both, &filters, true).is_empty());
    }

    #[test]
    fn test_translate_rename_without_token() {
        let filters = Mutex::default();
        let both = event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/a/x", "/a/y"]);
        let any = event(EventKind::Modify(ModifyKind::Name(RenameMode::Any)), &["/a/z"]);
        assert_eq!(
            translate(both, &filters, true),
            vec![Signal::Rename { from: PathBuf::from("/a/x"), to: PathBuf::from("/a/y") }]
        );
        assert_eq!(translate(any, &filters, true), vec![Signal::Renamed(PathBuf::from("/a/z"))]);
    }

    #[test]
    fn test_translate_rename_of_subscribed_directory() {
        let filters = Mutex::new(BTreeMap::from([
            (PathBuf::from("/a"), MODIFIED_CONTENT),
            (PathBuf::from("/a/sub"), MODIFIED_CONTENT),
        ]));
        let moved = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/a/sub"]);
        let root = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/a"]);
        assert!(translate(moved.clone(), &filters, true).is_empty());
        assert_eq!(
            translate(root, &filters, true),
            vec![Signal::RenameFrom { path: PathBuf::from("/a"), token: None }]
        );
        assert_eq!(
            translate(moved, &filters, false),
            vec![Signal::RenameFrom { path: PathBuf::from("/a/sub"), token: None }]
        );
    }

    #[test]
    fn test_translate_modified_filter() {
        let filters = Mutex::new(BTreeMap::from([(PathBuf::from("/a"), MODIFIED_CONTENT)]));
        let data = event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/a/x"]);
        let meta = event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), &["/a/x"]);
        let other = event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)), &["/b/x"]);
        assert_eq!(translate(data, &filters, true), vec![Signal::Modify(PathBuf::from("/a/x"))]);
        assert!(translate(meta, &filters, true).is_empty());
        assert_eq!(translate(other, &filters, true), vec![Signal::Modify(PathBuf::from("/b/x"))]);
    }

    #[test]
    fn test_translate_create_and_rescan() {
        let filters = Mutex::default();
        let create = event(EventKind::Create(CreateKind::File), &["/a/x"]);
        let rescan = event(EventKind::Other, &["/a"]).set_flag(notify::event::Flag::Rescan);
        assert_eq!(translate(create, &filters, true), vec![Signal::Create(PathBuf::from("/a/x"))]);
        assert_eq!(translate(rescan, &filters, true), vec![Signal::Overflow(Some(PathBuf::from("/a")))]);
    }
}
