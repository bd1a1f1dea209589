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
//! Watch options.

use std::slice::Iter;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default size of directory change buffers.
pub const DEFAULT_BUFFER_SIZE: i32 = 63 * 1024;

/// Modification filter bit for content changes.
pub const MODIFIED_CONTENT: i32 = 0b01;

/// Modification filter bit for metadata changes.
pub const MODIFIED_METADATA: i32 = 0b10;

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Watch option.
///
/// Options are stored opaquely per watch and handed to the backend when it
/// subscribes to a directory. Backends only apply the options they know of,
/// and silently ignore all others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opt {
    /// Size of the directory change buffer in bytes.
    BufferSize = 1,
    /// Notification filter bitmask of the platform.
    NotifyFilter = 2,
    /// Modification filter bitmask, see [`MODIFIED_CONTENT`] and
    /// [`MODIFIED_METADATA`].
    ModifiedFilter = 3,
    /// Collapse duplicate or contradictory events (`0` or `1`).
    SanitizeEvents = 4,
    /// Backfill events for directories created during a recursive watch
    /// (`0` or `1`).
    SyntheticEvents = 5,
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Watch options.
///
/// # Examples
///
/// ```
/// use treewatch::{Opt, WatchOptions};
///
/// // Create options and disable synthetic events
/// let options = WatchOptions::new().with(Opt::SyntheticEvents, 0);
/// assert!(!options.is_enabled(Opt::SyntheticEvents, true));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Option values in insertion order.
    values: Vec<(Opt, i32)>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Opt {
    /// Creates an option from its integer identifier.
    ///
    /// Unknown identifiers yield [`None`], so they can be dropped instead of
    /// being treated as errors.
    #[must_use]
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            1 => Some(Opt::BufferSize),
            2 => Some(Opt::NotifyFilter),
            3 => Some(Opt::ModifiedFilter),
            4 => Some(Opt::SanitizeEvents),
            5 => Some(Opt::SyntheticEvents),
            _ => None,
        }
    }
}

impl WatchOptions {
    /// Creates an empty set of options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option and returns the options.
    #[must_use]
    pub fn with(mut self, opt: Opt, value: i32) -> Self {
        self.set(opt, value);
        self
    }

    /// Sets an option, replacing a previous value.
    pub fn set(&mut self, opt: Opt, value: i32) {
        match self.values.iter_mut().find(|(check, _)| *check == opt) {
            Some((_, prev)) => *prev = value,
            None => self.values.push((opt, value)),
        }
    }

    /// Returns the value of an option, if set.
    #[must_use]
    pub fn get(&self, opt: Opt) -> Option<i32> {
        self.values
            .iter()
            .find_map(|(check, value)| (*check == opt).then_some(*value))
    }

    /// Returns the value of an option or the given default.
    #[must_use]
    pub fn get_or(&self, opt: Opt, default: i32) -> i32 {
        self.get(opt).unwrap_or(default)
    }

    /// Returns whether a toggle option is enabled.
    #[must_use]
    pub fn is_enabled(&self, opt: Opt, default: bool) -> bool {
        self.get(opt).map_or(default, |value| value != 0)
    }

    /// Returns an iterator over all options.
    pub fn iter(&self) -> Iter<'_, (Opt, i32)> {
        self.values.iter()
    }

    /// Returns the number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns whether there are no options.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl FromIterator<(Opt, i32)> for WatchOptions {
    /// Creates options from option-value pairs.
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (Opt, i32)>,
    {
        let mut options = Self::new();
        for (opt, value) in iter {
            options.set(opt, value);
        }
        options
    }
}

impl FromIterator<(i32, i32)> for WatchOptions {
    /// Creates options from raw key-value pairs, dropping unknown keys.
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (i32, i32)>,
    {
        iter.into_iter()
            .filter_map(|(key, value)| Opt::from_raw(key).map(|opt| (opt, value)))
            .collect()
    }
}

impl<'a> IntoIterator for &'a WatchOptions {
    type Item = &'a (Opt, i32);
    type IntoIter = Iter<'a, (Opt, i32)>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
