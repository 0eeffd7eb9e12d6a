//! Table of live kernel watches.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::channel::{Registrar, WatchHandle};
use super::error::WatchError;
use super::mask::{EventMask, KERNEL_WATCH_MASK};

/// One live kernel watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    /// Kernel-assigned handle.
    pub handle: WatchHandle,
    /// Absolute path of the watched directory.
    pub path: PathBuf,
    /// Watch whose activity caused this one to be added. `None` for roots.
    pub parent: Option<WatchHandle>,
    /// Kinds reported for entries below this directory.
    pub mask: EventMask,
}

/// Outcome of [`WatchTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new kernel watch was added.
    Added(WatchHandle),
    /// The path was already watched; nothing changed.
    AlreadyWatched(WatchHandle),
}

impl Registration {
    /// Handle of the watch covering the path.
    #[must_use]
    pub fn handle(self) -> WatchHandle {
        match self {
            Self::Added(h) | Self::AlreadyWatched(h) => h,
        }
    }

    /// Whether a new watch was registered.
    #[must_use]
    pub fn is_new(self) -> bool {
        matches!(self, Self::Added(_))
    }
}

struct TableState<R> {
    registrar: R,
    entries: HashMap<WatchHandle, WatchEntry>,
    by_path: HashMap<PathBuf, WatchHandle>,
    /// Handles torn down by path whose kernel "ignored" notice is still in
    /// flight.
    retired: HashSet<WatchHandle>,
}

impl<R: Registrar> TableState<R> {
    fn detach(&mut self, handle: WatchHandle) -> Option<WatchEntry> {
        let entry = self.entries.remove(&handle)?;
        if self.by_path.get(&entry.path) == Some(&handle) {
            self.by_path.remove(&entry.path);
        }
        Some(entry)
    }

    /// Detach an entry the kernel has already invalidated.
    fn expire(&mut self, handle: WatchHandle) -> Option<WatchEntry> {
        let entry = self.detach(handle)?;
        self.registrar.forget(handle);
        Some(entry)
    }

    fn retire(&mut self, handle: WatchHandle) -> Option<WatchEntry> {
        let entry = self.detach(handle)?;
        self.retired.insert(handle);
        if let Err(e) = self.registrar.unwatch(handle) {
            // EINVAL: the kernel already dropped it and queued "ignored".
            tracing::debug!(
                handle = %handle,
                path = %entry.path.display(),
                error = %e,
                "Watch already gone in kernel"
            );
        }
        Some(entry)
    }
}

/// Mapping from watch handle to watch metadata, shared between the engine
/// loop and callers registering roots.
///
/// Every operation takes the table lock once, so a path check and the
/// registration that depends on it can never interleave with another
/// caller's.
pub struct WatchTable<R> {
    state: Mutex<TableState<R>>,
}

impl<R: Registrar> WatchTable<R> {
    /// Create an empty table that registers watches through `registrar`.
    #[must_use]
    pub fn new(registrar: R) -> Self {
        Self {
            state: Mutex::new(TableState {
                registrar,
                entries: HashMap::new(),
                by_path: HashMap::new(),
                retired: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn with_registrar<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&self.lock().registrar)
    }

    /// Register a watch for `path` unless one already exists.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::RegistrationFailed`] when the kernel refuses the
    /// watch (limit reached, path vanished, permission denied).
    pub fn insert(
        &self,
        path: &Path,
        parent: Option<WatchHandle>,
        mask: EventMask,
    ) -> Result<Registration, WatchError> {
        let mut state = self.lock();
        if let Some(&handle) = state.by_path.get(path) {
            return Ok(Registration::AlreadyWatched(handle));
        }

        let handle = state
            .registrar
            .watch(path, KERNEL_WATCH_MASK)
            .map_err(|source| WatchError::RegistrationFailed {
                path: path.to_path_buf(),
                source,
            })?;

        // Same inode reached through another path: the kernel hands back
        // the existing descriptor.
        if let Some(stale) = state.detach(handle) {
            tracing::debug!(
                handle = %handle,
                old_path = %stale.path.display(),
                new_path = %path.display(),
                "Watch handle now refers to a different path"
            );
        }

        state.by_path.insert(path.to_path_buf(), handle);
        state.entries.insert(
            handle,
            WatchEntry {
                handle,
                path: path.to_path_buf(),
                parent,
                mask,
            },
        );
        tracing::debug!(
            handle = %handle,
            path = %path.display(),
            parent = ?parent.map(WatchHandle::as_raw),
            "Added watch"
        );
        Ok(Registration::Added(handle))
    }

    /// Drop the entry for `handle`. Absent handles are ignored.
    pub fn remove_by_handle(&self, handle: WatchHandle) -> Option<WatchEntry> {
        self.lock().expire(handle)
    }

    /// Tear down the watch for exactly `path`, ahead of its kernel
    /// "ignored" notice.
    pub fn remove_by_path(&self, path: &Path) -> Option<WatchEntry> {
        let mut state = self.lock();
        let handle = *state.by_path.get(path)?;
        state.retire(handle)
    }

    /// Tear down the watch for `path` and every watch below it.
    pub fn remove_subtree(&self, path: &Path) -> Vec<WatchEntry> {
        let mut state = self.lock();
        let handles: Vec<WatchHandle> = state
            .entries
            .values()
            .filter(|entry| entry.path.starts_with(path))
            .map(|entry| entry.handle)
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| state.retire(handle))
            .collect()
    }

    /// Handle the kernel's notice that `handle` is no longer valid.
    ///
    /// If the handle was already torn down by path the notice is consumed
    /// and any newer entry that reused the integer is left alone.
    pub fn acknowledge_ignored(&self, handle: WatchHandle) -> Option<WatchEntry> {
        let mut state = self.lock();
        if state.retired.remove(&handle) {
            return None;
        }
        state.expire(handle)
    }

    /// Whether `path` is currently watched.
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.lock().by_path.contains_key(path)
    }

    /// Entry for `handle`, if live.
    #[must_use]
    pub fn get(&self, handle: WatchHandle) -> Option<WatchEntry> {
        self.lock().entries.get(&handle).cloned()
    }

    /// Handle watching `path`, if any.
    #[must_use]
    pub fn handle_of(&self, path: &Path) -> Option<WatchHandle> {
        self.lock().by_path.get(path).copied()
    }

    /// Number of live watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no watch is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of every live entry, sorted by path.
    #[must_use]
    pub fn entries(&self) -> Vec<WatchEntry> {
        let mut entries: Vec<WatchEntry> = self.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Deregister every watch. Failures are logged, not returned; closing
    /// the channel invalidates whatever is left.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let handles: Vec<WatchHandle> = state.entries.keys().copied().collect();
        let mut removed = 0;
        for handle in handles {
            if let Some(entry) = state.detach(handle) {
                match state.registrar.unwatch(handle) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(
                        handle = %handle,
                        path = %entry.path.display(),
                        error = %e,
                        "Failed to remove watch"
                    ),
                }
            }
        }
        state.retired.clear();
        removed
    }
}
