//! In-memory channel doubles for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::channel::{EventSource, Registrar, WatchHandle};
use super::decoder::ChangeRecord;
use super::mask::EventMask;

#[derive(Default)]
struct RegistrarState {
    next: i32,
    watch_calls: usize,
    last_mask: Option<EventMask>,
    watched: HashMap<WatchHandle, PathBuf>,
    unwatched: Vec<WatchHandle>,
    forgotten: Vec<WatchHandle>,
    fail_next: Option<io::Error>,
    reuse_next: Option<WatchHandle>,
}

/// Registrar handing out sequential handles. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRegistrar {
    state: Arc<Mutex<RegistrarState>>,
}

impl FakeRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: io::Error) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    pub fn reuse_next(&self, handle: WatchHandle) {
        self.state.lock().unwrap().reuse_next = Some(handle);
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().unwrap().watch_calls
    }

    pub fn last_mask(&self) -> Option<EventMask> {
        self.state.lock().unwrap().last_mask
    }

    pub fn unwatched(&self) -> Vec<WatchHandle> {
        self.state.lock().unwrap().unwatched.clone()
    }

    pub fn forgotten(&self) -> Vec<WatchHandle> {
        self.state.lock().unwrap().forgotten.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().watched.len()
    }
}

impl Registrar for FakeRegistrar {
    fn watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchHandle> {
        let mut state = self.state.lock().unwrap();
        state.watch_calls += 1;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.last_mask = Some(mask);
        let handle = if let Some(handle) = state.reuse_next.take() {
            handle
        } else {
            state.next += 1;
            WatchHandle::from_raw(state.next)
        };
        state.watched.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn unwatch(&mut self, handle: WatchHandle) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.watched.remove(&handle).is_some() {
            state.unwatched.push(handle);
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(nix::libc::EINVAL))
        }
    }

    fn forget(&mut self, handle: WatchHandle) {
        let mut state = self.state.lock().unwrap();
        state.watched.remove(&handle);
        state.forgotten.push(handle);
    }
}

#[derive(Default)]
struct SourceState {
    queue: VecDeque<Vec<u8>>,
    fail_next: Option<io::Error>,
    closed: bool,
}

/// Source replaying scripted buffers. Clones share state.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one read's worth of records.
    pub fn push(&self, records: &[ChangeRecord]) {
        let bytes = records.iter().flat_map(|r| r.to_bytes(16)).collect();
        self.state.lock().unwrap().queue.push_back(bytes);
    }

    pub fn fail_next(&self, err: io::Error) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl EventSource for FakeSource {
    fn bytes_available(&self) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        Ok(state.queue.front().map_or(0, Vec::len))
    }

    fn read_raw(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let mut bytes = state.queue.pop_front().unwrap_or_default();
        bytes.truncate(max_bytes);
        Ok(bytes)
    }

    fn close(self) -> io::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
