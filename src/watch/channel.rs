//! Kernel notification channel facade.
//!
//! The engine only needs five primitives: open a channel, add a watch,
//! remove a watch, ask how many bytes are queued, and read raw bytes. They
//! are split into two traits so the [`WatchTable`](super::WatchTable) can
//! own registration while the engine loop owns reading.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use inotify::{Inotify, WatchDescriptor, WatchMask, Watches};
use serde::Serialize;

use super::error::WatchError;
use super::mask::EventMask;

/// Opaque kernel watch descriptor.
///
/// The kernel may hand out the same integer again once a watch is gone, so
/// a handle is only meaningful while its table entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatchHandle(i32);

impl WatchHandle {
    /// Wrap a raw descriptor.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw descriptor.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Add and remove kernel watches.
pub trait Registrar: Send {
    /// Start watching `path` with the given kernel mask.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the kernel refuses the watch.
    fn watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchHandle>;

    /// Stop watching.
    ///
    /// # Errors
    ///
    /// Returns the OS error; `EINVAL` means the kernel already dropped it.
    fn unwatch(&mut self, handle: WatchHandle) -> io::Result<()>;

    /// Drop local bookkeeping for a watch the kernel already removed.
    fn forget(&mut self, handle: WatchHandle);
}

/// Read the raw notification stream.
pub trait EventSource: Send {
    /// Bytes queued on the channel right now. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the channel cannot be queried.
    fn bytes_available(&self) -> io::Result<usize>;

    /// Read up to `max_bytes`. Never blocks; returns an empty buffer when
    /// nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the read fails.
    fn read_raw(&mut self, max_bytes: usize) -> io::Result<Vec<u8>>;

    /// Close the channel, invalidating every watch registered on it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if closing fails.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

#[allow(unsafe_code)]
mod ioctl {
    #[allow(unused_imports)]
    use nix::convert_ioctl_res;

    nix::ioctl_read_bad!(fionread, nix::libc::FIONREAD, nix::libc::c_int);
}

/// Reading side of an inotify instance.
pub struct InotifySource {
    inotify: Inotify,
}

/// Registration side of an inotify instance.
pub struct InotifyRegistrar {
    watches: Watches,
    descriptors: HashMap<WatchHandle, WatchDescriptor>,
}

/// Open a non-blocking, close-on-exec inotify channel.
///
/// # Errors
///
/// Returns [`WatchError::ChannelInitFailed`] if the kernel refuses, e.g. when
/// the per-user instance limit is reached.
pub fn open_channel() -> Result<(InotifySource, InotifyRegistrar), WatchError> {
    let inotify = Inotify::init().map_err(WatchError::ChannelInitFailed)?;
    let watches = inotify.watches();
    tracing::debug!(fd = inotify.as_raw_fd(), "Opened inotify channel");
    Ok((
        InotifySource { inotify },
        InotifyRegistrar {
            watches,
            descriptors: HashMap::new(),
        },
    ))
}

impl EventSource for InotifySource {
    fn bytes_available(&self) -> io::Result<usize> {
        let mut available: nix::libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the pointer, which
        // refers to a live local for the duration of the call.
        #[allow(unsafe_code)]
        let result = unsafe { ioctl::fionread(self.inotify.as_raw_fd(), &mut available) };
        result.map_err(io::Error::from)?;
        Ok(usize::try_from(available).unwrap_or(0))
    }

    fn read_raw(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max_bytes];
        match nix::unistd::read(self.inotify.as_raw_fd(), &mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => Ok(Vec::new()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn close(self) -> io::Result<()> {
        self.inotify.close()
    }
}

impl Registrar for InotifyRegistrar {
    fn watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchHandle> {
        let descriptor = self
            .watches
            .add(path, WatchMask::from_bits_truncate(mask.bits()))?;
        let handle = WatchHandle::from_raw(descriptor.get_watch_descriptor_id());
        self.descriptors.insert(handle, descriptor);
        Ok(handle)
    }

    fn unwatch(&mut self, handle: WatchHandle) -> io::Result<()> {
        match self.descriptors.remove(&handle) {
            Some(descriptor) => self.watches.remove(descriptor),
            None => Err(io::Error::from_raw_os_error(nix::libc::EINVAL)),
        }
    }

    fn forget(&mut self, handle: WatchHandle) {
        self.descriptors.remove(&handle);
    }
}

impl InotifyRegistrar {
    /// Descriptors still held for live watches.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.descriptors.len()
    }
}
