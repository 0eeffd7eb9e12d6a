//! Watch engine error types.

use std::path::PathBuf;

/// Errors that can occur while maintaining watches or reading notifications.
#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    /// The kernel notification channel could not be created.
    #[error("Failed to open notification channel: {0}")]
    ChannelInitFailed(#[source] std::io::Error),

    /// A watch could not be registered for a directory.
    #[error("Failed to watch {path}: {source}")]
    RegistrationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the notification channel failed.
    #[error("Failed to read notification channel: {0}")]
    ChannelReadFailed(#[source] std::io::Error),

    /// The notification channel is no longer usable.
    #[error("Notification channel closed")]
    ChannelClosed,

    /// The kernel dropped notifications because its queue was full.
    #[error("Kernel event queue overflowed, notifications were lost")]
    QueueOverflow,

    /// None of the requested roots could be watched.
    #[error("No usable root path among {0} requested")]
    NoUsableRoots(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Whether the error ends the dispatch loop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChannelInitFailed(_)
                | Self::ChannelReadFailed(_)
                | Self::ChannelClosed
                | Self::NoUsableRoots(_)
        )
    }

    /// Classify a read failure: a dead descriptor is fatal, anything else is
    /// reported and retried on the next cycle.
    #[must_use]
    pub fn from_read(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == nix::libc::EBADF || code == nix::libc::EFAULT => {
                Self::ChannelReadFailed(err)
            }
            _ => Self::Io(err),
        }
    }
}
