//! Kernel event masks and the named event kinds reported to callers.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bitset of inotify event kinds and flags, using the kernel's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// File was accessed.
        const ACCESS = 0x0000_0001;
        /// File was modified.
        const MODIFY = 0x0000_0002;
        /// Metadata changed.
        const ATTRIB = 0x0000_0004;
        /// Writable file was closed.
        const CLOSE_WRITE = 0x0000_0008;
        /// Unwritable file was closed.
        const CLOSE_NOWRITE = 0x0000_0010;
        /// File was opened.
        const OPEN = 0x0000_0020;
        /// File was moved out of a watched directory.
        const MOVED_FROM = 0x0000_0040;
        /// File was moved into a watched directory.
        const MOVED_TO = 0x0000_0080;
        /// Entry was created in a watched directory.
        const CREATE = 0x0000_0100;
        /// Entry was deleted from a watched directory.
        const DELETE = 0x0000_0200;
        /// The watched directory itself was deleted.
        const DELETE_SELF = 0x0000_0400;
        /// The watched directory itself was moved.
        const MOVE_SELF = 0x0000_0800;

        /// Backing filesystem was unmounted.
        const UNMOUNT = 0x0000_2000;
        /// Kernel event queue overflowed.
        const Q_OVERFLOW = 0x0000_4000;
        /// Watch was removed by the kernel or explicitly.
        const IGNORED = 0x0000_8000;

        /// Only watch the path if it is a directory.
        const ONLYDIR = 0x0100_0000;
        /// Do not follow a symlink.
        const DONT_FOLLOW = 0x0200_0000;
        /// Exclude events on unlinked objects.
        const EXCL_UNLINK = 0x0400_0000;
        /// Fail if a watch already exists for the inode.
        const MASK_CREATE = 0x1000_0000;
        /// Add to the mask of an existing watch.
        const MASK_ADD = 0x2000_0000;
        /// Event occurred against a directory.
        const ISDIR = 0x4000_0000;
        /// Only send the event once.
        const ONESHOT = 0x8000_0000;

        /// Either close variant.
        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        /// Either half of a rename.
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();
        /// Every event user space can subscribe to.
        const ALL_EVENTS = Self::ACCESS.bits()
            | Self::MODIFY.bits()
            | Self::ATTRIB.bits()
            | Self::CLOSE_WRITE.bits()
            | Self::CLOSE_NOWRITE.bits()
            | Self::OPEN.bits()
            | Self::MOVED_FROM.bits()
            | Self::MOVED_TO.bits()
            | Self::CREATE.bits()
            | Self::DELETE.bits()
            | Self::DELETE_SELF.bits()
            | Self::MOVE_SELF.bits();
    }
}

/// Mask every directory watch is registered with in the kernel.
///
/// The subscribed mask of a [`WatchEntry`](super::WatchEntry) only filters
/// what is reported; the kernel always delivers everything so the tree can
/// be maintained.
pub const KERNEL_WATCH_MASK: EventMask = EventMask::ALL_EVENTS
    .union(EventMask::ONLYDIR)
    .union(EventMask::DONT_FOLLOW);

/// Kinds whose occurrence means file content may have changed.
pub const CONTENT_MODIFYING: EventMask = EventMask::MODIFY.union(EventMask::MOVE);

impl EventMask {
    /// Whether this mask describes directory creation (or a directory moved in).
    #[must_use]
    pub fn is_dir_created(self) -> bool {
        self.contains(Self::ISDIR) && self.intersects(Self::CREATE | Self::MOVED_TO)
    }

    /// Whether this mask describes directory removal (or a directory moved out).
    #[must_use]
    pub fn is_dir_removed(self) -> bool {
        self.contains(Self::ISDIR) && self.intersects(Self::DELETE | Self::MOVED_FROM)
    }

    /// Whether the record carries a marker the engine never follows.
    #[must_use]
    pub fn is_unsupported_target(self) -> bool {
        self.intersects(Self::DONT_FOLLOW | Self::EXCL_UNLINK)
    }
}

/// A named, caller-visible kind of filesystem activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "access")]
    Access,
    #[serde(rename = "modify")]
    Modify,
    #[serde(rename = "attrib")]
    Attrib,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "move from")]
    MoveFrom,
    #[serde(rename = "move to")]
    MoveTo,
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "delete self")]
    DeleteSelf,
    #[serde(rename = "move self")]
    MoveSelf,
}

impl EventKind {
    /// Every kind, in kernel bit order.
    pub const ALL: [Self; 11] = [
        Self::Access,
        Self::Modify,
        Self::Attrib,
        Self::Closed,
        Self::Open,
        Self::MoveFrom,
        Self::MoveTo,
        Self::Create,
        Self::Delete,
        Self::DeleteSelf,
        Self::MoveSelf,
    ];

    /// Returns the display name used in incidents and on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Modify => "modify",
            Self::Attrib => "attrib",
            Self::Closed => "closed",
            Self::Open => "open",
            Self::MoveFrom => "move from",
            Self::MoveTo => "move to",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::DeleteSelf => "delete self",
            Self::MoveSelf => "move self",
        }
    }

    /// Returns the kernel bits this kind stands for.
    #[must_use]
    pub fn mask(self) -> EventMask {
        match self {
            Self::Access => EventMask::ACCESS,
            Self::Modify => EventMask::MODIFY,
            Self::Attrib => EventMask::ATTRIB,
            Self::Closed => EventMask::CLOSE,
            Self::Open => EventMask::OPEN,
            Self::MoveFrom => EventMask::MOVED_FROM,
            Self::MoveTo => EventMask::MOVED_TO,
            Self::Create => EventMask::CREATE,
            Self::Delete => EventMask::DELETE,
            Self::DeleteSelf => EventMask::DELETE_SELF,
            Self::MoveSelf => EventMask::MOVE_SELF,
        }
    }

    /// Kinds present in `mask`, in kernel bit order.
    #[must_use]
    pub fn from_mask(mask: EventMask) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|kind| mask.intersects(kind.mask()))
            .collect()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event kind name that is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Parse an allow-list of kind names into a subscription mask.
///
/// An empty list subscribes to every kind.
///
/// # Errors
///
/// Returns [`UnknownEventKind`] for the first name that is not recognized.
pub fn parse_event_list<S: AsRef<str>>(names: &[S]) -> Result<EventMask, UnknownEventKind> {
    let mut mask = EventMask::empty();
    for name in names {
        let name = name.as_ref();
        if name.trim().is_empty() {
            continue;
        }
        mask |= name.parse::<EventKind>()?.mask();
    }
    if mask.is_empty() {
        Ok(EventMask::ALL_EVENTS)
    } else {
        Ok(mask)
    }
}
