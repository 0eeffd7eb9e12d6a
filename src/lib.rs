//! irondome - real-time filesystem integrity monitor for Linux.
//!
//! Directory trees are watched through inotify. Bursts of activity on a path
//! are folded into incidents, and writes to regular files are checked
//! against a SHA-256 baseline kept in SQLite.

pub mod config;
pub mod display;
pub mod integrity;
pub mod metrics;
pub mod watch;
