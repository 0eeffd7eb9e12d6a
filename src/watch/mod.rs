//! Recursive inotify watch engine.

mod aggregator;
mod channel;
mod decoder;
mod engine;
mod error;
mod mask;
mod table;

#[cfg(test)]
mod testing;

pub use aggregator::{
    AggregationMode, Aggregator, Incident, Severity, DEFAULT_INACTIVITY_WINDOW, DEFAULT_MAX_PENDING,
};
pub use channel::{open_channel, EventSource, InotifyRegistrar, InotifySource, Registrar, WatchHandle};
pub use decoder::{decode, ChangeRecord, Records, HEADER_SIZE};
pub use engine::{
    EngineConfig, EngineState, MismatchAlert, MonitorEvent, RootReport, WatchEngine, MIN_READ_BUFFER,
};
pub use error::WatchError;
pub use mask::{
    parse_event_list, EventKind, EventMask, UnknownEventKind, CONTENT_MODIFYING, KERNEL_WATCH_MASK,
};
pub use table::{Registration, WatchEntry, WatchTable};
