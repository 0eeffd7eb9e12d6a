//! The watch engine: read, decode and dispatch loop.
//!
//! One engine owns one notification channel. Each cycle it asks how many
//! bytes are queued, reads and decodes them, keeps the [`WatchTable`] in
//! step with directories appearing and disappearing, runs the
//! [`IntegrityGate`] on content changes, and folds reportable kinds into
//! the [`Aggregator`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::aggregator::{
    AggregationMode, Aggregator, Incident, Severity, DEFAULT_INACTIVITY_WINDOW,
    DEFAULT_MAX_PENDING,
};
use super::channel::{open_channel, EventSource, InotifyRegistrar, InotifySource, Registrar, WatchHandle};
use super::decoder::{decode, ChangeRecord, HEADER_SIZE};
use super::error::WatchError;
use super::mask::{EventKind, EventMask, CONTENT_MODIFYING};
use super::table::{WatchEntry, WatchTable};
use crate::integrity::{IntegrityError, IntegrityGate, Verdict};

/// Smallest read that always fits one record with a maximal name.
pub const MIN_READ_BUFFER: usize = HEADER_SIZE + 256;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Kinds reported for roots and everything below them.
    pub mask: EventMask,
    /// Quiet period after which a pending incident is flushed.
    pub inactivity_window: Duration,
    /// Sleep between polls when nothing is queued.
    pub poll_interval: Duration,
    /// Upper bound on a single read.
    pub read_buffer_size: usize,
    pub aggregation: AggregationMode,
    pub max_pending: usize,
    /// Register existing subdirectories when adding roots.
    pub recursive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mask: EventMask::ALL_EVENTS,
            inactivity_window: DEFAULT_INACTIVITY_WINDOW,
            poll_interval: Duration::from_millis(200),
            read_buffer_size: 64 * 1024,
            aggregation: AggregationMode::default(),
            max_pending: DEFAULT_MAX_PENDING,
            recursive: true,
        }
    }
}

/// Lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Running,
    Terminating,
    Stopped,
}

/// Content divergence detected by the integrity gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchAlert {
    pub path: PathBuf,
    pub old_hash: String,
    pub new_hash: String,
    pub detected_at: DateTime<Utc>,
}

/// Something the caller should see.
#[derive(Debug)]
pub enum MonitorEvent {
    /// A flushed burst of activity on one path.
    Incident(Incident),
    /// Content no longer matches the baseline. Reported immediately.
    Mismatch(MismatchAlert),
    /// A non-fatal problem during a cycle.
    Error(WatchError),
}

/// Result of [`WatchEngine::add_roots`].
#[derive(Debug, Default)]
pub struct RootReport {
    /// Roots now watched, canonicalized.
    pub roots: Vec<PathBuf>,
    /// New watches registered, subdirectories included.
    pub directories: usize,
    /// Roots or subdirectories that could not be watched.
    pub failures: Vec<WatchError>,
}

/// Watches registered for one directory tree.
#[derive(Debug, Default)]
struct TreeScan {
    added: usize,
    failures: Vec<WatchError>,
}

/// Register `dir` and, when `recursive`, every directory below it.
///
/// Failing to watch `dir` itself is an error; failures below it are
/// collected. Symlinks are not followed.
fn register_tree<R: Registrar>(
    table: &WatchTable<R>,
    dir: &Path,
    parent: Option<WatchHandle>,
    mask: EventMask,
    recursive: bool,
) -> Result<TreeScan, WatchError> {
    let top = table.insert(dir, parent, mask)?;
    let mut scan = TreeScan {
        added: usize::from(top.is_new()),
        failures: Vec::new(),
    };
    if !recursive {
        return Ok(scan);
    }

    for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping entry during tree scan");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let parent = entry.path().parent().and_then(|p| table.handle_of(p));
        match table.insert(entry.path(), parent, mask) {
            Ok(reg) => scan.added += usize::from(reg.is_new()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch subdirectory");
                scan.failures.push(e);
            }
        }
    }
    Ok(scan)
}

/// Event-driven watch engine over one notification channel.
pub struct WatchEngine<S, R> {
    source: Option<S>,
    table: Arc<WatchTable<R>>,
    gate: IntegrityGate,
    aggregator: Aggregator,
    config: EngineConfig,
    state: EngineState,
}

impl WatchEngine<InotifySource, InotifyRegistrar> {
    /// Open an inotify channel and build an engine on it.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::ChannelInitFailed`] if the channel cannot be opened.
    pub fn open(config: EngineConfig, gate: IntegrityGate) -> Result<Self, WatchError> {
        let (source, registrar) = open_channel()?;
        Ok(Self::with_channel(source, registrar, gate, config))
    }
}

impl<S: EventSource, R: Registrar> WatchEngine<S, R> {
    /// Build an engine on an already open channel.
    #[must_use]
    pub fn with_channel(source: S, registrar: R, gate: IntegrityGate, config: EngineConfig) -> Self {
        let aggregator = Aggregator::new(
            config.aggregation,
            config.inactivity_window,
            config.max_pending,
        );
        Self {
            source: Some(source),
            table: Arc::new(WatchTable::new(registrar)),
            gate,
            aggregator,
            config,
            state: EngineState::Running,
        }
    }

    /// Shared watch table, for registering roots while the loop runs.
    #[must_use]
    pub fn table(&self) -> Arc<WatchTable<R>> {
        Arc::clone(&self.table)
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn transition(&mut self, new_state: EngineState) {
        tracing::debug!(from = ?self.state, to = ?new_state, "Engine state transition");
        self.state = new_state;
    }

    /// Start watching `roots` with the configured mask.
    ///
    /// Roots that cannot be watched are reported in the result and logged
    /// as warnings.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::NoUsableRoots`] when none of `roots` could be
    /// watched.
    pub fn add_roots(&self, roots: &[PathBuf]) -> Result<RootReport, WatchError> {
        let mut report = RootReport::default();
        for root in roots {
            let canonical = match std::fs::canonicalize(root) {
                Ok(p) => p,
                Err(source) => {
                    let err = WatchError::RegistrationFailed {
                        path: root.clone(),
                        source,
                    };
                    tracing::warn!(error = %err, "Skipping root");
                    report.failures.push(err);
                    continue;
                }
            };
            match register_tree(
                &self.table,
                &canonical,
                None,
                self.config.mask,
                self.config.recursive,
            ) {
                Ok(scan) => {
                    tracing::info!(
                        root = %canonical.display(),
                        directories = scan.added,
                        "Watching root"
                    );
                    report.directories += scan.added;
                    report.failures.extend(scan.failures);
                    report.roots.push(canonical);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping root");
                    report.failures.push(err);
                }
            }
        }

        if report.roots.is_empty() {
            return Err(WatchError::NoUsableRoots(roots.len()));
        }
        Ok(report)
    }

    /// Run one cycle now.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`WatchError`] when the channel is unusable.
    pub fn poll(&mut self) -> Result<Vec<MonitorEvent>, WatchError> {
        self.poll_at(Instant::now())
    }

    /// Run one cycle as if the current time were `now`.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`WatchError`] when the channel is unusable.
    pub fn poll_at(&mut self, now: Instant) -> Result<Vec<MonitorEvent>, WatchError> {
        self.cycle(now).map(|(events, _)| events)
    }

    fn cycle(&mut self, now: Instant) -> Result<(Vec<MonitorEvent>, usize), WatchError> {
        let mut events = Vec::new();
        let bytes = match self.read_pending() {
            Ok(bytes) => bytes,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Read failed, retrying next cycle");
                events.push(MonitorEvent::Error(e));
                Vec::new()
            }
        };
        if !bytes.is_empty() {
            self.dispatch(&bytes, now, &mut events);
        }
        for incident in self.aggregator.flush_expired(now) {
            log_incident(&incident);
            events.push(MonitorEvent::Incident(incident));
        }
        Ok((events, bytes.len()))
    }

    fn read_pending(&mut self) -> Result<Vec<u8>, WatchError> {
        let max = self.config.read_buffer_size.max(MIN_READ_BUFFER);
        let source = self.source.as_mut().ok_or(WatchError::ChannelClosed)?;
        let available = source.bytes_available().map_err(WatchError::from_read)?;
        if available == 0 {
            return Ok(Vec::new());
        }
        source
            .read_raw(available.min(max))
            .map_err(WatchError::from_read)
    }

    fn dispatch(&mut self, bytes: &[u8], now: Instant, events: &mut Vec<MonitorEvent>) {
        let mut records = decode(bytes);
        for record in records.by_ref() {
            self.dispatch_record(&record, now, events);
        }
        if records.is_truncated() {
            tracing::debug!(
                offset = records.offset(),
                len = bytes.len(),
                "Dropped truncated record"
            );
        }
    }

    fn dispatch_record(&mut self, record: &ChangeRecord, now: Instant, events: &mut Vec<MonitorEvent>) {
        tracing::trace!(
            handle = %record.handle,
            mask = ?record.mask,
            cookie = record.cookie,
            name = ?record.name,
            "Record"
        );

        if record.mask.contains(EventMask::Q_OVERFLOW) {
            tracing::warn!("Kernel event queue overflowed");
            events.push(MonitorEvent::Error(WatchError::QueueOverflow));
            return;
        }

        if record.mask.contains(EventMask::IGNORED) {
            if let Some(entry) = self.table.acknowledge_ignored(record.handle) {
                tracing::debug!(
                    handle = %record.handle,
                    path = %entry.path.display(),
                    "Watch invalidated by kernel"
                );
            }
            return;
        }

        let Some(entry) = self.table.get(record.handle) else {
            tracing::trace!(handle = %record.handle, "Record for unknown watch");
            return;
        };
        if record.mask.is_unsupported_target() {
            return;
        }

        let path = if record.name.is_empty() {
            entry.path.clone()
        } else {
            entry.path.join(&record.name)
        };

        if record.mask.is_dir_created() {
            self.extend(&entry, &path, events);
        } else if record.mask.is_dir_removed() {
            self.retract(record.mask, &path);
        }

        let severity = if record.mask.intersects(CONTENT_MODIFYING)
            && !record.mask.contains(EventMask::ISDIR)
        {
            self.check_integrity(&path, events)
        } else {
            Severity::Info
        };

        let kinds = EventKind::from_mask(record.mask & entry.mask);
        if kinds.is_empty() {
            return;
        }
        for incident in self.aggregator.record(&path, &kinds, now) {
            log_incident(&incident);
            events.push(MonitorEvent::Incident(incident));
        }
        if severity > Severity::Info {
            self.aggregator.escalate(&path, severity);
        }
    }

    fn extend(&self, parent: &WatchEntry, path: &Path, events: &mut Vec<MonitorEvent>) {
        if !path.is_dir() || self.table.exists(path) {
            return;
        }
        match register_tree(&self.table, path, Some(parent.handle), parent.mask, true) {
            Ok(scan) => {
                tracing::debug!(
                    path = %path.display(),
                    parent = %parent.handle,
                    directories = scan.added,
                    "Extended watch tree"
                );
                events.extend(scan.failures.into_iter().map(MonitorEvent::Error));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch new directory");
                events.push(MonitorEvent::Error(e));
            }
        }
    }

    fn retract(&self, mask: EventMask, path: &Path) {
        // A directory moved away keeps its inode and its watches below it.
        let removed = if mask.contains(EventMask::MOVED_FROM) {
            self.table.remove_subtree(path).len()
        } else {
            usize::from(self.table.remove_by_path(path).is_some())
        };
        if removed > 0 {
            tracing::debug!(path = %path.display(), removed, "Retracted watch tree");
        }
    }

    fn check_integrity(&self, path: &Path, events: &mut Vec<MonitorEvent>) -> Severity {
        match self.gate.on_modified(path) {
            Ok(Verdict::Mismatch { old_hash, new_hash }) => {
                tracing::error!(
                    path = %path.display(),
                    old_hash = %old_hash,
                    new_hash = %new_hash,
                    "Integrity mismatch"
                );
                events.push(MonitorEvent::Mismatch(MismatchAlert {
                    path: path.to_path_buf(),
                    old_hash,
                    new_hash,
                    detected_at: Utc::now(),
                }));
                Severity::Critical
            }
            Ok(Verdict::FirstSeen { .. }) => Severity::Warning,
            Ok(Verdict::Unchanged | Verdict::FileGone) => Severity::Info,
            Err(IntegrityError::NotRegularFile(_)) => Severity::Info,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Integrity check failed");
                Severity::Info
            }
        }
    }

    /// Flush pending incidents, deregister every watch and close the
    /// channel. Idempotent.
    pub fn shutdown(&mut self) -> Vec<Incident> {
        if self.state == EngineState::Stopped {
            return Vec::new();
        }
        if self.state == EngineState::Running {
            self.transition(EngineState::Terminating);
        }

        let incidents = self.aggregator.flush_all();
        for incident in &incidents {
            log_incident(incident);
        }

        let removed = self.table.clear();
        if let Some(source) = self.source.take() {
            if let Err(e) = source.close() {
                tracing::warn!(error = %e, "Failed to close notification channel");
            }
        }
        tracing::info!(removed, "Watch engine stopped");
        self.transition(EngineState::Stopped);
        incidents
    }

    /// Run until `cancel` fires, the receiver goes away, or the channel
    /// fails. Blocks the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`WatchError`] that ended the loop.
    pub fn run(
        mut self,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<(), WatchError> {
        tracing::info!(watches = self.table.len(), "Watch engine running");
        let outcome = self.run_loop(cancel, tx);
        for incident in self.shutdown() {
            if tx.send(MonitorEvent::Incident(incident)).is_err() {
                break;
            }
        }
        outcome
    }

    fn run_loop(
        &mut self,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<(), WatchError> {
        while self.state == EngineState::Running {
            if cancel.is_cancelled() {
                tracing::debug!("Watch engine cancelled");
                self.transition(EngineState::Terminating);
                break;
            }

            let (events, read) = match self.cycle(Instant::now()) {
                Ok(cycle) => cycle,
                Err(e) => {
                    tracing::error!(error = %e, "Notification channel failed");
                    self.transition(EngineState::Terminating);
                    return Err(e);
                }
            };
            for event in events {
                if tx.send(event).is_err() {
                    tracing::debug!("Event receiver dropped");
                    self.transition(EngineState::Terminating);
                    return Ok(());
                }
            }
            if read == 0 {
                std::thread::sleep(self.config.poll_interval);
            }
        }
        Ok(())
    }
}

impl<S, R> WatchEngine<S, R>
where
    S: EventSource + 'static,
    R: Registrar + 'static,
{
    /// Run the loop on a dedicated blocking worker.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (
        tokio::task::JoinHandle<Result<(), WatchError>>,
        mpsc::UnboundedReceiver<MonitorEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || self.run(&cancel, &tx));
        (handle, rx)
    }
}

fn log_incident(incident: &Incident) {
    let path = incident.path.display();
    let kinds = incident.kind_names();
    match incident.severity {
        Severity::Info => tracing::info!(path = %path, kinds = %kinds, records = incident.records, "Incident"),
        Severity::Warning => {
            tracing::warn!(path = %path, kinds = %kinds, records = incident.records, "Incident on file not in baseline");
        }
        Severity::Critical => {
            tracing::warn!(path = %path, kinds = %kinds, records = incident.records, "Incident on modified file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{hash_reader, BaselineStore, SqliteBaseline};
    use crate::watch::testing::{FakeRegistrar, FakeSource};

    const WINDOW: Duration = Duration::from_millis(100);

    struct Harness {
        engine: WatchEngine<FakeSource, FakeRegistrar>,
        source: FakeSource,
        registrar: FakeRegistrar,
        store: Arc<SqliteBaseline>,
        dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Harness {
        fn new(mask: EventMask) -> Self {
            Self::with_mode(mask, AggregationMode::PerPath)
        }

        fn with_mode(mask: EventMask, aggregation: AggregationMode) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = std::fs::canonicalize(dir.path()).unwrap();
            let source = FakeSource::new();
            let registrar = FakeRegistrar::new();
            let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
            let config = EngineConfig {
                mask,
                inactivity_window: WINDOW,
                poll_interval: Duration::from_millis(5),
                aggregation,
                ..EngineConfig::default()
            };
            let engine = WatchEngine::with_channel(
                source.clone(),
                registrar.clone(),
                IntegrityGate::new(store.clone(), 4096),
                config,
            );
            Self {
                engine,
                source,
                registrar,
                store,
                dir,
                root,
            }
        }

        fn watch_root(&self) -> WatchHandle {
            self.engine.add_roots(&[self.root.clone()]).unwrap();
            self.engine.table().handle_of(&self.root).unwrap()
        }

        fn handle(&self, path: &Path) -> WatchHandle {
            self.engine.table().handle_of(path).unwrap()
        }
    }

    fn rec(handle: WatchHandle, mask: EventMask, name: &str) -> ChangeRecord {
        ChangeRecord::new(handle, mask, 0, name)
    }

    fn incidents(events: Vec<MonitorEvent>) -> Vec<Incident> {
        events
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::Incident(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_write_burst_is_one_incident() {
        let mut h = Harness::new(EventMask::CREATE | EventMask::MODIFY | EventMask::DELETE | EventMask::CLOSE);
        let root = h.watch_root();
        std::fs::write(h.root.join("a.txt"), b"content").unwrap();

        let t0 = Instant::now();
        h.source.push(&[
            rec(root, EventMask::CREATE, "a.txt"),
            rec(root, EventMask::MODIFY, "a.txt"),
            rec(root, EventMask::CLOSE_WRITE, "a.txt"),
        ]);
        assert!(incidents(h.engine.poll_at(t0).unwrap()).is_empty());

        let flushed = incidents(h.engine.poll_at(t0 + WINDOW * 3).unwrap());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].path, h.root.join("a.txt"));
        assert_eq!(
            flushed[0].kinds,
            vec![EventKind::Create, EventKind::Modify, EventKind::Closed]
        );
        assert_eq!(flushed[0].records, 3);
        assert_eq!(flushed[0].severity, Severity::Warning);
        assert_eq!(h.store.count().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribed_kinds_are_not_reported() {
        let mut h = Harness::new(EventMask::DELETE);
        let root = h.watch_root();
        let t0 = Instant::now();
        h.source.push(&[rec(root, EventMask::OPEN, "a.txt")]);
        h.engine.poll_at(t0).unwrap();
        assert!(incidents(h.engine.poll_at(t0 + WINDOW * 3).unwrap()).is_empty());
    }

    #[test]
    fn test_new_subdirectory_is_watched() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        std::fs::create_dir(h.root.join("sub")).unwrap();

        let t0 = Instant::now();
        h.source.push(&[rec(root, EventMask::CREATE | EventMask::ISDIR, "sub")]);
        h.engine.poll_at(t0).unwrap();

        let sub_path = h.root.join("sub");
        let sub = h.handle(&sub_path);
        let entry = h.engine.table().get(sub).unwrap();
        assert_eq!(entry.parent, Some(root));
        assert_eq!(entry.mask, EventMask::ALL_EVENTS);

        std::fs::write(sub_path.join("b.txt"), b"b").unwrap();
        h.source.push(&[rec(sub, EventMask::CREATE, "b.txt")]);
        let t1 = t0 + Duration::from_millis(1);
        h.engine.poll_at(t1).unwrap();

        let paths: Vec<_> = incidents(h.engine.poll_at(t1 + WINDOW * 3).unwrap())
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert!(paths.contains(&sub_path.join("b.txt")));
        assert!(paths.contains(&sub_path));
    }

    #[test]
    fn test_new_subdirectory_children_are_scanned() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        std::fs::create_dir_all(h.root.join("sub/inner")).unwrap();

        h.source.push(&[rec(root, EventMask::MOVED_TO | EventMask::ISDIR, "sub")]);
        h.engine.poll().unwrap();

        let table = h.engine.table();
        let sub = h.handle(&h.root.join("sub"));
        let inner = table.get(h.handle(&h.root.join("sub/inner"))).unwrap();
        assert_eq!(inner.parent, Some(sub));
    }

    #[test]
    fn test_created_directory_already_gone_is_ignored() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        let calls = h.registrar.watch_calls();
        h.source.push(&[rec(root, EventMask::CREATE | EventMask::ISDIR, "ghost")]);
        let events = h.engine.poll().unwrap();
        assert!(!events.iter().any(|e| matches!(e, MonitorEvent::Error(_))));
        assert_eq!(h.registrar.watch_calls(), calls);
    }

    #[test]
    fn test_subdirectory_registration_failure_is_reported() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        std::fs::create_dir(h.root.join("sub")).unwrap();
        h.registrar
            .fail_next(std::io::Error::from_raw_os_error(nix::libc::ENOSPC));

        h.source.push(&[rec(root, EventMask::CREATE | EventMask::ISDIR, "sub")]);
        let events = h.engine.poll().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::Error(WatchError::RegistrationFailed { .. })
        )));
        assert_eq!(h.engine.state(), EngineState::Running);
    }

    #[test]
    fn test_deleted_subdirectory_and_late_ignored() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        std::fs::create_dir(h.root.join("sub")).unwrap();
        let root = h.watch_root();
        let sub = h.handle(&h.root.join("sub"));

        std::fs::remove_dir(h.root.join("sub")).unwrap();
        h.source.push(&[rec(root, EventMask::DELETE | EventMask::ISDIR, "sub")]);
        h.engine.poll().unwrap();
        assert!(!h.engine.table().exists(&h.root.join("sub")));
        assert_eq!(h.registrar.unwatched(), vec![sub]);

        h.source.push(&[
            rec(sub, EventMask::DELETE_SELF, ""),
            rec(sub, EventMask::IGNORED, ""),
        ]);
        let events = h.engine.poll().unwrap();
        assert!(!events.iter().any(|e| matches!(e, MonitorEvent::Error(_))));
        assert_eq!(h.engine.table().len(), 1);
    }

    #[test]
    fn test_directory_moved_out_drops_subtree() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        std::fs::create_dir_all(h.root.join("sub/inner")).unwrap();
        let root = h.watch_root();
        assert_eq!(h.engine.table().len(), 3);

        h.source.push(&[rec(root, EventMask::MOVED_FROM | EventMask::ISDIR, "sub")]);
        h.engine.poll().unwrap();
        assert_eq!(h.engine.table().len(), 1);
        assert_eq!(h.registrar.unwatched().len(), 2);
    }

    #[test]
    fn test_ignored_for_live_watch_removes_it() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        h.source.push(&[rec(root, EventMask::IGNORED, "")]);
        h.engine.poll().unwrap();
        assert!(h.engine.table().is_empty());
    }

    #[test]
    fn test_mismatch_is_surfaced_immediately() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        let path = h.root.join("a.txt");
        std::fs::write(&path, b"one").unwrap();
        let h1 = hash_reader(&b"one"[..], 64).unwrap();
        h.store.put(&path, &h1, Utc::now()).unwrap();

        std::fs::write(&path, b"two").unwrap();
        let h2 = hash_reader(&b"two"[..], 64).unwrap();

        let t0 = Instant::now();
        h.source.push(&[rec(root, EventMask::MODIFY, "a.txt")]);
        let events = h.engine.poll_at(t0).unwrap();
        let alert = events
            .iter()
            .find_map(|e| match e {
                MonitorEvent::Mismatch(m) => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(alert.path, path);
        assert_eq!(alert.old_hash, h1);
        assert_eq!(alert.new_hash, h2);
        assert_eq!(h.store.get(&path).unwrap().unwrap().hash, h2);

        let flushed = incidents(h.engine.poll_at(t0 + WINDOW * 3).unwrap());
        assert_eq!(flushed[0].severity, Severity::Critical);
    }

    #[test]
    fn test_unchanged_file_stays_info() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        let path = h.root.join("a.txt");
        std::fs::write(&path, b"same").unwrap();
        h.store
            .put(&path, &hash_reader(&b"same"[..], 64).unwrap(), Utc::now())
            .unwrap();

        let t0 = Instant::now();
        h.source.push(&[rec(root, EventMask::MODIFY, "a.txt")]);
        let events = h.engine.poll_at(t0).unwrap();
        assert!(!events.iter().any(|e| matches!(e, MonitorEvent::Mismatch(_))));
        let flushed = incidents(h.engine.poll_at(t0 + WINDOW * 3).unwrap());
        assert_eq!(flushed[0].severity, Severity::Info);
    }

    #[test]
    fn test_unknown_handle_and_unsupported_markers_are_skipped() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        let t0 = Instant::now();
        h.source.push(&[
            rec(WatchHandle::from_raw(4242), EventMask::MODIFY, "x"),
            rec(root, EventMask::MODIFY | EventMask::EXCL_UNLINK, "y"),
            rec(root, EventMask::MODIFY | EventMask::DONT_FOLLOW, "z"),
        ]);
        assert!(h.engine.poll_at(t0).unwrap().is_empty());
        assert!(incidents(h.engine.poll_at(t0 + WINDOW * 3).unwrap()).is_empty());
    }

    #[test]
    fn test_queue_overflow_is_not_fatal() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        h.watch_root();
        h.source.push(&[rec(WatchHandle::from_raw(-1), EventMask::Q_OVERFLOW, "")]);
        let events = h.engine.poll().unwrap();
        assert!(matches!(
            events.as_slice(),
            [MonitorEvent::Error(WatchError::QueueOverflow)]
        ));
        assert_eq!(h.engine.state(), EngineState::Running);
    }

    #[test]
    fn test_read_failures() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        h.watch_root();

        h.source
            .fail_next(std::io::Error::from_raw_os_error(nix::libc::EIO));
        let events = h.engine.poll().unwrap();
        assert!(matches!(events.as_slice(), [MonitorEvent::Error(WatchError::Io(_))]));

        h.source
            .fail_next(std::io::Error::from_raw_os_error(nix::libc::EBADF));
        let err = h.engine.poll().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_single_slot_flushes_on_path_switch() {
        let mut h = Harness::with_mode(EventMask::ALL_EVENTS, AggregationMode::SingleSlot);
        let root = h.watch_root();
        h.source.push(&[
            rec(root, EventMask::ATTRIB, "a"),
            rec(root, EventMask::ATTRIB, "b"),
        ]);
        let flushed = incidents(h.engine.poll().unwrap());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].path, h.root.join("a"));
    }

    #[test]
    fn test_add_roots_walks_existing_tree() {
        let h = Harness::new(EventMask::MODIFY);
        std::fs::create_dir_all(h.root.join("a/b")).unwrap();
        std::fs::create_dir(h.root.join("c")).unwrap();
        std::fs::write(h.root.join("file"), b"").unwrap();

        let report = h.engine.add_roots(&[h.dir.path().to_path_buf()]).unwrap();
        assert_eq!(report.roots, vec![h.root.clone()]);
        assert_eq!(report.directories, 4);
        assert!(report.failures.is_empty());

        let table = h.engine.table();
        let a = h.handle(&h.root.join("a"));
        assert_eq!(table.get(h.handle(&h.root.join("a/b"))).unwrap().parent, Some(a));
        assert_eq!(table.get(a).unwrap().mask, EventMask::MODIFY);
    }

    #[test]
    fn test_add_roots_non_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
        let engine = WatchEngine::with_channel(
            FakeSource::new(),
            FakeRegistrar::new(),
            IntegrityGate::new(store, 0),
            EngineConfig {
                recursive: false,
                ..EngineConfig::default()
            },
        );
        let report = engine.add_roots(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(report.directories, 1);
    }

    #[test]
    fn test_add_roots_partial_and_total_failure() {
        let h = Harness::new(EventMask::ALL_EVENTS);
        let missing = h.root.join("missing");

        let report = h
            .engine
            .add_roots(&[missing.clone(), h.root.clone()])
            .unwrap();
        assert_eq!(report.roots.len(), 1);
        assert_eq!(report.failures.len(), 1);

        let err = h.engine.add_roots(&[missing]).unwrap_err();
        assert!(matches!(err, WatchError::NoUsableRoots(1)));
    }

    #[test]
    fn test_shutdown_flushes_and_tears_down() {
        let mut h = Harness::new(EventMask::ALL_EVENTS);
        std::fs::create_dir(h.root.join("sub")).unwrap();
        let root = h.watch_root();
        h.source.push(&[rec(root, EventMask::ATTRIB, "a")]);
        h.engine.poll().unwrap();

        let flushed = h.engine.shutdown();
        assert_eq!(flushed.len(), 1);
        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert!(h.engine.table().is_empty());
        assert_eq!(h.registrar.unwatched().len(), 2);
        assert!(h.source.is_closed());

        assert!(h.engine.shutdown().is_empty());
        assert!(matches!(h.engine.poll(), Err(WatchError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_spawned_engine_reports_and_stops_on_cancel() {
        let h = Harness::new(EventMask::ALL_EVENTS);
        let root = h.watch_root();
        let source = h.source.clone();
        let registrar = h.registrar.clone();
        let cancel = CancellationToken::new();
        let (handle, mut rx) = h.engine.spawn(cancel.clone());

        source.push(&[rec(root, EventMask::ATTRIB, "a")]);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            MonitorEvent::Incident(i) => assert_eq!(i.kinds, vec![EventKind::Attrib]),
            other => panic!("unexpected event: {other:?}"),
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(source.is_closed());
        assert_eq!(registrar.unwatched(), vec![root]);
        drop(h.dir);
    }

    #[tokio::test]
    async fn test_spawned_engine_returns_fatal_error() {
        let h = Harness::new(EventMask::ALL_EVENTS);
        h.watch_root();
        h.source
            .fail_next(std::io::Error::from_raw_os_error(nix::libc::EBADF));
        let (handle, mut rx) = h.engine.spawn(CancellationToken::new());
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(WatchError::ChannelReadFailed(_))));
        assert!(rx.recv().await.is_none());
        assert!(h.source.is_closed());
    }
}
