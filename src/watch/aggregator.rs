//! Coalescing of notification bursts into incidents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mask::EventKind;

/// Default inactivity window after which a pending incident is flushed.
pub const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(1);

/// Default cap on concurrently pending paths.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// How urgent an incident is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Ordinary activity on a watched path.
    #[default]
    Info,
    /// Activity on a file the baseline had never seen.
    Warning,
    /// Content diverged from the baseline.
    Critical,
}

impl Severity {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// How pending activity is keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// One pending incident per path, each with its own inactivity timer.
    #[default]
    PerPath,
    /// A single active path; activity elsewhere flushes it first.
    SingleSlot,
}

/// One aggregated report covering a burst of notifications on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Incident {
    /// Path the activity concerned.
    pub path: PathBuf,
    /// Distinct kinds observed, in order of first observation.
    pub kinds: Vec<EventKind>,
    /// Highest severity raised during the burst.
    pub severity: Severity,
    /// Number of raw notifications folded into this incident.
    pub records: usize,
    /// Wall-clock time of the first notification.
    pub first_seen: DateTime<Utc>,
    /// Wall-clock time of the last notification.
    pub last_seen: DateTime<Utc>,
}

impl Incident {
    /// Kind names joined with ", ".
    #[must_use]
    pub fn kind_names(&self) -> String {
        self.kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug)]
struct Pending {
    kinds: Vec<EventKind>,
    severity: Severity,
    records: usize,
    started: Instant,
    last_activity: Instant,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Pending {
    fn new(now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            kinds: Vec::new(),
            severity: Severity::Info,
            records: 0,
            started: now,
            last_activity: now,
            first_seen: wall,
            last_seen: wall,
        }
    }

    fn into_incident(self, path: PathBuf) -> Incident {
        Incident {
            path,
            kinds: self.kinds,
            severity: self.severity,
            records: self.records,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Collapses rapid notifications on the same path into one [`Incident`]
/// per quiet period.
#[derive(Debug)]
pub struct Aggregator {
    mode: AggregationMode,
    window: Duration,
    max_pending: usize,
    pending: HashMap<PathBuf, Pending>,
    active: Option<PathBuf>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(
            AggregationMode::default(),
            DEFAULT_INACTIVITY_WINDOW,
            DEFAULT_MAX_PENDING,
        )
    }
}

impl Aggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(mode: AggregationMode, window: Duration, max_pending: usize) -> Self {
        Self {
            mode,
            window,
            max_pending: max_pending.max(1),
            pending: HashMap::new(),
            active: None,
        }
    }

    /// The configured inactivity window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The path that most recently saw activity, while anything is pending.
    #[must_use]
    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_deref()
    }

    /// Kinds pending for `path`.
    #[must_use]
    pub fn pending_kinds(&self, path: &Path) -> Option<&[EventKind]> {
        self.pending.get(path).map(|p| p.kinds.as_slice())
    }

    /// Number of paths with pending activity.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fold reportable `kinds` observed on `path` into its pending incident.
    ///
    /// Returns incidents that had to be flushed first: the previously
    /// active path in single-slot mode, or the least recently active path
    /// when the pending cap is reached.
    pub fn record(&mut self, path: &Path, kinds: &[EventKind], now: Instant) -> Vec<Incident> {
        if kinds.is_empty() {
            return Vec::new();
        }

        let mut flushed = Vec::new();
        match self.mode {
            AggregationMode::SingleSlot => {
                if self.active.as_deref() != Some(path) {
                    flushed.extend(self.flush_all());
                }
            }
            AggregationMode::PerPath => {
                if !self.pending.contains_key(path) && self.pending.len() >= self.max_pending {
                    flushed.extend(self.flush_stalest());
                }
            }
        }

        let pending = self
            .pending
            .entry(path.to_path_buf())
            .or_insert_with(|| Pending::new(now));
        for kind in kinds {
            if !pending.kinds.contains(kind) {
                pending.kinds.push(*kind);
            }
        }
        pending.records += 1;
        pending.last_activity = now;
        pending.last_seen = Utc::now();
        self.active = Some(path.to_path_buf());

        flushed
    }

    /// Raise the severity of the incident pending for `path`.
    ///
    /// Returns `false` when nothing is pending for it.
    pub fn escalate(&mut self, path: &Path, severity: Severity) -> bool {
        match self.pending.get_mut(path) {
            Some(pending) => {
                pending.severity = pending.severity.max(severity);
                true
            }
            None => false,
        }
    }

    /// Flush the active path's incident.
    pub fn flush(&mut self) -> Option<Incident> {
        let path = self.active.clone()?;
        self.flush_path(&path)
    }

    /// Flush the incident pending for `path`.
    pub fn flush_path(&mut self, path: &Path) -> Option<Incident> {
        let (path, pending) = self.pending.remove_entry(path)?;
        if self.active.as_deref() == Some(path.as_path()) {
            self.active = None;
        }
        Some(pending.into_incident(path))
    }

    /// Flush every incident quiet for longer than the window, oldest first.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<Incident> {
        let window = self.window;
        let expired: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_activity) > window)
            .map(|(path, _)| path.clone())
            .collect();
        self.take_sorted(expired)
    }

    /// Flush everything, oldest first.
    pub fn flush_all(&mut self) -> Vec<Incident> {
        let paths: Vec<PathBuf> = self.pending.keys().cloned().collect();
        self.take_sorted(paths)
    }

    fn flush_stalest(&mut self) -> Option<Incident> {
        let path = self
            .pending
            .iter()
            .min_by_key(|(_, p)| p.last_activity)
            .map(|(path, _)| path.clone())?;
        tracing::debug!(path = %path.display(), "Pending limit reached, flushing early");
        self.flush_path(&path)
    }

    fn take_sorted(&mut self, paths: Vec<PathBuf>) -> Vec<Incident> {
        let mut taken: Vec<(PathBuf, Pending)> = paths
            .into_iter()
            .filter_map(|path| self.pending.remove_entry(&path))
            .collect();
        taken.sort_by_key(|(_, p)| p.started);
        if self
            .active
            .as_ref()
            .is_some_and(|active| !self.pending.contains_key(active))
        {
            self.active = None;
        }
        taken
            .into_iter()
            .map(|(path, pending)| pending.into_incident(path))
            .collect()
    }
}
