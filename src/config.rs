use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::limits::MAX_HORIZON_WEEKS;
use crate::model::{OwnerId, ResourceKind};
use crate::resolver::ReadFailure;

/// Admission policy of one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Max simultaneous active reservations, if bounded.
    pub capacity: Option<u32>,
    /// Overlapping requests may join an existing group.
    pub joinable: bool,
}

impl Policy {
    /// Effective limit: an unbounded kind that can't be joined is exclusive.
    pub fn limit(&self) -> Option<u32> {
        match (self.capacity, self.joinable) {
            (Some(c), _) => Some(c),
            (None, true) => None,
            (None, false) => Some(1),
        }
    }
}

/// Per-kind policies. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    lecture_room: Policy,
    console: Policy,
    workstations: Policy,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            lecture_room: Policy { capacity: None, joinable: true },
            console: Policy { capacity: None, joinable: true },
            workstations: Policy { capacity: Some(16), joinable: false },
        }
    }
}

impl Catalog {
    pub fn with_policy(mut self, kind: ResourceKind, policy: Policy) -> Self {
        match kind {
            ResourceKind::LectureRoom => self.lecture_room = policy,
            ResourceKind::Console => self.console = policy,
            ResourceKind::Workstations => self.workstations = policy,
        }
        self
    }

    pub fn policy(&self, kind: ResourceKind) -> Policy {
        match kind {
            ResourceKind::LectureRoom => self.lecture_room,
            ResourceKind::Console => self.console,
            ResourceKind::Workstations => self.workstations,
        }
    }

    pub fn limit(&self, kind: ResourceKind) -> Option<u32> {
        self.policy(kind).limit()
    }

    pub fn is_joinable(&self, kind: ResourceKind) -> bool {
        self.policy(kind).joinable
    }
}

/// Process configuration, read from `SLOTDESK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub session_idle: Duration,
    pub horizon_weeks: u32,
    pub admins: HashSet<OwnerId>,
    pub catalog: Catalog,
    pub read_failure: ReadFailure,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            metrics_port: None,
            sweep_interval: Duration::from_secs(3600),
            compact_threshold: 1000,
            session_idle: Duration::from_secs(1800),
            horizon_weeks: 4,
            admins: HashSet::new(),
            catalog: Catalog::default(),
            read_failure: ReadFailure::Open,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).map(|s| s.trim().to_string());
        let mut cfg = Config::default();

        if let Some(bind) = parse("SLOTDESK_BIND") {
            cfg.bind = bind;
        }
        if let Some(port) = parse("SLOTDESK_PORT").and_then(|s| s.parse().ok()) {
            cfg.port = port;
        }
        if let Some(dir) = parse("SLOTDESK_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(n) = parse("SLOTDESK_MAX_CONNECTIONS").and_then(|s| s.parse().ok()) {
            cfg.max_connections = n;
        }
        cfg.metrics_port = parse("SLOTDESK_METRICS_PORT").and_then(|s| s.parse().ok());
        if let Some(secs) = parse("SLOTDESK_SWEEP_INTERVAL_SECS").and_then(|s| s.parse::<u64>().ok())
            && secs > 0
        {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse("SLOTDESK_COMPACT_THRESHOLD").and_then(|s| s.parse().ok()) {
            cfg.compact_threshold = n;
        }
        if let Some(secs) = parse("SLOTDESK_SESSION_IDLE_SECS").and_then(|s| s.parse::<u64>().ok())
            && secs > 0
        {
            cfg.session_idle = Duration::from_secs(secs);
        }
        if let Some(weeks) = parse("SLOTDESK_HORIZON_WEEKS").and_then(|s| s.parse::<u32>().ok()) {
            cfg.horizon_weeks = weeks.clamp(1, MAX_HORIZON_WEEKS);
        }
        if let Some(list) = parse("SLOTDESK_ADMINS") {
            cfg.admins = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Some(cap) = parse("SLOTDESK_WORKSTATION_CAPACITY").and_then(|s| s.parse::<u32>().ok())
            && cap > 0
        {
            let policy = Policy { capacity: Some(cap), joinable: false };
            cfg.catalog = cfg.catalog.with_policy(ResourceKind::Workstations, policy);
        }
        if let Some(mode) = parse("SLOTDESK_READ_FAILURE") {
            match mode.as_str() {
                "closed" => cfg.read_failure = ReadFailure::Closed,
                "open" => cfg.read_failure = ReadFailure::Open,
                other => tracing::warn!("ignoring SLOTDESK_READ_FAILURE={other}, expected open|closed"),
            }
        }
        cfg
    }

    /// Path of the reservation WAL inside the data directory.
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotdesk.wal")
    }
}
