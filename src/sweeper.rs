use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::info;

use crate::flow::SessionManager;
use crate::ledger::Ledger;
use crate::store::{Store, StoreError};

/// Wall-clock time in the process's local zone.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Expire every active reservation whose end is before `now`. Safe to repeat.
pub async fn sweep_once(store: &dyn Store, now: NaiveDateTime) -> Result<usize, StoreError> {
    let expired = store.mark_expired(now).await?;
    if expired > 0 {
        metrics::counter!(crate::observability::RESERVATIONS_EXPIRED_TOTAL).increment(expired as u64);
        info!("expired {expired} reservations as of {now}");
    }
    Ok(expired)
}

/// Background task: sweep on start, then every `period`.
pub async fn run_sweeper(store: Arc<dyn Store>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = sweep_once(store.as_ref(), local_now()).await {
            // Partially applied sweeps finish on the next tick
            tracing::error!("expiry sweep failed: {e}");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = ledger.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match ledger.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

/// Background task dropping booking sessions idle for longer than `idle`.
pub async fn run_session_janitor(sessions: Arc<SessionManager>, idle: Duration) {
    let mut interval = tokio::time::interval(idle.min(Duration::from_secs(60)));
    loop {
        interval.tick().await;
        let evicted = sessions.evict_idle(idle);
        if evicted > 0 {
            tracing::debug!("evicted {evicted} idle sessions");
        }
    }
}
