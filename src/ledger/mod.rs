//! In-memory reservation store backed by the WAL.
//!
//! State lives in per-(kind, date) [`DaySheet`]s behind their own `RwLock`, so
//! writers for different days never contend. Every mutation takes the sheet's
//! write lock, validates, appends the event to the WAL and only then applies it.

mod mutations;
mod queries;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::config::Catalog;
use crate::model::*;
use crate::store::{Store, StoreError};
use crate::wal::Wal;

pub type SheetKey = (ResourceKind, NaiveDate);
pub type SharedSheet = Arc<RwLock<DaySheet>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let results = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for ((_, tx), result) in batch.into_iter().zip(results) {
            let _ = tx.send(result);
        }
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Per-event outcome of one group commit. An event that fails to encode is
/// left out; a failed write rolls back the whole batch and fails every caller.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> Vec<io::Result<()>> {
    let appended: Vec<io::Result<()>> = batch
        .iter()
        .map(|(event, _)| wal.append_buffered(event))
        .collect();
    let flushed = wal.flush_sync();
    appended
        .into_iter()
        .map(|appended| {
            appended?;
            match &flushed {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        })
        .collect()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Ledger {
    pub(super) sheets: DashMap<SheetKey, SharedSheet>,
    pub(super) users: DashMap<OwnerId, User>,
    /// Reservation id → sheet holding it.
    pub(super) locator: DashMap<ReservationId, SheetKey>,
    pub(super) next_id: AtomicU64,
    pub(super) catalog: Catalog,
    /// Shared by every mutation, exclusive for compaction.
    pub(super) gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a reservation event to its sheet (caller holds the write lock).
fn apply_to_sheet(
    sheet: &mut DaySheet,
    event: &Event,
    locator: &DashMap<ReservationId, SheetKey>,
) {
    match event {
        Event::ReservationPlaced { id, owner, kind, date, span } => {
            sheet.insert(Reservation {
                id: *id,
                owner: *owner,
                kind: *kind,
                date: *date,
                span: *span,
                status: Status::Active,
            });
            locator.insert(*id, (*kind, *date));
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = sheet.get_mut(*id) {
                r.status = Status::Cancelled;
            }
        }
        Event::ReservationsExpired { ids, .. } => {
            for id in ids {
                if let Some(r) = sheet.get_mut(*id)
                    && r.is_active()
                {
                    r.status = Status::Expired;
                }
            }
        }
        // Users live outside the sheets
        Event::UserRegistered { .. } => {}
    }
}

/// Sheet an event belongs to, if any.
fn event_sheet(event: &Event) -> Option<SheetKey> {
    match event {
        Event::ReservationPlaced { kind, date, .. }
        | Event::ReservationCancelled { kind, date, .. }
        | Event::ReservationsExpired { kind, date, .. } => Some((*kind, *date)),
        Event::UserRegistered { .. } => None,
    }
}

impl Ledger {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf, catalog: Catalog) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let users = DashMap::new();
        let locator = DashMap::new();
        let mut sheets: HashMap<SheetKey, DaySheet> = HashMap::new();
        let mut max_id = 0;

        for event in &events {
            match event {
                Event::UserRegistered { id, full_name, phone, is_student } => {
                    users.insert(
                        *id,
                        User {
                            id: *id,
                            full_name: full_name.clone(),
                            phone: phone.clone(),
                            is_student: *is_student,
                        },
                    );
                }
                other => {
                    if let Event::ReservationPlaced { id, .. } = other {
                        max_id = max_id.max(*id);
                    }
                    if let Some(key) = event_sheet(other) {
                        let sheet = sheets
                            .entry(key)
                            .or_insert_with(|| DaySheet::new(key.0, key.1));
                        apply_to_sheet(sheet, other, &locator);
                    }
                }
            }
        }

        tracing::info!(
            "ledger replayed {} events: {} users, {} reservations",
            events.len(),
            users.len(),
            locator.len()
        );

        Ok(Self {
            sheets: sheets
                .into_iter()
                .map(|(key, sheet)| (key, Arc::new(RwLock::new(sheet))))
                .collect(),
            users,
            locator,
            next_id: AtomicU64::new(max_id + 1),
            catalog,
            gate: RwLock::new(()),
            wal_tx,
        })
    }

    /// Send an event to the background writer and wait for its fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Durably log `event`, then apply it to `sheet`.
    pub(super) async fn persist_and_apply(
        &self,
        sheet: &mut DaySheet,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_sheet(sheet, event, &self.locator);
        Ok(())
    }

    pub(super) fn sheet(&self, key: &SheetKey) -> Option<SharedSheet> {
        self.sheets.get(key).map(|e| e.value().clone())
    }

    pub(super) fn sheet_or_create(&self, key: SheetKey) -> SharedSheet {
        self.sheets
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySheet::new(key.0, key.1))))
            .value()
            .clone()
    }

    /// Snapshot of sheet handles matching `pred`, sorted by key.
    /// Collected up front so no map shard stays locked across an await.
    pub(super) fn sheets_where(&self, pred: impl Fn(&SheetKey) -> bool) -> Vec<SharedSheet> {
        let mut found: Vec<(SheetKey, SharedSheet)> = self
            .sheets
            .iter()
            .filter(|e| pred(e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        found.sort_by_key(|(key, _)| *key);
        found.into_iter().map(|(_, sheet)| sheet).collect()
    }
}

#[async_trait]
impl Store for Ledger {
    async fn find_user(&self, id: OwnerId) -> Result<Option<User>, StoreError> {
        Ok(self.user(id))
    }

    async fn register_user(&self, user: User) -> Result<(), StoreError> {
        self.upsert_user(user).await
    }

    async fn reservations_overlapping(
        &self,
        kind: ResourceKind,
        date: NaiveDate,
        span: HourSpan,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.overlapping(kind, date, span).await)
    }

    async fn has_kind_on_date(
        &self,
        owner: OwnerId,
        kind: ResourceKind,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self.holds_kind_on(owner, kind, date).await)
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId, StoreError> {
        self.place(new).await
    }

    async fn mark_cancelled(&self, id: ReservationId, owner: OwnerId) -> Result<bool, StoreError> {
        self.cancel(id, owner).await
    }

    async fn mark_expired(&self, as_of: NaiveDateTime) -> Result<usize, StoreError> {
        self.expire_due(as_of).await
    }

    async fn active_reservations(
        &self,
        owner: OwnerId,
        from: NaiveDate,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut found = self
            .owned_by(owner, |r| r.is_active() && r.date >= from)
            .await;
        found.sort_by_key(|r| (r.date, r.span.start));
        Ok(found)
    }

    async fn all_reservations(&self, owner: OwnerId) -> Result<Vec<Reservation>, StoreError> {
        let mut found = self.owned_by(owner, |_| true).await;
        found.sort_by_key(|r| std::cmp::Reverse((r.date, r.span.start)));
        Ok(found)
    }

    async fn reservations_on(
        &self,
        date: NaiveDate,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self
            .active_where(|(k, d)| *d == date && kind.is_none_or(|want| want == *k))
            .await)
    }

    async fn upcoming_reservations(&self, from: NaiveDate) -> Result<Vec<Reservation>, StoreError> {
        let mut found = self.active_where(|(_, d)| *d >= from).await;
        found.sort_by_key(|r| (r.date, r.span.start, r.kind));
        Ok(found)
    }
}
