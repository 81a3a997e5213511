use std::sync::atomic::Ordering;

use chrono::NaiveDateTime;

use crate::limits::*;
use crate::model::*;
use crate::store::StoreError;

use super::{Ledger, SharedSheet};

impl Ledger {
    pub async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        if user.full_name.trim().is_empty() || user.full_name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("full name must be 1..=128 bytes"));
        }
        if user.phone.len() > MAX_PHONE_LEN {
            return Err(StoreError::LimitExceeded("phone too long"));
        }
        if !self.users.contains_key(&user.id) && self.users.len() >= MAX_USERS {
            return Err(StoreError::LimitExceeded("too many users"));
        }
        let _gate = self.gate.read().await;

        let event = Event::UserRegistered {
            id: user.id,
            full_name: user.full_name.clone(),
            phone: user.phone.clone(),
            is_student: user.is_student,
        };
        self.wal_append(&event).await?;
        self.users.insert(user.id, user);
        Ok(())
    }

    /// Conditional insert: owner uniqueness and capacity are checked under the
    /// sheet's write lock, so concurrent callers cannot both pass the check.
    pub async fn place(&self, new: NewReservation) -> Result<ReservationId, StoreError> {
        if HourSpan::checked(new.span.start, new.span.end).is_none() {
            return Err(StoreError::LimitExceeded("span must satisfy start < end <= 24"));
        }
        let _gate = self.gate.read().await;
        let sheet = self.sheet_or_create((new.kind, new.date));
        let mut guard = sheet.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SHEET {
            return Err(StoreError::LimitExceeded("too many reservations on this day"));
        }

        if guard.active_for_owner(new.owner).is_some() {
            return Err(StoreError::Duplicate {
                owner: new.owner,
                kind: new.kind,
                date: new.date,
            });
        }
        if let Some(limit) = self.catalog.limit(new.kind) {
            let count = guard.overlapping(&new.span).count();
            if count >= limit as usize {
                return Err(StoreError::CapacityExceeded { count, limit });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = Event::ReservationPlaced {
            id,
            owner: new.owner,
            kind: new.kind,
            date: new.date,
            span: new.span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(
            "placed reservation {id}: owner {} {} {} {}",
            new.owner,
            new.kind.slug(),
            new.date,
            new.span
        );
        Ok(id)
    }

    pub async fn cancel(&self, id: ReservationId, owner: OwnerId) -> Result<bool, StoreError> {
        let Some(key) = self.locator.get(&id).map(|e| *e.value()) else {
            return Ok(false);
        };
        let Some(sheet) = self.sheet(&key) else {
            return Ok(false);
        };
        let _gate = self.gate.read().await;
        let mut guard = sheet.write().await;
        let cancellable = guard
            .reservations
            .iter()
            .any(|r| r.id == id && r.owner == owner && r.is_active());
        if !cancellable {
            return Ok(false);
        }

        let event = Event::ReservationCancelled {
            id,
            kind: key.0,
            date: key.1,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Expire active reservations whose end has passed at `now`.
    /// Each sheet is updated on its own, so an interrupted pass is safe to repeat.
    pub async fn expire_due(&self, now: NaiveDateTime) -> Result<usize, StoreError> {
        let today = now.date();
        let _gate = self.gate.read().await;
        let candidates: Vec<SharedSheet> = self.sheets_where(|(_, date)| *date <= today);

        let mut expired = 0;
        for sheet in candidates {
            let mut guard = sheet.write().await;
            let ids: Vec<ReservationId> = guard
                .active()
                .filter(|r| r.is_due(now))
                .map(|r| r.id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            let count = ids.len();
            let event = Event::ReservationsExpired {
                kind: guard.kind,
                date: guard.date,
                ids,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            expired += count;
        }
        Ok(expired)
    }

    /// Rewrite the WAL with the minimal event set that recreates current state.
    /// Writers are held off until the swap completes so nothing lands in the old file.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        let mut events: Vec<Event> = users
            .into_iter()
            .map(|u| Event::UserRegistered {
                id: u.id,
                full_name: u.full_name,
                phone: u.phone,
                is_student: u.is_student,
            })
            .collect();

        for sheet in self.sheets_where(|_| true) {
            let guard = sheet.read().await;
            let mut expired = Vec::new();
            for r in &guard.reservations {
                events.push(Event::ReservationPlaced {
                    id: r.id,
                    owner: r.owner,
                    kind: r.kind,
                    date: r.date,
                    span: r.span,
                });
                match r.status {
                    Status::Active => {}
                    Status::Cancelled => events.push(Event::ReservationCancelled {
                        id: r.id,
                        kind: r.kind,
                        date: r.date,
                    }),
                    Status::Expired => expired.push(r.id),
                }
            }
            if !expired.is_empty() {
                events.push(Event::ReservationsExpired {
                    kind: guard.kind,
                    date: guard.date,
                    ids: expired,
                });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
