use chrono::NaiveDate;

use crate::model::*;

use super::{Ledger, SheetKey};

impl Ledger {
    pub fn user(&self, id: OwnerId) -> Option<User> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    /// Active reservations of `kind` on `date` overlapping `span`, by start hour.
    pub async fn overlapping(
        &self,
        kind: ResourceKind,
        date: NaiveDate,
        span: HourSpan,
    ) -> Vec<Reservation> {
        let Some(sheet) = self.sheet(&(kind, date)) else {
            return Vec::new();
        };
        let guard = sheet.read().await;
        guard.overlapping(&span).cloned().collect()
    }

    pub async fn holds_kind_on(&self, owner: OwnerId, kind: ResourceKind, date: NaiveDate) -> bool {
        let Some(sheet) = self.sheet(&(kind, date)) else {
            return false;
        };
        let guard = sheet.read().await;
        guard.active_for_owner(owner).is_some()
    }

    /// Reservations of `owner` in any sheet that pass `filter`. Unordered.
    pub async fn owned_by(
        &self,
        owner: OwnerId,
        filter: impl Fn(&Reservation) -> bool,
    ) -> Vec<Reservation> {
        let mut found = Vec::new();
        for sheet in self.sheets_where(|_| true) {
            let guard = sheet.read().await;
            found.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.owner == owner && filter(r))
                    .cloned(),
            );
        }
        found
    }

    /// Active reservations of every sheet whose key passes `pred`,
    /// ordered by sheet key then start hour.
    pub async fn active_where(&self, pred: impl Fn(&SheetKey) -> bool) -> Vec<Reservation> {
        let mut found = Vec::new();
        for sheet in self.sheets_where(pred) {
            let guard = sheet.read().await;
            found.extend(guard.active().cloned());
        }
        found
    }
}
