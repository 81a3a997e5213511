use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Duplicate {
        owner: OwnerId,
        kind: ResourceKind,
        date: NaiveDate,
    },
    CapacityExceeded {
        count: usize,
        limit: u32,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Duplicate { owner, kind, date } => {
                write!(f, "owner {owner} already holds {} on {date}", kind.slug())
            }
            StoreError::CapacityExceeded { count, limit } => {
                write!(f, "capacity {limit} exceeded: {count} active reservations overlap")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Storage collaborator of the admission core.
///
/// Reads only ever return *active* reservations unless the method says
/// otherwise. `insert_reservation` is a conditional insert: implementations
/// must re-check owner uniqueness and capacity atomically with the write.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, id: OwnerId) -> Result<Option<User>, StoreError>;

    /// Insert or replace the user record.
    async fn register_user(&self, user: User) -> Result<(), StoreError>;

    async fn reservations_overlapping(
        &self,
        kind: ResourceKind,
        date: NaiveDate,
        span: HourSpan,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn has_kind_on_date(
        &self,
        owner: OwnerId,
        kind: ResourceKind,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId, StoreError>;

    /// `false` if the reservation is missing, owned by someone else, or not active.
    async fn mark_cancelled(&self, id: ReservationId, owner: OwnerId) -> Result<bool, StoreError>;

    /// Expire every active reservation that ended before `as_of`. Returns how many changed.
    async fn mark_expired(&self, as_of: NaiveDateTime) -> Result<usize, StoreError>;

    /// Active reservations of `owner` dated `from` or later, soonest first.
    async fn active_reservations(
        &self,
        owner: OwnerId,
        from: NaiveDate,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Every reservation of `owner` in any status, newest first.
    async fn all_reservations(&self, owner: OwnerId) -> Result<Vec<Reservation>, StoreError>;

    /// Active reservations on `date`, optionally of one kind, by kind then start.
    async fn reservations_on(
        &self,
        date: NaiveDate,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Active reservations dated `from` or later, by date then start.
    async fn upcoming_reservations(&self, from: NaiveDate) -> Result<Vec<Reservation>, StoreError>;
}
