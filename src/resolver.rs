//! Availability Resolver: the read side of admission.
//!
//! Reads go through the [`Store`]; what happens when a read fails is decided
//! by [`ReadFailure`].

use std::sync::Arc;

use chrono::NaiveDate;

use crate::flow::FlowError;
use crate::model::*;
use crate::store::{Store, StoreError};

/// Behavior of conflict detection when the store cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// Treat the failed read as "no conflicts". The conditional insert in the
    /// store still re-checks uniqueness and capacity on commit.
    Open,
    /// Surface the failure as [`FlowError::Storage`].
    Closed,
}

#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn Store>,
    on_read_failure: ReadFailure,
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>, on_read_failure: ReadFailure) -> Self {
        Self {
            store,
            on_read_failure,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Active reservations of `kind` on `date` whose span overlaps `span`.
    pub async fn find_overlapping(
        &self,
        kind: ResourceKind,
        date: NaiveDate,
        span: HourSpan,
    ) -> Result<Vec<Reservation>, FlowError> {
        match self.store.reservations_overlapping(kind, date, span).await {
            // Filtered again so a loose store can't leak adjacent or inactive rows.
            Ok(found) => Ok(found
                .into_iter()
                .filter(|r| r.is_active() && r.kind == kind && r.date == date && r.span.overlaps(&span))
                .collect()),
            Err(e) => self.degrade("reservations_overlapping", e, Vec::new()),
        }
    }

    pub async fn has_kind_on_date(
        &self,
        owner: OwnerId,
        kind: ResourceKind,
        date: NaiveDate,
    ) -> Result<bool, FlowError> {
        match self.store.has_kind_on_date(owner, kind, date).await {
            Ok(held) => Ok(held),
            Err(e) => self.degrade("has_kind_on_date", e, false),
        }
    }

    /// Kinds `owner` may still reserve on `date`.
    pub async fn available_kinds(
        &self,
        owner: OwnerId,
        date: NaiveDate,
    ) -> Result<Vec<ResourceKind>, FlowError> {
        let mut kinds = Vec::with_capacity(ResourceKind::ALL.len());
        for kind in ResourceKind::ALL {
            if !self.has_kind_on_date(owner, kind, date).await? {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    fn degrade<T>(&self, op: &'static str, err: StoreError, fallback: T) -> Result<T, FlowError> {
        tracing::warn!("store read {op} failed: {err}");
        metrics::counter!(crate::observability::STORE_READ_FAILURES_TOTAL, "op" => op).increment(1);
        match self.on_read_failure {
            ReadFailure::Open => Ok(fallback),
            ReadFailure::Closed => Err(FlowError::Storage(err.to_string())),
        }
    }
}

/// Largest number of spans active at the same instant.
///
/// Sweep over start/end boundaries; an end and a start at the same hour
/// don't overlap, so ends sort first.
pub fn peak_concurrency(spans: &[HourSpan]) -> usize {
    let mut edges: Vec<(u32, i32)> = Vec::with_capacity(spans.len() * 2);
    for s in spans {
        edges.push((s.start, 1));
        edges.push((s.end, -1));
    }
    edges.sort_unstable();

    let mut current: i32 = 0;
    let mut peak: i32 = 0;
    for (_, delta) in edges {
        current += delta;
        peak = peak.max(current);
    }
    peak as usize
}
