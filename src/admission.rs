//! Admission Decision: classify a candidate against the reservations it overlaps.
//!
//! Pure; the caller supplies the overlap set and the same-day check.

use serde::{Deserialize, Serialize};

use crate::config::Catalog;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    DuplicateTypeForDay,
    CapacityExceeded { count: usize, limit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// Joinable kind with overlapping holders; the owner must confirm.
    Join { participants: Vec<OwnerId> },
    Reject(Rejection),
}

/// Rules apply in order: same-day duplicate, capacity, join, accept.
///
/// `overlapping` must hold only active reservations of the candidate's kind
/// and date that overlap its span.
pub fn decide(
    candidate: &NewReservation,
    overlapping: &[Reservation],
    already_has_kind: bool,
    catalog: &Catalog,
) -> Decision {
    if already_has_kind {
        return Decision::Reject(Rejection::DuplicateTypeForDay);
    }

    let count = overlapping.len();
    if let Some(limit) = catalog.limit(candidate.kind)
        && count >= limit as usize
    {
        return Decision::Reject(Rejection::CapacityExceeded { count, limit });
    }

    if catalog.is_joinable(candidate.kind) && count > 0 {
        return Decision::Join {
            participants: participants(overlapping, candidate.owner),
        };
    }

    Decision::Accept
}

/// Distinct owners other than `owner`, by start hour of their reservation.
pub fn participants(overlapping: &[Reservation], owner: OwnerId) -> Vec<OwnerId> {
    let mut sorted: Vec<&Reservation> = overlapping.iter().collect();
    sorted.sort_by_key(|r| (r.span.start, r.id));
    let mut owners: Vec<OwnerId> = Vec::with_capacity(sorted.len());
    for r in sorted {
        if r.owner != owner && !owners.contains(&r.owner) {
            owners.push(r.owner);
        }
    }
    owners
}
