use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Chat user id. Stable per user, opaque to the core.
pub type OwnerId = i64;

/// Storage-assigned, strictly increasing.
pub type ReservationId = u64;

/// Half-open interval `[start, end)` in whole hours of one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourSpan {
    pub start: u32,
    pub end: u32,
}

impl HourSpan {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start < end, "HourSpan start must be before end");
        Self { start, end }
    }

    /// `None` unless `0 <= start < end <= 24`.
    pub fn checked(start: u32, end: u32) -> Option<Self> {
        (start < end && end <= 24).then_some(Self { start, end })
    }

    pub fn hours(&self) -> u32 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &HourSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.end
    }

    /// Midnight for a span that runs to the end of the day.
    pub fn end_time(&self) -> NaiveTime {
        hour_to_time(self.end)
    }
}

impl fmt::Display for HourSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start, self.end)
    }
}

fn hour_to_time(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour % 24, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// The closed set of bookable resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    LectureRoom,
    Console,
    Workstations,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::LectureRoom,
        ResourceKind::Console,
        ResourceKind::Workstations,
    ];

    /// Display name shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::LectureRoom => "Лекторий",
            ResourceKind::Console => "Плейстейшн",
            ResourceKind::Workstations => "Компьютеры",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            ResourceKind::LectureRoom => "lecture_room",
            ResourceKind::Console => "console",
            ResourceKind::Workstations => "workstations",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub owner: OwnerId,
    pub kind: ResourceKind,
    pub date: NaiveDate,
    pub span: HourSpan,
    pub status: Status,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    /// True once the reservation's end has passed at `now`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        let today = now.date();
        self.date < today || (self.date == today && self.span.end < 24 && self.span.end_time() < now.time())
    }
}

/// A candidate reservation before the store assigns an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub owner: OwnerId,
    pub kind: ResourceKind,
    pub date: NaiveDate,
    pub span: HourSpan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: OwnerId,
    pub full_name: String,
    pub phone: String,
    pub is_student: bool,
}

/// All reservations of one kind on one date, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DaySheet {
    pub kind: ResourceKind,
    pub date: NaiveDate,
    pub reservations: Vec<Reservation>,
}

impl DaySheet {
    pub fn new(kind: ResourceKind, date: NaiveDate) -> Self {
        Self {
            kind,
            date,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get_mut(&mut self, id: ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Active reservations whose span overlaps `query`.
    /// Everything starting at or after `query.end` is skipped by binary search.
    pub fn overlapping(&self, query: &HourSpan) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.span.end > query.start)
    }

    pub fn active_for_owner(&self, owner: OwnerId) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.owner == owner && r.is_active())
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: OwnerId,
        full_name: String,
        phone: String,
        is_student: bool,
    },
    ReservationPlaced {
        id: ReservationId,
        owner: OwnerId,
        kind: ResourceKind,
        date: NaiveDate,
        span: HourSpan,
    },
    ReservationCancelled {
        id: ReservationId,
        kind: ResourceKind,
        date: NaiveDate,
    },
    ReservationsExpired {
        kind: ResourceKind,
        date: NaiveDate,
        ids: Vec<ReservationId>,
    },
}
