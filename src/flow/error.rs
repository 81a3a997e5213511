use chrono::NaiveDate;

use crate::model::ResourceKind;

/// Why a choice failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalid {
    NoOpenWeeks,
    UnknownWeek(u32),
    ClosedDay(NaiveDate),
    DateOutsideWeek(NaiveDate),
    PastDate(NaiveDate),
    NoStartTimesLeft(NaiveDate),
    StartHour(u32),
    Duration(u32),
}

impl std::fmt::Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invalid::NoOpenWeeks => write!(f, "no bookable weeks right now"),
            Invalid::UnknownWeek(offset) => write!(f, "week {offset} is not bookable"),
            Invalid::ClosedDay(date) => write!(f, "closed on {date}"),
            Invalid::DateOutsideWeek(date) => write!(f, "{date} is not in the chosen week"),
            Invalid::PastDate(date) => write!(f, "{date} is in the past"),
            Invalid::NoStartTimesLeft(date) => write!(f, "no start times left on {date}"),
            Invalid::StartHour(hour) => write!(f, "{hour}:00 is not an available start time"),
            Invalid::Duration(hours) => write!(f, "{hours}h does not fit before closing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    NotRegistered,
    InvalidTransition(&'static str),
    Validation(Invalid),
    DuplicateTypeForDay(ResourceKind),
    CapacityExceeded { count: usize, limit: u32 },
    AllKindsBooked(NaiveDate),
    /// Session table is full.
    Busy,
    Storage(String),
}

impl FlowError {
    /// Stable identifier for clients.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::NotRegistered => "not_registered",
            FlowError::InvalidTransition(_) => "invalid_transition",
            FlowError::Validation(_) => "validation",
            FlowError::DuplicateTypeForDay(_) => "duplicate_type_for_day",
            FlowError::CapacityExceeded { .. } => "capacity_exceeded",
            FlowError::AllKindsBooked(_) => "all_kinds_booked",
            FlowError::Busy => "busy",
            FlowError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::NotRegistered => write!(f, "register before booking"),
            FlowError::InvalidTransition(why) => write!(f, "invalid step: {why}"),
            FlowError::Validation(invalid) => write!(f, "{invalid}"),
            FlowError::DuplicateTypeForDay(kind) => {
                write!(f, "you already have a {kind} reservation that day")
            }
            FlowError::CapacityExceeded { count, limit } => {
                write!(f, "fully booked: {count} of {limit} places taken")
            }
            FlowError::AllKindsBooked(date) => {
                write!(f, "you already hold every resource on {date}")
            }
            FlowError::Busy => write!(f, "too many open sessions, try again later"),
            FlowError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for FlowError {}
