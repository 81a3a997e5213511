//! Reservation flow: week → date → kind → start → duration → [join] → commit.
//!
//! A [`Session`] carries the choices made so far inside its [`Stage`]; going
//! back drops the later choices with the variant. Only [`Flow::advance`]
//! touches the store's write side, and only on commit.

mod error;
mod sessions;

pub use error::{FlowError, Invalid};
pub use sessions::SessionManager;

use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::admission::{self, Decision, Rejection};
use crate::calendar::{self, HoursTable, Week};
use crate::config::Catalog;
use crate::model::*;
use crate::resolver::Resolver;
use crate::store::StoreError;

/// Where a session is, with everything chosen to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Week,
    Date {
        week: Week,
    },
    Kind {
        week: Week,
        date: NaiveDate,
    },
    Start {
        week: Week,
        date: NaiveDate,
        kind: ResourceKind,
    },
    Duration {
        week: Week,
        date: NaiveDate,
        kind: ResourceKind,
        start: u32,
    },
    Join {
        week: Week,
        date: NaiveDate,
        kind: ResourceKind,
        span: HourSpan,
        participants: Vec<OwnerId>,
    },
}

/// One discrete user choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    Week(u32),
    Date(NaiveDate),
    Kind(ResourceKind),
    Start(u32),
    Duration(u32),
    Join(bool),
    Back,
}

/// Options offered at a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Prompt {
    Weeks {
        weeks: Vec<Week>,
    },
    Dates {
        week: Week,
        dates: Vec<NaiveDate>,
    },
    Kinds {
        date: NaiveDate,
        kinds: Vec<ResourceKind>,
    },
    Starts {
        date: NaiveDate,
        kind: ResourceKind,
        hours: Vec<u32>,
    },
    Durations {
        date: NaiveDate,
        kind: ResourceKind,
        start: u32,
        durations: Vec<u32>,
    },
    Join {
        date: NaiveDate,
        kind: ResourceKind,
        span: HourSpan,
        participants: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub reservation: Reservation,
    /// Display names of the other holders of the same window.
    pub companions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Prompt(Prompt),
    /// Recoverable outcome; the session now waits at `prompt`'s stage.
    Retry { error: FlowError, prompt: Prompt },
    Committed(Confirmation),
    Ended(FlowError),
}

impl Reply {
    /// The session is over after this reply.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Reply::Committed(_) | Reply::Ended(_))
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: Ulid,
    pub owner: OwnerId,
    pub stage: Stage,
    pub(crate) touched: Instant,
}

impl Session {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            id: Ulid::new(),
            owner,
            stage: Stage::Week,
            touched: Instant::now(),
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.touched.elapsed()
    }
}

pub struct Flow {
    resolver: Resolver,
    catalog: Catalog,
    hours: HoursTable,
    horizon_weeks: u32,
}

impl Flow {
    pub fn new(resolver: Resolver, catalog: Catalog, horizon_weeks: u32) -> Self {
        Self {
            resolver,
            catalog,
            hours: HoursTable::default(),
            horizon_weeks,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Start a booking: registration guard, then the week prompt.
    pub async fn begin(&self, owner: OwnerId, now: NaiveDateTime) -> Reply {
        if let Err(e) = self.ensure_registered(owner).await {
            return Reply::Ended(e);
        }
        let weeks = calendar::available_weeks(self.horizon_weeks, now.date());
        if weeks.is_empty() {
            return Reply::Ended(FlowError::Validation(Invalid::NoOpenWeeks));
        }
        Reply::Prompt(Prompt::Weeks { weeks })
    }

    /// Apply one choice to `session`.
    pub async fn advance(&self, session: &mut Session, choice: Choice, now: NaiveDateTime) -> Reply {
        session.touched = Instant::now();
        if let Err(e) = self.ensure_registered(session.owner).await {
            return Reply::Ended(e);
        }
        let today = now.date();

        match (session.stage.clone(), choice) {
            (stage, Choice::Back) => self.back(session, stage, now).await,

            (Stage::Week, Choice::Week(offset)) => {
                let Some(week) = calendar::available_weeks(self.horizon_weeks, today)
                    .into_iter()
                    .find(|w| w.offset == offset)
                else {
                    return self
                        .retry(session, FlowError::Validation(Invalid::UnknownWeek(offset)), now)
                        .await;
                };
                session.stage = Stage::Date { week };
                self.reprompt(session, now).await
            }

            (Stage::Date { week }, Choice::Date(date)) => {
                let invalid = if self.hours.for_date(date).is_none() {
                    Some(Invalid::ClosedDay(date))
                } else if !week.contains(date) {
                    Some(Invalid::DateOutsideWeek(date))
                } else if date < today {
                    Some(Invalid::PastDate(date))
                } else {
                    None
                };
                if let Some(invalid) = invalid {
                    return self.retry(session, FlowError::Validation(invalid), now).await;
                }
                self.to_kind(session, week, date, None).await
            }

            (Stage::Kind { week, date }, Choice::Kind(kind)) => {
                match self.resolver.has_kind_on_date(session.owner, kind, date).await {
                    Ok(true) => {
                        self.to_kind(session, week, date, Some(FlowError::DuplicateTypeForDay(kind)))
                            .await
                    }
                    Ok(false) => self.to_start(session, week, date, kind, None, now).await,
                    Err(e) => Reply::Ended(e),
                }
            }

            (Stage::Start { week, date, kind }, Choice::Start(start)) => {
                if !calendar::legal_start_times(&self.hours, date, now).contains(&start) {
                    return self
                        .to_start(session, week, date, kind, Some(FlowError::Validation(Invalid::StartHour(start))), now)
                        .await;
                }
                session.stage = Stage::Duration { week, date, kind, start };
                self.reprompt(session, now).await
            }

            (Stage::Duration { week, date, kind, start }, Choice::Duration(hours)) => {
                if !calendar::legal_durations(&self.hours, date, start).contains(&hours) {
                    return self
                        .retry(session, FlowError::Validation(Invalid::Duration(hours)), now)
                        .await;
                }
                // The start may have slipped into the past while the user was choosing
                if !calendar::legal_start_times(&self.hours, date, now).contains(&start) {
                    return self
                        .to_start(session, week, date, kind, Some(FlowError::Validation(Invalid::StartHour(start))), now)
                        .await;
                }
                let span = HourSpan::new(start, start + hours);
                let candidate = NewReservation { owner: session.owner, kind, date, span };
                match self.evaluate(&candidate).await {
                    Err(e) => Reply::Ended(e),
                    Ok(Decision::Accept) => self.commit(session, week, candidate, false, now).await,
                    Ok(Decision::Join { participants }) => {
                        session.stage = Stage::Join { week, date, kind, span, participants };
                        self.reprompt(session, now).await
                    }
                    Ok(Decision::Reject(rejection)) => {
                        let error = rejection_error(kind, rejection);
                        reject_metric(&error);
                        match error {
                            FlowError::DuplicateTypeForDay(_) => {
                                self.to_kind(session, week, date, Some(error)).await
                            }
                            _ => self.to_start(session, week, date, kind, Some(error), now).await,
                        }
                    }
                }
            }

            (Stage::Join { week, date, kind, .. }, Choice::Join(false)) => {
                self.to_start(session, week, date, kind, None, now).await
            }

            (Stage::Join { week, date, kind, span, .. }, Choice::Join(true)) => {
                let candidate = NewReservation { owner: session.owner, kind, date, span };
                match self.evaluate(&candidate).await {
                    Err(e) => Reply::Ended(e),
                    Ok(Decision::Reject(rejection)) => {
                        let error = rejection_error(kind, rejection);
                        reject_metric(&error);
                        Reply::Ended(error)
                    }
                    Ok(Decision::Accept | Decision::Join { .. }) => {
                        self.commit(session, week, candidate, true, now).await
                    }
                }
            }

            _ => Reply::Ended(FlowError::InvalidTransition(
                "choice does not match the current step",
            )),
        }
    }

    /// Options for the session's current stage.
    pub async fn prompt(&self, session: &Session, now: NaiveDateTime) -> Result<Prompt, FlowError> {
        let today = now.date();
        let prompt = match &session.stage {
            Stage::Week => Prompt::Weeks {
                weeks: calendar::available_weeks(self.horizon_weeks, today),
            },
            Stage::Date { week } => Prompt::Dates {
                week: *week,
                dates: calendar::dates_in_week(0, week.start)
                    .into_iter()
                    .filter(|d| *d >= today)
                    .collect(),
            },
            Stage::Kind { date, .. } => Prompt::Kinds {
                date: *date,
                kinds: self.resolver.available_kinds(session.owner, *date).await?,
            },
            Stage::Start { date, kind, .. } => Prompt::Starts {
                date: *date,
                kind: *kind,
                hours: calendar::legal_start_times(&self.hours, *date, now),
            },
            Stage::Duration { date, kind, start, .. } => Prompt::Durations {
                date: *date,
                kind: *kind,
                start: *start,
                durations: calendar::legal_durations(&self.hours, *date, *start),
            },
            Stage::Join { date, kind, span, participants, .. } => Prompt::Join {
                date: *date,
                kind: *kind,
                span: *span,
                participants: self.display_names(participants).await,
            },
        };
        Ok(prompt)
    }

    async fn ensure_registered(&self, owner: OwnerId) -> Result<(), FlowError> {
        match self.resolver.store().find_user(owner).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(FlowError::NotRegistered),
            Err(e) => Err(FlowError::Storage(e.to_string())),
        }
    }

    async fn back(&self, session: &mut Session, stage: Stage, now: NaiveDateTime) -> Reply {
        match stage {
            Stage::Week => Reply::Ended(FlowError::InvalidTransition("already at the first step")),
            Stage::Date { .. } => {
                session.stage = Stage::Week;
                self.reprompt(session, now).await
            }
            Stage::Kind { week, .. } => {
                session.stage = Stage::Date { week };
                self.reprompt(session, now).await
            }
            Stage::Start { week, date, .. } => self.to_kind(session, week, date, None).await,
            Stage::Duration { week, date, kind, .. } => {
                self.to_start(session, week, date, kind, None, now).await
            }
            Stage::Join { week, date, kind, span, .. } => {
                session.stage = Stage::Duration { week, date, kind, start: span.start };
                self.reprompt(session, now).await
            }
        }
    }

    /// Move to the kind stage; ends the session when every kind is taken.
    async fn to_kind(
        &self,
        session: &mut Session,
        week: Week,
        date: NaiveDate,
        error: Option<FlowError>,
    ) -> Reply {
        let kinds = match self.resolver.available_kinds(session.owner, date).await {
            Ok(kinds) => kinds,
            Err(e) => return Reply::Ended(e),
        };
        if kinds.is_empty() {
            return Reply::Ended(FlowError::AllKindsBooked(date));
        }
        session.stage = Stage::Kind { week, date };
        respond(error, Prompt::Kinds { date, kinds })
    }

    /// Move to the start stage; falls back to the date stage when the day has no start left.
    async fn to_start(
        &self,
        session: &mut Session,
        week: Week,
        date: NaiveDate,
        kind: ResourceKind,
        error: Option<FlowError>,
        now: NaiveDateTime,
    ) -> Reply {
        let hours = calendar::legal_start_times(&self.hours, date, now);
        if hours.is_empty() {
            session.stage = Stage::Date { week };
            return self
                .retry(session, FlowError::Validation(Invalid::NoStartTimesLeft(date)), now)
                .await;
        }
        session.stage = Stage::Start { week, date, kind };
        respond(error, Prompt::Starts { date, kind, hours })
    }

    async fn reprompt(&self, session: &Session, now: NaiveDateTime) -> Reply {
        match self.prompt(session, now).await {
            Ok(prompt) => Reply::Prompt(prompt),
            Err(e) => Reply::Ended(e),
        }
    }

    async fn retry(&self, session: &Session, error: FlowError, now: NaiveDateTime) -> Reply {
        match self.prompt(session, now).await {
            Ok(prompt) => Reply::Retry { error, prompt },
            Err(e) => Reply::Ended(e),
        }
    }

    async fn evaluate(&self, candidate: &NewReservation) -> Result<Decision, FlowError> {
        let overlapping = self
            .resolver
            .find_overlapping(candidate.kind, candidate.date, candidate.span)
            .await?;
        let held = self
            .resolver
            .has_kind_on_date(candidate.owner, candidate.kind, candidate.date)
            .await?;
        Ok(admission::decide(candidate, &overlapping, held, &self.catalog))
    }

    /// The only write. Store-side rejections are recoverable outside the join branch.
    async fn commit(
        &self,
        session: &mut Session,
        week: Week,
        candidate: NewReservation,
        joining: bool,
        now: NaiveDateTime,
    ) -> Reply {
        let id = match self.resolver.store().insert_reservation(candidate).await {
            Ok(id) => id,
            Err(StoreError::Duplicate { kind, .. }) => {
                let error = FlowError::DuplicateTypeForDay(kind);
                reject_metric(&error);
                if joining {
                    return Reply::Ended(error);
                }
                return self.to_kind(session, week, candidate.date, Some(error)).await;
            }
            Err(StoreError::CapacityExceeded { count, limit }) => {
                let error = FlowError::CapacityExceeded { count, limit };
                reject_metric(&error);
                if joining {
                    return Reply::Ended(error);
                }
                return self
                    .to_start(session, week, candidate.date, candidate.kind, Some(error), now)
                    .await;
            }
            Err(e) => {
                tracing::error!("commit for owner {} failed: {e}", candidate.owner);
                return Reply::Ended(FlowError::Storage(e.to_string()));
            }
        };

        let reservation = Reservation {
            id,
            owner: candidate.owner,
            kind: candidate.kind,
            date: candidate.date,
            span: candidate.span,
            status: Status::Active,
        };
        // Read after write; a failed read only loses the companion list.
        let companions = match self
            .resolver
            .find_overlapping(candidate.kind, candidate.date, candidate.span)
            .await
        {
            Ok(others) => {
                let owners = admission::participants(&others, candidate.owner);
                self.display_names(&owners).await
            }
            Err(e) => {
                debug!("companion lookup failed: {e}");
                Vec::new()
            }
        };

        metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL, "kind" => candidate.kind.slug())
            .increment(1);
        info!(
            "reservation {id} committed: owner {} {} {} {}{}",
            candidate.owner,
            candidate.kind.slug(),
            candidate.date,
            candidate.span,
            if joining { " (joined)" } else { "" }
        );
        Reply::Committed(Confirmation { reservation, companions })
    }

    async fn display_names(&self, owners: &[OwnerId]) -> Vec<String> {
        let mut names = Vec::with_capacity(owners.len());
        for owner in owners {
            let name = match self.resolver.store().find_user(*owner).await {
                Ok(Some(user)) => user.full_name,
                _ => format!("#{owner}"),
            };
            names.push(name);
        }
        names
    }
}

fn respond(error: Option<FlowError>, prompt: Prompt) -> Reply {
    match error {
        Some(error) => Reply::Retry { error, prompt },
        None => Reply::Prompt(prompt),
    }
}

fn rejection_error(kind: ResourceKind, rejection: Rejection) -> FlowError {
    match rejection {
        Rejection::DuplicateTypeForDay => FlowError::DuplicateTypeForDay(kind),
        Rejection::CapacityExceeded { count, limit } => FlowError::CapacityExceeded { count, limit },
    }
}

fn reject_metric(error: &FlowError) {
    metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "reason" => error.code())
        .increment(1);
}
