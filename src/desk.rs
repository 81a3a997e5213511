//! Request dispatcher: the structured surface any transport talks to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::config::{Catalog, Config};
use crate::flow::{Choice, Confirmation, Flow, FlowError, Prompt, Reply, SessionManager};
use crate::limits::{MAX_NAME_LEN, MAX_PHONE_LEN};
use crate::model::*;
use crate::observability::{self, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::resolver::{Resolver, peak_concurrency};
use crate::store::{Store, StoreError};
use crate::sweeper;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Register {
        user: OwnerId,
        full_name: String,
        phone: String,
        #[serde(default)]
        is_student: bool,
    },
    Book {
        user: OwnerId,
    },
    Choose {
        user: OwnerId,
        session: Ulid,
        choice: Choice,
    },
    Abandon {
        user: OwnerId,
    },
    Reservations {
        user: OwnerId,
        #[serde(default)]
        include_past: bool,
    },
    Cancel {
        user: OwnerId,
        reservation: ReservationId,
    },
    Schedule {
        user: OwnerId,
        date: NaiveDate,
        #[serde(default)]
        kind: Option<ResourceKind>,
    },
    Profile {
        user: OwnerId,
    },
    Overview {
        user: OwnerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&FlowError> for ErrorBody {
    fn from(e: &FlowError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<&StoreError> for ErrorBody {
    fn from(e: &StoreError) -> Self {
        let code = match e {
            StoreError::Duplicate { .. } => "duplicate_type_for_day",
            StoreError::CapacityExceeded { .. } => "capacity_exceeded",
            StoreError::LimitExceeded(_) => "limit_exceeded",
            StoreError::WalError(_) => "storage",
        };
        Self::new(code, e.to_string())
    }
}

/// A reservation with its holder's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub reservation: Reservation,
    pub owner_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSchedule {
    pub kind: ResourceKind,
    pub limit: Option<u32>,
    /// Most reservations active at once that day.
    pub peak: usize,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Prompt {
        session: Ulid,
        prompt: Prompt,
    },
    Retry {
        session: Ulid,
        error: ErrorBody,
        prompt: Prompt,
    },
    Committed {
        confirmation: Confirmation,
    },
    Ended {
        error: ErrorBody,
    },
    Abandoned {
        had_session: bool,
    },
    Registered {
        user: User,
    },
    Reservations {
        reservations: Vec<Reservation>,
    },
    Cancelled {
        reservation: ReservationId,
    },
    Schedule {
        date: NaiveDate,
        kinds: Vec<KindSchedule>,
    },
    Profile {
        user: User,
        active: usize,
        total: usize,
    },
    Overview {
        entries: Vec<Entry>,
    },
    Error {
        error: ErrorBody,
    },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            error: ErrorBody::new(code, message),
        }
    }
}

/// Metric status of a response; a session that ended without a commit is a failure.
fn status_label(resp: &Response) -> &'static str {
    match resp {
        Response::Error { .. } | Response::Ended { .. } => "error",
        _ => "ok",
    }
}

fn flow_response(session: Option<Ulid>, reply: Reply) -> Response {
    match (session, reply) {
        (Some(session), Reply::Prompt(prompt)) => Response::Prompt { session, prompt },
        (Some(session), Reply::Retry { error, prompt }) => Response::Retry {
            session,
            error: ErrorBody::from(&error),
            prompt,
        },
        (_, Reply::Committed(confirmation)) => Response::Committed { confirmation },
        (_, Reply::Ended(error)) => Response::Ended {
            error: ErrorBody::from(&error),
        },
        (None, Reply::Prompt(_) | Reply::Retry { .. }) => {
            Response::error("internal", "open step without a session")
        }
    }
}

pub struct Desk {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    catalog: Catalog,
    admins: HashSet<OwnerId>,
}

impl Desk {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        catalog: Catalog,
        admins: HashSet<OwnerId>,
    ) -> Self {
        Self {
            store,
            sessions,
            catalog,
            admins,
        }
    }

    /// Wire a desk, its flow and session table over `store`.
    pub fn from_config(store: Arc<dyn Store>, cfg: &Config) -> Self {
        let resolver = Resolver::new(store.clone(), cfg.read_failure);
        let flow = Flow::new(resolver, cfg.catalog.clone(), cfg.horizon_weeks);
        let sessions = Arc::new(SessionManager::new(flow));
        Self::new(store, sessions, cfg.catalog.clone(), cfg.admins.clone())
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn handle(&self, req: Request, now: NaiveDateTime) -> Response {
        let op = observability::op_label(&req);
        let start = Instant::now();
        let resp = self.dispatch(req, now).await;
        let status = status_label(&resp);
        metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(start.elapsed().as_secs_f64());
        resp
    }

    async fn dispatch(&self, req: Request, now: NaiveDateTime) -> Response {
        match req {
            Request::Register { user, full_name, phone, is_student } => {
                self.register(user, full_name, phone, is_student).await
            }
            Request::Book { user } => {
                let (session, reply) = self.sessions.begin(user, now).await;
                flow_response(session, reply)
            }
            Request::Choose { user, session, choice } => {
                let (session, reply) = self.sessions.apply(user, session, choice, now).await;
                flow_response(session, reply)
            }
            Request::Abandon { user } => Response::Abandoned {
                had_session: self.sessions.abandon(user),
            },
            Request::Reservations { user, include_past } => {
                if let Err(resp) = self.registered(user).await {
                    return resp;
                }
                self.reservations(user, include_past, now).await
            }
            Request::Cancel { user, reservation } => {
                if let Err(resp) = self.registered(user).await {
                    return resp;
                }
                self.cancel(user, reservation).await
            }
            Request::Schedule { user, date, kind } => {
                if let Err(resp) = self.registered(user).await {
                    return resp;
                }
                self.schedule(date, kind).await
            }
            Request::Profile { user } => match self.registered(user).await {
                Ok(record) => self.profile(record).await,
                Err(resp) => resp,
            },
            Request::Overview { user } => {
                if !self.admins.contains(&user) {
                    return Response::error("forbidden", "admins only");
                }
                self.overview(now).await
            }
        }
    }

    async fn registered(&self, user: OwnerId) -> Result<User, Response> {
        match self.store.find_user(user).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Response::Error {
                error: ErrorBody::from(&FlowError::NotRegistered),
            }),
            Err(e) => Err(Response::Error {
                error: ErrorBody::from(&e),
            }),
        }
    }

    async fn register(&self, id: OwnerId, full_name: String, phone: String, is_student: bool) -> Response {
        let full_name = full_name.trim().to_string();
        let phone = phone.trim().to_string();
        if full_name.is_empty() || full_name.len() > MAX_NAME_LEN {
            return Response::error("bad_request", format!("full_name must be 1..={MAX_NAME_LEN} bytes"));
        }
        if phone.is_empty() || phone.len() > MAX_PHONE_LEN {
            return Response::error("bad_request", format!("phone must be 1..={MAX_PHONE_LEN} bytes"));
        }

        let user = User { id, full_name, phone, is_student };
        match self.store.register_user(user.clone()).await {
            Ok(()) => {
                info!("registered user {id}");
                Response::Registered { user }
            }
            Err(e) => Response::Error {
                error: ErrorBody::from(&e),
            },
        }
    }

    async fn reservations(&self, user: OwnerId, include_past: bool, now: NaiveDateTime) -> Response {
        // Bring statuses up to date before listing
        if let Err(e) = sweeper::sweep_once(self.store.as_ref(), now).await {
            tracing::warn!("sweep before listing failed: {e}");
        }
        let found = if include_past {
            self.store.all_reservations(user).await
        } else {
            self.store.active_reservations(user, now.date()).await
        };
        match found {
            Ok(reservations) => Response::Reservations { reservations },
            Err(e) => Response::Error {
                error: ErrorBody::from(&e),
            },
        }
    }

    async fn cancel(&self, user: OwnerId, id: ReservationId) -> Response {
        match self.store.mark_cancelled(id, user).await {
            Ok(true) => {
                metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
                info!("reservation {id} cancelled by owner {user}");
                Response::Cancelled { reservation: id }
            }
            Ok(false) => Response::error("not_found", format!("no active reservation {id} of yours")),
            Err(e) => Response::Error {
                error: ErrorBody::from(&e),
            },
        }
    }

    async fn schedule(&self, date: NaiveDate, kind: Option<ResourceKind>) -> Response {
        let found = match self.store.reservations_on(date, kind).await {
            Ok(found) => found,
            Err(e) => {
                return Response::Error {
                    error: ErrorBody::from(&e),
                };
            }
        };

        let kinds: Vec<ResourceKind> = match kind {
            Some(k) => vec![k],
            None => ResourceKind::ALL.to_vec(),
        };
        let mut schedule = Vec::with_capacity(kinds.len());
        for k in kinds {
            let of_kind: Vec<Reservation> = found.iter().filter(|r| r.kind == k).cloned().collect();
            let spans: Vec<HourSpan> = of_kind.iter().map(|r| r.span).collect();
            schedule.push(KindSchedule {
                kind: k,
                limit: self.catalog.limit(k),
                peak: peak_concurrency(&spans),
                entries: self.with_names(of_kind).await,
            });
        }
        Response::Schedule { date, kinds: schedule }
    }

    async fn profile(&self, user: User) -> Response {
        match self.store.all_reservations(user.id).await {
            Ok(all) => Response::Profile {
                active: all.iter().filter(|r| r.is_active()).count(),
                total: all.len(),
                user,
            },
            Err(e) => Response::Error {
                error: ErrorBody::from(&e),
            },
        }
    }

    async fn overview(&self, now: NaiveDateTime) -> Response {
        match self.store.upcoming_reservations(now.date()).await {
            Ok(found) => Response::Overview {
                entries: self.with_names(found).await,
            },
            Err(e) => Response::Error {
                error: ErrorBody::from(&e),
            },
        }
    }

    async fn with_names(&self, reservations: Vec<Reservation>) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            let owner_name = match self.store.find_user(reservation.owner).await {
                Ok(Some(u)) => u.full_name,
                _ => format!("#{}", reservation.owner),
            };
            entries.push(Entry { reservation, owner_name });
        }
        entries
    }
}
