use super::*;
use crate::config::Policy;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotdesk_test_ledger");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(d: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    d.and_hms_opt(h, m, 0).unwrap()
}

fn candidate(owner: OwnerId, kind: ResourceKind, d: NaiveDate, start: u32, end: u32) -> NewReservation {
    NewReservation {
        owner,
        kind,
        date: d,
        span: HourSpan::new(start, end),
    }
}

fn user(id: OwnerId, name: &str) -> User {
    User {
        id,
        full_name: name.into(),
        phone: "+79990000000".into(),
        is_student: false,
    }
}

fn open(name: &str) -> (Ledger, PathBuf) {
    let path = test_wal_path(name);
    let ledger = Ledger::open(path.clone(), Catalog::default()).unwrap();
    (ledger, path)
}

// ── Placement ────────────────────────────────────────────

#[tokio::test]
async fn place_and_query_overlapping() {
    let (ledger, _) = open("place_query.wal");
    let tue = date(2024, 6, 11);

    let a = ledger
        .place(candidate(1, ResourceKind::Console, tue, 18, 20))
        .await
        .unwrap();
    let b = ledger
        .place(candidate(2, ResourceKind::Console, tue, 19, 21))
        .await
        .unwrap();
    assert!(b > a);

    let hits = ledger
        .overlapping(ResourceKind::Console, tue, HourSpan::new(20, 22))
        .await;
    assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b]);

    // Other kinds and dates are separate sheets
    assert!(ledger
        .overlapping(ResourceKind::LectureRoom, tue, HourSpan::new(18, 23))
        .await
        .is_empty());
    assert!(ledger
        .overlapping(ResourceKind::Console, date(2024, 6, 12), HourSpan::new(18, 23))
        .await
        .is_empty());
}

#[tokio::test]
async fn place_rejects_second_reservation_of_kind_per_day() {
    let (ledger, _) = open("duplicate.wal");
    let tue = date(2024, 6, 11);

    ledger
        .place(candidate(1, ResourceKind::Console, tue, 18, 19))
        .await
        .unwrap();
    let err = ledger
        .place(candidate(1, ResourceKind::Console, tue, 21, 22))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::Duplicate {
            owner: 1,
            kind: ResourceKind::Console,
            date: tue
        }
    );

    // Different kind the same day, and same kind another day, are fine
    ledger
        .place(candidate(1, ResourceKind::LectureRoom, tue, 21, 22))
        .await
        .unwrap();
    ledger
        .place(candidate(1, ResourceKind::Console, date(2024, 6, 12), 18, 19))
        .await
        .unwrap();
    assert!(ledger.holds_kind_on(1, ResourceKind::Console, tue).await);
    assert!(!ledger.holds_kind_on(2, ResourceKind::Console, tue).await);
}

#[tokio::test]
async fn cancelled_reservation_frees_the_day() {
    let (ledger, _) = open("cancel_frees.wal");
    let tue = date(2024, 6, 11);

    let id = ledger
        .place(candidate(1, ResourceKind::Console, tue, 18, 19))
        .await
        .unwrap();
    assert!(ledger.cancel(id, 1).await.unwrap());
    assert!(!ledger.holds_kind_on(1, ResourceKind::Console, tue).await);
    ledger
        .place(candidate(1, ResourceKind::Console, tue, 20, 21))
        .await
        .unwrap();
}

#[tokio::test]
async fn workstations_cap_at_sixteen() {
    let (ledger, _) = open("workstations_cap.wal");
    let tue = date(2024, 6, 11);

    for owner in 1..=16 {
        ledger
            .place(candidate(owner, ResourceKind::Workstations, tue, 14, 16))
            .await
            .unwrap();
    }

    let err = ledger
        .place(candidate(17, ResourceKind::Workstations, tue, 15, 17))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::CapacityExceeded { count: 16, limit: 16 });

    // Adjacent window does not overlap [14,16)
    ledger
        .place(candidate(17, ResourceKind::Workstations, tue, 16, 18))
        .await
        .unwrap();
}

#[tokio::test]
async fn joinable_kinds_are_unbounded() {
    let (ledger, _) = open("joinable_unbounded.wal");
    let tue = date(2024, 6, 11);
    for owner in 1..=30 {
        ledger
            .place(candidate(owner, ResourceKind::LectureRoom, tue, 18, 20))
            .await
            .unwrap();
    }
    let hits = ledger
        .overlapping(ResourceKind::LectureRoom, tue, HourSpan::new(19, 20))
        .await;
    assert_eq!(hits.len(), 30);
}

#[tokio::test]
async fn exclusive_kind_admits_one() {
    let path = test_wal_path("exclusive.wal");
    let catalog = Catalog::default().with_policy(
        ResourceKind::Console,
        Policy { capacity: None, joinable: false },
    );
    let ledger = Ledger::open(path, catalog).unwrap();
    let tue = date(2024, 6, 11);

    ledger
        .place(candidate(1, ResourceKind::Console, tue, 18, 20))
        .await
        .unwrap();
    let err = ledger
        .place(candidate(2, ResourceKind::Console, tue, 19, 21))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::CapacityExceeded { count: 1, limit: 1 });
}

#[tokio::test]
async fn place_rejects_malformed_span() {
    let (ledger, _) = open("bad_span.wal");
    let tue = date(2024, 6, 11);
    let bad = NewReservation {
        owner: 1,
        kind: ResourceKind::Console,
        date: tue,
        span: HourSpan { start: 22, end: 25 },
    };
    assert!(matches!(
        ledger.place(bad).await,
        Err(StoreError::LimitExceeded(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_placements_never_exceed_capacity() {
    let (ledger, _) = open("race.wal");
    let ledger = Arc::new(ledger);
    let tue = date(2024, 6, 11);

    let mut handles = Vec::new();
    for owner in 0..40 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .place(candidate(owner, ResourceKind::Workstations, tue, 18, 20))
                .await
        }));
    }

    let mut placed = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => placed += 1,
            Err(StoreError::CapacityExceeded { limit: 16, .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(placed, 16);
    assert_eq!(rejected, 24);
    assert_eq!(
        ledger
            .overlapping(ResourceKind::Workstations, tue, HourSpan::new(18, 20))
            .await
            .len(),
        16
    );
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_requires_owner_and_active() {
    let (ledger, _) = open("cancel_owner.wal");
    let tue = date(2024, 6, 11);
    let id = ledger
        .place(candidate(1, ResourceKind::Console, tue, 18, 19))
        .await
        .unwrap();

    assert!(!ledger.cancel(id, 2).await.unwrap());
    assert!(!ledger.cancel(9999, 1).await.unwrap());
    assert!(ledger.cancel(id, 1).await.unwrap());
    assert!(!ledger.cancel(id, 1).await.unwrap());

    let all = ledger.all_reservations(1).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, Status::Cancelled);
}

// ── Expiry ───────────────────────────────────────────────

#[tokio::test]
async fn expire_due_marks_past_and_finished_today() {
    let (ledger, _) = open("expire.wal");
    let yesterday = date(2024, 6, 10);
    let today = date(2024, 6, 11);
    let now = at(today, 20, 30);

    let old = ledger
        .place(candidate(1, ResourceKind::Console, yesterday, 18, 19))
        .await
        .unwrap();
    let ended = ledger
        .place(candidate(2, ResourceKind::Console, today, 18, 20))
        .await
        .unwrap();
    let running = ledger
        .place(candidate(3, ResourceKind::Console, today, 20, 22))
        .await
        .unwrap();
    let cancelled = ledger
        .place(candidate(4, ResourceKind::LectureRoom, yesterday, 18, 19))
        .await
        .unwrap();
    ledger.cancel(cancelled, 4).await.unwrap();
    let future = ledger
        .place(candidate(5, ResourceKind::Console, date(2024, 6, 12), 18, 19))
        .await
        .unwrap();

    assert_eq!(ledger.expire_due(now).await.unwrap(), 2);

    let status = |owner| {
        let ledger = &ledger;
        async move { ledger.all_reservations(owner).await.unwrap()[0].clone() }
    };
    assert_eq!(status(1).await.id, old);
    assert_eq!(status(1).await.status, Status::Expired);
    assert_eq!(status(2).await.id, ended);
    assert_eq!(status(2).await.status, Status::Expired);
    assert_eq!(status(3).await.id, running);
    assert_eq!(status(3).await.status, Status::Active);
    assert_eq!(status(4).await.status, Status::Cancelled);
    assert_eq!(status(5).await.id, future);
    assert_eq!(status(5).await.status, Status::Active);
}

#[tokio::test]
async fn expire_due_is_idempotent() {
    let (ledger, _) = open("expire_idempotent.wal");
    let d = date(2024, 6, 10);
    ledger
        .place(candidate(1, ResourceKind::Workstations, d, 18, 19))
        .await
        .unwrap();

    let now = at(date(2024, 6, 11), 9, 0);
    assert_eq!(ledger.expire_due(now).await.unwrap(), 1);
    let appends = ledger.wal_appends_since_compact().await;
    assert_eq!(ledger.expire_due(now).await.unwrap(), 0);
    // Nothing new is logged by an empty pass
    assert_eq!(ledger.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn expired_reservations_free_capacity() {
    let (ledger, _) = open("expire_capacity.wal");
    let today = date(2024, 6, 11);
    let catalog_limit = Catalog::default().limit(ResourceKind::Workstations).unwrap();
    for owner in 0..catalog_limit as i64 {
        ledger
            .place(candidate(owner, ResourceKind::Workstations, today, 18, 19))
            .await
            .unwrap();
    }
    ledger.expire_due(at(today, 19, 30)).await.unwrap();
    assert!(ledger
        .overlapping(ResourceKind::Workstations, today, HourSpan::new(18, 23))
        .await
        .is_empty());
}

// ── Listings ─────────────────────────────────────────────

#[tokio::test]
async fn listings_are_ordered() {
    let (ledger, _) = open("listings.wal");
    let mon = date(2024, 6, 10);
    let tue = date(2024, 6, 11);

    ledger.place(candidate(1, ResourceKind::Workstations, tue, 18, 19)).await.unwrap();
    ledger.place(candidate(1, ResourceKind::Console, mon, 20, 21)).await.unwrap();
    ledger.place(candidate(1, ResourceKind::LectureRoom, mon, 18, 19)).await.unwrap();
    ledger.place(candidate(2, ResourceKind::Console, tue, 19, 20)).await.unwrap();

    let active = ledger.active_reservations(1, mon).await.unwrap();
    let order: Vec<(NaiveDate, u32)> = active.iter().map(|r| (r.date, r.span.start)).collect();
    assert_eq!(order, vec![(mon, 18), (mon, 20), (tue, 18)]);

    let from_tue = ledger.active_reservations(1, tue).await.unwrap();
    assert_eq!(from_tue.len(), 1);

    let history = ledger.all_reservations(1).await.unwrap();
    assert_eq!(history.first().unwrap().date, tue);
    assert_eq!(history.last().unwrap().date, mon);

    let tue_all = ledger.reservations_on(tue, None).await.unwrap();
    let kinds: Vec<ResourceKind> = tue_all.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ResourceKind::Console, ResourceKind::Workstations]);

    let tue_consoles = ledger
        .reservations_on(tue, Some(ResourceKind::Console))
        .await
        .unwrap();
    assert_eq!(tue_consoles.len(), 1);
    assert_eq!(tue_consoles[0].owner, 2);

    let upcoming = ledger.upcoming_reservations(tue).await.unwrap();
    let starts: Vec<u32> = upcoming.iter().map(|r| r.span.start).collect();
    assert_eq!(starts, vec![18, 19]);
}

// ── Users ────────────────────────────────────────────────

#[tokio::test]
async fn register_and_update_user() {
    let (ledger, _) = open("users.wal");
    assert!(ledger.find_user(5).await.unwrap().is_none());

    ledger.register_user(user(5, "Анна")).await.unwrap();
    assert_eq!(ledger.find_user(5).await.unwrap().unwrap().full_name, "Анна");

    ledger.register_user(user(5, "Анна Смирнова")).await.unwrap();
    assert_eq!(
        ledger.find_user(5).await.unwrap().unwrap().full_name,
        "Анна Смирнова"
    );
}

#[tokio::test]
async fn register_rejects_bad_fields() {
    let (ledger, _) = open("users_bad.wal");
    assert!(matches!(
        ledger.register_user(user(1, "   ")).await,
        Err(StoreError::LimitExceeded(_))
    ));
    assert!(matches!(
        ledger.register_user(user(1, &"я".repeat(100))).await,
        Err(StoreError::LimitExceeded(_))
    ));
    let mut long_phone = user(1, "Олег");
    long_phone.phone = "1".repeat(crate::limits::MAX_PHONE_LEN + 1);
    assert!(matches!(
        ledger.register_user(long_phone).await,
        Err(StoreError::LimitExceeded(_))
    ));
    assert!(ledger.find_user(1).await.unwrap().is_none());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn commits_after_torn_tail_survive_restart() {
    let (ledger, path) = open("torn_then_commit.wal");
    let d = date(2024, 6, 12);
    let first = ledger.place(candidate(1, ResourceKind::Console, d, 18, 19)).await.unwrap();
    drop(ledger);
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xAB; 6]).unwrap(); // crash mid-append
    }

    let recovered = Ledger::open(path.clone(), Catalog::default()).unwrap();
    let second = recovered.place(candidate(2, ResourceKind::Console, d, 18, 19)).await.unwrap();
    assert!(second > first);
    drop(recovered);

    let reopened = Ledger::open(path, Catalog::default()).unwrap();
    let ids: Vec<ReservationId> = reopened
        .reservations_on(d, Some(ResourceKind::Console))
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![first, second]);
}

#[test]
fn failed_flush_fails_every_caller_and_counts_nothing() {
    // Every write to /dev/full fails with ENOSPC
    let full = std::path::Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let mut wal = crate::wal::Wal::open(full).unwrap();
    let event = |id| Event::ReservationPlaced {
        id,
        owner: id as OwnerId,
        kind: ResourceKind::Console,
        date: date(2024, 6, 12),
        span: HourSpan::new(18, 19),
    };
    let (tx1, _rx1) = oneshot::channel();
    let (tx2, _rx2) = oneshot::channel();
    let batch = vec![(event(1), tx1), (event(2), tx2)];

    let results = flush_batch(&mut wal, &batch);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_err()));
    assert_eq!(wal.appends_since_compact(), 0);
}

#[tokio::test]
async fn replay_restores_state_and_id_counter() {
    let (ledger, path) = open("replay.wal");
    let today = date(2024, 6, 11);

    ledger.register_user(user(1, "Пётр")).await.unwrap();
    let kept = ledger.place(candidate(1, ResourceKind::Console, today, 20, 22)).await.unwrap();
    let gone = ledger.place(candidate(1, ResourceKind::LectureRoom, today, 18, 19)).await.unwrap();
    let old = ledger
        .place(candidate(1, ResourceKind::Workstations, date(2024, 6, 10), 18, 19))
        .await
        .unwrap();
    ledger.cancel(gone, 1).await.unwrap();
    ledger.expire_due(at(today, 19, 30)).await.unwrap();

    let reopened = Ledger::open(path, Catalog::default()).unwrap();
    assert_eq!(reopened.user(1).unwrap().full_name, "Пётр");

    let history = reopened.all_reservations(1).await.unwrap();
    let status_of = |id| history.iter().find(|r| r.id == id).unwrap().status;
    assert_eq!(status_of(kept), Status::Active);
    assert_eq!(status_of(gone), Status::Cancelled);
    assert_eq!(status_of(old), Status::Expired);

    let next = reopened
        .place(candidate(2, ResourceKind::Console, today, 20, 21))
        .await
        .unwrap();
    assert!(next > kept.max(gone).max(old));

    // Cancel still finds reservations through the rebuilt locator
    assert!(reopened.cancel(kept, 1).await.unwrap());
}

#[tokio::test]
async fn concurrent_appends_survive_replay() {
    let (ledger, path) = open("group_commit.wal");
    let ledger = Arc::new(ledger);
    let d = date(2024, 6, 12);

    let mut handles = Vec::new();
    for owner in 0..20 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .place(candidate(owner, ResourceKind::LectureRoom, d, 18, 19))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let reopened = Ledger::open(path, Catalog::default()).unwrap();
    assert_eq!(reopened.reservations_on(d, None).await.unwrap().len(), 20);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (ledger, path) = open("compaction.wal");
    let today = date(2024, 6, 11);

    ledger.register_user(user(1, "Ира")).await.unwrap();
    ledger.register_user(user(1, "Ирина")).await.unwrap();
    let mut ids = Vec::new();
    for owner in 1..=5 {
        ids.push(
            ledger
                .place(candidate(owner, ResourceKind::Workstations, today, 20, 21))
                .await
                .unwrap(),
        );
    }
    ledger.cancel(ids[0], 1).await.unwrap();
    ledger
        .place(candidate(9, ResourceKind::Console, date(2024, 6, 10), 18, 19))
        .await
        .unwrap();
    ledger.expire_due(at(today, 9, 0)).await.unwrap();

    assert!(ledger.wal_appends_since_compact().await > 0);
    ledger.compact_wal().await.unwrap();
    assert_eq!(ledger.wal_appends_since_compact().await, 0);

    let reopened = Ledger::open(path, Catalog::default()).unwrap();
    assert_eq!(reopened.user(1).unwrap().full_name, "Ирина");
    assert_eq!(reopened.reservations_on(today, None).await.unwrap().len(), 4);
    assert_eq!(
        reopened.all_reservations(1).await.unwrap()[0].status,
        Status::Cancelled
    );
    assert_eq!(
        reopened.all_reservations(9).await.unwrap()[0].status,
        Status::Expired
    );
}
