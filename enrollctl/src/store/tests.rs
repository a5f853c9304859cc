use chrono::{Duration, Utc};
use rstest::{fixture, rstest};
use uuid::Uuid;

use crate::models::{
    DiscrepancyKind, Enrollment, EnrollmentStatus, NewClass, NewDiscrepancy, PaymentIntent, PaymentStatus, ReserveOutcome,
    Role, User,
};
use crate::store::{ACTIVE_ENROLLMENT_INDEX, Administration, DbError, Store, StoreTx, in_memory::InMemoryStore};

#[cfg(feature = "pg-tests")]
use crate::store::postgres::PostgresStore;

/// Fixture that returns InMemoryStore
#[fixture]
fn in_memory_store() -> InMemoryStore {
    InMemoryStore::new()
}

/// Generates an in-memory test and, with `pg-tests`, a Postgres twin for a
/// generic `run_*` body.
macro_rules! store_contract {
    ($name:ident, $pg_name:ident, $body:ident) => {
        #[rstest]
        #[tokio::test]
        async fn $name(in_memory_store: InMemoryStore) {
            $body(&in_memory_store).await;
        }

        #[cfg(feature = "pg-tests")]
        #[sqlx::test]
        async fn $pg_name(pool: sqlx::PgPool) {
            let store = PostgresStore::new(pool);
            $body(&store).await;
        }
    };
}

async fn seed_student<S: Administration>(store: &S) -> User {
    let id = Uuid::new_v4();
    let user = User {
        id,
        ..User::new("Ada", format!("ada-{id}@example.com"), Role::Student)
    };
    store.create_user(&user).await.unwrap();
    user
}

async fn seed_class<S: Administration>(store: &S, capacity: i32) -> crate::models::Class {
    store
        .create_class(NewClass {
            title: "Life drawing".to_string(),
            description: "Charcoal and paper".to_string(),
            capacity,
            price_cents: 4200,
        })
        .await
        .unwrap()
}

/// Commit one pending enrollment with its payment intent the way the reservation path does.
async fn commit_pending<S: Store>(store: &S, student: &User, class_id: Uuid, version: i64) -> (Enrollment, PaymentIntent) {
    let mut tx = store.begin().await.unwrap();
    assert!(matches!(
        tx.reserve_if_available(class_id, version).await.unwrap(),
        ReserveOutcome::Reserved { .. }
    ));
    let enrollment = Enrollment::pending(Uuid::new_v4(), student.id, class_id, Utc::now());
    tx.insert_enrollment(&enrollment).await.unwrap();
    let intent = PaymentIntent::pending(enrollment.id, format!("pref-{}", enrollment.id), 4200, "https://pay/x".into());
    tx.insert_payment_intent(&intent).await.unwrap();
    tx.attach_payment_intent(enrollment.id, intent.id).await.unwrap();
    tx.commit().await.unwrap();
    (enrollment, intent)
}

async fn run_reserve_commits_and_detects_stale_version<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 2).await;

    let (enrollment, intent) = commit_pending(store, &student, class.id, class.version).await;

    let after = store.get_class(class.id).await.unwrap().unwrap();
    assert_eq!(after.occupancy, 1);
    assert_eq!(after.version, class.version + 1);

    let stored = store.get_enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EnrollmentStatus::Pending);
    assert_eq!(stored.payment_intent_id, Some(intent.id));

    let mut tx = store.begin().await.unwrap();
    let outcome = tx.reserve_if_available(class.id, class.version).await.unwrap();
    assert_eq!(outcome, ReserveOutcome::Conflict);
    tx.rollback().await.unwrap();
}

store_contract!(
    test_reserve_commits_and_detects_stale_version,
    test_reserve_commits_and_detects_stale_version_postgres,
    run_reserve_commits_and_detects_stale_version
);

async fn run_full_class_conflicts<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 1).await;
    commit_pending(store, &student, class.id, class.version).await;

    let full = store.get_class(class.id).await.unwrap().unwrap();
    let mut tx = store.begin().await.unwrap();
    assert_eq!(
        tx.reserve_if_available(full.id, full.version).await.unwrap(),
        ReserveOutcome::Conflict
    );
}

store_contract!(
    test_full_class_conflicts,
    test_full_class_conflicts_postgres,
    run_full_class_conflicts
);

async fn run_rollback_and_drop_discard_everything<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 3).await;

    let enrollment = Enrollment::pending(Uuid::new_v4(), student.id, class.id, Utc::now());
    let mut tx = store.begin().await.unwrap();
    tx.reserve_if_available(class.id, class.version).await.unwrap();
    tx.insert_enrollment(&enrollment).await.unwrap();
    tx.rollback().await.unwrap();

    let dropped = Enrollment::pending(Uuid::new_v4(), student.id, class.id, Utc::now());
    {
        let mut tx = store.begin().await.unwrap();
        tx.reserve_if_available(class.id, class.version).await.unwrap();
        tx.insert_enrollment(&dropped).await.unwrap();
    }

    let after = store.get_class(class.id).await.unwrap().unwrap();
    assert_eq!(after.occupancy, 0);
    assert_eq!(after.version, class.version);
    assert!(store.get_enrollment(enrollment.id).await.unwrap().is_none());
    assert!(store.get_enrollment(dropped.id).await.unwrap().is_none());
}

store_contract!(
    test_rollback_and_drop_discard_everything,
    test_rollback_and_drop_discard_everything_postgres,
    run_rollback_and_drop_discard_everything
);

async fn run_active_enrollment_is_unique<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 5).await;
    commit_pending(store, &student, class.id, class.version).await;

    let duplicate = Enrollment::pending(Uuid::new_v4(), student.id, class.id, Utc::now());
    let mut tx = store.begin().await.unwrap();
    let err = tx.insert_enrollment(&duplicate).await.unwrap_err();
    assert!(err.violates(ACTIVE_ENROLLMENT_INDEX), "unexpected error: {err:?}");
}

store_contract!(
    test_active_enrollment_is_unique,
    test_active_enrollment_is_unique_postgres,
    run_active_enrollment_is_unique
);

async fn run_release_is_guarded_by_occupancy<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 1).await;

    assert!(!store.release_seat(class.id).await.unwrap());
    commit_pending(store, &student, class.id, class.version).await;
    assert!(store.release_seat(class.id).await.unwrap());
    assert!(!store.release_seat(class.id).await.unwrap());

    let after = store.get_class(class.id).await.unwrap().unwrap();
    assert_eq!(after.occupancy, 0);

    assert!(matches!(store.release_seat(Uuid::new_v4()).await, Err(DbError::NotFound)));
}

store_contract!(
    test_release_is_guarded_by_occupancy,
    test_release_is_guarded_by_occupancy_postgres,
    run_release_is_guarded_by_occupancy
);

async fn run_conditional_status_transitions<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 2).await;
    let (enrollment, _) = commit_pending(store, &student, class.id, class.version).await;

    assert!(store.cancel_enrollment(enrollment.id, Utc::now()).await.unwrap().is_none());

    let confirmed = store
        .confirm_enrollment(enrollment.id, "pay-1", Utc::now())
        .await
        .unwrap()
        .expect("pending enrollment confirms");
    assert_eq!(confirmed.status, EnrollmentStatus::Confirmed);
    assert_eq!(confirmed.provider_payment_id.as_deref(), Some("pay-1"));

    assert!(store.confirm_enrollment(enrollment.id, "pay-1", Utc::now()).await.unwrap().is_none());
    assert!(store.expire_enrollment(enrollment.id, Utc::now()).await.unwrap().is_none());

    let cancelled = store.cancel_enrollment(enrollment.id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(cancelled.status, EnrollmentStatus::Cancelled);
    assert!(store.find_active_enrollment(student.id, class.id).await.unwrap().is_none());
}

store_contract!(
    test_conditional_status_transitions,
    test_conditional_status_transitions_postgres,
    run_conditional_status_transitions
);

async fn run_payment_status_never_leaves_approved<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 2).await;
    let (_, intent) = commit_pending(store, &student, class.id, class.version).await;

    let found = store.find_payment_intent_by_provider_id(&intent.provider_id).await.unwrap().unwrap();
    assert_eq!(found.id, intent.id);

    let approved = store
        .update_payment_status(intent.id, PaymentStatus::Approved, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(approved.status, PaymentStatus::Approved);

    let regressed = store
        .update_payment_status(intent.id, PaymentStatus::Rejected, Utc::now())
        .await
        .unwrap();
    assert!(regressed.is_none());

    let stored = store.get_payment_intent_for_enrollment(intent.enrollment_id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Approved);

    let missing = store
        .update_payment_status(Uuid::new_v4(), PaymentStatus::Approved, Utc::now())
        .await;
    assert!(matches!(missing, Err(DbError::NotFound)));
}

store_contract!(
    test_payment_status_never_leaves_approved,
    test_payment_status_never_leaves_approved_postgres,
    run_payment_status_never_leaves_approved
);

async fn run_stale_pending_listing<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let other = seed_student(store).await;
    let class = seed_class(store, 3).await;

    let (first, _) = commit_pending(store, &student, class.id, class.version).await;
    let (second, _) = commit_pending(store, &other, class.id, class.version + 1).await;
    store.confirm_enrollment(second.id, "pay-2", Utc::now()).await.unwrap();

    let cutoff = Utc::now() + Duration::seconds(1);
    let stale = store.list_stale_pending(cutoff, 10).await.unwrap();
    assert_eq!(stale.iter().map(|e| e.id).collect::<Vec<_>>(), vec![first.id]);

    let none = store.list_stale_pending(first.created_at - Duration::seconds(1), 10).await.unwrap();
    assert!(none.is_empty());

    let expired = store.expire_enrollment(first.id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(expired.status, EnrollmentStatus::Expired);
    assert!(store.list_stale_pending(cutoff, 10).await.unwrap().is_empty());
}

store_contract!(
    test_stale_pending_listing,
    test_stale_pending_listing_postgres,
    run_stale_pending_listing
);

async fn run_discrepancy_lifecycle<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 1).await;
    let (enrollment, _) = commit_pending(store, &student, class.id, class.version).await;

    let recorded = store
        .record_discrepancy(NewDiscrepancy {
            kind: DiscrepancyKind::SeatReleaseFailed,
            enrollment_id: enrollment.id,
            class_id: class.id,
            detail: "release failed".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(recorded.attempts, 0);

    store.record_repair_failure(recorded.id, "still down").await.unwrap();
    let open = store.list_open_discrepancies(10).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].attempts, 1);
    assert_eq!(open[0].last_error.as_deref(), Some("still down"));

    assert!(store.resolve_discrepancy(recorded.id, Utc::now()).await.unwrap());
    assert!(!store.resolve_discrepancy(recorded.id, Utc::now()).await.unwrap());
    assert!(store.list_open_discrepancies(10).await.unwrap().is_empty());
}

store_contract!(
    test_discrepancy_lifecycle,
    test_discrepancy_lifecycle_postgres,
    run_discrepancy_lifecycle
);

async fn run_open_discrepancies_by_kind<S: Store + Administration>(store: &S) {
    let student = seed_student(store).await;
    let class = seed_class(store, 1).await;
    let (enrollment, _) = commit_pending(store, &student, class.id, class.version).await;
    let (enrollment_id, class_id) = (enrollment.id, class.id);
    let record = move |kind: DiscrepancyKind| async move {
        // Keep created_at strictly increasing.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store
            .record_discrepancy(NewDiscrepancy {
                kind,
                enrollment_id,
                class_id,
                detail: kind.as_str().to_string(),
            })
            .await
    };

    let review = record(DiscrepancyKind::LedgerUnderflow).await.unwrap();
    let first = record(DiscrepancyKind::SeatReleaseFailed).await.unwrap();
    record(DiscrepancyKind::ApprovedPaymentForInactiveEnrollment).await.unwrap();
    let second = record(DiscrepancyKind::SeatReleaseFailed).await.unwrap();

    let failed = store
        .list_open_discrepancies_of_kind(DiscrepancyKind::SeatReleaseFailed, 10)
        .await
        .unwrap();
    assert_eq!(failed.iter().map(|d| d.id).collect::<Vec<_>>(), vec![first.id, second.id]);

    let limited = store
        .list_open_discrepancies_of_kind(DiscrepancyKind::SeatReleaseFailed, 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, first.id);

    store.resolve_discrepancy(review.id, Utc::now()).await.unwrap();
    assert!(
        store
            .list_open_discrepancies_of_kind(DiscrepancyKind::LedgerUnderflow, 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(store.list_open_discrepancies(10).await.unwrap().len(), 3);
}

store_contract!(
    test_open_discrepancies_by_kind,
    test_open_discrepancies_by_kind_postgres,
    run_open_discrepancies_by_kind
);

#[rstest]
#[tokio::test]
async fn test_in_memory_reserver_waits_for_held_seat(in_memory_store: InMemoryStore) {
    let store = in_memory_store;
    let student = seed_student(&store).await;
    let class = seed_class(&store, 5).await;

    let mut first = store.begin().await.unwrap();
    first.reserve_if_available(class.id, class.version).await.unwrap();

    let contender = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut tx = store.begin().await.unwrap();
            tx.reserve_if_available(class.id, class.version).await.unwrap()
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!contender.is_finished());

    let enrollment = Enrollment::pending(Uuid::new_v4(), student.id, class.id, Utc::now());
    first.insert_enrollment(&enrollment).await.unwrap();
    first.commit().await.unwrap();

    assert_eq!(contender.await.unwrap(), ReserveOutcome::Conflict);
}

#[rstest]
#[tokio::test]
async fn test_in_memory_injected_release_failure(in_memory_store: InMemoryStore) {
    let class = seed_class(&in_memory_store, 1).await;
    in_memory_store.fail_next_seat_releases(1);
    assert!(matches!(in_memory_store.release_seat(class.id).await, Err(DbError::Other(_))));
    assert!(!in_memory_store.release_seat(class.id).await.unwrap());
}
