//! Cancellation of confirmed enrollments.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use super::ledger::{CapacityLedger, SeatRelease};
use crate::errors::{Error, Result};
use crate::models::{Enrollment, EnrollmentStatus};
use crate::store::Store;
use crate::types::{EnrollmentId, abbrev_uuid};

#[derive(Debug, Clone, Serialize)]
pub struct Cancellation {
    pub enrollment: Enrollment,
    pub seat: SeatRelease,
}

pub struct CancellationCoordinator<S> {
    store: Arc<S>,
    ledger: CapacityLedger<S>,
}

impl<S: Store> CancellationCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            ledger: CapacityLedger::new(store.clone()),
            store,
        }
    }

    /// Cancel a confirmed enrollment and give its seat back.
    ///
    /// The status change is committed before the release. If the release
    /// fails the cancellation still stands and the seat is recorded as a
    /// discrepancy for the repair task.
    ///
    /// # Errors
    /// - `NotFound` - unknown enrollment
    /// - `InvalidState` - the enrollment is not confirmed
    #[instrument(skip(self), fields(enrollment_id = %abbrev_uuid(&enrollment_id)), err)]
    pub async fn cancel(&self, enrollment_id: EnrollmentId) -> Result<Cancellation> {
        let current = self.load(enrollment_id).await?;
        if current.status != EnrollmentStatus::Confirmed {
            return Err(invalid_state(&current));
        }

        let cancelled = match self.store.cancel_enrollment(enrollment_id, Utc::now()).await? {
            Some(cancelled) => cancelled,
            // Lost a race with another cancellation.
            None => return Err(invalid_state(&self.load(enrollment_id).await?)),
        };
        tracing::info!(
            "Cancelled enrollment {} in class {}",
            abbrev_uuid(&cancelled.id),
            abbrev_uuid(&cancelled.class_id)
        );

        let seat = self.ledger.release_for(&cancelled, "cancellation").await?;
        Ok(Cancellation {
            enrollment: cancelled,
            seat,
        })
    }

    async fn load(&self, enrollment_id: EnrollmentId) -> Result<Enrollment> {
        self.store.get_enrollment(enrollment_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Enrollment".to_string(),
            id: enrollment_id.to_string(),
        })
    }
}

fn invalid_state(enrollment: &Enrollment) -> Error {
    Error::InvalidState {
        enrollment_id: enrollment.id.to_string(),
        status: enrollment.status,
        expected: EnrollmentStatus::Confirmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EnrollmentEffect, Engine, ReconcileOutcome};
    use crate::models::DiscrepancyKind;
    use crate::store::in_memory::InMemoryStore;
    use crate::test_utils::{FakeProvider, approved_notification, engine, seed_class, seed_student, test_config};

    async fn confirmed(store: &InMemoryStore) -> (Engine<InMemoryStore>, Enrollment) {
        let engine = engine(store, FakeProvider::new(), &test_config());
        let student = seed_student(store).await;
        let class = seed_class(store, 3).await;
        let reservation = engine.reservations.reserve(student.id, class.id).await.unwrap();
        engine
            .reconciler
            .reconcile(&approved_notification(&reservation.payment_intent.provider_id, "payment.updated"))
            .await
            .unwrap();
        let enrollment = store.get_enrollment(reservation.enrollment.id).await.unwrap().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Confirmed);
        (engine, enrollment)
    }

    #[tokio::test]
    async fn cancelling_confirmed_releases_one_seat() {
        let store = InMemoryStore::new();
        let (engine, enrollment) = confirmed(&store).await;
        assert_eq!(store.get_class(enrollment.class_id).await.unwrap().unwrap().occupancy, 1);

        let cancellation = engine.cancellations.cancel(enrollment.id).await.unwrap();
        assert_eq!(cancellation.enrollment.status, EnrollmentStatus::Cancelled);
        assert!(cancellation.enrollment.cancelled_at.is_some());
        assert_eq!(cancellation.seat, SeatRelease::Released);
        assert_eq!(store.get_class(enrollment.class_id).await.unwrap().unwrap().occupancy, 0);

        let again = engine.cancellations.cancel(enrollment.id).await.unwrap_err();
        assert!(matches!(
            again,
            Error::InvalidState {
                status: EnrollmentStatus::Cancelled,
                ..
            }
        ));
        assert_eq!(store.get_class(enrollment.class_id).await.unwrap().unwrap().occupancy, 0);
    }

    #[tokio::test]
    async fn pending_enrollment_cannot_be_cancelled() {
        let store = InMemoryStore::new();
        let engine = engine(&store, FakeProvider::new(), &test_config());
        let student = seed_student(&store).await;
        let class = seed_class(&store, 3).await;
        let reservation = engine.reservations.reserve(student.id, class.id).await.unwrap();

        let err = engine.cancellations.cancel(reservation.enrollment.id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                status: EnrollmentStatus::Pending,
                expected: EnrollmentStatus::Confirmed,
                ..
            }
        ));
        assert_eq!(store.get_class(class.id).await.unwrap().unwrap().occupancy, 1);
    }

    #[tokio::test]
    async fn unknown_enrollment_is_not_found() {
        let store = InMemoryStore::new();
        let engine = engine(&store, FakeProvider::new(), &test_config());
        let err = engine.cancellations.cancel(EnrollmentId::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn failed_release_is_deferred_to_repair() {
        let store = InMemoryStore::new();
        let (engine, enrollment) = confirmed(&store).await;
        store.fail_next_seat_releases(1);

        let cancellation = engine.cancellations.cancel(enrollment.id).await.unwrap();
        let SeatRelease::Deferred { discrepancy_id } = cancellation.seat else {
            panic!("expected deferred release, got {:?}", cancellation.seat);
        };
        assert_eq!(cancellation.enrollment.status, EnrollmentStatus::Cancelled);
        assert_eq!(store.get_class(enrollment.class_id).await.unwrap().unwrap().occupancy, 1);

        let open = store.list_open_discrepancies(10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, discrepancy_id);
        assert_eq!(open[0].kind, DiscrepancyKind::SeatReleaseFailed);
    }

    #[tokio::test]
    async fn cancelling_with_no_occupied_seat_records_underflow() {
        let store = InMemoryStore::new();
        let (engine, enrollment) = confirmed(&store).await;
        // Something else already gave the seat back.
        assert!(store.release_seat(enrollment.class_id).await.unwrap());

        let cancellation = engine.cancellations.cancel(enrollment.id).await.unwrap();
        let SeatRelease::NothingHeld { discrepancy_id } = cancellation.seat else {
            panic!("expected nothing held, got {:?}", cancellation.seat);
        };
        assert_eq!(cancellation.enrollment.status, EnrollmentStatus::Cancelled);
        assert_eq!(store.get_class(enrollment.class_id).await.unwrap().unwrap().occupancy, 0);

        let open = store.list_open_discrepancies(10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, discrepancy_id);
        assert_eq!(open[0].kind, DiscrepancyKind::LedgerUnderflow);
        assert_eq!(open[0].enrollment_id, enrollment.id);
    }

    #[tokio::test]
    async fn approval_replayed_after_cancel_changes_nothing() {
        let store = InMemoryStore::new();
        let (engine, enrollment) = confirmed(&store).await;
        let cancellation = engine.cancellations.cancel(enrollment.id).await.unwrap();

        let intent = store.get_payment_intent_for_enrollment(enrollment.id).await.unwrap().unwrap();
        let outcome = engine
            .reconciler
            .reconcile(&approved_notification(&intent.provider_id, "payment.updated"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied {
                enrollment: EnrollmentEffect::AlreadyConfirmed,
                ..
            }
        ));
        assert_eq!(store.get_enrollment(enrollment.id).await.unwrap().unwrap(), cancellation.enrollment);
        assert_eq!(store.get_class(enrollment.class_id).await.unwrap().unwrap().occupancy, 0);
        assert!(store.list_open_discrepancies(10).await.unwrap().is_empty());
    }
}
