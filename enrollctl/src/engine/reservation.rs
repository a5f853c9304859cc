//! Seat reservation.
//!
//! One reservation attempt is one storage transaction:
//!
//! 1. conditional seat increment against the observed class version
//! 2. pending enrollment insert
//! 3. payment intent creation at the provider, keyed by the enrollment id
//! 4. payment intent insert, then commit
//!
//! A version conflict aborts the attempt and retries from a fresh read. A
//! conflict caused by a competing seat commit retries at once and is not
//! charged against the retry budget; any other version movement backs off
//! exponentially and counts as one attempt. Any other failure rolls the whole attempt back, so a
//! seat is never held without its enrollment and payment intent. The
//! enrollment id is minted once per call, so every attempt presents the same
//! idempotency key to the provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use super::ledger::CapacityLedger;
use super::retry::RetryPolicy;
use crate::config::{CheckoutConfig, ReservationConfig};
use crate::errors::{Error, Result};
use crate::models::{Class, Enrollment, PaymentIntent, ReserveOutcome};
use crate::payment_providers::{IntentRequest, PaymentProvider, ReturnUrls};
use crate::store::{ACTIVE_ENROLLMENT_INDEX, Store, StoreTx};
use crate::types::{ClassId, EnrollmentId, UserId, abbrev_uuid};

/// A held seat awaiting payment.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub enrollment: Enrollment,
    pub payment_intent: PaymentIntent,
    pub redirect_url: String,
}

enum Attempt {
    Committed(Reservation),
    Conflict,
}

pub struct ReservationCoordinator<S> {
    store: Arc<S>,
    ledger: CapacityLedger<S>,
    provider: Arc<dyn PaymentProvider>,
    retry: RetryPolicy,
    deadline: Duration,
    notify_url: String,
    return_urls: ReturnUrls,
}

impl<S: Store> ReservationCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        provider: Arc<dyn PaymentProvider>,
        config: &ReservationConfig,
        checkout: &CheckoutConfig,
    ) -> Self {
        Self {
            ledger: CapacityLedger::new(store.clone()),
            store,
            provider,
            retry: RetryPolicy::from(config),
            deadline: config.transaction_deadline,
            notify_url: checkout.notify_url.to_string(),
            return_urls: ReturnUrls::under(checkout.back_url.as_str()),
        }
    }

    /// Reserve a seat for `student_id` in `class_id` and mint its payment intent.
    ///
    /// # Errors
    /// - `NotFound` - unknown student or class
    /// - `InvalidParticipant` - the user is not a student
    /// - `AlreadyEnrolled` - an active enrollment exists for the pair
    /// - `NoSeatsAvailable` - the class is full
    /// - `Exhausted` - still conflicting after the configured attempts
    /// - `DeadlineExceeded` - an attempt ran past the transaction deadline
    /// - `PaymentProvider` - the provider call failed; nothing was persisted
    #[instrument(skip(self), fields(student_id = %abbrev_uuid(&student_id), class_id = %abbrev_uuid(&class_id)), err)]
    pub async fn reserve(&self, student_id: UserId, class_id: ClassId) -> Result<Reservation> {
        let result = self.reserve_with_retry(student_id, class_id).await;
        let outcome = match &result {
            Ok(_) => "reserved",
            Err(Error::NoSeatsAvailable { .. }) => "no_seats",
            Err(Error::AlreadyEnrolled { .. }) => "already_enrolled",
            Err(Error::Exhausted { .. }) => "exhausted",
            Err(Error::DeadlineExceeded { .. }) => "deadline_exceeded",
            Err(Error::PaymentProvider(_)) => "provider_error",
            Err(_) => "rejected",
        };
        metrics::counter!("enrollctl_reservations_total", "outcome" => outcome).increment(1);
        result
    }

    async fn reserve_with_retry(&self, student_id: UserId, class_id: ClassId) -> Result<Reservation> {
        self.check_preconditions(student_id, class_id).await?;

        let enrollment_id = EnrollmentId::new_v4();
        let mut attempts = 0;
        let mut charged = 0;
        let mut class = self.ledger.observe(class_id).await?;
        loop {
            if !class.has_available_seat() {
                return Err(Error::NoSeatsAvailable {
                    class_id: class_id.to_string(),
                });
            }

            attempts += 1;
            let attempt = tokio::time::timeout(self.deadline, self.attempt(&class, student_id, enrollment_id))
                .await
                .map_err(|_| {
                    tracing::warn!(
                        "Reservation attempt for enrollment {} exceeded {:?}, rolled back",
                        abbrev_uuid(&enrollment_id),
                        self.deadline
                    );
                    Error::DeadlineExceeded {
                        deadline_ms: self.deadline.as_millis(),
                    }
                })??;

            let observed = match attempt {
                Attempt::Committed(reservation) => {
                    tracing::info!(
                        "Reserved seat in class {} for student {} as enrollment {} (attempt {})",
                        abbrev_uuid(&class_id),
                        abbrev_uuid(&student_id),
                        abbrev_uuid(&enrollment_id),
                        attempts
                    );
                    return Ok(reservation);
                }
                Attempt::Conflict => class,
            };

            metrics::counter!("enrollctl_reservation_conflicts_total").increment(1);
            class = self.ledger.observe(class_id).await?;
            if lost_seat_to_contender(&observed, &class) {
                // Someone else committed a seat; the next read already reflects it.
                tracing::debug!(
                    "Class {} filled to {}/{} under us, retrying",
                    abbrev_uuid(&class_id),
                    class.occupancy,
                    class.capacity
                );
                continue;
            }

            charged += 1;
            if !self.retry.allows(charged) {
                tracing::warn!(
                    "Giving up on class {} after {} contended attempts",
                    abbrev_uuid(&class_id),
                    charged
                );
                return Err(Error::Exhausted { attempts: charged });
            }
            let delay = self.retry.delay(charged - 1);
            tracing::debug!(
                "Version of class {} moved past {}, retrying in {:?}",
                abbrev_uuid(&class_id),
                observed.version,
                delay
            );
            tokio::time::sleep(delay).await;
            class = self.ledger.observe(class_id).await?;
        }
    }

    /// Fail-fast checks; the unique index still decides the race.
    async fn check_preconditions(&self, student_id: UserId, class_id: ClassId) -> Result<()> {
        let student = self.store.get_user(student_id).await?.ok_or_else(|| Error::NotFound {
            resource: "User".to_string(),
            id: student_id.to_string(),
        })?;
        if !student.can_enroll() {
            return Err(Error::InvalidParticipant {
                user_id: student_id.to_string(),
                reason: "Only students can enroll in classes".to_string(),
            });
        }
        if self.store.find_active_enrollment(student_id, class_id).await?.is_some() {
            return Err(already_enrolled(student_id, class_id));
        }
        Ok(())
    }

    async fn attempt(&self, class: &Class, student_id: UserId, enrollment_id: EnrollmentId) -> Result<Attempt> {
        let mut tx = self.store.begin().await?;

        if let ReserveOutcome::Conflict = tx.reserve_if_available(class.id, class.version).await? {
            tx.rollback().await?;
            return Ok(Attempt::Conflict);
        }

        let enrollment = Enrollment::pending(enrollment_id, student_id, class.id, Utc::now());
        tx.insert_enrollment(&enrollment).await.map_err(|e| {
            if e.violates(ACTIVE_ENROLLMENT_INDEX) {
                already_enrolled(student_id, class.id)
            } else {
                Error::from(e)
            }
        })?;

        let request = IntentRequest {
            title: class.title.clone(),
            description: class.description.clone(),
            quantity: 1,
            unit_price_cents: class.price_cents,
            external_reference: enrollment_id.to_string(),
            notify_url: self.notify_url.clone(),
            return_urls: self.return_urls.clone(),
        };
        let created = match self.provider.create_intent(&request).await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(
                    "Payment provider failed for enrollment {}, rolling back seat: {}",
                    abbrev_uuid(&enrollment_id),
                    e
                );
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!("Rollback after provider failure also failed: {}", rollback);
                }
                return Err(Error::PaymentProvider(e));
            }
        };

        let intent = PaymentIntent::pending(enrollment_id, created.provider_id, class.price_cents, created.redirect_url);
        tx.insert_payment_intent(&intent).await?;
        tx.attach_payment_intent(enrollment_id, intent.id).await?;
        tx.commit().await.map_err(|e| {
            if e.violates(ACTIVE_ENROLLMENT_INDEX) {
                already_enrolled(student_id, class.id)
            } else {
                Error::from(e)
            }
        })?;

        Ok(Attempt::Committed(Reservation {
            redirect_url: intent.redirect_url.clone(),
            enrollment: Enrollment {
                payment_intent_id: Some(intent.id),
                ..enrollment
            },
            payment_intent: intent,
        }))
    }
}

/// A conflict caused by another reservation committing a seat is progress,
/// not contention: the retry that follows either wins or sees a full class.
fn lost_seat_to_contender(observed: &Class, fresh: &Class) -> bool {
    fresh.occupancy > observed.occupancy
}

fn already_enrolled(student_id: UserId, class_id: ClassId) -> Error {
    Error::AlreadyEnrolled {
        student_id: student_id.to_string(),
        class_id: class_id.to_string(),
    }
}
