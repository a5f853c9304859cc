//! Applies provider payment notifications to payment intents and enrollments.
//!
//! This is the only writer that confirms an enrollment. Confirmation is a
//! conditional update on `status = 'pending'`, so replays and the
//! created/updated pair for one payment confirm at most once.
//!
//! A notification names a payment, which is matched to its intent by the
//! intent's provider id. When that fails (the provider minted a separate
//! payment id at checkout) the payment is fetched and matched through its
//! external reference, which is the enrollment id.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use crate::errors::{Error, Result};
use crate::models::{Confirmation, DiscrepancyKind, NewDiscrepancy, PaymentIntent, PaymentStatus};
use crate::payment_providers::{Notification, PaymentProvider, ProviderPayment};
use crate::store::Store;
use crate::types::{DiscrepancyId, EnrollmentId, PaymentIntentId, abbrev_uuid};

const PAYMENT_ENTITY: &str = "payment";
const SUPPORTED_ACTIONS: [&str; 2] = ["payment.created", "payment.updated"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The provider does not model this payload at all.
    Unrecognized,
    UnsupportedEntity,
    UnsupportedAction,
}

/// Effect of a notification on the owning enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum EnrollmentEffect {
    Confirmed,
    AlreadyConfirmed,
    /// The payment is not approved; the enrollment stays as it was.
    Unchanged,
    /// Approved, but the enrollment can no longer be confirmed.
    Inactive { discrepancy_id: DiscrepancyId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Ignored {
        reason: IgnoreReason,
    },
    Applied {
        payment_intent_id: PaymentIntentId,
        payment_status: PaymentStatus,
        enrollment: EnrollmentEffect,
    },
}

pub struct WebhookReconciler<S> {
    store: Arc<S>,
    provider: Arc<dyn PaymentProvider>,
}

impl<S: Store> WebhookReconciler<S> {
    pub fn new(store: Arc<S>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    /// # Errors
    /// - `NotFound` - no payment intent carries the notification's payment id
    /// - `PaymentProvider` - the status lookup failed
    #[instrument(skip(self, notification), fields(payment_id = %notification.payment_id, action = %notification.action), err)]
    pub async fn reconcile(&self, notification: &Notification) -> Result<ReconcileOutcome> {
        let result = self.apply(notification).await;
        let outcome = match &result {
            Ok(ReconcileOutcome::Ignored { .. }) => "ignored",
            Ok(ReconcileOutcome::Applied {
                enrollment: EnrollmentEffect::Confirmed,
                ..
            }) => "confirmed",
            Ok(ReconcileOutcome::Applied { .. }) => "applied",
            Err(Error::NotFound { .. }) => "unknown_payment",
            Err(_) => "error",
        };
        metrics::counter!("enrollctl_webhooks_total", "outcome" => outcome).increment(1);
        result
    }

    async fn apply(&self, notification: &Notification) -> Result<ReconcileOutcome> {
        if notification.entity_type != PAYMENT_ENTITY {
            tracing::debug!("Ignoring {} notification", notification.entity_type);
            return Ok(ReconcileOutcome::Ignored {
                reason: IgnoreReason::UnsupportedEntity,
            });
        }
        if !SUPPORTED_ACTIONS.contains(&notification.action.as_str()) {
            tracing::debug!("Ignoring payment notification with action {}", notification.action);
            return Ok(ReconcileOutcome::Ignored {
                reason: IgnoreReason::UnsupportedAction,
            });
        }

        let (intent, fetched) = match self.store.find_payment_intent_by_provider_id(&notification.payment_id).await? {
            Some(intent) => (intent, None),
            None => {
                let payment = self.provider.get_payment(&notification.payment_id).await?;
                let intent = self.intent_for_payment(&notification.payment_id, &payment).await?;
                (intent, Some(payment.status))
            }
        };

        let status = match fetched.or(notification.status) {
            Some(status) => status,
            None => self.provider.get_payment(&notification.payment_id).await?.status,
        };

        let intent = match self.store.update_payment_status(intent.id, status, Utc::now()).await? {
            Some(updated) => updated,
            None => {
                tracing::debug!(
                    "Payment intent {} is already {}, ignoring reported {}",
                    abbrev_uuid(&intent.id),
                    intent.status,
                    status
                );
                intent
            }
        };

        let effect = if intent.status == PaymentStatus::Approved {
            self.confirm(&intent, &notification.payment_id).await?
        } else {
            EnrollmentEffect::Unchanged
        };

        Ok(ReconcileOutcome::Applied {
            payment_intent_id: intent.id,
            payment_status: intent.status,
            enrollment: effect,
        })
    }

    async fn intent_for_payment(&self, payment_id: &str, payment: &ProviderPayment) -> Result<PaymentIntent> {
        let not_found = || Error::NotFound {
            resource: "Payment intent".to_string(),
            id: payment_id.to_string(),
        };
        let Some(enrollment_id) = payment
            .external_reference
            .as_deref()
            .and_then(|r| EnrollmentId::parse_str(r).ok())
        else {
            tracing::warn!(
                "Payment {} matches no intent and has no usable external reference ({:?})",
                payment_id,
                payment.external_reference
            );
            return Err(not_found());
        };

        let intent = self
            .store
            .get_payment_intent_for_enrollment(enrollment_id)
            .await?
            .ok_or_else(not_found)?;
        tracing::debug!(
            "Matched payment {} to intent {} through enrollment {}",
            payment_id,
            abbrev_uuid(&intent.id),
            abbrev_uuid(&enrollment_id)
        );
        Ok(intent)
    }

    async fn confirm(&self, intent: &PaymentIntent, payment_id: &str) -> Result<EnrollmentEffect> {
        let now = Utc::now();
        if let Some(confirmed) = self.store.confirm_enrollment(intent.enrollment_id, payment_id, now).await? {
            tracing::info!(
                "Confirmed enrollment {} for student {} after payment {}",
                abbrev_uuid(&confirmed.id),
                abbrev_uuid(&confirmed.student_id),
                payment_id
            );
            return Ok(EnrollmentEffect::Confirmed);
        }

        let mut enrollment = self
            .store
            .get_enrollment(intent.enrollment_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                resource: "Enrollment".to_string(),
                id: intent.enrollment_id.to_string(),
            })?;

        match enrollment.confirm(payment_id, now) {
            Ok(Confirmation::AlreadyConfirmed) => {
                tracing::debug!("Enrollment {} already confirmed", abbrev_uuid(&enrollment.id));
                Ok(EnrollmentEffect::AlreadyConfirmed)
            }
            Ok(Confirmation::Confirmed) => Err(Error::Internal {
                operation: format!("confirm enrollment {}: conditional update missed a pending row", enrollment.id),
            }),
            Err(transition) => {
                tracing::warn!(
                    "Approved payment {} arrived for enrollment {} which is {}; recording for refund review",
                    payment_id,
                    enrollment.id,
                    transition.from
                );
                let discrepancy = self
                    .store
                    .record_discrepancy(NewDiscrepancy {
                        kind: DiscrepancyKind::ApprovedPaymentForInactiveEnrollment,
                        enrollment_id: enrollment.id,
                        class_id: enrollment.class_id,
                        detail: format!("payment {payment_id} approved while enrollment was {}", transition.from),
                    })
                    .await?;
                metrics::counter!(
                    "enrollctl_discrepancies_total",
                    "kind" => DiscrepancyKind::ApprovedPaymentForInactiveEnrollment.as_str()
                )
                .increment(1);
                Ok(EnrollmentEffect::Inactive {
                    discrepancy_id: discrepancy.id,
                })
            }
        }
    }
}
