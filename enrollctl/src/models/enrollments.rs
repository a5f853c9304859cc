//! Enrollment records and their state machine.
//!
//! ```text
//! pending ──confirm──▶ confirmed ──cancel──▶ cancelled
//!    │
//!    └──expire──▶ expired
//! ```
//!
//! Only the webhook reconciler confirms, only the cancellation coordinator
//! cancels, and only the expiry sweeper expires.

use crate::types::{ClassId, EnrollmentId, PaymentIntentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enrollment status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl EnrollmentStatus {
    /// Statuses covered by the one-per-(student, class) uniqueness rule.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("enrollment cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
}

/// What a confirmation attempt did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    /// Already past pending through a confirmation; replays land here.
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub student_id: UserId,
    pub class_id: ClassId,
    pub payment_intent_id: Option<PaymentIntentId>,
    pub provider_payment_id: Option<String>,
    pub status: EnrollmentStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn pending(id: EnrollmentId, student_id: UserId, class_id: ClassId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            student_id,
            class_id,
            payment_intent_id: None,
            provider_payment_id: None,
            status: EnrollmentStatus::Pending,
            created_at: at,
            confirmed_at: None,
            cancelled_at: None,
            expired_at: None,
        }
    }

    /// Confirm with the provider's payment id. Confirming a record that was
    /// already confirmed (including one since cancelled) changes nothing.
    pub fn confirm(&mut self, provider_payment_id: &str, at: DateTime<Utc>) -> Result<Confirmation, TransitionError> {
        match self.status {
            EnrollmentStatus::Pending => {
                self.status = EnrollmentStatus::Confirmed;
                self.provider_payment_id = Some(provider_payment_id.to_string());
                self.confirmed_at = Some(at);
                Ok(Confirmation::Confirmed)
            }
            // Cancelled is only reachable from confirmed, so this payment was already applied.
            EnrollmentStatus::Confirmed | EnrollmentStatus::Cancelled => Ok(Confirmation::AlreadyConfirmed),
            EnrollmentStatus::Expired => Err(self.illegal(EnrollmentStatus::Confirmed)),
        }
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != EnrollmentStatus::Confirmed {
            return Err(self.illegal(EnrollmentStatus::Cancelled));
        }
        self.status = EnrollmentStatus::Cancelled;
        self.cancelled_at = Some(at);
        Ok(())
    }

    pub fn expire(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != EnrollmentStatus::Pending {
            return Err(self.illegal(EnrollmentStatus::Expired));
        }
        self.status = EnrollmentStatus::Expired;
        self.expired_at = Some(at);
        Ok(())
    }

    fn illegal(&self, to: EnrollmentStatus) -> TransitionError {
        TransitionError { from: self.status, to }
    }
}
