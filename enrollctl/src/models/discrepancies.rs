//! Reconciliation discrepancies: known partial failures recorded for repair.

use crate::types::{ClassId, DiscrepancyId, EnrollmentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discrepancy kind stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// The enrollment left the active set but its seat is still counted.
    SeatReleaseFailed,
    /// A release found no occupied seat to give back.
    LedgerUnderflow,
    /// The provider approved a payment for an enrollment that can no longer be confirmed.
    ApprovedPaymentForInactiveEnrollment,
}

impl DiscrepancyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SeatReleaseFailed => "seat_release_failed",
            Self::LedgerUnderflow => "ledger_underflow",
            Self::ApprovedPaymentForInactiveEnrollment => "approved_payment_for_inactive_enrollment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDiscrepancy {
    pub kind: DiscrepancyKind,
    pub enrollment_id: EnrollmentId,
    pub class_id: ClassId,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Discrepancy {
    pub id: DiscrepancyId,
    pub kind: DiscrepancyKind,
    pub enrollment_id: EnrollmentId,
    pub class_id: ClassId,
    pub detail: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Discrepancy {
    pub fn open(new: NewDiscrepancy, at: DateTime<Utc>) -> Self {
        Self {
            id: DiscrepancyId::new_v4(),
            kind: new.kind,
            enrollment_id: new.enrollment_id,
            class_id: new.class_id,
            detail: new.detail,
            attempts: 0,
            last_error: None,
            created_at: at,
            resolved_at: None,
        }
    }
}
