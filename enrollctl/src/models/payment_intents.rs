use crate::types::{EnrollmentId, PaymentIntentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payment status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    /// `approved` is terminal; a rejected payment may still be retried by the payer.
    pub fn can_become(self, next: PaymentStatus) -> bool {
        match self {
            PaymentStatus::Approved => next == PaymentStatus::Approved,
            PaymentStatus::Pending | PaymentStatus::Rejected => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct PaymentIntent {
    pub id: PaymentIntentId,
    pub enrollment_id: EnrollmentId,
    /// Identifier the provider returned when the intent was created
    pub provider_id: String,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub redirect_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn pending(enrollment_id: EnrollmentId, provider_id: String, amount_cents: i64, redirect_url: String) -> Self {
        let now = Utc::now();
        Self {
            id: PaymentIntentId::new_v4(),
            enrollment_id,
            provider_id,
            amount_cents,
            status: PaymentStatus::Pending,
            redirect_url,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PaymentStatus::*;

    #[test]
    fn approved_is_terminal() {
        assert!(Approved.can_become(Approved));
        assert!(!Approved.can_become(Rejected));
        assert!(!Approved.can_become(Pending));
    }

    #[test]
    fn rejected_can_still_be_approved() {
        assert!(Rejected.can_become(Approved));
        assert!(Pending.can_become(Rejected));
    }
}
