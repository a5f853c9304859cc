//! Common type definitions.
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`UserId`]: participant (student, instructor or admin) identifier
//! - [`ClassId`]: class identifier, the unit of capacity
//! - [`EnrollmentId`]: enrollment identifier, also used as the payment provider's external reference
//! - [`PaymentIntentId`]: internal payment intent identifier
//! - [`DiscrepancyId`]: reconciliation discrepancy identifier

use uuid::Uuid;

pub type UserId = Uuid;
pub type ClassId = Uuid;
pub type EnrollmentId = Uuid;
pub type PaymentIntentId = Uuid;
pub type DiscrepancyId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Parse a caller-supplied identifier, naming the field on failure.
pub fn parse_id(field: &'static str, raw: &str) -> Result<Uuid, crate::errors::Error> {
    Uuid::parse_str(raw.trim()).map_err(|_| crate::errors::Error::Validation {
        message: format!("{field} must be a UUID, got '{raw}'"),
    })
}
