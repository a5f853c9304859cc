//! Storage seam for the enrollment engine.
//!
//! [`Store`] exposes the reads and single-statement conditional writes the
//! coordinators need; [`StoreTx`] is the multi-table transaction used by the
//! reservation path. Dropping a [`StoreTx`] without committing rolls it back.
//!
//! Two backends are provided: [`postgres::PostgresStore`] for production and
//! [`in_memory::InMemoryStore`] for tests and local development.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::models::{
    Class, Discrepancy, DiscrepancyKind, Enrollment, NewClass, NewDiscrepancy, PaymentIntent, PaymentStatus, ReserveOutcome, User,
};
use crate::types::{ClassId, DiscrepancyId, EnrollmentId, PaymentIntentId, UserId};

pub mod errors;
pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

pub use errors::{DbError, Result};

/// Partial unique index covering active (pending or confirmed) enrollments.
pub const ACTIVE_ENROLLMENT_INDEX: &str = "enrollments_active_student_class_unique";

/// Persistent state of classes, enrollments, payment intents and discrepancies.
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open a transaction for the reservation path.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    fn get_user(&self, id: UserId) -> impl Future<Output = Result<Option<User>>> + Send;

    fn get_class(&self, id: ClassId) -> impl Future<Output = Result<Option<Class>>> + Send;

    fn get_enrollment(&self, id: EnrollmentId) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    /// The pending or confirmed enrollment for the pair, if any.
    fn find_active_enrollment(
        &self,
        student_id: UserId,
        class_id: ClassId,
    ) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    fn get_payment_intent_for_enrollment(
        &self,
        enrollment_id: EnrollmentId,
    ) -> impl Future<Output = Result<Option<PaymentIntent>>> + Send;

    fn find_payment_intent_by_provider_id(
        &self,
        provider_id: &str,
    ) -> impl Future<Output = Result<Option<PaymentIntent>>> + Send;

    /// Set a payment intent's status unless it is already approved.
    ///
    /// # Returns
    /// The updated intent, or `None` when the stored status is terminal.
    ///
    /// # Errors
    /// - `NotFound` - if the intent doesn't exist
    fn update_payment_status(
        &self,
        id: PaymentIntentId,
        status: PaymentStatus,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<PaymentIntent>>> + Send;

    /// Conditionally move an enrollment from pending to confirmed.
    ///
    /// # Returns
    /// The confirmed enrollment, or `None` if it was not pending.
    fn confirm_enrollment(
        &self,
        id: EnrollmentId,
        provider_payment_id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    /// Conditionally move an enrollment from confirmed to cancelled.
    ///
    /// # Returns
    /// The cancelled enrollment, or `None` if it was not confirmed.
    fn cancel_enrollment(
        &self,
        id: EnrollmentId,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    /// Conditionally move an enrollment from pending to expired.
    fn expire_enrollment(
        &self,
        id: EnrollmentId,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    /// Pending enrollments created before `created_before`, oldest first.
    fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Enrollment>>> + Send;

    /// Give back one seat, guarded by occupancy > 0.
    ///
    /// # Returns
    /// `false` when the class had nothing to release.
    ///
    /// # Errors
    /// - `NotFound` - if the class doesn't exist
    fn release_seat(&self, class_id: ClassId) -> impl Future<Output = Result<bool>> + Send;

    fn record_discrepancy(&self, discrepancy: NewDiscrepancy) -> impl Future<Output = Result<Discrepancy>> + Send;

    /// Unresolved discrepancies, oldest first.
    fn list_open_discrepancies(&self, limit: usize) -> impl Future<Output = Result<Vec<Discrepancy>>> + Send;

    /// Unresolved discrepancies of one kind, oldest first.
    fn list_open_discrepancies_of_kind(
        &self,
        kind: DiscrepancyKind,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Discrepancy>>> + Send;

    /// Bump the attempt counter and remember why the repair failed.
    fn record_repair_failure(&self, id: DiscrepancyId, error: &str) -> impl Future<Output = Result<()>> + Send;

    /// # Returns
    /// `false` if the discrepancy was already resolved.
    fn resolve_discrepancy(&self, id: DiscrepancyId, at: DateTime<Utc>) -> impl Future<Output = Result<bool>> + Send;
}

/// A storage transaction spanning the class, enrollment and payment intent writes.
pub trait StoreTx: Send {
    /// Increment occupancy and version iff the stored version equals
    /// `expected_version` and a seat is free, as one conditional write.
    fn reserve_if_available(
        &mut self,
        class_id: ClassId,
        expected_version: i64,
    ) -> impl Future<Output = Result<ReserveOutcome>> + Send;

    /// # Errors
    /// - `UniqueViolation` on [`ACTIVE_ENROLLMENT_INDEX`] - if the student already holds an active enrollment
    fn insert_enrollment(&mut self, enrollment: &Enrollment) -> impl Future<Output = Result<()>> + Send;

    /// # Errors
    /// - `UniqueViolation` - if the enrollment already has an intent or the provider id is taken
    fn insert_payment_intent(&mut self, intent: &PaymentIntent) -> impl Future<Output = Result<()>> + Send;

    /// Link an enrollment written in this transaction to its payment intent.
    fn attach_payment_intent(
        &mut self,
        enrollment_id: EnrollmentId,
        payment_intent_id: PaymentIntentId,
    ) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

/// Administrative writes for users and classes.
///
/// Inventory management lives outside the engine; this seam exists for
/// seeding and tests.
pub trait Administration: Send + Sync {
    fn create_user(&self, user: &User) -> impl Future<Output = Result<()>> + Send;

    fn create_class(&self, class: NewClass) -> impl Future<Output = Result<Class>> + Send;
}
