//! In-memory store.
//!
//! All records live behind one `RwLock`. The reserve-if-available write takes
//! a per-class async lock that the transaction holds until it commits or is
//! dropped, so a concurrent reserver waits and then re-evaluates the version
//! and capacity predicate, the same way a Postgres row lock behaves. Data is
//! lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use super::{ACTIVE_ENROLLMENT_INDEX, Administration, DbError, Result, Store, StoreTx};
use crate::models::{
    Class, Discrepancy, DiscrepancyKind, Enrollment, EnrollmentStatus, NewClass, NewDiscrepancy, PaymentIntent, PaymentStatus, ReserveOutcome,
    User,
};
use crate::types::{ClassId, DiscrepancyId, EnrollmentId, PaymentIntentId, UserId};

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    classes: HashMap<ClassId, Class>,
    enrollments: HashMap<EnrollmentId, Enrollment>,
    intents: HashMap<PaymentIntentId, PaymentIntent>,
    discrepancies: HashMap<DiscrepancyId, Discrepancy>,
}

impl State {
    fn has_active_enrollment(&self, student_id: UserId, class_id: ClassId) -> bool {
        self.enrollments
            .values()
            .any(|e| e.student_id == student_id && e.class_id == class_id && e.status.is_active())
    }
}

/// In-memory implementation of [`Store`] and [`Administration`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    class_locks: Arc<Mutex<HashMap<ClassId, Arc<tokio::sync::Mutex<()>>>>>,
    release_failures: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` seat releases fail with a storage error.
    pub fn fail_next_seat_releases(&self, count: usize) {
        self.release_failures.store(count, Ordering::SeqCst);
    }

    fn class_lock(&self, class_id: ClassId) -> Arc<tokio::sync::Mutex<()>> {
        self.class_locks.lock().entry(class_id).or_default().clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.release_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn open_discrepancies(&self, keep: impl Fn(&Discrepancy) -> bool, limit: usize) -> Vec<Discrepancy> {
        let state = self.state.read();
        let mut open: Vec<Discrepancy> = state
            .discrepancies
            .values()
            .filter(|d| d.resolved_at.is_none() && keep(d))
            .cloned()
            .collect();
        open.sort_by_key(|d| d.created_at);
        open.truncate(limit);
        open
    }

    fn update_enrollment(
        &self,
        id: EnrollmentId,
        apply: impl FnOnce(&mut Enrollment) -> bool,
    ) -> Option<Enrollment> {
        let mut state = self.state.write();
        let enrollment = state.enrollments.get_mut(&id)?;
        let mut candidate = enrollment.clone();
        if !apply(&mut candidate) {
            return None;
        }
        *enrollment = candidate.clone();
        Some(candidate)
    }
}

fn active_enrollment_violation() -> DbError {
    DbError::UniqueViolation {
        constraint: Some(ACTIVE_ENROLLMENT_INDEX.to_string()),
        table: Some("enrollments".to_string()),
        message: "student already holds an active enrollment for this class".to_string(),
    }
}

fn unique_violation(constraint: &str, table: &str) -> DbError {
    DbError::UniqueViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("duplicate key violates {constraint}"),
    }
}

fn missing_reference(constraint: &str, table: &str) -> DbError {
    DbError::ForeignKeyViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("referenced row missing for {constraint}"),
    }
}

impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx> {
        Ok(InMemoryTx {
            store: self.clone(),
            held: None,
            enrollments: Vec::new(),
            intents: Vec::new(),
        })
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.state.read().users.get(&id).cloned())
    }

    async fn get_class(&self, id: ClassId) -> Result<Option<Class>> {
        Ok(self.state.read().classes.get(&id).cloned())
    }

    async fn get_enrollment(&self, id: EnrollmentId) -> Result<Option<Enrollment>> {
        Ok(self.state.read().enrollments.get(&id).cloned())
    }

    async fn find_active_enrollment(&self, student_id: UserId, class_id: ClassId) -> Result<Option<Enrollment>> {
        Ok(self
            .state
            .read()
            .enrollments
            .values()
            .find(|e| e.student_id == student_id && e.class_id == class_id && e.status.is_active())
            .cloned())
    }

    async fn get_payment_intent_for_enrollment(&self, enrollment_id: EnrollmentId) -> Result<Option<PaymentIntent>> {
        Ok(self
            .state
            .read()
            .intents
            .values()
            .find(|i| i.enrollment_id == enrollment_id)
            .cloned())
    }

    async fn find_payment_intent_by_provider_id(&self, provider_id: &str) -> Result<Option<PaymentIntent>> {
        Ok(self
            .state
            .read()
            .intents
            .values()
            .find(|i| i.provider_id == provider_id)
            .cloned())
    }

    async fn update_payment_status(
        &self,
        id: PaymentIntentId,
        status: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<PaymentIntent>> {
        let mut state = self.state.write();
        let intent = state.intents.get_mut(&id).ok_or(DbError::NotFound)?;
        if !intent.status.can_become(status) {
            return Ok(None);
        }
        intent.status = status;
        intent.updated_at = at;
        Ok(Some(intent.clone()))
    }

    async fn confirm_enrollment(
        &self,
        id: EnrollmentId,
        provider_payment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Enrollment>> {
        Ok(self.update_enrollment(id, |e| {
            e.status == EnrollmentStatus::Pending && e.confirm(provider_payment_id, at).is_ok()
        }))
    }

    async fn cancel_enrollment(&self, id: EnrollmentId, at: DateTime<Utc>) -> Result<Option<Enrollment>> {
        Ok(self.update_enrollment(id, |e| e.cancel(at).is_ok()))
    }

    async fn expire_enrollment(&self, id: EnrollmentId, at: DateTime<Utc>) -> Result<Option<Enrollment>> {
        Ok(self.update_enrollment(id, |e| e.expire(at).is_ok()))
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>> {
        let state = self.state.read();
        let mut stale: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.status == EnrollmentStatus::Pending && e.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|e| e.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn release_seat(&self, class_id: ClassId) -> Result<bool> {
        let _guard = self.class_lock(class_id).lock_owned().await;
        if self.take_injected_failure() {
            return Err(DbError::Other(anyhow!("injected seat release failure")));
        }
        let mut state = self.state.write();
        let class = state.classes.get_mut(&class_id).ok_or(DbError::NotFound)?;
        Ok(class.release(Utc::now()))
    }

    async fn record_discrepancy(&self, discrepancy: NewDiscrepancy) -> Result<Discrepancy> {
        let record = Discrepancy::open(discrepancy, Utc::now());
        self.state.write().discrepancies.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_open_discrepancies(&self, limit: usize) -> Result<Vec<Discrepancy>> {
        Ok(self.open_discrepancies(|_| true, limit))
    }

    async fn list_open_discrepancies_of_kind(&self, kind: DiscrepancyKind, limit: usize) -> Result<Vec<Discrepancy>> {
        Ok(self.open_discrepancies(|d| d.kind == kind, limit))
    }

    async fn record_repair_failure(&self, id: DiscrepancyId, error: &str) -> Result<()> {
        let mut state = self.state.write();
        let discrepancy = state.discrepancies.get_mut(&id).ok_or(DbError::NotFound)?;
        discrepancy.attempts += 1;
        discrepancy.last_error = Some(error.to_string());
        Ok(())
    }

    async fn resolve_discrepancy(&self, id: DiscrepancyId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write();
        let discrepancy = state.discrepancies.get_mut(&id).ok_or(DbError::NotFound)?;
        if discrepancy.resolved_at.is_some() {
            return Ok(false);
        }
        discrepancy.attempts += 1;
        discrepancy.resolved_at = Some(at);
        Ok(true)
    }
}

impl Administration for InMemoryStore {
    async fn create_user(&self, user: &User) -> Result<()> {
        let mut state = self.state.write();
        if state.users.contains_key(&user.id) {
            return Err(unique_violation("users_pkey", "users"));
        }
        if state.users.values().any(|u| u.email == user.email) {
            return Err(unique_violation("users_email_key", "users"));
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn create_class(&self, class: NewClass) -> Result<Class> {
        if class.capacity < 0 {
            return Err(DbError::CheckViolation {
                constraint: Some("classes_occupancy_within_capacity".to_string()),
                table: Some("classes".to_string()),
                message: "capacity must not be negative".to_string(),
            });
        }
        let class = Class::new(class);
        self.state.write().classes.insert(class.id, class.clone());
        Ok(class)
    }
}

struct HeldSeat {
    class_id: ClassId,
    expected_version: i64,
    _lock: OwnedMutexGuard<()>,
}

/// Staged writes applied atomically on commit. Dropping discards them and
/// releases the class lock.
pub struct InMemoryTx {
    store: InMemoryStore,
    held: Option<HeldSeat>,
    enrollments: Vec<Enrollment>,
    intents: Vec<PaymentIntent>,
}

impl InMemoryTx {
    fn staged_enrollment(&self, id: EnrollmentId) -> bool {
        self.enrollments.iter().any(|e| e.id == id)
    }
}

impl StoreTx for InMemoryTx {
    async fn reserve_if_available(&mut self, class_id: ClassId, expected_version: i64) -> Result<ReserveOutcome> {
        if self.held.is_some() {
            return Err(DbError::Other(anyhow!("transaction already holds a seat")));
        }
        let lock = self.store.class_lock(class_id).lock_owned().await;

        let outcome = {
            let state = self.store.state.read();
            let mut snapshot = state.classes.get(&class_id).cloned().ok_or(DbError::NotFound)?;
            snapshot.try_reserve(expected_version, Utc::now())
        };
        if let ReserveOutcome::Reserved { .. } = outcome {
            self.held = Some(HeldSeat {
                class_id,
                expected_version,
                _lock: lock,
            });
        }
        Ok(outcome)
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> Result<()> {
        {
            let state = self.store.state.read();
            if !state.users.contains_key(&enrollment.student_id) {
                return Err(missing_reference("enrollments_student_id_fkey", "enrollments"));
            }
            if !state.classes.contains_key(&enrollment.class_id) {
                return Err(missing_reference("enrollments_class_id_fkey", "enrollments"));
            }
            if state.enrollments.contains_key(&enrollment.id) || self.staged_enrollment(enrollment.id) {
                return Err(unique_violation("enrollments_pkey", "enrollments"));
            }
            if enrollment.status.is_active() && state.has_active_enrollment(enrollment.student_id, enrollment.class_id) {
                return Err(active_enrollment_violation());
            }
        }
        let staged_duplicate = self.enrollments.iter().any(|e| {
            e.student_id == enrollment.student_id && e.class_id == enrollment.class_id && e.status.is_active()
        });
        if staged_duplicate && enrollment.status.is_active() {
            return Err(active_enrollment_violation());
        }
        self.enrollments.push(enrollment.clone());
        Ok(())
    }

    async fn insert_payment_intent(&mut self, intent: &PaymentIntent) -> Result<()> {
        let state = self.store.state.read();
        if !state.enrollments.contains_key(&intent.enrollment_id) && !self.staged_enrollment(intent.enrollment_id) {
            return Err(missing_reference("payment_intents_enrollment_id_fkey", "payment_intents"));
        }
        let mut existing = state.intents.values().chain(self.intents.iter());
        if existing.any(|i| i.enrollment_id == intent.enrollment_id) {
            return Err(unique_violation("payment_intents_enrollment_id_key", "payment_intents"));
        }
        let mut existing = state.intents.values().chain(self.intents.iter());
        if existing.any(|i| i.provider_id == intent.provider_id) {
            return Err(unique_violation("payment_intents_provider_id_key", "payment_intents"));
        }
        drop(state);
        self.intents.push(intent.clone());
        Ok(())
    }

    async fn attach_payment_intent(&mut self, enrollment_id: EnrollmentId, payment_intent_id: PaymentIntentId) -> Result<()> {
        let enrollment = self
            .enrollments
            .iter_mut()
            .find(|e| e.id == enrollment_id)
            .ok_or(DbError::NotFound)?;
        enrollment.payment_intent_id = Some(payment_intent_id);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut state = self.store.state.write();

        for enrollment in &self.enrollments {
            if enrollment.status.is_active() && state.has_active_enrollment(enrollment.student_id, enrollment.class_id) {
                return Err(active_enrollment_violation());
            }
        }
        if let Some(held) = &self.held {
            let class = state.classes.get_mut(&held.class_id).ok_or(DbError::NotFound)?;
            if class.try_reserve(held.expected_version, Utc::now()) == ReserveOutcome::Conflict {
                return Err(DbError::Other(anyhow!("class {} changed under a held seat", held.class_id)));
            }
        }
        for enrollment in self.enrollments {
            state.enrollments.insert(enrollment.id, enrollment);
        }
        for intent in self.intents {
            state.intents.insert(intent.id, intent);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
