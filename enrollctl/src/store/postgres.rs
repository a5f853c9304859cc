//! PostgreSQL store.
//!
//! The reserve-if-available primitive is one conditional `UPDATE` evaluated
//! server-side; the row lock it takes is held until the surrounding
//! transaction commits or rolls back. Active-enrollment uniqueness is
//! enforced by the partial unique index [`ACTIVE_ENROLLMENT_INDEX`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::instrument;

use super::{ACTIVE_ENROLLMENT_INDEX, Administration, DbError, Result, Store, StoreTx};
use crate::models::{
    Class, Discrepancy, DiscrepancyKind, Enrollment, NewClass, NewDiscrepancy, PaymentIntent, PaymentStatus, ReserveOutcome, User,
};
use crate::types::{ClassId, DiscrepancyId, EnrollmentId, PaymentIntentId, UserId, abbrev_uuid};

const ENROLLMENT_COLUMNS: &str = "id, student_id, class_id, payment_intent_id, provider_payment_id, status, \
     created_at, confirmed_at, cancelled_at, expired_at";
const INTENT_COLUMNS: &str = "id, enrollment_id, provider_id, amount_cents, status, redirect_url, created_at, updated_at";
const CLASS_COLUMNS: &str = "id, title, description, capacity, occupancy, price_cents, version, created_at, updated_at";
const DISCREPANCY_COLUMNS: &str =
    "id, kind, enrollment_id, class_id, detail, attempts, last_error, created_at, resolved_at";

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Store for PostgresStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx> {
        Ok(PostgresTx {
            tx: self.pool.begin().await?,
        })
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT id, name, email, role, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_class(&self, id: ClassId) -> Result<Option<Class>> {
        let class = sqlx::query_as::<_, Class>(&format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(class)
    }

    async fn get_enrollment(&self, id: EnrollmentId) -> Result<Option<Enrollment>> {
        let enrollment =
            sqlx::query_as::<_, Enrollment>(&format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(enrollment)
    }

    async fn find_active_enrollment(&self, student_id: UserId, class_id: ClassId) -> Result<Option<Enrollment>> {
        let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
             WHERE student_id = $1 AND class_id = $2 AND status IN ('pending', 'confirmed')"
        ))
        .bind(student_id)
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enrollment)
    }

    async fn get_payment_intent_for_enrollment(&self, enrollment_id: EnrollmentId) -> Result<Option<PaymentIntent>> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE enrollment_id = $1"
        ))
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(intent)
    }

    async fn find_payment_intent_by_provider_id(&self, provider_id: &str) -> Result<Option<PaymentIntent>> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE provider_id = $1"
        ))
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(intent)
    }

    #[instrument(skip(self), fields(intent_id = %abbrev_uuid(&id)), err)]
    async fn update_payment_status(
        &self,
        id: PaymentIntentId,
        status: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<PaymentIntent>> {
        let updated = sqlx::query_as::<_, PaymentIntent>(&format!(
            "UPDATE payment_intents SET status = $2, updated_at = $3
             WHERE id = $1 AND (status <> 'approved' OR $2 = 'approved')
             RETURNING {INTENT_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM payment_intents WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(DbError::NotFound);
            }
        }
        Ok(updated)
    }

    #[instrument(skip(self), fields(enrollment_id = %abbrev_uuid(&id)), err)]
    async fn confirm_enrollment(
        &self,
        id: EnrollmentId,
        provider_payment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Enrollment>> {
        let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
            "UPDATE enrollments SET status = 'confirmed', provider_payment_id = $2, confirmed_at = $3
             WHERE id = $1 AND status = 'pending'
             RETURNING {ENROLLMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(provider_payment_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enrollment)
    }

    #[instrument(skip(self), fields(enrollment_id = %abbrev_uuid(&id)), err)]
    async fn cancel_enrollment(&self, id: EnrollmentId, at: DateTime<Utc>) -> Result<Option<Enrollment>> {
        let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
            "UPDATE enrollments SET status = 'cancelled', cancelled_at = $2
             WHERE id = $1 AND status = 'confirmed'
             RETURNING {ENROLLMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enrollment)
    }

    #[instrument(skip(self), fields(enrollment_id = %abbrev_uuid(&id)), err)]
    async fn expire_enrollment(&self, id: EnrollmentId, at: DateTime<Utc>) -> Result<Option<Enrollment>> {
        let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
            "UPDATE enrollments SET status = 'expired', expired_at = $2
             WHERE id = $1 AND status = 'pending'
             RETURNING {ENROLLMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enrollment)
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>> {
        let stale = sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
             WHERE status = 'pending' AND created_at < $1
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(created_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(stale)
    }

    #[instrument(skip(self), fields(class_id = %abbrev_uuid(&class_id)), err)]
    async fn release_seat(&self, class_id: ClassId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE classes SET occupancy = occupancy - 1, version = version + 1, updated_at = NOW()
             WHERE id = $1 AND occupancy > 0",
        )
        .bind(class_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM classes WHERE id = $1)")
                .bind(class_id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(DbError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self, discrepancy), fields(kind = discrepancy.kind.as_str()), err)]
    async fn record_discrepancy(&self, discrepancy: NewDiscrepancy) -> Result<Discrepancy> {
        let record = Discrepancy::open(discrepancy, Utc::now());
        let stored = sqlx::query_as::<_, Discrepancy>(&format!(
            "INSERT INTO reconciliation_discrepancies (id, kind, enrollment_id, class_id, detail, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {DISCREPANCY_COLUMNS}"
        ))
        .bind(record.id)
        .bind(record.kind)
        .bind(record.enrollment_id)
        .bind(record.class_id)
        .bind(&record.detail)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn list_open_discrepancies(&self, limit: usize) -> Result<Vec<Discrepancy>> {
        let open = sqlx::query_as::<_, Discrepancy>(&format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM reconciliation_discrepancies
             WHERE resolved_at IS NULL
             ORDER BY created_at ASC
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(open)
    }

    async fn list_open_discrepancies_of_kind(&self, kind: DiscrepancyKind, limit: usize) -> Result<Vec<Discrepancy>> {
        let open = sqlx::query_as::<_, Discrepancy>(&format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM reconciliation_discrepancies
             WHERE resolved_at IS NULL AND kind = $1
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(kind)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(open)
    }

    async fn record_repair_failure(&self, id: DiscrepancyId, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE reconciliation_discrepancies SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn resolve_discrepancy(&self, id: DiscrepancyId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE reconciliation_discrepancies SET attempts = attempts + 1, resolved_at = $2
             WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists =
                sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM reconciliation_discrepancies WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?;
            if !exists {
                return Err(DbError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }
}

impl Administration for PostgresStore {
    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO users (id, name, email, role, created_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(user.id)
            .bind(&user.name)
            .bind(&user.email)
            .bind(user.role)
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_class(&self, class: NewClass) -> Result<Class> {
        let class = Class::new(class);
        let stored = sqlx::query_as::<_, Class>(&format!(
            "INSERT INTO classes (id, title, description, capacity, occupancy, price_cents, version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, $5, 0, $6, $6)
             RETURNING {CLASS_COLUMNS}"
        ))
        .bind(class.id)
        .bind(&class.title)
        .bind(&class.description)
        .bind(class.capacity)
        .bind(class.price_cents)
        .bind(class.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }
}

/// Reservation transaction. Dropping it without [`StoreTx::commit`] rolls back.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl StoreTx for PostgresTx {
    #[instrument(skip(self), fields(class_id = %abbrev_uuid(&class_id)), err)]
    async fn reserve_if_available(&mut self, class_id: ClassId, expected_version: i64) -> Result<ReserveOutcome> {
        let version = sqlx::query_scalar::<_, i64>(
            "UPDATE classes SET occupancy = occupancy + 1, version = version + 1, updated_at = NOW()
             WHERE id = $1 AND version = $2 AND occupancy < capacity
             RETURNING version",
        )
        .bind(class_id)
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(match version {
            Some(version) => ReserveOutcome::Reserved { version },
            None => ReserveOutcome::Conflict,
        })
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> Result<()> {
        sqlx::query(
            "INSERT INTO enrollments (id, student_id, class_id, payment_intent_id, provider_payment_id, status,
                                      created_at, confirmed_at, cancelled_at, expired_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(enrollment.id)
        .bind(enrollment.student_id)
        .bind(enrollment.class_id)
        .bind(enrollment.payment_intent_id)
        .bind(&enrollment.provider_payment_id)
        .bind(enrollment.status)
        .bind(enrollment.created_at)
        .bind(enrollment.confirmed_at)
        .bind(enrollment.cancelled_at)
        .bind(enrollment.expired_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            let err = DbError::from(e);
            if err.violates(ACTIVE_ENROLLMENT_INDEX) {
                tracing::debug!(
                    "Active enrollment already exists for student {} in class {}",
                    abbrev_uuid(&enrollment.student_id),
                    abbrev_uuid(&enrollment.class_id)
                );
            }
            err
        })?;
        Ok(())
    }

    async fn insert_payment_intent(&mut self, intent: &PaymentIntent) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_intents (id, enrollment_id, provider_id, amount_cents, status, redirect_url,
                                          created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(intent.id)
        .bind(intent.enrollment_id)
        .bind(&intent.provider_id)
        .bind(intent.amount_cents)
        .bind(intent.status)
        .bind(&intent.redirect_url)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn attach_payment_intent(&mut self, enrollment_id: EnrollmentId, payment_intent_id: PaymentIntentId) -> Result<()> {
        let result = sqlx::query("UPDATE enrollments SET payment_intent_id = $2 WHERE id = $1")
            .bind(enrollment_id)
            .bind(payment_intent_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
