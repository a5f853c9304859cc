//! Capacity ledger: observing a class and giving seats back.
//!
//! Reservation itself happens inside the reservation transaction through
//! [`StoreTx::reserve_if_available`](crate::store::StoreTx::reserve_if_available).
//! Release is the one write that may fail after an enrollment has already
//! changed state, so a failed release is recorded as a discrepancy instead of
//! being returned as an error.

use std::sync::Arc;

use serde::Serialize;

use crate::errors::{Error, Result};
use crate::models::{Class, DiscrepancyKind, Enrollment, NewDiscrepancy};
use crate::store::Store;
use crate::types::{ClassId, DiscrepancyId, abbrev_uuid};

/// What happened to an enrollment's seat when it left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeatRelease {
    Released,
    /// The release failed; the discrepancy will be retried by the repair task.
    Deferred { discrepancy_id: DiscrepancyId },
    /// The class had no occupied seat to give back.
    NothingHeld { discrepancy_id: DiscrepancyId },
}

pub struct CapacityLedger<S> {
    store: Arc<S>,
}

impl<S> Clone for CapacityLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> CapacityLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Current occupancy and version of a class.
    pub async fn observe(&self, class_id: ClassId) -> Result<Class> {
        self.store.get_class(class_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Class".to_string(),
            id: class_id.to_string(),
        })
    }

    /// Give back the seat held by `enrollment`, which has just left the active set.
    ///
    /// Only fails if the discrepancy itself cannot be recorded.
    pub async fn release_for(&self, enrollment: &Enrollment, reason: &str) -> Result<SeatRelease> {
        let (kind, detail) = match self.store.release_seat(enrollment.class_id).await {
            Ok(true) => {
                metrics::counter!("enrollctl_seat_releases_total", "outcome" => "released").increment(1);
                tracing::debug!(
                    "Released seat in class {} after {} of enrollment {}",
                    abbrev_uuid(&enrollment.class_id),
                    reason,
                    abbrev_uuid(&enrollment.id)
                );
                return Ok(SeatRelease::Released);
            }
            Ok(false) => {
                tracing::warn!(
                    "Class {} had no occupied seat to release for enrollment {} ({})",
                    enrollment.class_id,
                    enrollment.id,
                    reason
                );
                metrics::counter!("enrollctl_seat_releases_total", "outcome" => "nothing_held").increment(1);
                (
                    DiscrepancyKind::LedgerUnderflow,
                    format!("{reason}: occupancy was already zero"),
                )
            }
            Err(e) => {
                tracing::error!(
                    "Failed to release seat in class {} for enrollment {} ({}): {}",
                    enrollment.class_id,
                    enrollment.id,
                    reason,
                    e
                );
                metrics::counter!("enrollctl_seat_releases_total", "outcome" => "failed").increment(1);
                (DiscrepancyKind::SeatReleaseFailed, format!("{reason}: {e}"))
            }
        };

        let discrepancy = self
            .store
            .record_discrepancy(NewDiscrepancy {
                kind,
                enrollment_id: enrollment.id,
                class_id: enrollment.class_id,
                detail,
            })
            .await
            .inspect_err(|e| {
                tracing::error!(
                    "Could not record {} discrepancy for enrollment {}: {}",
                    kind.as_str(),
                    enrollment.id,
                    e
                );
            })?;
        metrics::counter!("enrollctl_discrepancies_total", "kind" => kind.as_str()).increment(1);

        Ok(match kind {
            DiscrepancyKind::LedgerUnderflow => SeatRelease::NothingHeld {
                discrepancy_id: discrepancy.id,
            },
            _ => SeatRelease::Deferred {
                discrepancy_id: discrepancy.id,
            },
        })
    }
}
