//! Retries deferred seat releases.
//!
//! Only [`DiscrepancyKind::SeatReleaseFailed`] is selected, so open review
//! items never take up room in a repair batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::Result;
use crate::models::{Discrepancy, DiscrepancyKind};
use crate::store::Store;
use crate::types::abbrev_uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub repaired: usize,
    pub failed: usize,
}

pub struct DiscrepancyRepairer<S> {
    store: Arc<S>,
    batch_size: usize,
}

impl<S: Store> DiscrepancyRepairer<S> {
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One pass over up to `limit` open deferred releases.
    #[instrument(skip(self), err)]
    pub async fn repair(&self, limit: usize) -> Result<RepairSummary> {
        let mut summary = RepairSummary::default();
        let pending = self
            .store
            .list_open_discrepancies_of_kind(DiscrepancyKind::SeatReleaseFailed, limit)
            .await?;
        for discrepancy in pending {
            if self.repair_one(&discrepancy).await? {
                summary.repaired += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.repaired > 0 || summary.failed > 0 {
            tracing::info!("Repair pass: {} repaired, {} failed", summary.repaired, summary.failed);
        }
        Ok(summary)
    }

    async fn repair_one(&self, discrepancy: &Discrepancy) -> Result<bool> {
        match self.store.release_seat(discrepancy.class_id).await {
            Ok(true) => {
                self.store.resolve_discrepancy(discrepancy.id, Utc::now()).await?;
                metrics::counter!("enrollctl_seat_releases_total", "outcome" => "repaired").increment(1);
                tracing::debug!(
                    "Released deferred seat in class {} for enrollment {}",
                    abbrev_uuid(&discrepancy.class_id),
                    abbrev_uuid(&discrepancy.enrollment_id)
                );
                Ok(true)
            }
            Ok(false) => {
                // Someone already gave the seat back; nothing is owed.
                tracing::warn!(
                    "Class {} had no occupied seat for deferred release {}, resolving",
                    discrepancy.class_id,
                    discrepancy.id
                );
                self.store.resolve_discrepancy(discrepancy.id, Utc::now()).await?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    "Deferred seat release {} failed again (attempt {}): {}",
                    discrepancy.id,
                    discrepancy.attempts + 1,
                    e
                );
                self.store.record_repair_failure(discrepancy.id, &e.to_string()).await?;
                Ok(false)
            }
        }
    }

    /// Run repair passes every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Discrepancy repair task shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.repair(self.batch_size).await {
                        tracing::error!("Discrepancy repair pass failed: {}", e);
                    }
                }
            }
        }
    }
}
