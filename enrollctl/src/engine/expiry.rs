//! Expires pending enrollments whose payment never arrived, freeing their seats.
//!
//! Disabled unless `expiry.pending_ttl` is configured. Expiry is a
//! conditional update on `status = 'pending'`, so it loses cleanly to a
//! confirmation that lands first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::ledger::CapacityLedger;
use crate::errors::Result;
use crate::store::Store;
use crate::types::abbrev_uuid;

pub struct ExpirySweeper<S> {
    store: Arc<S>,
    ledger: CapacityLedger<S>,
    ttl: chrono::Duration,
    batch_size: usize,
}

impl<S: Store> ExpirySweeper<S> {
    pub fn new(store: Arc<S>, ttl: Duration, batch_size: usize) -> Self {
        Self {
            ledger: CapacityLedger::new(store.clone()),
            store,
            // Out-of-range ttls never expire anything.
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            batch_size,
        }
    }

    /// Expire one batch of stale pending enrollments.
    ///
    /// # Returns
    /// How many enrollments were expired.
    #[instrument(skip(self), err)]
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let Some(cutoff) = now.checked_sub_signed(self.ttl) else {
            return Ok(0);
        };
        let stale = self.store.list_stale_pending(cutoff, self.batch_size).await?;
        let mut expired = 0;
        for candidate in stale {
            let Some(enrollment) = self.store.expire_enrollment(candidate.id, now).await? else {
                tracing::debug!("Enrollment {} left pending before expiry", abbrev_uuid(&candidate.id));
                continue;
            };
            self.ledger.release_for(&enrollment, "expiry").await?;
            metrics::counter!("enrollctl_expired_enrollments_total").increment(1);
            expired += 1;
        }
        if expired > 0 {
            tracing::info!("Expired {} pending enrollments older than {}", expired, self.ttl);
        }
        Ok(expired)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Expiry sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }
    }
}
