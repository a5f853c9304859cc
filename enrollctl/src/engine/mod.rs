//! The enrollment engine: reservation, payment reconciliation, cancellation
//! and the background tasks that keep the seat ledger honest.

pub mod cancellation;
pub mod expiry;
pub mod ledger;
pub mod reconciler;
pub mod repair;
pub mod reservation;
pub mod retry;

use std::sync::Arc;

pub use cancellation::{Cancellation, CancellationCoordinator};
pub use expiry::ExpirySweeper;
pub use ledger::{CapacityLedger, SeatRelease};
pub use reconciler::{EnrollmentEffect, IgnoreReason, ReconcileOutcome, WebhookReconciler};
pub use repair::{DiscrepancyRepairer, RepairSummary};
pub use reservation::{Reservation, ReservationCoordinator};
pub use retry::RetryPolicy;

use crate::config::Config;
use crate::payment_providers::PaymentProvider;
use crate::store::Store;

/// All coordinators, sharing one store and one payment provider.
pub struct Engine<S> {
    store: Arc<S>,
    pub reservations: ReservationCoordinator<S>,
    pub reconciler: WebhookReconciler<S>,
    pub cancellations: CancellationCoordinator<S>,
    pub repair: DiscrepancyRepairer<S>,
    /// `None` when no pending ttl is configured.
    pub expiry: Option<ExpirySweeper<S>>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, provider: Arc<dyn PaymentProvider>, config: &Config) -> Self {
        Self {
            reservations: ReservationCoordinator::new(
                store.clone(),
                provider.clone(),
                &config.reservation,
                &config.checkout,
            ),
            reconciler: WebhookReconciler::new(store.clone(), provider),
            cancellations: CancellationCoordinator::new(store.clone()),
            repair: DiscrepancyRepairer::new(store.clone(), config.repair.batch_size),
            expiry: config
                .expiry
                .pending_ttl
                .map(|ttl| ExpirySweeper::new(store.clone(), ttl, config.expiry.batch_size)),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
