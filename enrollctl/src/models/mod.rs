//! Domain records persisted by the store.
//!
//! Status transitions live on the records themselves so that every store
//! backend and coordinator applies the same rules.

pub mod classes;
pub mod discrepancies;
pub mod enrollments;
pub mod payment_intents;
pub mod users;

pub use classes::{Class, NewClass, ReserveOutcome};
pub use discrepancies::{Discrepancy, DiscrepancyKind, NewDiscrepancy};
pub use enrollments::{Confirmation, Enrollment, EnrollmentStatus, TransitionError};
pub use payment_intents::{PaymentIntent, PaymentStatus};
pub use users::{Role, User};
