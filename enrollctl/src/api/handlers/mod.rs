//! HTTP request handlers.
//!
//! - [`enrollments`]: reserve, read and cancel enrollments
//! - [`webhooks`]: payment provider notifications
//! - [`discrepancies`]: inspection and manual repair of ledger discrepancies
//!
//! Handlers return [`crate::errors::Error`], which maps onto status codes and
//! plain-text messages.

pub mod discrepancies;
pub mod enrollments;
pub mod webhooks;
