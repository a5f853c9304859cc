//! HTTP surface.
//!
//! - **[`handlers`]**: axum route handlers, generic over the [`Store`](crate::store::Store) backend
//! - **[`models`]**: request bodies and query parameters
//!
//! Routes are assembled in [`crate::build_router`].

pub mod handlers;
pub mod models;
