//! Classes and the pure rules of the capacity ledger.
//!
//! A class's `occupancy` only moves through [`Class::try_reserve`] and
//! [`Class::release`] (or their SQL equivalents in the Postgres store), and
//! every committed change bumps `version`.

use crate::types::ClassId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Class {
    pub id: ClassId,
    pub title: String,
    pub description: String,
    pub capacity: i32,
    pub occupancy: i32,
    pub price_cents: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrative request for creating a class.
#[derive(Debug, Clone)]
pub struct NewClass {
    pub title: String,
    pub description: String,
    pub capacity: i32,
    pub price_cents: i64,
}

/// Result of the reserve-if-available primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The seat is held; `version` is the class version after the increment.
    Reserved { version: i64 },
    /// The version moved or the class filled up since it was observed.
    Conflict,
}

impl Class {
    pub fn new(request: NewClass) -> Self {
        let now = Utc::now();
        Self {
            id: ClassId::new_v4(),
            title: request.title,
            description: request.description,
            capacity: request.capacity,
            occupancy: 0,
            price_cents: request.price_cents,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_available_seat(&self) -> bool {
        self.occupancy < self.capacity
    }

    pub fn available_seats(&self) -> i32 {
        (self.capacity - self.occupancy).max(0)
    }

    /// Compare-and-swap on version combined with the capacity predicate.
    pub fn try_reserve(&mut self, expected_version: i64, at: DateTime<Utc>) -> ReserveOutcome {
        if self.version != expected_version || !self.has_available_seat() {
            return ReserveOutcome::Conflict;
        }
        self.occupancy += 1;
        self.version += 1;
        self.updated_at = at;
        ReserveOutcome::Reserved { version: self.version }
    }

    /// Returns false when there was nothing to release.
    pub fn release(&mut self, at: DateTime<Utc>) -> bool {
        if self.occupancy <= 0 {
            return false;
        }
        self.occupancy -= 1;
        self.version += 1;
        self.updated_at = at;
        true
    }
}
