//! Request payloads. Identifiers arrive as strings and are parsed explicitly so
//! that a malformed id is a validation error rather than an extractor rejection.

use serde::Deserialize;

use crate::errors::Result;
use crate::types::{ClassId, UserId, parse_id};

/// Default and maximum page sizes for discrepancy listings.
pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveRequest {
    pub student_id: String,
    pub class_id: String,
}

impl ReserveRequest {
    pub fn ids(&self) -> Result<(UserId, ClassId)> {
        Ok((parse_id("student_id", &self.student_id)?, parse_id("class_id", &self.class_id)?))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}
