use crate::models::EnrollmentStatus;
use crate::payment_providers::PaymentError;
use crate::store::DbError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed identifier or request field, rejected before any side effect
    #[error("{message}")]
    Validation { message: String },

    /// The class is full
    #[error("Class {class_id} has no seats available")]
    NoSeatsAvailable { class_id: String },

    /// The student already holds a pending or confirmed enrollment for the class
    #[error("Student {student_id} is already enrolled in class {class_id}")]
    AlreadyEnrolled { student_id: String, class_id: String },

    /// The participant is not allowed to enroll
    #[error("User {user_id} cannot enroll: {reason}")]
    InvalidParticipant { user_id: String, reason: String },

    /// The reservation kept losing the optimistic update race
    #[error("Reservation still conflicting after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The reservation transaction ran past its deadline and was rolled back
    #[error("Reservation did not finish within {deadline_ms}ms")]
    DeadlineExceeded { deadline_ms: u128 },

    /// External payment provider failure
    #[error(transparent)]
    PaymentProvider(#[from] PaymentError),

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Illegal state transition
    #[error("Enrollment {enrollment_id} is {status}, expected {expected}")]
    InvalidState {
        enrollment_id: String,
        status: EnrollmentStatus,
        expected: EnrollmentStatus,
    },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::InvalidParticipant { .. } => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::NoSeatsAvailable { .. } | Error::AlreadyEnrolled { .. } | Error::InvalidState { .. } => {
                StatusCode::CONFLICT
            }
            Error::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::PaymentProvider(PaymentError::InvalidSignature | PaymentError::InvalidData(_)) => StatusCode::BAD_REQUEST,
            Error::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Transient failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Exhausted { .. }
                | Error::DeadlineExceeded { .. }
                | Error::PaymentProvider(PaymentError::ProviderApi(_) | PaymentError::Timeout)
        )
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message } => message.clone(),
            Error::NoSeatsAvailable { .. } => "No seats available in this class".to_string(),
            Error::AlreadyEnrolled { .. } => "You are already enrolled in this class".to_string(),
            Error::InvalidParticipant { reason, .. } => reason.clone(),
            Error::Exhausted { .. } => "The class is busy right now, please try again".to_string(),
            Error::DeadlineExceeded { .. } => "The reservation took too long, please try again".to_string(),
            Error::PaymentProvider(PaymentError::InvalidSignature) => "Invalid webhook signature".to_string(),
            Error::PaymentProvider(PaymentError::InvalidData(_)) => "Invalid payment notification".to_string(),
            Error::PaymentProvider(_) => "Payment provider unavailable, please try again".to_string(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::InvalidState { status, expected, .. } => {
                format!("Enrollment is {status}, only {expected} enrollments can be changed this way")
            }
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) | Error::PaymentProvider(_) => {
                tracing::warn!("Dependency error: {}", self);
            }
            Error::Exhausted { .. } | Error::DeadlineExceeded { .. } => {
                tracing::warn!("Transient reservation failure: {}", self);
            }
            Error::InvalidParticipant { .. } | Error::NoSeatsAvailable { .. } | Error::AlreadyEnrolled { .. } => {
                tracing::info!("Enrollment rejected: {}", self);
            }
            Error::Validation { .. } | Error::NotFound { .. } | Error::InvalidState { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let mut response = (status, self.user_message()).into_response();
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rejections_are_conflicts() {
        let err = Error::NoSeatsAvailable { class_id: "c".into() };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(!err.is_retryable());

        let err = Error::InvalidState {
            enrollment_id: "e".into(),
            status: EnrollmentStatus::Pending,
            expected: EnrollmentStatus::Confirmed,
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.user_message().contains("pending"));
    }

    #[test]
    fn exhaustion_is_retryable() {
        let err = Error::Exhausted { attempts: 5 };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_retryable());
        let response = err.into_response();
        assert!(response.headers().contains_key(axum::http::header::RETRY_AFTER));
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = Error::Database(DbError::Other(anyhow::anyhow!("connection refused on 10.0.0.3")));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.user_message().contains("10.0.0.3"));
    }
}
