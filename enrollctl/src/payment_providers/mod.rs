//! Payment provider abstraction layer
//!
//! This module defines the `PaymentProvider` trait which abstracts the
//! external checkout service: minting a payment intent for a reservation,
//! looking up a payment's status, and authenticating inbound notifications.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::PaymentConfig;
use crate::models::PaymentStatus;

pub mod dummy;
pub mod mercadopago;
pub mod signature;

/// Create a payment provider from configuration
///
/// This is the single point where we convert config into provider instances.
pub fn create_provider(config: PaymentConfig) -> Result<Arc<dyn PaymentProvider>> {
    Ok(match config {
        PaymentConfig::MercadoPago(mp_config) => Arc::new(mercadopago::MercadoPagoProvider::new(mp_config)?),
        PaymentConfig::Dummy(dummy_config) => Arc::new(dummy::DummyProvider::from(dummy_config)),
    })
}

/// Result type for payment provider operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Errors that can occur during payment processing
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    #[error("Payment provider did not respond in time")]
    Timeout,

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Webhook signature verification failed")]
    InvalidSignature,
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PaymentError::Timeout
        } else if err.is_decode() {
            PaymentError::InvalidData(err.to_string())
        } else {
            PaymentError::ProviderApi(err.to_string())
        }
    }
}

/// Payer-facing return URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

impl ReturnUrls {
    /// `{back_url}/success`, `{back_url}/failure` and `{back_url}/pending`.
    pub fn under(back_url: &str) -> Self {
        let base = back_url.trim_end_matches('/');
        Self {
            success: format!("{base}/success"),
            failure: format!("{base}/failure"),
            pending: format!("{base}/pending"),
        }
    }
}

/// Everything the provider needs to mint a payment intent for one seat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub title: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    /// Enrollment id; doubles as the idempotency key
    pub external_reference: String,
    pub notify_url: String,
    pub return_urls: ReturnUrls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIntent {
    pub provider_id: String,
    pub redirect_url: String,
}

/// A payment as the provider reports it.
///
/// A payment id differs from the intent's `provider_id` whenever the provider
/// creates the payment after checkout; `external_reference` ties it back to
/// the enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPayment {
    pub status: PaymentStatus,
    pub external_reference: Option<String>,
}

/// Represents an inbound payment notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Entity type, e.g. "payment"
    pub entity_type: String,
    /// e.g. "payment.created" or "payment.updated"
    pub action: String,
    /// The provider's payment id
    pub payment_id: String,
    /// Status carried by the notification, if the provider includes one
    pub status: Option<PaymentStatus>,
}

#[derive(Debug, Deserialize)]
struct WireNotification {
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    action: String,
    data: WireData,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireData {
    id: serde_json::Value,
}

/// Parse the `{type, action, data: {id}, status?}` notification body.
pub fn parse_notification(body: &str) -> Result<Notification> {
    let wire: WireNotification =
        serde_json::from_str(body).map_err(|e| PaymentError::InvalidData(format!("Malformed notification: {e}")))?;
    let payment_id = match wire.data.id {
        serde_json::Value::String(id) => id,
        serde_json::Value::Number(id) => id.to_string(),
        other => return Err(PaymentError::InvalidData(format!("Unexpected data.id: {other}"))),
    };
    if payment_id.is_empty() {
        return Err(PaymentError::InvalidData("Empty data.id".to_string()));
    }
    Ok(Notification {
        entity_type: wire.entity_type,
        action: wire.action,
        payment_id,
        status: wire.status.as_deref().map(status_from_provider),
    })
}

/// Map a provider status string onto our three-state lifecycle.
pub fn status_from_provider(raw: &str) -> PaymentStatus {
    match raw.to_ascii_lowercase().as_str() {
        "approved" => PaymentStatus::Approved,
        "rejected" | "cancelled" | "refunded" | "charged_back" => PaymentStatus::Rejected,
        _ => PaymentStatus::Pending,
    }
}

/// Abstract payment provider interface
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Mint a payment intent and return the payer redirect.
    ///
    /// Calling twice with the same external reference must not create a second charge.
    async fn create_intent(&self, request: &IntentRequest) -> Result<CreatedIntent>;

    /// Fetch a payment by the id carried in notifications.
    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment>;

    /// Validate and extract a notification from raw request data
    ///
    /// Returns None if this provider doesn't model the payload.
    /// Returns Err if validation fails (invalid signature, malformed data, etc.)
    async fn validate_webhook(&self, headers: &axum::http::HeaderMap, body: &str) -> Result<Option<Notification>>;
}
