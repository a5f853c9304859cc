//! Dummy payment provider implementation
//!
//! Hands out deterministic intents without calling anything external and
//! reports every payment approved. Useful for testing and development: post a
//! `{"type":"payment","action":"payment.updated","data":{"id":"dummy_<enrollment>"}}`
//! notification to confirm an enrollment.

use async_trait::async_trait;

use crate::{
    config::DummyConfig,
    models::PaymentStatus,
    payment_providers::{
        CreatedIntent, IntentRequest, Notification, PaymentProvider, ProviderPayment, Result, parse_notification,
    },
};

/// Dummy payment provider that approves everything
pub struct DummyProvider {
    checkout_base_url: String,
}

impl From<DummyConfig> for DummyProvider {
    fn from(config: DummyConfig) -> Self {
        Self {
            checkout_base_url: config.checkout_base_url.to_string(),
        }
    }
}

#[async_trait]
impl PaymentProvider for DummyProvider {
    async fn create_intent(&self, request: &IntentRequest) -> Result<CreatedIntent> {
        // Derived from the external reference so retries map to the same intent
        let provider_id = format!("dummy_{}", request.external_reference);
        let redirect_url = format!("{}?intent={}", self.checkout_base_url.trim_end_matches('/'), provider_id);

        tracing::info!("Dummy provider created intent {} for {}", provider_id, request.external_reference);

        Ok(CreatedIntent {
            provider_id,
            redirect_url,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        Ok(ProviderPayment {
            status: PaymentStatus::Approved,
            external_reference: payment_id.strip_prefix("dummy_").map(str::to_string),
        })
    }

    async fn validate_webhook(&self, _headers: &axum::http::HeaderMap, body: &str) -> Result<Option<Notification>> {
        parse_notification(body).map(Some)
    }
}
