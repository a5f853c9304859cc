//! MercadoPago Checkout Pro provider.
//!
//! Intents are checkout preferences created with the enrollment id as both
//! `external_reference` and `X-Idempotency-Key`. Payment status comes from
//! the payments API. A payment gets its own id, distinct from the
//! preference id, and carries the enrollment id back as `external_reference`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    config::MercadoPagoConfig,
    payment_providers::{
        CreatedIntent, IntentRequest, Notification, PaymentError, PaymentProvider, ProviderPayment, Result,
        parse_notification, signature, status_from_provider,
    },
};

pub struct MercadoPagoProvider {
    client: reqwest::Client,
    api_base_url: String,
    access_token: String,
    webhook_secret: Option<String>,
    sandbox: bool,
}

impl MercadoPagoProvider {
    pub fn new(config: MercadoPagoConfig) -> Result<Self> {
        crate::install_crypto_provider();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PaymentError::ProviderApi(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base_url: config.api_base_url.as_str().trim_end_matches('/').to_string(),
            access_token: config.access_token,
            webhook_secret: config.webhook_secret,
            sandbox: config.sandbox,
        })
    }

    async fn error_from_response(response: reqwest::Response) -> PaymentError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        PaymentError::ProviderApi(format!("MercadoPago returned {status}: {body}"))
    }
}

#[derive(Debug, Serialize)]
struct PreferenceRequest<'a> {
    items: [PreferenceItem<'a>; 1],
    external_reference: &'a str,
    notification_url: &'a str,
    back_urls: BackUrls<'a>,
    auto_return: &'static str,
}

#[derive(Debug, Serialize)]
struct PreferenceItem<'a> {
    title: &'a str,
    description: &'a str,
    quantity: u32,
    #[serde(with = "rust_decimal::serde::float")]
    unit_price: Decimal,
}

#[derive(Debug, Serialize)]
struct BackUrls<'a> {
    success: &'a str,
    failure: &'a str,
    pending: &'a str,
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: Option<String>,
    sandbox_init_point: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    status: String,
    #[serde(default)]
    external_reference: Option<String>,
}

#[async_trait]
impl PaymentProvider for MercadoPagoProvider {
    async fn create_intent(&self, request: &IntentRequest) -> Result<CreatedIntent> {
        let body = PreferenceRequest {
            items: [PreferenceItem {
                title: &request.title,
                description: &request.description,
                quantity: request.quantity,
                unit_price: Decimal::new(request.unit_price_cents, 2),
            }],
            external_reference: &request.external_reference,
            notification_url: &request.notify_url,
            back_urls: BackUrls {
                success: &request.return_urls.success,
                failure: &request.return_urls.failure,
                pending: &request.return_urls.pending,
            },
            auto_return: "approved",
        };

        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.api_base_url))
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", &request.external_reference)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to create MercadoPago preference: {:?}", e);
                PaymentError::from(e)
            })?;

        if !response.status().is_success() {
            let err = Self::error_from_response(response).await;
            tracing::error!("MercadoPago rejected preference for {}: {}", request.external_reference, err);
            return Err(err);
        }

        let preference: PreferenceResponse = response.json().await?;
        let redirect = if self.sandbox {
            preference.sandbox_init_point.or(preference.init_point)
        } else {
            preference.init_point
        };
        let redirect_url =
            redirect.ok_or_else(|| PaymentError::InvalidData(format!("Preference {} has no init point", preference.id)))?;

        tracing::info!(
            "Created MercadoPago preference {} for enrollment {}",
            preference.id,
            request.external_reference
        );

        Ok(CreatedIntent {
            provider_id: preference.id,
            redirect_url,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        let response = self
            .client
            .get(format!("{}/v1/payments/{}", self.api_base_url, payment_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to retrieve MercadoPago payment {}: {:?}", payment_id, e);
                PaymentError::from(e)
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let payment: PaymentResponse = response.json().await?;
        tracing::debug!("MercadoPago payment {} is {}", payment_id, payment.status);
        Ok(ProviderPayment {
            status: status_from_provider(&payment.status),
            external_reference: payment.external_reference.filter(|r| !r.is_empty()),
        })
    }

    async fn validate_webhook(&self, headers: &axum::http::HeaderMap, body: &str) -> Result<Option<Notification>> {
        let notification = parse_notification(body)?;

        if let Some(secret) = &self.webhook_secret {
            let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
            let (Some(sig), Some(request_id)) = (header("x-signature"), header("x-request-id")) else {
                tracing::error!("MercadoPago webhook missing x-signature or x-request-id header");
                return Err(PaymentError::InvalidSignature);
            };
            if !signature::verify(sig, request_id, &notification.payment_id, secret) {
                tracing::error!("MercadoPago webhook signature mismatch for payment {}", notification.payment_id);
                return Err(PaymentError::InvalidSignature);
            }
        }

        Ok(Some(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentStatus;
    use crate::payment_providers::ReturnUrls;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, webhook_secret: Option<&str>) -> MercadoPagoConfig {
        MercadoPagoConfig {
            access_token: "TEST-token".to_string(),
            api_base_url: server.uri().parse().unwrap(),
            webhook_secret: webhook_secret.map(str::to_string),
            sandbox: false,
            request_timeout: Duration::from_secs(2),
        }
    }

    fn request() -> IntentRequest {
        IntentRequest {
            title: "Ceramics".into(),
            description: "Intro to glazing".into(),
            quantity: 1,
            unit_price_cents: 12345,
            external_reference: "2f1e4c1a-enrollment".into(),
            notify_url: "https://api.example/webhooks/payments".into(),
            return_urls: ReturnUrls::under("https://app.example/enroll"),
        }
    }

    #[tokio::test]
    async fn creates_preference_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .and(header("authorization", "Bearer TEST-token"))
            .and(header("x-idempotency-key", "2f1e4c1a-enrollment"))
            .and(body_partial_json(serde_json::json!({
                "external_reference": "2f1e4c1a-enrollment",
                "notification_url": "https://api.example/webhooks/payments",
                "auto_return": "approved",
                "back_urls": {"success": "https://app.example/enroll/success"},
                "items": [{"title": "Ceramics", "quantity": 1, "unit_price": 123.45}]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "pref-123",
                "init_point": "https://mp.example/checkout?pref_id=pref-123",
                "sandbox_init_point": "https://sandbox.mp.example/checkout?pref_id=pref-123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MercadoPagoProvider::new(config(&server, None)).unwrap();
        let created = provider.create_intent(&request()).await.unwrap();
        assert_eq!(created.provider_id, "pref-123");
        assert_eq!(created.redirect_url, "https://mp.example/checkout?pref_id=pref-123");
    }

    #[tokio::test]
    async fn api_errors_surface_as_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = MercadoPagoProvider::new(config(&server, None)).unwrap();
        let err = provider.create_intent(&request()).await.unwrap_err();
        assert!(matches!(err, PaymentError::ProviderApi(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut cfg = config(&server, None);
        cfg.request_timeout = Duration::from_millis(100);
        let provider = MercadoPagoProvider::new(cfg).unwrap();
        assert!(matches!(provider.create_intent(&request()).await, Err(PaymentError::Timeout)));
    }

    #[tokio::test]
    async fn looks_up_payment_with_its_external_reference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/555"))
            .and(header("authorization", "Bearer TEST-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 555,
                "status": "approved",
                "external_reference": "2f1e4c1a-enrollment"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/556"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 556, "status": "in_process"})))
            .mount(&server)
            .await;

        let provider = MercadoPagoProvider::new(config(&server, None)).unwrap();
        assert_eq!(
            provider.get_payment("555").await.unwrap(),
            ProviderPayment {
                status: PaymentStatus::Approved,
                external_reference: Some("2f1e4c1a-enrollment".to_string()),
            }
        );
        assert_eq!(
            provider.get_payment("556").await.unwrap(),
            ProviderPayment {
                status: PaymentStatus::Pending,
                external_reference: None,
            }
        );
    }

    #[tokio::test]
    async fn verifies_signed_webhooks_when_secret_configured() {
        let server = MockServer::start().await;
        let provider = MercadoPagoProvider::new(config(&server, Some("whsecret"))).unwrap();
        let body = r#"{"type":"payment","action":"payment.updated","data":{"id":"555"}}"#;

        let unsigned = provider.validate_webhook(&axum::http::HeaderMap::new(), body).await;
        assert!(matches!(unsigned, Err(PaymentError::InvalidSignature)));

        let sig = signature::sign("555", "req-9", "1704908010", "whsecret").unwrap();
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-signature", format!("ts=1704908010,v1={sig}").parse().unwrap());
        headers.insert("x-request-id", "req-9".parse().unwrap());
        let notification = provider.validate_webhook(&headers, body).await.unwrap().unwrap();
        assert_eq!(notification.payment_id, "555");
        assert_eq!(notification.action, "payment.updated");
    }
}
