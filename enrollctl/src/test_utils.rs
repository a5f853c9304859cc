//! Shared fixtures for engine and API tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::Engine;
use crate::models::{Class, NewClass, PaymentStatus, Role, User};
use crate::payment_providers::{
    CreatedIntent, IntentRequest, Notification, PaymentError, PaymentProvider, ProviderPayment, Result,
    parse_notification,
};
use crate::store::Administration;
use crate::store::in_memory::InMemoryStore;

/// Provider double that records calls and can be told to fail or stall.
#[derive(Default)]
pub struct FakeProvider {
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<IntentRequest>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    status: Mutex<Option<PaymentStatus>>,
    payments: Mutex<HashMap<String, ProviderPayment>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let provider = Self::default();
        provider.fail.store(true, Ordering::SeqCst);
        Arc::new(provider)
    }

    pub fn stalling(delay: Duration) -> Arc<Self> {
        let provider = Self::default();
        *provider.delay.lock() = Some(delay);
        Arc::new(provider)
    }

    pub fn set_status(&self, status: PaymentStatus) {
        *self.status.lock() = Some(status);
    }

    /// Make `payment_id` known as a payment for `enrollment_id`, as a provider
    /// that numbers payments separately from intents would.
    pub fn register_payment(&self, payment_id: &str, enrollment_id: Uuid, status: PaymentStatus) {
        self.payments.lock().insert(
            payment_id.to_string(),
            ProviderPayment {
                status,
                external_reference: Some(enrollment_id.to_string()),
            },
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn provider_id_for(enrollment_id: Uuid) -> String {
        format!("fake-{enrollment_id}")
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_intent(&self, request: &IntentRequest) -> Result<CreatedIntent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaymentError::ProviderApi("fake provider is down".to_string()));
        }
        let provider_id = format!("fake-{}", request.external_reference);
        Ok(CreatedIntent {
            redirect_url: format!("https://pay.example/checkout/{provider_id}"),
            provider_id,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        if let Some(payment) = self.payments.lock().get(payment_id) {
            return Ok(payment.clone());
        }
        Ok(ProviderPayment {
            status: self.status.lock().unwrap_or(PaymentStatus::Approved),
            external_reference: payment_id.strip_prefix("fake-").map(str::to_string),
        })
    }

    async fn validate_webhook(&self, _headers: &axum::http::HeaderMap, body: &str) -> Result<Option<Notification>> {
        parse_notification(body).map(Some)
    }
}

/// Config with fast retries and a permissive attempt bound for contention tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.enable_metrics = false;
    config.reservation.max_attempts = 20;
    config.reservation.backoff = Duration::from_millis(1);
    config.reservation.max_backoff = Duration::from_millis(5);
    config.reservation.transaction_deadline = Duration::from_secs(5);
    config
}

pub fn engine(store: &InMemoryStore, provider: Arc<dyn PaymentProvider>, config: &Config) -> Engine<InMemoryStore> {
    Engine::new(Arc::new(store.clone()), provider, config)
}

pub async fn seed_user(store: &InMemoryStore, role: Role) -> User {
    let id = Uuid::new_v4();
    let user = User {
        id,
        ..User::new(format!("user-{id}"), format!("{id}@example.com"), role)
    };
    store.create_user(&user).await.unwrap();
    user
}

pub async fn seed_student(store: &InMemoryStore) -> User {
    seed_user(store, Role::Student).await
}

pub async fn seed_class(store: &InMemoryStore, capacity: i32) -> Class {
    store
        .create_class(NewClass {
            title: "Watercolour".to_string(),
            description: "Loose landscapes".to_string(),
            capacity,
            price_cents: 3000,
        })
        .await
        .unwrap()
}

pub fn approved_notification(payment_id: &str, action: &str) -> Notification {
    Notification {
        entity_type: "payment".to_string(),
        action: action.to_string(),
        payment_id: payment_id.to_string(),
        status: Some(PaymentStatus::Approved),
    }
}
