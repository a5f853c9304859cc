use axum::{extract::State, http::HeaderMap, response::Json};
use tracing::instrument;

use crate::{
    AppState,
    engine::{IgnoreReason, ReconcileOutcome},
    errors::Result,
    store::Store,
};

/// Payment provider notification endpoint.
///
/// Signature and payload validation is delegated to the configured provider.
/// Processed and ignored notifications both answer 200 so the provider stops
/// redelivering them; a notification for an unknown payment answers 404 and
/// will be retried.
#[instrument(skip_all)]
pub async fn payment_webhook<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ReconcileOutcome>> {
    let Some(notification) = state.provider.validate_webhook(&headers, &body).await? else {
        tracing::debug!("Provider did not recognise webhook payload");
        return Ok(Json(ReconcileOutcome::Ignored {
            reason: IgnoreReason::Unrecognized,
        }));
    };
    Ok(Json(state.engine.reconciler.reconcile(&notification).await?))
}
