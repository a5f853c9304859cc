use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use tracing::instrument;

use crate::{
    AppState,
    api::models::ListQuery,
    engine::RepairSummary,
    errors::{Error, Result},
    models::Discrepancy,
    store::{DbError, Store},
    types::parse_id,
};

/// Open discrepancies, oldest first.
#[instrument(skip_all)]
pub async fn list_discrepancies<S: Store>(
    State(state): State<AppState<S>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Discrepancy>>> {
    Ok(Json(state.engine.store().list_open_discrepancies(query.limit()).await?))
}

/// Run one repair pass now instead of waiting for the background task.
#[instrument(skip_all)]
pub async fn repair_discrepancies<S: Store>(
    State(state): State<AppState<S>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<RepairSummary>> {
    let limit = query.limit.map_or(state.engine.repair.batch_size(), |_| query.limit());
    Ok(Json(state.engine.repair.repair(limit).await?))
}

/// Close a discrepancy an operator has dealt with by hand.
///
/// Resolving an already resolved discrepancy is a no-op.
#[instrument(skip_all, fields(discrepancy_id = %id))]
pub async fn resolve_discrepancy<S: Store>(State(state): State<AppState<S>>, Path(id): Path<String>) -> Result<StatusCode> {
    let discrepancy_id = parse_id("discrepancy_id", &id)?;
    match state.engine.store().resolve_discrepancy(discrepancy_id, Utc::now()).await {
        Ok(true) => {
            tracing::info!("Discrepancy {} resolved by operator", discrepancy_id);
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(false) => Ok(StatusCode::NO_CONTENT),
        Err(DbError::NotFound) => Err(Error::NotFound {
            resource: "Discrepancy".to_string(),
            id: discrepancy_id.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}
