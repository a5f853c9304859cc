use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::ReserveRequest,
    engine::{Cancellation, Reservation},
    errors::{Error, Result},
    models::Enrollment,
    store::Store,
    types::parse_id,
};

/// Reserve a seat and return the checkout redirect.
#[instrument(skip_all)]
pub async fn create_enrollment<S: Store>(
    State(state): State<AppState<S>>,
    Json(request): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<Reservation>)> {
    let (student_id, class_id) = request.ids()?;
    let reservation = state.engine.reservations.reserve(student_id, class_id).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

#[instrument(skip_all, fields(enrollment_id = %id))]
pub async fn get_enrollment<S: Store>(State(state): State<AppState<S>>, Path(id): Path<String>) -> Result<Json<Enrollment>> {
    let enrollment_id = parse_id("enrollment_id", &id)?;
    let enrollment = state
        .engine
        .store()
        .get_enrollment(enrollment_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Enrollment".to_string(),
            id: enrollment_id.to_string(),
        })?;
    Ok(Json(enrollment))
}

#[instrument(skip_all, fields(enrollment_id = %id))]
pub async fn cancel_enrollment<S: Store>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<Cancellation>> {
    let enrollment_id = parse_id("enrollment_id", &id)?;
    Ok(Json(state.engine.cancellations.cancel(enrollment_id).await?))
}
