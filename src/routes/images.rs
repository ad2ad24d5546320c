use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::{ApiError, Caller};
use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct ImageUrlResponse {
    pub image_url: String,
    pub expires_in_secs: u64,
}

/// GET /api/v1/images/{image_id}/url: presigned download link for a source
/// or converted image owned by the caller.
pub async fn image_url(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(image_id): Path<Uuid>,
) -> Result<Json<ImageUrlResponse>, ApiError> {
    let image = state.images.find_for_user(user_id, image_id).await?;
    let image_url = state
        .storage
        .signed_download_url(&image.storage_key, state.signed_url_ttl)
        .await?;

    Ok(Json(ImageUrlResponse {
        image_url,
        expires_in_secs: state.signed_url_ttl.as_secs(),
    }))
}
