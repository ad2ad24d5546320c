use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::{ApiError, Caller};
use crate::app_state::AppState;
use crate::db::RepositoryError;
use crate::models::image::ImageFormat;
use crate::models::request::{ConversionForm, ConversionRequest, RequestStatus};

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub enqueued: bool,
}

fn parse_format(field: &str, raw: &str) -> Result<ImageFormat, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unsupported {field} '{raw}': needed jpeg or png")))
}

/// POST /api/v1/conversions: upload an image and queue its conversion.
pub async fn submit_conversion(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut source_format = None;
    let mut target_format = None;
    let mut ratio = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("file part has no filename".to_string()))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                file = Some((filename, data.to_vec()));
            }
            "source_format" | "target_format" | "ratio" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                match name.as_str() {
                    "source_format" => source_format = Some(parse_format("source format", &value)?),
                    "target_format" => target_format = Some(parse_format("target format", &value)?),
                    _ => {
                        ratio = Some(value.trim().parse::<i32>().map_err(|_| {
                            ApiError::BadRequest("invalid ratio form value".to_string())
                        })?)
                    }
                }
            }
            _ => {}
        }
    }

    let (filename, data) = file.ok_or_else(|| ApiError::BadRequest("missing file".to_string()))?;
    let missing = |field: &str| ApiError::BadRequest(format!("missing {field}"));

    let form = ConversionForm {
        filename,
        source_format: source_format.ok_or_else(|| missing("source_format"))?,
        target_format: target_format.ok_or_else(|| missing("target_format"))?,
        ratio: ratio.ok_or_else(|| missing("ratio"))?,
    };

    let submission = state.producer.submit(user_id, &form, &data).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id: submission.request_id,
            status: submission.status,
            enqueued: submission.enqueued,
        }),
    ))
}

/// GET /api/v1/conversions: the caller's request history.
pub async fn list_conversions(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<Vec<ConversionRequest>>, ApiError> {
    Ok(Json(state.requests.list_for_user(user_id).await?))
}

/// GET /api/v1/conversions/{request_id}: poll one request's status.
pub async fn get_conversion(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ConversionRequest>, ApiError> {
    match state.requests.get(request_id).await? {
        Some(request) if request.user_id == user_id => Ok(Json(request)),
        _ => Err(RepositoryError::NoSuchRequest.into()),
    }
}
