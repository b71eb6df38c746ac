use super::{ApiError, ApiResult, AppState};
use crate::model::MatchResult;
use axum::{
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};

/// Reads the `file` field of a multipart upload.
async fn read_image(multipart: Result<Multipart, MultipartRejection>) -> ApiResult<Bytes> {
    let mut multipart =
        multipart.map_err(|e| ApiError::new(e.status(), "invalid_input", e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), "invalid_input", e.body_text()))?
    {
        if field.name() == Some("file") {
            return field
                .bytes()
                .await
                .map_err(|e| ApiError::new(e.status(), "invalid_input", e.body_text()));
        }
    }
    Err(ApiError::invalid_input("missing multipart field `file`"))
}

/// POST /register/:identity
pub async fn register(
    Path(identity): Path<String>,
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Value>> {
    let image = read_image(multipart).await?;
    let registered = state.registry.register(&identity, image).await?;
    Ok(Json(json!({
        "status": "registered",
        "identity": registered.identity,
        "total": registered.total,
        "replaced": registered.replaced,
    })))
}

/// POST /recognize
pub async fn recognize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<MatchResult>> {
    let image = read_image(multipart).await?;
    Ok(Json(state.registry.recognize(image).await?))
}
