use super::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct RenameQuery {
    new_name: Option<String>,
}

/// GET /users
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "users": state.registry.list() }))
}

/// GET /users/detail
pub async fn detail(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "users": state.registry.list_detail() }))
}

pub async fn delete(
    Path(identity): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let deleted = state.registry.delete(&identity).await?;
    Ok(Json(json!({
        "status": "deleted",
        "identity": deleted.identity,
        "total": deleted.total,
    })))
}

/// PUT /users/:identity?new_name=
pub async fn rename(
    Path(identity): Path<String>,
    Query(query): Query<RenameQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let new_name = query
        .new_name
        .ok_or_else(|| ApiError::invalid_input("missing query parameter `new_name`"))?;
    let renamed = state.registry.rename(&identity, &new_name).await?;
    Ok(Json(json!({
        "status": "renamed",
        "old_name": renamed.old_name,
        "new_name": renamed.new_name,
    })))
}

pub async fn photo(
    Path(identity): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let data = state.registry.photo(&identity).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], data))
}
