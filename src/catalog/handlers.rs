use axum::{
    extract::{Path, State},
    Json,
};

use super::types::CatalogResponse;
use crate::server::AppState;

pub async fn get_catalog(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<CatalogResponse> {
    Json(state.aggregator.get_catalog(&user_id).await)
}
