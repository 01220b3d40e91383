//! Stock listing.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct ProductResponse {
    pub sku: String,
    pub status: String,
    pub order_id: Option<String>,
}

/// GET /products: every stock item with its status and owner.
#[tracing::instrument(skip(state))]
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<ProductResponse>>, ApiError> {
    let items = state.ledger.list().await?;
    Ok(Json(
        items
            .into_iter()
            .map(|item| ProductResponse {
                sku: item.sku.to_string(),
                status: item.status.as_str().to_string(),
                order_id: item.order_id.map(|id| id.to_string()),
            })
            .collect(),
    ))
}
