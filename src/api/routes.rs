//! API Routes
//!
//! HTTP endpoint definitions.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::TransactionStatus;
use crate::error::AppError;
use crate::handlers::{CreateTransactionCommand, CreateTransactionHandler};

use super::AppState;

/// Header carrying the client's idempotency token
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub source_account_id: Uuid,
    pub target_account_id: Uuid,
    pub transfer_type_id: i32,
    pub value: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub transaction_external_id: Uuid,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/transactions", post(create_transaction))
        .route("/transactions/:id", get(get_transaction))
}

// =========================================================================
// POST /transactions
// =========================================================================

/// Create a pending transaction.
///
/// 201 with a `Location` header for a new transaction, 200 when the
/// idempotency key replays an earlier one.
async fn create_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTransactionRequest>,
) -> Result<Response, AppError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AppError::MissingHeader(IDEMPOTENCY_KEY_HEADER.to_string()))?;

    let handler = CreateTransactionHandler::new(state.transactions.clone());

    let command = CreateTransactionCommand::new(
        request.source_account_id,
        request.target_account_id,
        request.transfer_type_id,
        request.value,
    )
    .with_idempotency_key(idempotency_key);

    let result = handler.execute(command).await?;

    let body = Json(TransactionResponse {
        transaction_external_id: result.transaction_external_id,
        status: result.status,
        created_at: result.created_at,
    });

    if result.replayed {
        return Ok((StatusCode::OK, body).into_response());
    }

    let location = format!("/api/v1/transactions/{}", result.transaction_external_id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], body).into_response())
}

// =========================================================================
// GET /transactions/:id
// =========================================================================

/// Get a transaction by its external id
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransactionResponse>, AppError> {
    let tx = state
        .transactions
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::TransactionNotFound(id.to_string()))?;

    Ok(Json(TransactionResponse {
        transaction_external_id: tx.external_id(),
        status: tx.status(),
        created_at: tx.created_at(),
    }))
}
