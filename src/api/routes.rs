//! Read-only status handlers
//!
//! - GET /health
//! - GET /api/:chain/deposits/:address
//! - GET /api/:chain/withdrawals?status=&limit=
//! - GET /api/:chain/hot-wallet
//! - GET /api/:chain/stats
//! - GET /api/:chain/transactions?limit=

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::server::SharedAppState;
use crate::storage::StorageError;
use crate::types::{Chain, WithdrawalStatus};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Handler errors, rendered as `{"error": .., "details": ..}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Storage(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::BadRequest(details) => (StatusCode::BAD_REQUEST, "Bad request", details),
            ApiError::NotFound(details) => (StatusCode::NOT_FOUND, "Not found", details),
            ApiError::Storage(e) => {
                tracing::error!(error = %e, "Store query failed");
                let status = if e.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, "Storage error", e.to_string())
            }
        };

        let body = serde_json::json!({
            "error": error,
            "details": details,
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Parse the chain segment and require it to be configured
fn configured_chain(state: &SharedAppState, raw: &str) -> ApiResult<Chain> {
    let chain: Chain = raw
        .parse()
        .map_err(|e: crate::types::UnknownChain| ApiError::BadRequest(e.to_string()))?;
    if !state.chains.contains(&chain) {
        return Err(ApiError::NotFound(format!("chain {} is not configured", chain)));
    }
    Ok(chain)
}

/// GET /health
pub async fn handle_health(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "custody-tracker",
        "version": env!("CARGO_PKG_VERSION"),
        "chains": state.chains,
    }))
}

/// GET /api/:chain/deposits/:address
///
/// Latest deposit registered for the address.
pub async fn handle_get_deposit(
    State(state): State<SharedAppState>,
    Path((chain, address)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let chain = configured_chain(&state, &chain)?;

    match state.store.get_deposit_by_address(chain, &address).await? {
        Some(deposit) => Ok(Json(deposit)),
        None => Err(ApiError::NotFound(format!(
            "no deposit for {} on {}",
            address, chain
        ))),
    }
}

/// GET /api/:chain/withdrawals
///
/// Pending withdrawals are listed oldest first, in dispatch order.
pub async fn handle_list_withdrawals(
    State(state): State<SharedAppState>,
    Path(chain): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let chain = configured_chain(&state, &chain)?;
    let status = match query.status.as_deref() {
        None => WithdrawalStatus::Pending,
        Some(raw) => raw.parse().map_err(ApiError::BadRequest)?,
    };

    let withdrawals = match status {
        WithdrawalStatus::Pending => {
            state
                .store
                .get_pending_withdrawals(chain, query.limit())
                .await?
        }
        other => {
            state
                .store
                .get_withdrawals_by_status(chain, other, query.limit())
                .await?
        }
    };

    Ok(Json(serde_json::json!({
        "chain": chain,
        "status": status,
        "withdrawals": withdrawals,
    })))
}

/// GET /api/:chain/hot-wallet
pub async fn handle_get_hot_wallet(
    State(state): State<SharedAppState>,
    Path(chain): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let chain = configured_chain(&state, &chain)?;

    state
        .store
        .get_hot_wallet(chain)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no hot wallet configured for {}", chain)))
}

/// GET /api/:chain/stats
pub async fn handle_stats(
    State(state): State<SharedAppState>,
    Path(chain): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let chain = configured_chain(&state, &chain)?;
    let counts = state.store.count_by_status(chain).await?;

    Ok(Json(serde_json::json!({
        "chain": chain,
        "deposits": counts.deposits,
        "withdrawals": counts.withdrawals,
    })))
}

/// GET /api/:chain/transactions
pub async fn handle_list_transactions(
    State(state): State<SharedAppState>,
    Path(chain): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let chain = configured_chain(&state, &chain)?;
    let transactions = state.store.get_transactions(chain, query.limit()).await?;

    Ok(Json(serde_json::json!({
        "chain": chain,
        "transactions": transactions,
    })))
}
