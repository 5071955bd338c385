//! API Server Module
//!
//! Application state, router and server startup for the status API.

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::routes::{
    handle_get_deposit, handle_get_hot_wallet, handle_health, handle_list_transactions,
    handle_list_withdrawals, handle_stats,
};
use crate::storage::LedgerStore;
use crate::types::Chain;
use crate::worker::ShutdownSignal;

/// Shared state of the status API
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    /// Chains this process serves
    pub chains: Vec<Chain>,
}

/// Shared application state type
pub type SharedAppState = Arc<AppState>;

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, chains: Vec<Chain>) -> SharedAppState {
        Arc::new(Self { store, chains })
    }
}

/// Build the router
pub fn create_router(state: SharedAppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/:chain/deposits/:address", get(handle_get_deposit))
        .route("/api/:chain/withdrawals", get(handle_list_withdrawals))
        .route("/api/:chain/hot-wallet", get(handle_get_hot_wallet))
        .route("/api/:chain/stats", get(handle_stats))
        .route("/api/:chain/transactions", get(handle_list_transactions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn start_server(
    addr: SocketAddr,
    state: SharedAppState,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Status API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLedgerStore;
    use crate::types::{Deposit, HotWallet, Withdrawal};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn app(store: &MemoryLedgerStore) -> Router {
        create_router(AppState::new(
            Arc::new(store.clone()),
            vec![Chain::Ethereum, Chain::Polygon],
        ))
    }

    #[tokio::test]
    async fn test_health() {
        let response = get(app(&MemoryLedgerStore::new()), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["chains"], serde_json::json!(["ethereum", "polygon"]));
    }

    #[tokio::test]
    async fn test_deposit_lookup() {
        let store = MemoryLedgerStore::new();
        store
            .create_deposit(&Deposit::new(
                Chain::Ethereum,
                "0xwatched".to_string(),
                "user-1".to_string(),
                "order-1".to_string(),
                Decimal::ONE,
            ))
            .await
            .unwrap();

        let response = get(app(&store), "/api/ethereum/deposits/0xwatched").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["order_id"], "order-1");
        assert_eq!(body["status"], "pending");

        // scoped by chain
        let response = get(app(&store), "/api/polygon/deposits/0xwatched").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_and_unconfigured_chains() {
        let store = MemoryLedgerStore::new();

        let response = get(app(&store), "/api/solana/stats").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get(app(&store), "/api/bsc/stats").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_withdrawal_listing() {
        let store = MemoryLedgerStore::new();
        for order in ["a", "b"] {
            store
                .create_withdrawal(&Withdrawal::new(
                    Chain::Polygon,
                    order.to_string(),
                    "0xhot".to_string(),
                    "0xdest".to_string(),
                    Decimal::ONE,
                    Decimal::ZERO,
                ))
                .await
                .unwrap();
        }

        let response = get(app(&store), "/api/polygon/withdrawals").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let orders: Vec<_> = body["withdrawals"]
            .as_array()
            .unwrap()
            .iter()
            .map(|w| w["order_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(orders, vec!["a", "b"]);

        let response = get(app(&store), "/api/polygon/withdrawals?status=sent").await;
        let body = body_json(response).await;
        assert!(body["withdrawals"].as_array().unwrap().is_empty());

        let response = get(app(&store), "/api/polygon/withdrawals?status=bogus").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_hot_wallet_hides_key() {
        let store = MemoryLedgerStore::new();
        let response = get(app(&store), "/api/ethereum/hot-wallet").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        store
            .upsert_hot_wallet(&HotWallet::new(
                Chain::Ethereum,
                "0xhot".to_string(),
                "kms:secret".to_string(),
            ))
            .await
            .unwrap();

        let response = get(app(&store), "/api/ethereum/hot-wallet").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["address"], "0xhot");
        assert!(body.get("encrypted_key").is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryLedgerStore::new();
        store
            .create_deposit(&Deposit::new(
                Chain::Ethereum,
                "0xwatched".to_string(),
                "user-1".to_string(),
                "order-1".to_string(),
                Decimal::ONE,
            ))
            .await
            .unwrap();

        let response = get(app(&store), "/api/ethereum/stats").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deposits"]["pending"], 1);
    }
}
