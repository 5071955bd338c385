//! Withdrawal Signer
//!
//! Signing is delegated to an external service holding the key material.
//! The hot wallet's encrypted key is opaque here and only forwarded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chain::SignedTransaction;
use crate::types::{format_amount, HotWallet, Withdrawal};

/// Produces a signed raw transaction paying out a withdrawal
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WithdrawalSigner: Send + Sync {
    async fn sign(
        &self,
        withdrawal: &Withdrawal,
        hot_wallet: &HotWallet,
    ) -> Result<SignedTransaction, SignerError>;
}

/// Signer errors
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signing service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("signing service refused request ({status}): {message}")]
    Refused { status: u16, message: String },

    #[error("invalid signing response: {0}")]
    InvalidResponse(String),
}

impl SignerError {
    /// The withdrawal stays pending and is signed again next cycle
    pub fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    chain: &'a str,
    withdrawal_id: i64,
    order_id: &'a str,
    from_address: &'a str,
    to_address: &'a str,
    amount: String,
    fee: String,
    encrypted_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    raw_tx: String,
}

/// HTTP client for the external signing service
pub struct RemoteSigner {
    endpoint: String,
    http_client: reqwest::Client,
}

impl RemoteSigner {
    /// Create a signer posting to `{base_url}/sign`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SignerError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: format!("{}/sign", base_url.trim_end_matches('/')),
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl WithdrawalSigner for RemoteSigner {
    async fn sign(
        &self,
        withdrawal: &Withdrawal,
        hot_wallet: &HotWallet,
    ) -> Result<SignedTransaction, SignerError> {
        let request = SignRequest {
            chain: withdrawal.chain.as_str(),
            withdrawal_id: withdrawal.id,
            order_id: &withdrawal.order_id,
            from_address: &hot_wallet.address,
            to_address: &withdrawal.to_address,
            amount: format_amount(withdrawal.amount),
            fee: format_amount(withdrawal.fee),
            encrypted_key: &hot_wallet.encrypted_key,
        };

        let resp = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SignerError::Refused {
                status: status.as_u16(),
                message,
            });
        }

        let body: SignResponse = resp.json().await?;
        if !body.raw_tx.starts_with("0x") || body.raw_tx.len() <= 2 {
            return Err(SignerError::InvalidResponse(format!(
                "raw transaction is not 0x-prefixed hex: {}",
                body.raw_tx
            )));
        }

        Ok(SignedTransaction {
            raw_hex: body.raw_tx,
        })
    }
}
