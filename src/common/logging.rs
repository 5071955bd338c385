//! Structured Logging for the Custody Tracker
//!
//! Provides structured logging with:
//! - JSON output for log aggregation services
//! - Correlation IDs tying every event of a deposit or withdrawal together
//! - Operator alerts for conditions that need manual attention
//! - Worker lifecycle events
//!
//! # Usage
//!
//! ```rust,ignore
//! use custody_tracker::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?; // JSON mode for production
//! ```

use serde::Serialize;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use rust_decimal::Decimal;

use crate::types::{format_amount, Deposit, HotWallet, Withdrawal};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Deposit lifecycle events
    Deposit,
    /// Withdrawal lifecycle events
    Withdrawal,
    /// Hot wallet balance refreshes
    Wallet,
    /// Worker start, stop, restart
    Worker,
    /// System events (startup, shutdown)
    System,
    /// Conditions requiring operator attention
    Alert,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Correlation ID, e.g. `ethereum:deposit:42`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Duration in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_str().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Add correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add duration
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Add error details
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Serialize this event to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

/// Correlation id for a deposit
pub fn deposit_correlation_id(deposit: &Deposit) -> String {
    format!("{}:deposit:{}", deposit.chain, deposit.id)
}

/// Correlation id for a withdrawal
pub fn withdrawal_correlation_id(withdrawal: &Withdrawal) -> String {
    format!("{}:withdrawal:{}", withdrawal.chain, withdrawal.id)
}

// ============================================================================
// Domain Event Logging
// ============================================================================

/// Log a deposit lifecycle event (observed, confirmed, expired)
pub fn log_deposit_event(event_type: &str, deposit: &Deposit) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Deposit, event_type)
        .with_correlation_id(deposit_correlation_id(deposit))
        .with_data(serde_json::json!({
            "deposit_id": deposit.id,
            "chain": deposit.chain,
            "address": deposit.address,
            "order_id": deposit.order_id,
            "expected_amount": format_amount(deposit.expected_amount),
            "received_amount": deposit.received_amount.map(format_amount),
            "tx_hash": deposit.tx_hash,
            "block_number": deposit.block_number,
            "confirmations": deposit.confirmations,
            "status": deposit.status,
        }));

    tracing::info!(target: "custody::deposit", "{}", event.to_json());
}

/// Log a withdrawal lifecycle event (sent, confirmed, failed)
pub fn log_withdrawal_event(event_type: &str, withdrawal: &Withdrawal, success: bool) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Withdrawal, event_type)
        .with_correlation_id(withdrawal_correlation_id(withdrawal))
        .with_data(serde_json::json!({
            "withdrawal_id": withdrawal.id,
            "chain": withdrawal.chain,
            "order_id": withdrawal.order_id,
            "to_address": withdrawal.to_address,
            "amount": format_amount(withdrawal.amount),
            "fee": format_amount(withdrawal.fee),
            "tx_hash": withdrawal.tx_hash,
            "confirmations": withdrawal.confirmations,
            "status": withdrawal.status,
        }));

    if let Some(err) = withdrawal.error.as_deref() {
        event = event.with_error("WITHDRAWAL_FAILED", err);
    }

    if success {
        tracing::info!(target: "custody::withdrawal", "{}", event.to_json());
    } else {
        tracing::error!(target: "custody::withdrawal", "{}", event.to_json());
    }
}

/// Raise an operator alert
///
/// `severity` is `Warn` for conditions that resolve with funding or time and
/// `Error` for anything that needs a human before the ledger can move on.
pub fn log_operator_alert(
    alert: &str,
    severity: LogLevel,
    correlation_id: Option<&str>,
    details: serde_json::Value,
) {
    let mut event = LogEvent::new(severity, EventCategory::Alert, alert).with_data(details);
    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    match severity {
        LogLevel::Error => tracing::error!(target: "custody::alert", "{}", event.to_json()),
        _ => tracing::warn!(target: "custody::alert", "{}", event.to_json()),
    }
}

/// Log a change of a hot wallet's cached balance
pub fn log_wallet_event(event_type: &str, wallet: &HotWallet, previous: Decimal) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Wallet, event_type)
        .with_correlation_id(format!("{}:hot_wallet", wallet.chain))
        .with_data(serde_json::json!({
            "chain": wallet.chain,
            "address": wallet.address,
            "previous": format_amount(previous),
            "balance": format_amount(wallet.balance),
        }));

    tracing::info!(target: "custody::wallet", "{}", event.to_json());
}

/// Log a worker cycle that did something, with its duration
pub fn log_cycle_event(worker: &str, summary: &str, duration_ms: u64) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Worker, "worker_cycle")
        .with_correlation_id(worker)
        .with_data(serde_json::json!({ "worker": worker, "summary": summary }))
        .with_duration(duration_ms);

    tracing::info!(target: "custody::worker", "{}", event.to_json());
}

/// Log a process-level event (startup, shutdown)
pub fn log_system_event(event_type: &str, data: serde_json::Value) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::System, event_type).with_data(data);
    tracing::info!(target: "custody::system", "{}", event.to_json());
}

/// Log a worker lifecycle event
pub fn log_worker_event(event_type: &str, worker: &str, error: Option<&str>) {
    let level = if error.is_some() {
        LogLevel::Error
    } else {
        LogLevel::Info
    };
    let mut event = LogEvent::new(level, EventCategory::Worker, event_type)
        .with_correlation_id(worker)
        .with_data(serde_json::json!({ "worker": worker }));

    if let Some(err) = error {
        event = event.with_error("WORKER_ERROR", err);
    }

    match level {
        LogLevel::Error => tracing::error!(target: "custody::worker", "{}", event.to_json()),
        _ => tracing::info!(target: "custody::worker", "{}", event.to_json()),
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// # Arguments
/// * `level` - Minimum log level to output
/// * `json_format` - Use JSON format (recommended for production)
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_str();
        EnvFilter::new(format!(
            "custody_tracker={level},custody={level},tower_http={level},axum={level}"
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chain;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Warn, EventCategory::Alert, "hot_wallet_underfunded")
            .with_correlation_id("polygon:withdrawal:9")
            .with_data(serde_json::json!({"required": "0.5"}))
            .with_duration(42);

        let json = event.to_json();
        assert!(json.contains("hot_wallet_underfunded"));
        assert!(json.contains("polygon:withdrawal:9"));
        assert!(json.contains("\"category\":\"alert\""));
        assert!(json.contains("\"level\":\"WARN\""));
        assert!(json.contains("\"duration_ms\":42"));
    }

    #[test]
    fn test_wallet_event_category() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Wallet, "hot_wallet_balance_changed");
        assert!(event.to_json().contains("\"category\":\"wallet\""));

        let event = LogEvent::new(LogLevel::Info, EventCategory::System, "custody_tracker_started");
        assert!(event.to_json().contains("\"category\":\"system\""));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("INFO".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_correlation_ids() {
        let mut deposit = Deposit::new(
            Chain::Arbitrum,
            "0xabc".to_string(),
            "u".to_string(),
            "o".to_string(),
            rust_decimal::Decimal::ONE,
        );
        deposit.id = 12;
        assert_eq!(deposit_correlation_id(&deposit), "arbitrum:deposit:12");
    }
}
