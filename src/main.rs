//! Custody Tracker CLI
//!
//! Runs the per-chain workers with the status API, or performs a single
//! operator action against the ledger.

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use custody_tracker::api::{start_server, AppState};
use custody_tracker::chain::{ChainClient, EvmRpcClient};
use custody_tracker::common::{
    init_logging, log_system_event, ConfigError, CustodyConfig, CustodyError, Result,
};
use custody_tracker::coordinator::{
    chain_workers, shutdown_signal, Coordinator, RestartPolicy, WorkerRegistry, SHUTDOWN_GRACE,
};
use custody_tracker::operator;
use custody_tracker::signer::{RemoteSigner, WithdrawalSigner};
use custody_tracker::storage::{LedgerStore, SqliteLedgerStore, StorageError};
use custody_tracker::types::{Chain, WithdrawalStatus};
use custody_tracker::worker::BackoffPolicy;

#[derive(Parser)]
#[command(name = "custody-tracker")]
#[command(about = "Multi-chain deposit tracker and withdrawal dispatcher", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workers of every configured chain and the status API
    Run,

    /// Watch an address for an expected deposit
    RegisterDeposit {
        #[arg(short, long)]
        chain: Chain,

        /// Deposit address to watch
        #[arg(short, long)]
        address: String,

        #[arg(short, long)]
        user_id: String,

        #[arg(short, long)]
        order_id: String,

        /// Expected amount in native units (e.g. 1.5)
        #[arg(short = 'm', long)]
        amount: Decimal,
    },

    /// Queue a withdrawal from the chain's hot wallet
    SubmitWithdrawal {
        #[arg(short, long)]
        chain: Chain,

        #[arg(short, long)]
        order_id: String,

        /// Destination address
        #[arg(short, long)]
        to: String,

        /// Amount in native units
        #[arg(short = 'm', long)]
        amount: Decimal,

        /// Network fee budget in native units
        #[arg(short, long, default_value = "0")]
        fee: Decimal,
    },

    /// Queue a fresh copy of a failed withdrawal
    ResubmitWithdrawal {
        /// Id of the failed withdrawal
        id: i64,
    },

    /// Provision or replace a chain's hot wallet
    SetHotWallet {
        #[arg(short, long)]
        chain: Chain,

        #[arg(short, long)]
        address: String,

        /// Encrypted key handed to the signing service (or set HOT_WALLET_ENCRYPTED_KEY)
        #[arg(short, long, env = "HOT_WALLET_ENCRYPTED_KEY", hide_env_values = true)]
        encrypted_key: String,
    },

    /// Show the latest deposit for an address
    Deposit {
        #[arg(short, long)]
        chain: Chain,

        #[arg(short, long)]
        address: String,
    },

    /// List withdrawals by status
    Withdrawals {
        #[arg(short, long)]
        chain: Chain,

        #[arg(short, long, default_value = "pending")]
        status: WithdrawalStatus,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Record counts by status
    Stats {
        #[arg(short, long)]
        chain: Chain,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match CustodyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(config.log_level, config.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(code = e.error_code(), error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, config: CustodyConfig) -> Result<()> {
    if let Commands::Run = command {
        return run(config).await;
    }

    let store = open_store(&config)?;

    match command {
        Commands::Run => Ok(()),
        Commands::RegisterDeposit {
            chain,
            address,
            user_id,
            order_id,
            amount,
        } => {
            config.chain(chain)?;
            let deposit =
                operator::register_deposit(&store, chain, &address, &user_id, &order_id, amount)
                    .await?;
            print_json(&deposit)
        }
        Commands::SubmitWithdrawal {
            chain,
            order_id,
            to,
            amount,
            fee,
        } => {
            config.chain(chain)?;
            let withdrawal =
                operator::submit_withdrawal(&store, chain, &order_id, &to, amount, fee).await?;
            print_json(&withdrawal)
        }
        Commands::ResubmitWithdrawal { id } => {
            let withdrawal = operator::resubmit_withdrawal(&store, id).await?;
            print_json(&withdrawal)
        }
        Commands::SetHotWallet {
            chain,
            address,
            encrypted_key,
        } => {
            config.chain(chain)?;
            let wallet = operator::set_hot_wallet(&store, chain, &address, &encrypted_key).await?;
            print_json(&wallet)
        }
        Commands::Deposit { chain, address } => {
            let deposit = store
                .get_deposit_by_address(chain, &address.to_lowercase())
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("deposit for {}", address)))?;
            print_json(&deposit)
        }
        Commands::Withdrawals {
            chain,
            status,
            limit,
        } => {
            let withdrawals = match status {
                WithdrawalStatus::Pending => store.get_pending_withdrawals(chain, limit).await?,
                other => store.get_withdrawals_by_status(chain, other, limit).await?,
            };
            print_json(&withdrawals)
        }
        Commands::Stats { chain } => {
            let counts = store.count_by_status(chain).await?;
            print_json(&counts)
        }
    }
}

fn open_store(config: &CustodyConfig) -> Result<SqliteLedgerStore> {
    Ok(SqliteLedgerStore::new(
        &config.database.path,
        config.database.pool_size,
    )?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| CustodyError::validation(format!("failed to render output: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

/// Start every worker and the status API; return when they have stopped
async fn run(config: CustodyConfig) -> Result<()> {
    config.log_summary();
    log_system_event(
        "custody_tracker_starting",
        serde_json::json!({ "chains": config.chains.keys().collect::<Vec<_>>() }),
    );

    let store: Arc<dyn LedgerStore> = Arc::new(open_store(&config)?);
    let signer: Arc<dyn WithdrawalSigner> = Arc::new(RemoteSigner::new(
        config.require_signer_url()?,
        config.rpc.timeout,
    )?);

    let mut registry = WorkerRegistry::new();
    for chain_config in config.chains.values() {
        let client = EvmRpcClient::new(
            chain_config.chain,
            &chain_config.rpc_url,
            config.rpc.timeout,
            config.rpc.incoming_scan_blocks,
        )?;
        client.verify_chain_id(chain_config.chain_id).await?;
        tracing::info!(
            chain = %chain_config.chain,
            chain_id = chain_config.chain_id,
            "Chain RPC verified"
        );

        let client: Arc<dyn ChainClient> = Arc::new(client);
        for spec in chain_workers(
            chain_config,
            &config.workers,
            store.clone(),
            client,
            signer.clone(),
        )? {
            registry.register(spec)?;
        }
    }
    registry.ensure_complete(config.chains.keys())?;

    let retry = BackoffPolicy::new(
        config.workers.retry_backoff_base_ms,
        config.workers.retry_backoff_max_ms,
    );
    let coordinator = Coordinator::new(registry, retry, RestartPolicy::from_config(&config.workers));
    let shutdown = coordinator.shutdown_handle();

    let addr: SocketAddr = config
        .server
        .bind_addr()
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            ConfigError::InvalidValue("SERVER_HOST".to_string(), e.to_string())
        })?;
    let chains: Vec<Chain> = config.chains.keys().copied().collect();
    let api_state = AppState::new(store.clone(), chains);
    let api_shutdown = shutdown.clone();
    let api = tokio::spawn(async move {
        let result = start_server(addr, api_state, api_shutdown.subscribe()).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Status API failed, stopping");
            api_shutdown.trigger();
        }
        result
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.trigger();
    });

    let outcome = coordinator.run().await;
    shutdown.trigger();

    match tokio::time::timeout(SHUTDOWN_GRACE, api).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Status API stopped with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "Status API task failed"),
        Err(_) => tracing::warn!("Status API did not stop within the grace period"),
    }

    log_system_event(
        "custody_tracker_stopped",
        serde_json::json!({ "clean": outcome.is_ok() }),
    );
    outcome?;
    Ok(())
}
