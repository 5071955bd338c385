//! SQLite Persistent Storage for the Ledger
//!
//! Provides durable storage for deposits, withdrawals, hot wallets and the
//! transaction read model. Uses connection pooling via r2d2 for concurrent
//! access from every chain worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use super::traits::{LedgerCounts, LedgerStore, StorageError, StorageResult, WriteOutcome};
use crate::types::{
    Chain, Deposit, DepositStatus, HotWallet, Transaction, Withdrawal, WithdrawalStatus,
};

/// SQLite-backed ledger store with connection pooling
pub struct SqliteLedgerStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA synchronous = NORMAL;",
            )
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain TEXT NOT NULL,
                address TEXT NOT NULL,
                user_id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                expected_amount TEXT NOT NULL,
                received_amount TEXT,
                tx_hash TEXT,
                block_number INTEGER,
                confirmations INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                confirmed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_chain_status
                ON deposits(chain, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_deposits_chain_address
                ON deposits(chain, address, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS uq_deposits_pending_address
                ON deposits(chain, address) WHERE status = 'pending';
            CREATE UNIQUE INDEX IF NOT EXISTS uq_deposits_tx_hash
                ON deposits(chain, tx_hash) WHERE tx_hash IS NOT NULL;

            CREATE TABLE IF NOT EXISTS withdrawals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain TEXT NOT NULL,
                order_id TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                tx_hash TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                block_number INTEGER,
                confirmations INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                sent_at INTEGER,
                confirmed_at INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_withdrawals_chain_status
                ON withdrawals(chain, status, created_at);

            CREATE TABLE IF NOT EXISTS hot_wallets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                balance TEXT NOT NULL DEFAULT '0',
                last_checked_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain TEXT NOT NULL,
                kind TEXT NOT NULL,
                tx_hash TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                block_number INTEGER,
                status TEXT NOT NULL,
                confirmations INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(chain, tx_hash)
            );
            "#,
        )
        .map_err(db_error)?;

        Ok(())
    }

    // Row conversion

    fn row_to_deposit(row: &Row) -> rusqlite::Result<Deposit> {
        Ok(Deposit {
            id: row.get("id")?,
            chain: parse_column(row, "chain")?,
            address: row.get("address")?,
            user_id: row.get("user_id")?,
            order_id: row.get("order_id")?,
            expected_amount: parse_column(row, "expected_amount")?,
            received_amount: parse_optional_column(row, "received_amount")?,
            tx_hash: row.get("tx_hash")?,
            block_number: row.get::<_, Option<i64>>("block_number")?.map(|v| v as u64),
            confirmations: row.get::<_, i64>("confirmations")? as u64,
            status: parse_column(row, "status")?,
            created_at: timestamp_column(row, "created_at")?,
            confirmed_at: optional_timestamp_column(row, "confirmed_at")?,
        })
    }

    fn row_to_withdrawal(row: &Row) -> rusqlite::Result<Withdrawal> {
        Ok(Withdrawal {
            id: row.get("id")?,
            chain: parse_column(row, "chain")?,
            order_id: row.get("order_id")?,
            from_address: row.get("from_address")?,
            to_address: row.get("to_address")?,
            amount: parse_column(row, "amount")?,
            fee: parse_column(row, "fee")?,
            tx_hash: row.get("tx_hash")?,
            status: parse_column(row, "status")?,
            block_number: row.get::<_, Option<i64>>("block_number")?.map(|v| v as u64),
            confirmations: row.get::<_, i64>("confirmations")? as u64,
            created_at: timestamp_column(row, "created_at")?,
            sent_at: optional_timestamp_column(row, "sent_at")?,
            confirmed_at: optional_timestamp_column(row, "confirmed_at")?,
            error: row.get("error")?,
        })
    }

    fn row_to_wallet(row: &Row) -> rusqlite::Result<HotWallet> {
        Ok(HotWallet {
            id: row.get("id")?,
            chain: parse_column(row, "chain")?,
            address: row.get("address")?,
            encrypted_key: row.get("encrypted_key")?,
            balance: parse_column(row, "balance")?,
            last_checked_at: optional_timestamp_column(row, "last_checked_at")?,
        })
    }

    fn row_to_transaction(row: &Row) -> rusqlite::Result<Transaction> {
        Ok(Transaction {
            id: row.get("id")?,
            chain: parse_column(row, "chain")?,
            kind: parse_column(row, "kind")?,
            tx_hash: row.get("tx_hash")?,
            from_address: row.get("from_address")?,
            to_address: row.get("to_address")?,
            amount: parse_column(row, "amount")?,
            fee: parse_column(row, "fee")?,
            block_number: row.get::<_, Option<i64>>("block_number")?.map(|v| v as u64),
            status: parse_column(row, "status")?,
            confirmations: row.get::<_, i64>("confirmations")? as u64,
            created_at: timestamp_column(row, "created_at")?,
        })
    }

    // Synchronous helper methods for the trait implementations

    fn create_deposit_sync(&self, deposit: &Deposit) -> Result<Deposit, StorageError> {
        deposit.validate().map_err(StorageError::InvalidData)?;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO deposits (
                chain, address, user_id, order_id, expected_amount,
                received_amount, tx_hash, block_number, confirmations,
                status, created_at, confirmed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                deposit.chain.as_str(),
                deposit.address,
                deposit.user_id,
                deposit.order_id,
                deposit.expected_amount.to_string(),
                deposit.received_amount.map(|a| a.to_string()),
                deposit.tx_hash,
                deposit.block_number.map(|v| v as i64),
                deposit.confirmations as i64,
                deposit.status.as_str(),
                deposit.created_at.timestamp_millis(),
                deposit.confirmed_at.map(|t| t.timestamp_millis()),
            ],
        )
        .map_err(|e| {
            duplicate_or(e, || format!("{} deposit address {}", deposit.chain, deposit.address))
        })?;

        let mut created = deposit.clone();
        created.id = conn.last_insert_rowid();
        Ok(created)
    }

    fn get_deposit_sync(&self, id: i64) -> Result<Option<Deposit>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT * FROM deposits WHERE id = ?1",
            params![id],
            |row| Self::row_to_deposit(row),
        )
        .optional()
        .map_err(db_error)
    }

    fn get_deposit_by_address_sync(
        &self,
        chain: Chain,
        address: &str,
    ) -> Result<Option<Deposit>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            r#"
            SELECT * FROM deposits
            WHERE chain = ?1 AND address = ?2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            params![chain.as_str(), address],
            |row| Self::row_to_deposit(row),
        )
        .optional()
        .map_err(db_error)
    }

    fn get_deposit_by_tx_hash_sync(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> Result<Option<Deposit>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT * FROM deposits WHERE chain = ?1 AND tx_hash = ?2",
            params![chain.as_str(), tx_hash],
            |row| Self::row_to_deposit(row),
        )
        .optional()
        .map_err(db_error)
    }

    fn get_pending_deposits_sync(
        &self,
        chain: Chain,
        limit: usize,
    ) -> Result<Vec<Deposit>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                r#"
            SELECT * FROM deposits
            WHERE chain = ?1 AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT ?2
            "#,
            )
            .map_err(db_error)?;

        let records = stmt
            .query_map(params![chain.as_str(), limit as i64], |row| {
                Self::row_to_deposit(row)
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;

        Ok(records)
    }

    fn update_deposit_sync(&self, deposit: &Deposit) -> Result<WriteOutcome, StorageError> {
        deposit.validate().map_err(StorageError::InvalidData)?;
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
            UPDATE deposits SET
                received_amount = ?2,
                tx_hash = ?3,
                block_number = ?4,
                confirmations = ?5,
                status = ?6,
                confirmed_at = ?7
            WHERE id = ?1
                AND chain = ?8
                AND status = 'pending'
                AND (tx_hash IS NULL OR tx_hash = ?3)
                AND (received_amount IS NULL OR received_amount = ?2)
                AND (block_number IS NULL OR block_number <= ?4)
                AND confirmations <= ?5
            "#,
                params![
                    deposit.id,
                    deposit.received_amount.map(|a| a.to_string()),
                    deposit.tx_hash,
                    deposit.block_number.map(|v| v as i64),
                    deposit.confirmations as i64,
                    deposit.status.as_str(),
                    deposit.confirmed_at.map(|t| t.timestamp_millis()),
                    deposit.chain.as_str(),
                ],
            )
            .map_err(|e| duplicate_or(e, || format!("deposit tx {:?}", deposit.tx_hash)))?;

        Ok(outcome(rows_affected))
    }

    fn create_withdrawal_sync(&self, withdrawal: &Withdrawal) -> Result<Withdrawal, StorageError> {
        withdrawal.validate().map_err(StorageError::InvalidData)?;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO withdrawals (
                chain, order_id, from_address, to_address, amount, fee,
                tx_hash, status, block_number, confirmations,
                created_at, sent_at, confirmed_at, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                withdrawal.chain.as_str(),
                withdrawal.order_id,
                withdrawal.from_address,
                withdrawal.to_address,
                withdrawal.amount.to_string(),
                withdrawal.fee.to_string(),
                withdrawal.tx_hash,
                withdrawal.status.as_str(),
                withdrawal.block_number.map(|v| v as i64),
                withdrawal.confirmations as i64,
                withdrawal.created_at.timestamp_millis(),
                withdrawal.sent_at.map(|t| t.timestamp_millis()),
                withdrawal.confirmed_at.map(|t| t.timestamp_millis()),
                withdrawal.error,
            ],
        )
        .map_err(db_error)?;

        let mut created = withdrawal.clone();
        created.id = conn.last_insert_rowid();
        Ok(created)
    }

    fn get_withdrawal_sync(&self, id: i64) -> Result<Option<Withdrawal>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT * FROM withdrawals WHERE id = ?1",
            params![id],
            |row| Self::row_to_withdrawal(row),
        )
        .optional()
        .map_err(db_error)
    }

    fn get_withdrawals_by_status_sync(
        &self,
        chain: Chain,
        status: WithdrawalStatus,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                r#"
            SELECT * FROM withdrawals
            WHERE chain = ?1 AND status = ?2
            ORDER BY created_at ASC, id ASC
            LIMIT ?3
            "#,
            )
            .map_err(db_error)?;

        let records = stmt
            .query_map(
                params![chain.as_str(), status.as_str(), limit as i64],
                |row| Self::row_to_withdrawal(row),
            )
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;

        Ok(records)
    }

    fn update_withdrawal_sync(&self, withdrawal: &Withdrawal) -> Result<WriteOutcome, StorageError> {
        withdrawal.validate().map_err(StorageError::InvalidData)?;
        let conn = self.conn()?;

        // Fixed status literals, never user input
        let predecessors = withdrawal
            .status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            r#"
            UPDATE withdrawals SET
                tx_hash = ?2,
                status = ?3,
                block_number = ?4,
                confirmations = ?5,
                sent_at = ?6,
                confirmed_at = ?7,
                error = ?8
            WHERE id = ?1
                AND chain = ?9
                AND status IN ({})
                AND (tx_hash IS NULL OR tx_hash = ?2)
                AND confirmations <= ?5
            "#,
            predecessors
        );

        let rows_affected = conn
            .execute(
                &sql,
                params![
                    withdrawal.id,
                    withdrawal.tx_hash,
                    withdrawal.status.as_str(),
                    withdrawal.block_number.map(|v| v as i64),
                    withdrawal.confirmations as i64,
                    withdrawal.sent_at.map(|t| t.timestamp_millis()),
                    withdrawal.confirmed_at.map(|t| t.timestamp_millis()),
                    withdrawal.error,
                    withdrawal.chain.as_str(),
                ],
            )
            .map_err(db_error)?;

        Ok(outcome(rows_affected))
    }

    fn get_hot_wallet_sync(&self, chain: Chain) -> Result<Option<HotWallet>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT * FROM hot_wallets WHERE chain = ?1",
            params![chain.as_str()],
            |row| Self::row_to_wallet(row),
        )
        .optional()
        .map_err(db_error)
    }

    fn upsert_hot_wallet_sync(&self, wallet: &HotWallet) -> Result<HotWallet, StorageError> {
        {
            let conn = self.conn()?;
            conn.execute(
                r#"
            INSERT INTO hot_wallets (chain, address, encrypted_key, balance, last_checked_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(chain) DO UPDATE SET
                address = excluded.address,
                encrypted_key = excluded.encrypted_key,
                balance = excluded.balance,
                last_checked_at = excluded.last_checked_at
            "#,
                params![
                    wallet.chain.as_str(),
                    wallet.address,
                    wallet.encrypted_key,
                    wallet.balance.to_string(),
                    wallet.last_checked_at.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(db_error)?;
        }

        self.get_hot_wallet_sync(wallet.chain)?
            .ok_or_else(|| StorageError::NotFound(format!("hot wallet for {}", wallet.chain)))
    }

    fn update_hot_wallet_balance_sync(
        &self,
        chain: Chain,
        balance: Decimal,
    ) -> Result<WriteOutcome, StorageError> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                "UPDATE hot_wallets SET balance = ?1, last_checked_at = ?2 WHERE chain = ?3",
                params![
                    balance.to_string(),
                    Utc::now().timestamp_millis(),
                    chain.as_str()
                ],
            )
            .map_err(db_error)?;

        Ok(outcome(rows_affected))
    }

    fn record_transaction_sync(&self, tx: &Transaction) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO transactions (
                chain, kind, tx_hash, from_address, to_address, amount, fee,
                block_number, status, confirmations, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(chain, tx_hash) DO UPDATE SET
                block_number = excluded.block_number,
                status = excluded.status,
                confirmations = excluded.confirmations
            "#,
            params![
                tx.chain.as_str(),
                tx.kind.as_str(),
                tx.tx_hash,
                tx.from_address,
                tx.to_address,
                tx.amount.to_string(),
                tx.fee.to_string(),
                tx.block_number.map(|v| v as i64),
                tx.status.as_str(),
                tx.confirmations as i64,
                tx.created_at.timestamp_millis(),
            ],
        )
        .map_err(db_error)?;

        Ok(())
    }

    fn get_transactions_sync(
        &self,
        chain: Chain,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                r#"
            SELECT * FROM transactions
            WHERE chain = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
            )
            .map_err(db_error)?;

        let records = stmt
            .query_map(params![chain.as_str(), limit as i64], |row| {
                Self::row_to_transaction(row)
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;

        Ok(records)
    }

    fn count_by_status_sync(&self, chain: Chain) -> Result<LedgerCounts, StorageError> {
        let conn = self.conn()?;
        let mut counts = LedgerCounts::default();

        for (table, target) in [
            ("deposits", &mut counts.deposits),
            ("withdrawals", &mut counts.withdrawals),
        ] {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT status, COUNT(*) FROM {} WHERE chain = ?1 GROUP BY status",
                    table
                ))
                .map_err(db_error)?;

            let rows = stmt
                .query_map(params![chain.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(db_error)?;

            for row in rows {
                let (status, count) = row.map_err(db_error)?;
                target.insert(status, count as u64);
            }
        }

        Ok(counts)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn create_deposit(&self, deposit: &Deposit) -> StorageResult<Deposit> {
        self.create_deposit_sync(deposit)
    }

    async fn get_deposit(&self, id: i64) -> StorageResult<Option<Deposit>> {
        self.get_deposit_sync(id)
    }

    async fn get_deposit_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> StorageResult<Option<Deposit>> {
        self.get_deposit_by_address_sync(chain, address)
    }

    async fn get_deposit_by_tx_hash(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> StorageResult<Option<Deposit>> {
        self.get_deposit_by_tx_hash_sync(chain, tx_hash)
    }

    async fn get_pending_deposits(&self, chain: Chain, limit: usize) -> StorageResult<Vec<Deposit>> {
        self.get_pending_deposits_sync(chain, limit)
    }

    async fn update_deposit(&self, deposit: &Deposit) -> StorageResult<WriteOutcome> {
        self.update_deposit_sync(deposit)
    }

    async fn create_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<Withdrawal> {
        self.create_withdrawal_sync(withdrawal)
    }

    async fn get_withdrawal(&self, id: i64) -> StorageResult<Option<Withdrawal>> {
        self.get_withdrawal_sync(id)
    }

    async fn get_pending_withdrawals(
        &self,
        chain: Chain,
        limit: usize,
    ) -> StorageResult<Vec<Withdrawal>> {
        self.get_withdrawals_by_status_sync(chain, WithdrawalStatus::Pending, limit)
    }

    async fn get_withdrawals_by_status(
        &self,
        chain: Chain,
        status: WithdrawalStatus,
        limit: usize,
    ) -> StorageResult<Vec<Withdrawal>> {
        self.get_withdrawals_by_status_sync(chain, status, limit)
    }

    async fn update_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<WriteOutcome> {
        self.update_withdrawal_sync(withdrawal)
    }

    async fn get_hot_wallet(&self, chain: Chain) -> StorageResult<Option<HotWallet>> {
        self.get_hot_wallet_sync(chain)
    }

    async fn upsert_hot_wallet(&self, wallet: &HotWallet) -> StorageResult<HotWallet> {
        self.upsert_hot_wallet_sync(wallet)
    }

    async fn update_hot_wallet_balance(
        &self,
        chain: Chain,
        balance: Decimal,
    ) -> StorageResult<WriteOutcome> {
        self.update_hot_wallet_balance_sync(chain, balance)
    }

    async fn record_transaction(&self, tx: &Transaction) -> StorageResult<()> {
        self.record_transaction_sync(tx)
    }

    async fn get_transactions(&self, chain: Chain, limit: usize) -> StorageResult<Vec<Transaction>> {
        self.get_transactions_sync(chain, limit)
    }

    async fn count_by_status(&self, chain: Chain) -> StorageResult<LedgerCounts> {
        self.count_by_status_sync(chain)
    }
}

fn outcome(rows_affected: usize) -> WriteOutcome {
    if rows_affected == 0 {
        WriteOutcome::NotFound
    } else {
        WriteOutcome::Applied
    }
}

/// Map a rusqlite error, keeping corrupt rows and lock contention apart
fn db_error(e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(_, _, inner) => {
            StorageError::InvalidData(inner.to_string())
        }
        rusqlite::Error::SqliteFailure(ref err, _)
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StorageError::Connection(e.to_string())
        }
        other => StorageError::Database(other.to_string()),
    }
}

fn duplicate_or(e: rusqlite::Error, what: impl FnOnce() -> String) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(what());
        }
    }
    db_error(e)
}

fn invalid_column(column: &str, message: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(StorageError::InvalidData(format!("{}: {}", column, message))),
    )
}

fn parse_column<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e| invalid_column(column, e))
}

fn parse_optional_column<T>(row: &Row, column: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match row.get::<_, Option<String>>(column)? {
        Some(raw) => raw.parse().map(Some).map_err(|e| invalid_column(column, e)),
        None => Ok(None),
    }
}

fn timestamp_column(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(column)?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| invalid_column(column, format!("timestamp out of range: {}", millis)))
}

fn optional_timestamp_column(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(column)? {
        Some(millis) => DateTime::<Utc>::from_timestamp_millis(millis)
            .map(Some)
            .ok_or_else(|| invalid_column(column, format!("timestamp out of range: {}", millis))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;

    fn amount(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn create_test_deposit(address: &str) -> Deposit {
        Deposit::new(
            Chain::Ethereum,
            address.to_string(),
            "user-1".to_string(),
            "order-1".to_string(),
            amount("1.0"),
        )
    }

    fn create_test_withdrawal(order: &str) -> Withdrawal {
        Withdrawal::new(
            Chain::Ethereum,
            order.to_string(),
            "0xhot".to_string(),
            "0xdest".to_string(),
            amount("0.5"),
            amount("0.01"),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let created = store.create_deposit(&create_test_deposit("0xaa")).await.unwrap();
        assert!(created.id > 0);

        let retrieved = store.get_deposit(created.id).await.unwrap().unwrap();
        assert_eq!(retrieved.address, "0xaa");
        assert_eq!(retrieved.expected_amount, amount("1.0"));
        assert_eq!(retrieved.status, DepositStatus::Pending);
        assert!(retrieved.received_amount.is_none());
    }

    #[tokio::test]
    async fn test_get_by_address_is_chain_scoped() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.create_deposit(&create_test_deposit("0xaa")).await.unwrap();

        assert!(store
            .get_deposit_by_address(Chain::Ethereum, "0xaa")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_deposit_by_address(Chain::Polygon, "0xaa")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_pending_address() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.create_deposit(&create_test_deposit("0xsame")).await.unwrap();

        let result = store.create_deposit(&create_test_deposit("0xsame")).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_update_is_conditional() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let mut record = store.create_deposit(&create_test_deposit("0xaa")).await.unwrap();

        record.record_observation("0xtx".to_string(), 100, amount("1.0"));
        record.raise_confirmations(1);
        assert_eq!(store.update_deposit(&record).await.unwrap(), WriteOutcome::Applied);

        // rewriting the same state is harmless
        assert_eq!(store.update_deposit(&record).await.unwrap(), WriteOutcome::Applied);

        record.raise_confirmations(3);
        record.mark_confirmed(Utc::now());
        assert_eq!(store.update_deposit(&record).await.unwrap(), WriteOutcome::Applied);

        // terminal rows are frozen
        let mut late = record.clone();
        late.raise_confirmations(9);
        assert_eq!(store.update_deposit(&late).await.unwrap(), WriteOutcome::NotFound);

        let stored = store.get_deposit(record.id).await.unwrap().unwrap();
        assert_eq!(stored.confirmations, 3);
        assert_eq!(stored.status, DepositStatus::Confirmed);
        assert!(stored.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_rejects_replaced_hash() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let mut record = store.create_deposit(&create_test_deposit("0xaa")).await.unwrap();
        record.record_observation("0xtx".to_string(), 100, amount("1.0"));
        store.update_deposit(&record).await.unwrap();

        let mut replaced = record.clone();
        replaced.tx_hash = Some("0xother".to_string());
        assert_eq!(store.update_deposit(&replaced).await.unwrap(), WriteOutcome::NotFound);

        let mut missing = create_test_deposit("0xbb");
        missing.id = 999;
        assert_eq!(store.update_deposit(&missing).await.unwrap(), WriteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_pending_withdrawals_fifo() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let base = Utc::now();

        for (i, order) in ["c", "a", "b"].iter().enumerate() {
            let mut w = create_test_withdrawal(order);
            // created out of insertion order
            w.created_at = base + chrono::Duration::seconds([3, 1, 2][i]);
            store.create_withdrawal(&w).await.unwrap();
        }

        let pending = store.get_pending_withdrawals(Chain::Ethereum, 10).await.unwrap();
        let orders: Vec<_> = pending.iter().map(|w| w.order_id.as_str()).collect();
        assert_eq!(orders, vec!["a", "b", "c"]);

        let limited = store.get_pending_withdrawals(Chain::Ethereum, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_withdrawal_transitions() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let mut w = store.create_withdrawal(&create_test_withdrawal("o1")).await.unwrap();

        w.mark_sent("0xhash".to_string(), Utc::now());
        assert_eq!(store.update_withdrawal(&w).await.unwrap(), WriteOutcome::Applied);

        // a second broadcast hash is refused
        let mut rebroadcast = w.clone();
        rebroadcast.tx_hash = Some("0xsecond".to_string());
        assert_eq!(
            store.update_withdrawal(&rebroadcast).await.unwrap(),
            WriteOutcome::NotFound
        );

        w.advance_block(10);
        w.raise_confirmations(12);
        w.mark_confirmed(Utc::now());
        assert_eq!(store.update_withdrawal(&w).await.unwrap(), WriteOutcome::Applied);

        // no regression from confirmed
        let mut regressed = w.clone();
        regressed.status = WithdrawalStatus::Sent;
        regressed.confirmed_at = None;
        assert_eq!(
            store.update_withdrawal(&regressed).await.unwrap(),
            WriteOutcome::NotFound
        );

        let stored = store.get_withdrawal(w.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Confirmed);
        assert_eq!(stored.tx_hash.as_deref(), Some("0xhash"));
    }

    #[tokio::test]
    async fn test_invalid_record_rejected() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let mut w = store.create_withdrawal(&create_test_withdrawal("o1")).await.unwrap();
        w.status = WithdrawalStatus::Sent;

        let result = store.update_withdrawal(&w).await;
        assert!(matches!(result, Err(StorageError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_hot_wallet_balance() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        assert_eq!(
            store
                .update_hot_wallet_balance(Chain::Bsc, amount("1"))
                .await
                .unwrap(),
            WriteOutcome::NotFound
        );

        let wallet = HotWallet::new(Chain::Bsc, "0xhot".to_string(), "kms:key".to_string());
        store.upsert_hot_wallet(&wallet).await.unwrap();

        store
            .update_hot_wallet_balance(Chain::Bsc, amount("12.5"))
            .await
            .unwrap();

        let stored = store.get_hot_wallet(Chain::Bsc).await.unwrap().unwrap();
        assert_eq!(stored.balance, amount("12.5"));
        assert_eq!(stored.encrypted_key, "kms:key");
        assert!(stored.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_transaction_upsert_and_counts() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        let mut w = store.create_withdrawal(&create_test_withdrawal("o1")).await.unwrap();
        w.mark_sent("0xhash".to_string(), Utc::now());
        store.update_withdrawal(&w).await.unwrap();

        let mut tx = Transaction::from_withdrawal(&w).unwrap();
        store.record_transaction(&tx).await.unwrap();
        tx.confirmations = 4;
        tx.block_number = Some(77);
        store.record_transaction(&tx).await.unwrap();

        let txs = store.get_transactions(Chain::Ethereum, 10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Withdrawal);
        assert_eq!(txs[0].confirmations, 4);
        assert_eq!(txs[0].block_number, Some(77));

        store.create_deposit(&create_test_deposit("0xaa")).await.unwrap();
        let counts = store.count_by_status(Chain::Ethereum).await.unwrap();
        assert_eq!(counts.deposits.get("pending"), Some(&1));
        assert_eq!(counts.withdrawals.get("sent"), Some(&1));
    }

    #[tokio::test]
    async fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger").join("custody.db");

        let id = {
            let store = SqliteLedgerStore::new(&path, 4).unwrap();
            store.create_deposit(&create_test_deposit("0xaa")).await.unwrap().id
        };

        let reopened = SqliteLedgerStore::new(&path, 4).unwrap();
        assert!(reopened.get_deposit(id).await.unwrap().is_some());
    }
}
