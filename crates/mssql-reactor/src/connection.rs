//! Connection facade: transaction commands, savepoints, and session options.
//!
//! Transaction control reduces to simple text exchanges on the underlying
//! client; the server answers with environment-change tokens that the
//! client's listeners fold into the connection state before anything else
//! observes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tds_wire::{ClientMessage, Message, SqlBatch};

use crate::binding::Binding;
use crate::client::{Client, TransactionStatus};
use crate::config::{ConnectionOptions, SignedDuration};
use crate::cursor;
use crate::error::{Error, Result};
use crate::exchange::QueryStream;
use crate::statement_cache::PreparedStatementCache;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// SQL Server default.
    #[default]
    ReadCommitted,
    /// Rows read within the transaction cannot change.
    RepeatableRead,
    /// Full isolation.
    Serializable,
    /// Row-versioned point-in-time view.
    Snapshot,
}

impl IsolationLevel {
    /// The `SET TRANSACTION ISOLATION LEVEL` statement for this level.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            Self::Snapshot => "SET TRANSACTION ISOLATION LEVEL SNAPSHOT",
        }
    }
}

/// How deeply [`Connection::validate`] probes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationDepth {
    /// Check client-side state only.
    Local,
    /// Round-trip a validation query to the server.
    Remote,
}

/// Attributes of a transaction to begin.
#[derive(Debug, Clone, Default)]
pub struct TransactionDefinition {
    name: Option<String>,
    mark: Option<String>,
    isolation_level: Option<IsolationLevel>,
    lock_wait_timeout: Option<SignedDuration>,
}

impl TransactionDefinition {
    /// An empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the transaction. The name is sanitized and validated before use.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark the transaction in the log. Requires a name.
    #[must_use]
    pub fn mark(mut self, mark: impl Into<String>) -> Self {
        self.mark = Some(mark.into());
        self
    }

    /// Run the transaction at the given isolation level.
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Apply a lock wait timeout for the duration of the transaction.
    /// Negative values mean infinite wait.
    #[must_use]
    pub fn lock_wait_timeout(mut self, timeout: SignedDuration) -> Self {
        self.lock_wait_timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
struct TxState {
    isolation_level: IsolationLevel,
    previous_isolation_level: Option<IsolationLevel>,
    reset_lock_wait: bool,
}

/// A connection to SQL Server.
pub struct Connection {
    client: Client,
    options: ConnectionOptions,
    cache: Arc<Mutex<PreparedStatementCache>>,
    statement_timeout: Mutex<Option<Duration>>,
    auto_commit: AtomicBool,
    tx_state: Mutex<TxState>,
}

impl Connection {
    /// Create a connection over an established client.
    #[must_use]
    pub fn new(client: Client, options: ConnectionOptions) -> Self {
        let cache = PreparedStatementCache::from_spec(options.statement_cache());
        let auto_commit = client.transaction_status() == TransactionStatus::AutoCommit;
        let statement_timeout = options.statement_timeout();

        Self {
            client,
            options,
            cache: Arc::new(Mutex::new(cache)),
            statement_timeout: Mutex::new(statement_timeout),
            auto_commit: AtomicBool::new(auto_commit),
            tx_state: Mutex::new(TxState {
                isolation_level: IsolationLevel::default(),
                previous_isolation_level: None,
                reset_lock_wait: false,
            }),
        }
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The prepared-statement cache of this connection.
    #[must_use]
    pub fn statement_cache(&self) -> &Arc<Mutex<PreparedStatementCache>> {
        &self.cache
    }

    /// Execute a query, routing between direct and cursored execution by the
    /// configured fetch size and the binding.
    ///
    /// # Errors
    ///
    /// Fails synchronously on an empty query, a closed connection, or a full
    /// request queue.
    pub fn query(&self, sql: &str, binding: Binding) -> Result<QueryStream> {
        let options = self.effective_options();
        cursor::exchange(&self.client, &options, &self.cache, sql, binding)
    }

    /// Begin a transaction with default attributes.
    ///
    /// # Errors
    ///
    /// Propagates exchange and server errors.
    pub async fn begin_transaction(&self) -> Result<()> {
        self.begin_transaction_with(TransactionDefinition::default())
            .await
    }

    /// Begin a transaction.
    ///
    /// Skipped when a server transaction is already started.
    ///
    /// # Errors
    ///
    /// Fails on invalid transaction names or marks, and propagates exchange
    /// and server errors.
    pub async fn begin_transaction_with(&self, definition: TransactionDefinition) -> Result<()> {
        let status = self.client.transaction_status();
        if status == TransactionStatus::Started {
            tracing::debug!(?status, "skipping begin transaction");
            return Ok(());
        }

        let mut sql = String::from("BEGIN TRANSACTION");
        if let Some(name) = &definition.name {
            let name = sanitized_identifier(name, 32)?;
            sql.push(' ');
            sql.push_str(&name);

            if let Some(mark) = &definition.mark {
                let mark = sanitized_identifier(mark, 128)?;
                sql.push_str(" WITH MARK '");
                sql.push_str(&mark);
                sql.push('\'');
            }
        }
        sql.push(';');

        if let Some(level) = definition.isolation_level {
            sql.push_str(level.as_sql());
            sql.push(';');
        }

        let lock_wait_timeout = definition
            .lock_wait_timeout
            .or_else(|| self.options.lock_wait_timeout());
        if let Some(timeout) = lock_wait_timeout {
            self.tx_state.lock().reset_lock_wait = true;
            sql.push_str(&format!("SET LOCK_TIMEOUT {};", timeout.lock_timeout_millis()));
        }

        tracing::debug!(?status, "beginning transaction");
        self.run_batch(&sql).await?;

        let mut tx = self.tx_state.lock();
        tx.previous_isolation_level = Some(tx.isolation_level);
        if let Some(level) = definition.isolation_level {
            tx.isolation_level = level;
        }
        Ok(())
    }

    /// Commit the current transaction.
    ///
    /// Skipped when no server transaction is active.
    ///
    /// # Errors
    ///
    /// Propagates exchange and server errors.
    pub async fn commit_transaction(&self) -> Result<()> {
        let status = self.client.transaction_status();
        if status != TransactionStatus::Started {
            tracing::debug!(?status, "skipping commit transaction");
            return Ok(());
        }

        tracing::debug!(?status, "committing transaction");
        let sql = format!("IF @@TRANCOUNT > 0 COMMIT TRANSACTION;{}", self.cleanup_sql());
        self.run_batch(&sql).await?;
        self.apply_cleanup();
        Ok(())
    }

    /// Roll back the current transaction.
    ///
    /// # Errors
    ///
    /// Propagates exchange and server errors.
    pub async fn rollback_transaction(&self) -> Result<()> {
        let status = self.client.transaction_status();
        if status != TransactionStatus::Started && status != TransactionStatus::Explicit {
            tracing::debug!(?status, "skipping rollback transaction");
            return Ok(());
        }

        tracing::debug!(?status, "rolling back transaction");
        let sql = format!(
            "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;{}",
            self.cleanup_sql()
        );
        self.run_batch(&sql).await?;
        self.apply_cleanup();
        Ok(())
    }

    /// Create a savepoint. Enters implicit transaction mode when needed.
    ///
    /// # Errors
    ///
    /// Fails on invalid savepoint names and propagates exchange and server
    /// errors.
    pub async fn create_savepoint(&self, name: &str) -> Result<()> {
        let name = sanitized_identifier(name, 32)?;

        tracing::debug!(savepoint = %name, "creating savepoint");
        let sql = format!(
            "SET IMPLICIT_TRANSACTIONS ON; IF @@TRANCOUNT = 0 BEGIN BEGIN TRAN IF @@TRANCOUNT = 2 COMMIT TRAN END SAVE TRAN {name};"
        );
        self.run_batch(&sql).await?;
        self.auto_commit.store(false, Ordering::Release);
        Ok(())
    }

    /// Roll back to a savepoint.
    ///
    /// Skipped when no server transaction is active.
    ///
    /// # Errors
    ///
    /// Fails on invalid savepoint names and propagates exchange and server
    /// errors.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let name = sanitized_identifier(name, 32)?;

        let status = self.client.transaction_status();
        if status != TransactionStatus::Started {
            tracing::debug!(?status, savepoint = %name, "skipping rollback to savepoint");
            return Ok(());
        }

        tracing::debug!(savepoint = %name, "rolling back to savepoint");
        self.run_batch(&format!("ROLLBACK TRANSACTION {name}")).await
    }

    /// Whether the connection commits each statement on its own.
    #[must_use]
    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
            && self.client.transaction_status() != TransactionStatus::Started
    }

    /// Switch auto-commit mode, committing any pending transaction first.
    ///
    /// # Errors
    ///
    /// Propagates exchange and server errors.
    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let mut sql = String::new();
        if self.auto_commit.load(Ordering::Acquire) != auto_commit {
            sql.push_str("IF @@TRANCOUNT > 0 COMMIT TRAN;");
        }
        sql.push_str(if auto_commit {
            "SET IMPLICIT_TRANSACTIONS OFF;"
        } else {
            "SET IMPLICIT_TRANSACTIONS ON;"
        });

        self.run_batch(&sql).await?;
        self.auto_commit.store(auto_commit, Ordering::Release);
        Ok(())
    }

    /// Apply a lock wait timeout. Negative values translate to `-1`
    /// (infinite wait).
    ///
    /// # Errors
    ///
    /// Propagates exchange and server errors.
    pub async fn set_lock_wait_timeout(&self, timeout: SignedDuration) -> Result<()> {
        self.run_batch(&format!("SET LOCK_TIMEOUT {}", timeout.lock_timeout_millis()))
            .await
    }

    /// Set the statement timeout for subsequent queries. Statements
    /// exceeding the timeout are cancelled through an attention request.
    pub fn set_statement_timeout(&self, timeout: Duration) {
        *self.statement_timeout.lock() = Some(timeout);
    }

    /// The transaction isolation level currently in effect.
    #[must_use]
    pub fn transaction_isolation_level(&self) -> IsolationLevel {
        self.tx_state.lock().isolation_level
    }

    /// Change the transaction isolation level.
    ///
    /// # Errors
    ///
    /// Propagates exchange and server errors.
    pub async fn set_transaction_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.run_batch(level.as_sql()).await?;
        self.tx_state.lock().isolation_level = level;
        Ok(())
    }

    /// Check connection health.
    pub async fn validate(&self, depth: ValidationDepth) -> bool {
        if depth == ValidationDepth::Local {
            return self.client.is_connected();
        }

        if !self.client.is_connected() {
            return false;
        }

        match cursor::exchange_direct(
            &self.client,
            &self.effective_options(),
            "SELECT 1",
            Binding::empty(),
        ) {
            Ok(mut stream) => loop {
                match stream.next_message().await {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "validation failed");
                        break false;
                    }
                    None => break true,
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "validation failed");
                false
            }
        }
    }

    /// Cancel the running command through an out-of-band attention request.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed.
    pub async fn cancel(&self) -> Result<()> {
        self.client.attention().await
    }

    fn effective_options(&self) -> ConnectionOptions {
        let mut options = self.options.clone();
        if let Some(timeout) = *self.statement_timeout.lock() {
            options = options.with_statement_timeout(timeout);
        }
        options
    }

    /// Render the post-transaction cleanup. The cleanup restores the
    /// isolation level and lock wait timeout and is idempotent.
    fn cleanup_sql(&self) -> String {
        let tx = self.tx_state.lock();
        let mut sql = String::new();

        if let Some(previous) = tx.previous_isolation_level {
            if previous != tx.isolation_level {
                sql.push_str(previous.as_sql());
                sql.push(';');
            }
        }

        if tx.reset_lock_wait {
            sql.push_str("SET LOCK_TIMEOUT -1;");
        }

        sql
    }

    fn apply_cleanup(&self) {
        let mut tx = self.tx_state.lock();
        if let Some(previous) = tx.previous_isolation_level.take() {
            tx.isolation_level = previous;
        }
        tx.reset_lock_wait = false;
    }

    async fn run_batch(&self, sql: &str) -> Result<()> {
        let batch = SqlBatch::new(sql, self.client.transaction_descriptor());
        let mut stream = self.client.exchange(ClientMessage::SqlBatch(batch), |message| {
            matches!(message, Message::Done(done) if done.is_done()) || message.is_attention_ack()
        })?;

        let mut first_error = None;
        while let Some(item) = stream.next_message().await {
            match item {
                Ok(Message::Error(token)) => {
                    if first_error.is_none() {
                        first_error = Some(Error::server(&token));
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.client.is_connected())
            .field("auto_commit", &self.auto_commit.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Sanitize an identifier: `-` and `.` become `_`, the identifier is cut to
/// its trailing `max_length` characters, and a non-alphanumeric leading
/// character is dropped.
fn sanitize(identifier: &str, max_length: usize) -> String {
    let replaced: Vec<char> = identifier
        .chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c })
        .collect();

    let start = replaced.len().saturating_sub(max_length);
    let mut sanitized: String = replaced[start..].iter().collect();

    if let Some(first) = sanitized.chars().next() {
        if !first.is_alphanumeric() {
            sanitized = sanitized.chars().skip(1).collect();
        }
    }

    sanitized
}

/// Whether a sanitized identifier matches `[\w\d_]{1,max_length}`.
fn is_valid_identifier(identifier: &str, max_length: usize) -> bool {
    let mut length = 0;
    for c in identifier.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return false;
        }
        length += 1;
    }
    length >= 1 && length <= max_length
}

/// Sanitize and validate an identifier for use in transaction commands.
fn sanitized_identifier(identifier: &str, max_length: usize) -> Result<String> {
    let sanitized = sanitize(identifier, max_length);
    if is_valid_identifier(&sanitized, max_length) {
        Ok(sanitized)
    } else {
        Err(Error::InvalidIdentifier(format!(
            "identifiers must contain only characters, numbers and underscores and must not exceed {max_length} characters: {identifier:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize("my-save.point", 32), "my_save_point");
    }

    #[test]
    fn test_sanitize_keeps_trailing_characters() {
        assert_eq!(sanitize("abcdefgh", 4), "efgh");
    }

    #[test]
    fn test_sanitize_drops_leading_non_alphanumeric() {
        assert_eq!(sanitize("_name", 32), "name");
        assert_eq!(sanitize("@name", 32), "name");
    }

    #[test]
    fn test_sanitize_empty() {
        assert_eq!(sanitize("", 32), "");
    }

    #[test]
    fn test_sanitized_identifier_round_trip() {
        // Sanitization then validation succeeds iff the sanitized form
        // matches the identifier pattern and is non-empty.
        for (input, expected_valid) in [
            ("savepoint1", true),
            ("my-point", true),
            ("a.b.c", true),
            ("_x", true),
            ("", false),
            ("_", false),
            ("näme", false),
            ("bad name", false),
            ("quote'name", false),
        ] {
            let result = sanitized_identifier(input, 32);
            assert_eq!(
                result.is_ok(),
                expected_valid,
                "unexpected outcome for {input:?}: {result:?}"
            );
            if let Ok(sanitized) = result {
                assert!(is_valid_identifier(&sanitized, 32));
            }
        }
    }

    #[test]
    fn test_identifier_length_limit() {
        let long = "a".repeat(33);
        assert!(sanitized_identifier(&long, 32).is_ok());
        assert_eq!(sanitized_identifier(&long, 32).unwrap().len(), 32);

        let long_valid = "b".repeat(32);
        assert_eq!(sanitized_identifier(&long_valid, 32).unwrap(), long_valid);
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(
            IsolationLevel::ReadCommitted.as_sql(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(
            IsolationLevel::Snapshot.as_sql(),
            "SET TRANSACTION ISOLATION LEVEL SNAPSHOT"
        );
    }

    #[test]
    fn test_transaction_definition_builder() {
        let definition = TransactionDefinition::new()
            .name("tx-1")
            .mark("audit")
            .isolation_level(IsolationLevel::Serializable);
        assert_eq!(definition.name.as_deref(), Some("tx-1"));
        assert_eq!(definition.mark.as_deref(), Some("audit"));
        assert_eq!(
            definition.isolation_level,
            Some(IsolationLevel::Serializable)
        );
    }
}
