//! Database connection, TLS support, advisory locking, and the implicit transaction
//! that every install/upgrade/uninstall runs inside.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row, SimpleQueryMessage};

use crate::config::SslMode;
use crate::error::{Result, StrataError};

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal.
///
/// Uses the `E'...'` escape form when the value contains backslashes so the
/// result is independent of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StrataError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StrataError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Rows, column names and affected-row count produced by one statement.
#[derive(Debug, Default, Clone)]
pub struct StatementOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub row_count: u64,
}

/// A single database session with an implicit transaction.
///
/// The first mutating call opens a transaction; nothing becomes visible to
/// other sessions until [`Connection::commit`] is called. Read-only queries
/// issued while no transaction is open run in autocommit mode.
pub struct Connection {
    client: Client,
    in_transaction: AtomicBool,
}

impl Connection {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            in_transaction: AtomicBool::new(false),
        }
    }

    /// The underlying client, for callers that need raw driver access.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether a transaction is currently open on this session.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// Open the implicit transaction if none is open yet.
    pub async fn begin(&self) -> Result<()> {
        if !self.in_transaction() {
            self.client.batch_execute("BEGIN").await?;
            self.in_transaction.store(true, Ordering::SeqCst);
            tracing::debug!("Transaction opened");
        }
        Ok(())
    }

    /// Commit the open transaction. A no-op when none is open.
    pub async fn commit(&self) -> Result<()> {
        if self.in_transaction() {
            self.client.batch_execute("COMMIT").await?;
            self.in_transaction.store(false, Ordering::SeqCst);
            tracing::debug!("Transaction committed");
        }
        Ok(())
    }

    /// Roll back the open transaction. A no-op when none is open.
    pub async fn rollback(&self) -> Result<()> {
        if self.in_transaction() {
            self.in_transaction.store(false, Ordering::SeqCst);
            self.client.batch_execute("ROLLBACK").await?;
            tracing::debug!("Transaction rolled back");
        }
        Ok(())
    }

    /// Run a read-only query. Does not open a transaction.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.client.query(sql, params).await?)
    }

    /// Run a read-only query expecting exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        Ok(self.client.query_one(sql, params).await?)
    }

    /// Run a mutating statement inside the implicit transaction.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.begin().await?;
        Ok(self.client.execute(sql, params).await?)
    }

    /// Run one or more mutating statements without parameters inside the implicit transaction.
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.begin().await?;
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Run a single already-split statement through the simple query protocol
    /// inside the implicit transaction and collect everything it returned.
    pub async fn run_statement(
        &self,
        statement: &str,
    ) -> std::result::Result<StatementOutcome, tokio_postgres::Error> {
        if !self.in_transaction() {
            self.client.batch_execute("BEGIN").await?;
            self.in_transaction.store(true, Ordering::SeqCst);
        }

        let messages = self.client.simple_query(statement).await?;
        let mut outcome = StatementOutcome::default();
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => {
                    if outcome.columns.is_empty() {
                        outcome.columns =
                            row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    let values = (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect();
                    outcome.rows.push(values);
                }
                SimpleQueryMessage::CommandComplete(count) => {
                    outcome.row_count = count;
                }
                _ => {}
            }
        }
        Ok(outcome)
    }
}

/// Build a rustls ClientConfig using the Mozilla CA bundle.
///
/// The crypto provider is named explicitly: with more than one rustls backend
/// compiled in, there is no process-level default to pick up.
fn make_rustls_config() -> Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| {
            StrataError::ConfigError(format!("Failed to build TLS configuration: {}", e))
        })?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

/// Check if a postgres error is a permanent authentication failure that should not be retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

/// Connect once, spawning the connection task.
///
/// With a TLS config the handshake is attempted first; `prefer` falls back to
/// plaintext when it fails.
async fn connect_once(
    conn_string: &str,
    ssl_mode: &SslMode,
    tls_config: Option<&rustls::ClientConfig>,
    connect_timeout_secs: u32,
) -> std::result::Result<Client, tokio_postgres::Error> {
    let connect_fut = async {
        if let Some(config) = tls_config {
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(config.clone());
            match tokio_postgres::connect(conn_string, tls).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::error!(error = %e, "Database connection error");
                        }
                    });
                    return Ok(client);
                }
                Err(e) if *ssl_mode == SslMode::Require => return Err(e),
                Err(e) => {
                    tracing::debug!(error = %e, "TLS connection failed, falling back to plaintext");
                }
            }
        }

        let (client, connection) =
            tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Database connection error");
            }
        });
        Ok(client)
    };

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(
            std::time::Duration::from_secs(connect_timeout_secs as u64),
            connect_fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(tokio_postgres::Error::__private_api_timeout()),
        }
    } else {
        connect_fut.await
    }
}

/// Connect to the database using the provided connection string.
pub async fn connect(conn_string: &str) -> Result<Connection> {
    connect_with_config(conn_string, &SslMode::Prefer, 0, 30, 0).await
}

/// Connect to the database, retrying up to `retries` times with exponential backoff + jitter.
///
/// Each retry waits `min(2^attempt, 30) + rand(0..1000ms)` before the next attempt.
/// Permanent errors (authentication failures) are not retried.
pub async fn connect_with_config(
    conn_string: &str,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
    statement_timeout_secs: u32,
) -> Result<Connection> {
    let tls_config = match ssl_mode {
        SslMode::Disable => None,
        SslMode::Prefer | SslMode::Require => Some(make_rustls_config()?),
    };
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt.min(5), 30);
            let delay = std::time::Duration::from_secs(base_delay)
                + std::time::Duration::from_millis(fastrand::u64(0..1000));
            tracing::info!(
                attempt = attempt + 1,
                max_attempts = retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match connect_once(conn_string, ssl_mode, tls_config.as_ref(), connect_timeout_secs).await {
            Ok(client) => {
                if attempt > 0 {
                    tracing::info!(
                        attempt = attempt + 1,
                        max_attempts = retries + 1,
                        "Connected successfully after retry"
                    );
                }

                if statement_timeout_secs > 0 {
                    let timeout_sql =
                        format!("SET statement_timeout = '{}s'", statement_timeout_secs);
                    client.batch_execute(&timeout_sql).await?;
                }

                return Ok(Connection::new(client));
            }
            Err(e) => {
                if is_permanent_error(&e) {
                    tracing::error!(error = %e, "Permanent connection error, not retrying");
                    return Err(StrataError::DatabaseError(e));
                }
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(StrataError::DatabaseError(e)),
        None => Err(StrataError::ConfigError(
            "No connection attempt was made".to_string(),
        )),
    }
}

/// Acquire a session-level PostgreSQL advisory lock keyed on the ledger table.
///
/// Serializes concurrent engine runs against the same schema/module.
pub async fn acquire_advisory_lock(conn: &Connection, lock_name: &str) -> Result<()> {
    let lock_id = advisory_lock_id(lock_name);
    tracing::info!(lock_id = lock_id, lock = %lock_name, "Acquiring advisory lock");

    conn.client()
        .execute("SELECT pg_advisory_lock($1)", &[&lock_id])
        .await
        .map_err(|e| StrataError::LockError(crate::error::format_db_error(&e)))?;

    Ok(())
}

/// Release the advisory lock taken by [`acquire_advisory_lock`].
pub async fn release_advisory_lock(conn: &Connection, lock_name: &str) -> Result<()> {
    let lock_id = advisory_lock_id(lock_name);
    tracing::info!(lock_id = lock_id, lock = %lock_name, "Releasing advisory lock");

    conn.client()
        .execute("SELECT pg_advisory_unlock($1)", &[&lock_id])
        .await
        .map_err(|e| StrataError::LockError(crate::error::format_db_error(&e)))?;

    Ok(())
}

/// Compute a stable i64 lock ID from the lock name using CRC32.
fn advisory_lock_id(lock_name: &str) -> i64 {
    crc32fast::hash(lock_name.as_bytes()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("simple"), "\"simple\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"C:\data"), r"E'C:\\data'");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("public").is_ok());
        assert!(validate_identifier("strata_migrations_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad-name").is_err());
        assert!(validate_identifier("x; DROP TABLE y").is_err());
    }

    #[test]
    fn test_rustls_config_builds_without_default_provider() {
        assert!(make_rustls_config().is_ok());
    }

    #[test]
    fn test_advisory_lock_id_is_stable() {
        assert_eq!(
            advisory_lock_id("public.strata_migrations"),
            advisory_lock_id("public.strata_migrations")
        );
        assert_ne!(
            advisory_lock_id("public.strata_migrations"),
            advisory_lock_id("other.strata_migrations")
        );
    }
}
