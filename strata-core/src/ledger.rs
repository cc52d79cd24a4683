//! The migration ledger: one append-only row per install, upgrade or baseline event.

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_postgres::Row;

use crate::changelog::Changelog;
use crate::db::{quote_ident, Connection};
use crate::error::{Result, StrataError};
use crate::parameter::ParameterSet;
use crate::version::Version;

/// Layout version of the ledger table itself, stored on every row.
pub const LEDGER_TABLE_VERSION: &str = "2025.0";

/// A row from the ledger table.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub id: String,
    pub date_installed: NaiveDateTime,
    pub module: Option<String>,
    pub version: Version,
    pub beta_testing: bool,
    pub changelog_files: Vec<String>,
    pub parameters: serde_json::Value,
    pub migration_table_version: String,
}

/// Result of comparing the installed baseline with the changelogs on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    /// Changelogs newer than the baseline exist.
    Behind,
    /// The baseline is the newest changelog.
    Current,
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerStatus::Behind => write!(f, "behind"),
            LedgerStatus::Current => write!(f, "current"),
        }
    }
}

/// Handle on the ledger table of one schema/module.
#[derive(Debug, Clone)]
pub struct Ledger {
    schema: String,
    table: String,
    module: Option<String>,
}

const SELECT_COLUMNS: &str = "id::text, date_installed, module, version, beta_testing, \
     changelog_files, parameters::text, migration_table_version";

impl Ledger {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            module: None,
        }
    }

    /// Module name written on rows inserted through this handle.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    /// `"schema"."table"`, quoted.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Unquoted `schema.table`, used for the advisory lock key and messages.
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Check if the ledger table exists in the configured schema.
    pub async fn exists(&self, conn: &Connection) -> Result<bool> {
        let row = conn
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&self.schema, &self.table],
            )
            .await?;
        Ok(row.get::<_, bool>(0))
    }

    /// Schemas other than the configured one holding a table with the ledger's name.
    pub async fn exists_in_other_schemas(&self, conn: &Connection) -> Result<Vec<String>> {
        let rows = conn
            .query(
                "SELECT table_schema::text FROM information_schema.tables
                 WHERE table_name = $1 AND table_schema <> $2
                 ORDER BY table_schema",
                &[&self.table, &self.schema],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    /// Create the ledger table (and its schema) if it does not exist.
    pub async fn create(
        &self,
        conn: &Connection,
        allow_multiple_modules: bool,
        commit: bool,
    ) -> Result<()> {
        if self.exists(conn).await? {
            tracing::debug!(ledger = %self.display_name(), "Ledger table already exists");
            return Ok(());
        }

        let others = self.exists_in_other_schemas(conn).await?;
        if !others.is_empty() && !allow_multiple_modules {
            return Err(StrataError::MigrationState(format!(
                "A ledger table '{}' already exists in schema(s) {}. \
                 Set allow_multiple_modules to keep a separate ledger in '{}'.",
                self.table,
                others.join(", "),
                self.schema
            )));
        }

        let sql = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE {fq} (
    id                      UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    date_installed          TIMESTAMP NOT NULL DEFAULT now(),
    module                  VARCHAR(50),
    version                 VARCHAR(50) NOT NULL,
    beta_testing            BOOLEAN NOT NULL DEFAULT FALSE,
    changelog_files         TEXT[],
    parameters              JSONB,
    migration_table_version VARCHAR(50) NOT NULL DEFAULT '{table_version}'
);
"#,
            schema = quote_ident(&self.schema),
            fq = self.qualified_name(),
            table_version = LEDGER_TABLE_VERSION,
        );

        tracing::info!(ledger = %self.display_name(), "Creating ledger table");
        conn.batch_execute(&sql).await?;

        if commit {
            conn.commit().await?;
        }
        Ok(())
    }

    /// All ledger rows, oldest first. Empty when the table does not exist.
    pub async fn records(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        if !self.exists(conn).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} ORDER BY date_installed, version",
            SELECT_COLUMNS,
            self.qualified_name()
        );
        let rows = conn.query(&sql, &[]).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// The row with the highest version, ties broken by installation time.
    pub async fn baseline_record(&self, conn: &Connection) -> Result<Option<MigrationRecord>> {
        let records = self.records(conn).await?;
        Ok(records.into_iter().max_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.date_installed.cmp(&b.date_installed))
        }))
    }

    /// The currently installed version, or `None` if the ledger is empty or absent.
    pub async fn baseline(&self, conn: &Connection) -> Result<Option<Version>> {
        Ok(self.baseline_record(conn).await?.map(|r| r.version))
    }

    /// Append a row for `version`.
    ///
    /// Fails unless `version` is strictly greater than the current baseline.
    pub async fn set_baseline(
        &self,
        conn: &Connection,
        version: &str,
        changelog_files: &[String],
        parameters: &ParameterSet,
        beta_testing: bool,
        commit: bool,
    ) -> Result<()> {
        let version = Version::parse(version)?;

        if let Some(current) = self.baseline(conn).await? {
            if version <= current {
                return Err(StrataError::MigrationState(format!(
                    "Cannot set baseline to {} in {}: it must be greater than the current baseline {}",
                    version,
                    self.display_name(),
                    current
                )));
            }
        }

        let sql = format!(
            "INSERT INTO {} (module, version, beta_testing, changelog_files, parameters, migration_table_version) \
             VALUES ($1, $2, $3, $4, ($5::text)::jsonb, $6)",
            self.qualified_name()
        );
        let files: Vec<String> = changelog_files.to_vec();
        let params_json = parameters.to_json().to_string();

        conn.execute(
            &sql,
            &[
                &self.module,
                &version.as_str(),
                &beta_testing,
                &files,
                &params_json,
                &LEDGER_TABLE_VERSION,
            ],
        )
        .await?;

        tracing::info!(
            ledger = %self.display_name(),
            version = %version,
            files = files.len(),
            beta_testing = beta_testing,
            "Recorded ledger entry"
        );

        if commit {
            conn.commit().await?;
        }
        Ok(())
    }

    /// Compare the installed baseline with the full set of changelogs on disk.
    pub async fn compare(&self, conn: &Connection, changelogs: &[Changelog]) -> Result<LedgerStatus> {
        let baseline = self.baseline(conn).await?.ok_or_else(|| {
            StrataError::MigrationState(format!(
                "Ledger {} has no baseline to compare with",
                self.display_name()
            ))
        })?;
        compare_versions(&baseline, changelogs)
    }

    /// The full row for `version`, or the baseline row when `version` is `None`.
    pub async fn migration_details(
        &self,
        conn: &Connection,
        version: Option<&str>,
    ) -> Result<MigrationRecord> {
        match version {
            None => self.baseline_record(conn).await?.ok_or_else(|| {
                StrataError::MigrationState(format!(
                    "Ledger {} has no entries",
                    self.display_name()
                ))
            }),
            Some(raw) => {
                let wanted = Version::parse(raw)?;
                self.records(conn)
                    .await?
                    .into_iter()
                    .filter(|r| r.version == wanted)
                    .max_by(|a, b| a.date_installed.cmp(&b.date_installed))
                    .ok_or_else(|| {
                        StrataError::MigrationState(format!(
                            "Version {} is not recorded in ledger {}",
                            wanted,
                            self.display_name()
                        ))
                    })
            }
        }
    }

    /// Whether a row exists for `version`.
    pub async fn is_applied(&self, conn: &Connection, version: &Version) -> Result<bool> {
        Ok(self
            .records(conn)
            .await?
            .iter()
            .any(|r| &r.version == version))
    }
}

/// `compare()` on an already-read baseline.
pub fn compare_versions(baseline: &Version, changelogs: &[Changelog]) -> Result<LedgerStatus> {
    if !changelogs.iter().any(|c| c.version() == baseline) {
        return Err(StrataError::MigrationState(format!(
            "Installed baseline {} has no matching changelog directory. \
             The changelogs no longer match what was installed.",
            baseline
        )));
    }
    if changelogs.iter().any(|c| c.version() > baseline) {
        Ok(LedgerStatus::Behind)
    } else {
        Ok(LedgerStatus::Current)
    }
}

fn record_from_row(row: &Row) -> Result<MigrationRecord> {
    let raw_version: String = row.get(3);
    let version = Version::parse(&raw_version).map_err(|e| {
        StrataError::MigrationState(format!("Ledger holds an unreadable version: {}", e))
    })?;

    let parameters = match row.get::<_, Option<String>>(6) {
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            StrataError::MigrationState(format!(
                "Ledger parameters for version {} are not valid JSON: {}",
                version, e
            ))
        })?,
        None => serde_json::Value::Null,
    };

    Ok(MigrationRecord {
        id: row.get(0),
        date_installed: row.get(1),
        module: row.get(2),
        version,
        beta_testing: row.get(4),
        changelog_files: row.get::<_, Option<Vec<String>>>(5).unwrap_or_default(),
        parameters,
        migration_table_version: row.get(7),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn changelogs(versions: &[&str]) -> Vec<Changelog> {
        versions
            .iter()
            .map(|v| Changelog::new(Version::parse(v).unwrap(), PathBuf::from(v)))
            .collect()
    }

    #[test]
    fn test_compare_versions() {
        let set = changelogs(&["1.0.0", "1.1.0"]);
        assert_eq!(
            compare_versions(&Version::parse("1.0.0").unwrap(), &set).unwrap(),
            LedgerStatus::Behind
        );
        assert_eq!(
            compare_versions(&Version::parse("1.1.0").unwrap(), &set).unwrap(),
            LedgerStatus::Current
        );
        // 1.1 and 1.1.0 are the same version
        assert_eq!(
            compare_versions(&Version::parse("1.1").unwrap(), &set).unwrap(),
            LedgerStatus::Current
        );
    }

    #[test]
    fn test_compare_missing_baseline_is_an_error() {
        let set = changelogs(&["1.0.0", "1.1.0"]);
        let err = compare_versions(&Version::parse("1.0.5").unwrap(), &set).unwrap_err();
        assert!(matches!(err, StrataError::MigrationState(_)));
    }

    #[test]
    fn test_names() {
        let ledger = Ledger::new("my_schema", "strata_migrations").with_module("demo");
        assert_eq!(ledger.qualified_name(), "\"my_schema\".\"strata_migrations\"");
        assert_eq!(ledger.display_name(), "my_schema.strata_migrations");
        assert_eq!(ledger.module(), Some("demo"));
    }
}
