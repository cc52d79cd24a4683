pub mod changelog;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod feedback;
pub mod hooks;
pub mod ledger;
pub mod parameter;
pub mod placeholder;
pub mod roles;
pub mod sql;
pub mod version;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use commands::EngineContext;
use config::StrataConfig;
use db::Connection;
use error::{Result, StrataError};
use feedback::{Feedback, LogFeedback};
use hooks::{CodeHook, HookRegistry};
use roles::RoleProvisioner;

pub use commands::baseline::BaselineReport;
pub use commands::info::{ChangelogInfo, ChangelogState, InfoReport};
pub use commands::install::InstallReport;
pub use commands::uninstall::UninstallReport;
pub use commands::upgrade::UpgradeReport;
pub use commands::validate::ValidateReport;
pub use commands::{AppliedChangelog, MigrateOptions};
pub use config::CliOverrides;
pub use ledger::{LedgerStatus, MigrationRecord};

/// Main entry point for the Strata library.
///
/// Owns one database session. Install, upgrade, uninstall and baseline run
/// under an advisory lock on the ledger table; if one of them fails, the open
/// transaction is rolled back before the error is returned.
pub struct Strata {
    pub config: StrataConfig,
    conn: Connection,
    registry: HookRegistry,
    roles: Option<Arc<dyn RoleProvisioner>>,
    feedback: Arc<dyn Feedback>,
}

impl Strata {
    /// Create a new Strata instance, connecting to the database.
    ///
    /// If `connect_retries` is configured, retries with exponential backoff.
    pub async fn new(config: StrataConfig) -> Result<Self> {
        let conn_string = config.connection_string()?;
        let conn = db::connect_with_config(
            &conn_string,
            &config.database.ssl_mode,
            config.database.connect_retries,
            config.database.connect_timeout_secs,
            config.database.statement_timeout_secs,
        )
        .await?;
        Ok(Self::with_connection(config, conn))
    }

    /// Create a new Strata instance with an existing connection.
    pub fn with_connection(config: StrataConfig, conn: Connection) -> Self {
        Self {
            config,
            conn,
            registry: HookRegistry::new(),
            roles: None,
            feedback: Arc::new(LogFeedback::new()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Register a code hook for a hook file declared in the config.
    ///
    /// Relative paths resolve against the config file's directory, like the hook declarations.
    pub fn register_hook(&mut self, path: impl AsRef<Path>, hook: Arc<dyn CodeHook>) {
        let path = self.config.resolve_path(path.as_ref());
        self.registry.register(path, hook);
    }

    pub fn set_role_provisioner(&mut self, provisioner: Arc<dyn RoleProvisioner>) {
        self.roles = Some(provisioner);
    }

    pub fn set_feedback(&mut self, feedback: Arc<dyn Feedback>) {
        self.feedback = feedback;
    }

    /// The progress sink; call `cancel()` on it to stop a running command.
    ///
    /// A cancellation stays in effect for later commands until `reset()` is called.
    pub fn feedback(&self) -> Arc<dyn Feedback> {
        Arc::clone(&self.feedback)
    }

    fn context(&self) -> EngineContext<'_> {
        EngineContext {
            conn: &self.conn,
            config: &self.config,
            registry: &self.registry,
            roles: self.roles.as_deref(),
            feedback: self.feedback.as_ref(),
        }
    }

    async fn guarded<T>(&self, command: &str, run: impl Future<Output = Result<T>>) -> Result<T> {
        let lock_name = self.context().ledger().display_name();
        let use_lock = self.config.module.advisory_lock;

        // A cancellation requested before or while waiting for the lock still counts.
        self.feedback.unlock_cancellation();

        if use_lock {
            db::acquire_advisory_lock(&self.conn, &lock_name).await?;
        }

        let result = if self.feedback.is_cancelled() {
            Err(StrataError::Cancelled(format!(
                "{} was cancelled before it started",
                command
            )))
        } else {
            run.await
        };

        if let Err(ref e) = result {
            tracing::error!(command = command, error = %e, "Command failed, rolling back");
            if let Err(rollback_err) = self.conn.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
        }

        // Always release the advisory lock
        if use_lock {
            if let Err(e) = db::release_advisory_lock(&self.conn, &lock_name).await {
                tracing::warn!(error = %e, "Failed to release advisory lock");
            }
        }

        result
    }

    /// Install the module into a database without a ledger.
    pub async fn install(&self, options: &MigrateOptions) -> Result<InstallReport> {
        let ctx = self.context();
        self.guarded("install", commands::install::execute(&ctx, options))
            .await
    }

    /// Apply changelogs newer than the installed baseline.
    pub async fn upgrade(&self, options: &MigrateOptions) -> Result<UpgradeReport> {
        let ctx = self.context();
        self.guarded("upgrade", commands::upgrade::execute(&ctx, options))
            .await
    }

    /// Run the uninstall hooks.
    pub async fn uninstall(
        &self,
        parameters: &HashMap<String, String>,
        commit: bool,
    ) -> Result<UninstallReport> {
        let ctx = self.context();
        self.guarded(
            "uninstall",
            commands::uninstall::execute(&ctx, parameters, commit),
        )
        .await
    }

    /// Record a baseline for an existing database.
    pub async fn baseline(&self, version: &str) -> Result<BaselineReport> {
        let ctx = self.context();
        self.guarded("baseline", commands::baseline::execute(&ctx, version))
            .await
    }

    /// Show changelog and ledger status.
    pub async fn info(&self) -> Result<InfoReport> {
        commands::info::execute(&self.context()).await
    }

    /// Validate changelogs and hooks without touching the database.
    pub fn validate(&self, parameters: &HashMap<String, String>) -> Result<ValidateReport> {
        commands::validate::execute(&self.config, &self.registry, parameters)
    }

    /// Compare the installed baseline with the changelogs on disk.
    pub async fn compare(&self) -> Result<LedgerStatus> {
        let changelogs = changelog::discover(&self.config.changelogs_root(), None, None)?;
        self.context()
            .ledger()
            .compare(&self.conn, &changelogs)
            .await
    }

    /// Ledger row for `version`, or the baseline row.
    pub async fn migration_details(&self, version: Option<&str>) -> Result<MigrationRecord> {
        self.context()
            .ledger()
            .migration_details(&self.conn, version)
            .await
    }
}
