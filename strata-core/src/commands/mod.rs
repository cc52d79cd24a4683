//! Command implementations: install, upgrade, uninstall, baseline, info, validate.

use std::collections::HashMap;

use crate::config::StrataConfig;
use crate::db::Connection;
use crate::error::{Result, StrataError};
use crate::feedback::Feedback;
use crate::hooks::HookRegistry;
use crate::ledger::Ledger;
use crate::roles::{RoleOptions, RoleProvisioner};

mod apply;
pub mod baseline;
pub mod info;
pub mod install;
pub mod uninstall;
pub mod upgrade;
pub mod validate;

pub use apply::AppliedChangelog;

/// Everything a command needs for one engine run.
pub struct EngineContext<'a> {
    pub conn: &'a Connection,
    pub config: &'a StrataConfig,
    pub registry: &'a HookRegistry,
    pub roles: Option<&'a dyn RoleProvisioner>,
    pub feedback: &'a dyn Feedback,
}

impl EngineContext<'_> {
    /// Ledger handle for the configured schema and table, tagged with the module name if set.
    pub fn ledger(&self) -> Ledger {
        let ledger = Ledger::new(&self.config.module.schema, &self.config.module.table);
        match &self.config.module.name {
            Some(name) => ledger.with_module(name),
            None => ledger,
        }
    }

    fn module_name(&self) -> Result<&str> {
        self.config.module.name.as_deref().ok_or_else(|| {
            StrataError::ConfigError(
                "A module name is required. Set [module] name in the config file.".to_string(),
            )
        })
    }
}

/// Options shared by install and upgrade.
#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Highest version to apply (inclusive).
    pub max_version: Option<String>,
    /// Parameter values as text, keyed by parameter name.
    pub parameters: HashMap<String, String>,
    pub beta_testing: bool,
    pub skip_drop_app: bool,
    pub skip_create_app: bool,
    pub roles: RoleOptions,
    /// Upgrade only: proceed even if the installation is in beta testing mode.
    pub force: bool,
    /// Install only: demo data set loaded after the install is committed.
    pub demo_data: Option<String>,
}
