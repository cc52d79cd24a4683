use std::collections::HashMap;

use serde::Serialize;

use crate::changelog;
use crate::config::StrataConfig;
use crate::error::{Result, StrataError};
use crate::hooks::{HookPhase, HookRegistry};
use crate::sql::SqlContent;

/// Report returned after a validate operation.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub valid: bool,
    pub changelogs_checked: usize,
    pub hooks_checked: usize,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Execute the validate command. No database connection is used.
///
/// Every changelog and every hook is checked against the resolved parameters;
/// all problems are collected before failing.
pub fn execute(
    config: &StrataConfig,
    registry: &HookRegistry,
    parameters: &HashMap<String, String>,
) -> Result<ValidateReport> {
    let parameters = config.resolve_parameters(parameters)?;
    let changelogs = changelog::discover(&config.changelogs_root(), None, None)?;

    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if changelogs.is_empty() {
        warnings.push(format!(
            "No changelogs found in '{}'",
            config.changelogs_root().display()
        ));
    }

    for changelog in &changelogs {
        if let Err(e) = changelog.validate(&parameters) {
            issues.push(e.reason());
        }
    }

    let hooks: Vec<_> = [HookPhase::DropApp, HookPhase::CreateApp, HookPhase::Uninstall]
        .into_iter()
        .flat_map(|phase| config.hooks_for(phase))
        .collect();

    for hook in &hooks {
        if let Err(e) = hook.validate(&parameters, registry) {
            issues.push(e.reason());
        }
    }

    if config.hooks.uninstall.is_empty() {
        warnings.push("No uninstall hooks configured; uninstall will be refused.".to_string());
    }

    for demo in &config.demo_data {
        let file = config.resolve_path(&demo.file);
        if let Err(e) = SqlContent::file(&file).validate(&parameters.sql_parameters()) {
            issues.push(format!("Demo data '{}': {}", demo.name, e.reason()));
        }
    }

    let valid = issues.is_empty();

    tracing::info!(
        valid = valid,
        changelogs = changelogs.len(),
        hooks = hooks.len(),
        issue_count = issues.len(),
        warning_count = warnings.len(),
        "Validation completed"
    );

    if !valid {
        return Err(StrataError::ValidationFailed(issues.join("\n")));
    }

    Ok(ValidateReport {
        valid,
        changelogs_checked: changelogs.len(),
        hooks_checked: hooks.len(),
        issues,
        warnings,
    })
}
