//! Upgrade an installed module to newer changelogs.

use serde::Serialize;

use super::apply::{self, AppliedChangelog, Phases};
use super::{EngineContext, MigrateOptions};
use crate::changelog::{self, Changelog};
use crate::error::{Result, StrataError};
use crate::feedback::Progress;
use crate::ledger::{compare_versions, MigrationRecord};
use crate::version::Version;

/// Report returned after an upgrade.
#[derive(Debug, Serialize)]
pub struct UpgradeReport {
    pub module: String,
    pub previous_baseline: Version,
    pub baseline: Version,
    pub changelogs_applied: Vec<AppliedChangelog>,
    pub hooks_executed: usize,
    pub roles_created: bool,
    pub permissions_granted: bool,
    pub up_to_date: bool,
}

/// Whether `version` is accounted for by the ledger.
///
/// A row without files is a baseline recorded to adopt an existing database;
/// it stands for every version up to its own.
fn covered_by_adoption(records: &[MigrationRecord], version: &Version) -> bool {
    records
        .iter()
        .any(|r| r.changelog_files.is_empty() && &r.version >= version)
}

/// Execute the upgrade command.
pub async fn execute(ctx: &EngineContext<'_>, options: &MigrateOptions) -> Result<UpgradeReport> {
    let module = ctx.module_name()?.to_string();
    let ledger = ctx.ledger();

    if !ledger.exists(ctx.conn).await? {
        return Err(StrataError::MigrationState(format!(
            "Ledger {} does not exist. Install the module first.",
            ledger.display_name()
        )));
    }

    let current = ledger.baseline_record(ctx.conn).await?.ok_or_else(|| {
        StrataError::MigrationState(format!(
            "Ledger {} has no entries. Install the module or set a baseline first.",
            ledger.display_name()
        ))
    })?;

    if let Some(ref recorded) = current.module {
        if recorded != &module {
            return Err(StrataError::MigrationState(format!(
                "Ledger {} belongs to module '{}', not '{}'",
                ledger.display_name(),
                recorded,
                module
            )));
        }
    }

    if current.beta_testing && !options.force {
        return Err(StrataError::MigrationState(format!(
            "Module '{}' was installed in beta testing mode (version {}). \
             Upgrading it is refused unless forced.",
            module, current.version
        )));
    }

    let parameters = ctx.config.resolve_parameters(&options.parameters)?;
    let max_version = options
        .max_version
        .as_deref()
        .map(Version::parse)
        .transpose()?;

    let baseline = current.version.clone();
    let all = changelog::discover(&ctx.config.changelogs_root(), None, None)?;
    compare_versions(&baseline, &all)?;

    let records = ledger.records(ctx.conn).await?;
    for changelog in all.iter().filter(|c| c.version() <= &baseline) {
        if !changelog.is_applied(ctx.conn, &ledger).await?
            && !covered_by_adoption(&records, changelog.version())
        {
            return Err(StrataError::MigrationState(format!(
                "Changelog {} is not newer than the baseline {} but was never recorded as applied. \
                 The database no longer matches its own history.",
                changelog.version(),
                baseline
            )));
        }
    }

    let applicable: Vec<Changelog> = all
        .into_iter()
        .filter(|c| c.version() > &baseline)
        .filter(|c| max_version.as_ref().is_none_or(|max| c.version() <= max))
        .collect();

    if applicable.is_empty() {
        tracing::info!(module = %module, baseline = %baseline, "Module is up to date");
        return Ok(UpgradeReport {
            module,
            previous_baseline: baseline.clone(),
            baseline,
            changelogs_applied: Vec::new(),
            hooks_executed: 0,
            roles_created: false,
            permissions_granted: false,
            up_to_date: true,
        });
    }

    let phases = Phases::from_options(ctx, options);
    apply::preflight(ctx, &applicable, &phases, &parameters, options)?;

    let total = apply::total_steps(&phases, &applicable, options)?;
    let mut progress = Progress::new(ctx.feedback, total);
    progress.note(&format!(
        "Starting upgrade of module {} from {} ({} changelog(s))",
        module,
        baseline,
        applicable.len()
    ))?;

    let outcome = apply::run(
        ctx,
        &ledger,
        &applicable,
        &phases,
        &parameters,
        options,
        &mut progress,
    )
    .await?;

    apply::commit(ctx, &progress).await?;

    let new_baseline = applicable
        .last()
        .map(|c| c.version().clone())
        .unwrap_or_else(|| baseline.clone());

    tracing::info!(
        module = %module,
        from = %baseline,
        to = %new_baseline,
        changelogs = outcome.applied.len(),
        hooks = outcome.hooks_executed,
        "Upgrade completed"
    );

    Ok(UpgradeReport {
        module,
        previous_baseline: baseline,
        baseline: new_baseline,
        changelogs_applied: outcome.applied,
        hooks_executed: outcome.hooks_executed,
        roles_created: outcome.roles_created,
        permissions_granted: outcome.permissions_granted,
        up_to_date: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(version: &str, files: &[&str]) -> MigrationRecord {
        MigrationRecord {
            id: "00000000-0000-0000-0000-000000000000".to_string(),
            date_installed: NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            module: Some("demo".to_string()),
            version: Version::parse(version).unwrap(),
            beta_testing: false,
            changelog_files: files.iter().map(|f| f.to_string()).collect(),
            parameters: serde_json::Value::Null,
            migration_table_version: "2025.0".to_string(),
        }
    }

    #[test]
    fn test_adoption_row_covers_older_versions() {
        let records = vec![record("1.2.0", &[])];
        assert!(covered_by_adoption(&records, &Version::parse("1.0.0").unwrap()));
        assert!(covered_by_adoption(&records, &Version::parse("1.2").unwrap()));
        assert!(!covered_by_adoption(&records, &Version::parse("1.3.0").unwrap()));
    }

    #[test]
    fn test_applied_rows_do_not_cover_other_versions() {
        let records = vec![record("1.2.0", &["changelogs/1.2.0/01.sql"])];
        assert!(!covered_by_adoption(&records, &Version::parse("1.0.0").unwrap()));
    }
}
