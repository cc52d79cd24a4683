//! Install a module into a database that has no ledger yet.

use serde::Serialize;

use super::apply::{self, AppliedChangelog, Phases};
use super::{EngineContext, MigrateOptions};
use crate::changelog;
use crate::error::{Result, StrataError};
use crate::feedback::Progress;
use crate::sql::SqlContent;
use crate::version::Version;

/// Report returned after an install.
#[derive(Debug, Serialize)]
pub struct InstallReport {
    pub module: String,
    pub baseline: Option<Version>,
    pub changelogs_applied: Vec<AppliedChangelog>,
    pub hooks_executed: usize,
    pub roles_created: bool,
    pub permissions_granted: bool,
    pub demo_data: Option<String>,
}

/// Execute the install command.
///
/// Fails without writing anything if the ledger already exists. Everything up
/// to and including the roles phase is committed together; demo data, if
/// requested, is loaded and committed afterwards.
pub async fn execute(ctx: &EngineContext<'_>, options: &MigrateOptions) -> Result<InstallReport> {
    let module = ctx.module_name()?.to_string();
    let ledger = ctx.ledger();

    if ledger.exists(ctx.conn).await? {
        return Err(StrataError::MigrationState(format!(
            "Ledger {} already exists. Use upgrade, or start from an empty database.",
            ledger.display_name()
        )));
    }

    let parameters = ctx.config.resolve_parameters(&options.parameters)?;
    let max_version = options
        .max_version
        .as_deref()
        .map(Version::parse)
        .transpose()?;

    let root = ctx.config.changelogs_root();
    let changelogs = changelog::discover(&root, None, max_version.as_ref())?;
    if changelogs.is_empty() {
        return Err(StrataError::InvalidChangelog(format!(
            "No changelogs to install in '{}'",
            root.display()
        )));
    }

    let phases = Phases::from_options(ctx, options);
    apply::preflight(ctx, &changelogs, &phases, &parameters, options)?;

    let demo_file = options
        .demo_data
        .as_deref()
        .map(|name| ctx.config.demo_data_file(name))
        .transpose()?;
    if let Some(ref file) = demo_file {
        if ctx.config.module.validate_on_run {
            SqlContent::file(file).validate(&parameters.sql_parameters())?;
        }
    }

    let total = apply::total_steps(&phases, &changelogs, options)?;
    let mut progress = Progress::new(ctx.feedback, total);
    progress.note(&format!(
        "Installing module {} up to version {}",
        module,
        changelogs
            .last()
            .map(|c| c.version().to_string())
            .unwrap_or_default()
    ))?;

    ledger
        .create(ctx.conn, ctx.config.module.allow_multiple_modules, false)
        .await?;

    let outcome = apply::run(
        ctx,
        &ledger,
        &changelogs,
        &phases,
        &parameters,
        options,
        &mut progress,
    )
    .await?;

    apply::commit(ctx, &progress).await?;

    if let Some(ref file) = demo_file {
        tracing::info!(file = %file.display(), "Loading demo data");
        SqlContent::file(file)
            .with_phase("demo data")
            .execute(ctx.conn, &parameters.sql_parameters(), true)
            .await?;
    }

    let baseline = changelogs.last().map(|c| c.version().clone());
    tracing::info!(
        module = %module,
        baseline = ?baseline.as_ref().map(|v| v.to_string()),
        changelogs = outcome.applied.len(),
        hooks = outcome.hooks_executed,
        "Install completed"
    );

    Ok(InstallReport {
        module,
        baseline,
        changelogs_applied: outcome.applied,
        hooks_executed: outcome.hooks_executed,
        roles_created: outcome.roles_created,
        permissions_granted: outcome.permissions_granted,
        demo_data: options.demo_data.clone(),
    })
}
