//! The drop-app → changelogs → create-app → roles sequence shared by install and upgrade.

use serde::Serialize;

use super::{EngineContext, MigrateOptions};
use crate::changelog::Changelog;
use crate::error::{Result, StrataError};
use crate::feedback::Progress;
use crate::hooks::{HookDefinition, HookPhase};
use crate::ledger::Ledger;
use crate::parameter::ParameterSet;

/// A changelog applied during this run.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedChangelog {
    pub version: String,
    pub files: Vec<String>,
}

#[derive(Debug, Default)]
pub(super) struct SequenceOutcome {
    pub applied: Vec<AppliedChangelog>,
    pub hooks_executed: usize,
    pub roles_created: bool,
    pub permissions_granted: bool,
}

pub(super) struct Phases {
    pub drop_app: Vec<HookDefinition>,
    pub create_app: Vec<HookDefinition>,
}

impl Phases {
    pub fn from_options(ctx: &EngineContext<'_>, options: &MigrateOptions) -> Self {
        Self {
            drop_app: if options.skip_drop_app {
                Vec::new()
            } else {
                ctx.config.hooks_for(HookPhase::DropApp)
            },
            create_app: if options.skip_create_app {
                Vec::new()
            } else {
                ctx.config.hooks_for(HookPhase::CreateApp)
            },
        }
    }

    fn hooks(&self) -> impl Iterator<Item = &HookDefinition> {
        self.drop_app.iter().chain(self.create_app.iter())
    }
}

/// Hooks + changelog files + role operations.
pub(super) fn total_steps(
    phases: &Phases,
    changelogs: &[Changelog],
    options: &MigrateOptions,
) -> Result<usize> {
    let mut files = 0;
    for changelog in changelogs {
        files += changelog.files()?.len();
    }
    Ok(phases.drop_app.len() + phases.create_app.len() + files + options.roles.step_count())
}

/// Checks done before anything is written.
pub(super) fn preflight(
    ctx: &EngineContext<'_>,
    changelogs: &[Changelog],
    phases: &Phases,
    parameters: &ParameterSet,
    options: &MigrateOptions,
) -> Result<()> {
    if options.roles.create_roles && ctx.roles.is_none() {
        return Err(StrataError::ConfigError(
            "Role creation was requested but no role provisioner is configured".to_string(),
        ));
    }

    if !ctx.config.module.validate_on_run {
        return Ok(());
    }

    for changelog in changelogs {
        changelog.validate(parameters)?;
    }
    for hook in phases.hooks() {
        hook.validate(parameters, ctx.registry)?;
    }
    tracing::debug!(changelogs = changelogs.len(), "Pre-run validation passed");
    Ok(())
}

/// Run the sequence without committing.
pub(super) async fn run(
    ctx: &EngineContext<'_>,
    ledger: &Ledger,
    changelogs: &[Changelog],
    phases: &Phases,
    parameters: &ParameterSet,
    options: &MigrateOptions,
    progress: &mut Progress<'_>,
) -> Result<SequenceOutcome> {
    let mut outcome = SequenceOutcome::default();

    let drop_total = phases.drop_app.len();
    for (i, hook) in phases.drop_app.iter().enumerate() {
        progress.step(&format!("Dropping application (hook {}/{})", i + 1, drop_total))?;
        hook.execute(ctx.conn, false, parameters, ctx.registry).await?;
        outcome.hooks_executed += 1;
    }

    for changelog in changelogs {
        let files = changelog
            .apply(
                ctx.conn,
                parameters,
                Some(ledger),
                options.beta_testing,
                Some(&mut *progress),
            )
            .await?;
        outcome.applied.push(AppliedChangelog {
            version: changelog.version().to_string(),
            files,
        });
    }

    let create_total = phases.create_app.len();
    for (i, hook) in phases.create_app.iter().enumerate() {
        progress.step(&format!("Creating application (hook {}/{})", i + 1, create_total))?;
        hook.execute(ctx.conn, false, parameters, ctx.registry).await?;
        outcome.hooks_executed += 1;
    }

    if options.roles.create_roles {
        let provisioner = ctx.roles.ok_or_else(|| {
            StrataError::ConfigError("No role provisioner is configured".to_string())
        })?;

        progress.step("Creating roles")?;
        provisioner
            .create_roles(ctx.conn, options.roles.grant, ctx.feedback)
            .await?;
        outcome.roles_created = true;

        if options.roles.grant {
            progress.step("Granting permissions")?;
            provisioner.grant_permissions(ctx.conn, ctx.feedback).await?;
            outcome.permissions_granted = true;
        }
    }

    Ok(outcome)
}

/// Latch cancellation, then commit.
pub(super) async fn commit(ctx: &EngineContext<'_>, progress: &Progress<'_>) -> Result<()> {
    ctx.feedback.lock_cancellation();
    progress.check_cancelled()?;
    ctx.feedback
        .report_progress("Committing", progress.completed(), progress.completed());
    ctx.conn.commit().await
}
