//! Uninstall a module by running its uninstall hooks.

use std::collections::HashMap;

use serde::Serialize;

use super::EngineContext;
use crate::error::{Result, StrataError};
use crate::feedback::Progress;
use crate::hooks::HookPhase;

/// Report returned after an uninstall.
#[derive(Debug, Serialize)]
pub struct UninstallReport {
    pub hooks_executed: usize,
    pub committed: bool,
}

/// Execute the uninstall command.
///
/// There is no implicit reverse migration: at least one uninstall hook must be configured.
pub async fn execute(
    ctx: &EngineContext<'_>,
    parameters: &HashMap<String, String>,
    commit: bool,
) -> Result<UninstallReport> {
    let hooks = ctx.config.hooks_for(HookPhase::Uninstall);
    if hooks.is_empty() {
        return Err(StrataError::ConfigError(
            "No uninstall hooks are configured; nothing defines how to uninstall this module"
                .to_string(),
        ));
    }

    let parameters = ctx.config.resolve_parameters(parameters)?;
    if ctx.config.module.validate_on_run {
        for hook in &hooks {
            hook.validate(&parameters, ctx.registry)?;
        }
    }

    let total = hooks.len();
    let mut progress = Progress::new(ctx.feedback, total);
    for (i, hook) in hooks.iter().enumerate() {
        progress.step(&format!("Uninstalling (hook {}/{})", i + 1, total))?;
        hook.execute(ctx.conn, false, &parameters, ctx.registry).await?;
    }

    if commit {
        ctx.feedback.lock_cancellation();
        progress.check_cancelled()?;
        ctx.conn.commit().await?;
    }

    tracing::info!(hooks = total, committed = commit, "Uninstall completed");
    Ok(UninstallReport {
        hooks_executed: total,
        committed: commit,
    })
}
