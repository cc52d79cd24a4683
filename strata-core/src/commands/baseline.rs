//! Record a baseline version for a database whose schema already exists.

use serde::Serialize;

use super::EngineContext;
use crate::error::Result;
use crate::parameter::ParameterSet;
use crate::version::Version;

#[derive(Debug, Serialize)]
pub struct BaselineReport {
    pub previous_baseline: Option<Version>,
    pub baseline: Version,
}

/// Execute the baseline command.
///
/// 1. Create the ledger if it does not exist
/// 2. Append a row for `version` with no files
/// 3. Commit
///
/// The version must be greater than the current baseline.
pub async fn execute(ctx: &EngineContext<'_>, version: &str) -> Result<BaselineReport> {
    let baseline = Version::parse(version)?;
    let ledger = ctx.ledger();

    ledger
        .create(ctx.conn, ctx.config.module.allow_multiple_modules, false)
        .await?;
    let previous_baseline = ledger.baseline(ctx.conn).await?;

    ledger
        .set_baseline(
            ctx.conn,
            baseline.as_str(),
            &[],
            &ParameterSet::new(),
            false,
            true,
        )
        .await?;

    tracing::info!(
        version = %baseline,
        ledger = %ledger.display_name(),
        "Successfully baselined schema"
    );
    Ok(BaselineReport {
        previous_baseline,
        baseline,
    })
}
