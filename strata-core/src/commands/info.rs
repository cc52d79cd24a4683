use chrono::NaiveDateTime;
use serde::Serialize;

use super::EngineContext;
use crate::changelog;
use crate::error::Result;
use crate::ledger::{compare_versions, LedgerStatus, MigrationRecord};
use crate::version::Version;

/// The state of a changelog relative to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChangelogState {
    /// Recorded in the ledger.
    Applied,
    /// On disk, newer than anything recorded.
    Pending,
    /// On disk, older than the baseline and never recorded.
    Skipped,
    /// Recorded in the ledger but no directory on disk.
    Missing,
}

impl std::fmt::Display for ChangelogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangelogState::Applied => write!(f, "Applied"),
            ChangelogState::Pending => write!(f, "Pending"),
            ChangelogState::Skipped => write!(f, "Skipped"),
            ChangelogState::Missing => write!(f, "Missing"),
        }
    }
}

/// Combined view of one version (directory + ledger).
#[derive(Debug, Clone, Serialize)]
pub struct ChangelogInfo {
    pub version: Version,
    pub state: ChangelogState,
    pub files: usize,
    pub date_installed: Option<NaiveDateTime>,
    pub beta_testing: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct InfoReport {
    pub ledger: String,
    pub ledger_exists: bool,
    pub module: Option<String>,
    pub baseline: Option<Version>,
    pub beta_testing: bool,
    pub status: Option<LedgerStatus>,
    /// Why `status` could not be computed, e.g. the baseline has no changelog.
    pub status_error: Option<String>,
    pub changelogs: Vec<ChangelogInfo>,
    pub records: Vec<MigrationRecord>,
}

/// Execute the info command: merge changelogs on disk with ledger rows. Read only.
pub async fn execute(ctx: &EngineContext<'_>) -> Result<InfoReport> {
    let ledger = ctx.ledger();
    let ledger_exists = ledger.exists(ctx.conn).await?;
    let records = ledger.records(ctx.conn).await?;
    let changelogs = changelog::discover(&ctx.config.changelogs_root(), None, None)?;

    let current = records.iter().max_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.date_installed.cmp(&b.date_installed))
    });
    let baseline = current.map(|r| r.version.clone());

    let (status, status_error) = match baseline {
        Some(ref b) => match compare_versions(b, &changelogs) {
            Ok(s) => (Some(s), None),
            Err(e) => (None, Some(e.reason())),
        },
        None => (None, None),
    };

    let mut infos = Vec::new();
    for changelog in &changelogs {
        let row = records
            .iter()
            .filter(|r| &r.version == changelog.version())
            .max_by(|a, b| a.date_installed.cmp(&b.date_installed));

        let state = match (row, &baseline) {
            (Some(_), _) => ChangelogState::Applied,
            (None, Some(b)) if changelog.version() <= b => ChangelogState::Skipped,
            (None, _) => ChangelogState::Pending,
        };

        infos.push(ChangelogInfo {
            version: changelog.version().clone(),
            state,
            files: changelog.files()?.len(),
            date_installed: row.map(|r| r.date_installed),
            beta_testing: row.map(|r| r.beta_testing),
        });
    }

    for record in &records {
        let on_disk = changelogs.iter().any(|c| c.version() == &record.version);
        let listed = infos.iter().any(|i| i.version == record.version);
        if !on_disk && !listed {
            infos.push(ChangelogInfo {
                version: record.version.clone(),
                state: ChangelogState::Missing,
                files: record.changelog_files.len(),
                date_installed: Some(record.date_installed),
                beta_testing: Some(record.beta_testing),
            });
        }
    }

    infos.sort_by(|a, b| a.version.cmp(&b.version));

    Ok(InfoReport {
        ledger: ledger.display_name(),
        ledger_exists,
        module: current.and_then(|r| r.module.clone()),
        baseline,
        beta_testing: current.is_some_and(|r| r.beta_testing),
        status,
        status_error,
        changelogs: infos,
        records,
    })
}
