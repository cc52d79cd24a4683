//! Changelog discovery: version-named directories of ordered SQL files.

use std::path::{Path, PathBuf};

use crate::db::Connection;
use crate::error::{Result, StrataError};
use crate::feedback::Progress;
use crate::ledger::Ledger;
use crate::parameter::ParameterSet;
use crate::sql::SqlContent;
use crate::version::Version;

/// One version directory of the changelogs root.
#[derive(Debug, Clone)]
pub struct Changelog {
    version: Version,
    dir: PathBuf,
}

impl Changelog {
    pub fn new(version: Version, dir: PathBuf) -> Self {
        Self { version, dir }
    }

    /// Build a changelog from a directory whose name is its version.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StrataError::InvalidChangelog(format!(
                    "Changelog directory '{}' has no usable name",
                    dir.display()
                ))
            })?;
        let version = Version::parse(name).map_err(|e| {
            StrataError::InvalidChangelog(format!(
                "Changelog directory '{}': {}",
                dir.display(),
                e.reason()
            ))
        })?;
        Ok(Self::new(version, dir.to_path_buf()))
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `*.sql` files directly inside the directory, sorted by file name.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            StrataError::InvalidChangelog(format!(
                "Failed to read changelog directory '{}': {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Check the directory exists, holds SQL files, and every file splits and binds cleanly.
    pub fn validate(&self, parameters: &ParameterSet) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(StrataError::InvalidChangelog(format!(
                "Changelog directory '{}' does not exist",
                self.dir.display()
            )));
        }

        let files = self.files()?;
        if files.is_empty() {
            return Err(StrataError::InvalidChangelog(format!(
                "Changelog directory '{}' contains no .sql files",
                self.dir.display()
            )));
        }

        let bound = parameters.sql_parameters();
        for file in &files {
            SqlContent::file(file).validate(&bound).map_err(|e| {
                StrataError::InvalidChangelog(format!(
                    "Changelog {} file '{}': {}",
                    self.version,
                    file.display(),
                    e.reason()
                ))
            })?;
        }
        Ok(())
    }

    /// Run every file in order, then record one ledger row if a ledger is given.
    ///
    /// Nothing is committed here. Returns the applied file paths.
    pub async fn apply(
        &self,
        conn: &Connection,
        parameters: &ParameterSet,
        ledger: Option<&Ledger>,
        beta_testing: bool,
        mut progress: Option<&mut Progress<'_>>,
    ) -> Result<Vec<String>> {
        let bound = parameters.sql_parameters();
        let phase = format!("changelog {}", self.version);
        let mut applied = Vec::new();

        for file in self.files()? {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Some(progress) = progress.as_deref_mut() {
                progress.step(&format!("Applying changelog {}: {}", self.version, file_name))?;
            }

            tracing::debug!(version = %self.version, file = %file.display(), "Applying changelog file");
            SqlContent::file(&file)
                .with_phase(phase.clone())
                .execute(conn, &bound, false)
                .await?;
            applied.push(file.display().to_string());
        }

        if let Some(ledger) = ledger {
            ledger
                .set_baseline(
                    conn,
                    self.version.as_str(),
                    &applied,
                    parameters,
                    beta_testing,
                    false,
                )
                .await?;
        }

        tracing::info!(version = %self.version, files = applied.len(), "Applied changelog");
        Ok(applied)
    }

    /// Whether the ledger already records this version.
    pub async fn is_applied(&self, conn: &Connection, ledger: &Ledger) -> Result<bool> {
        ledger.is_applied(conn, &self.version).await
    }
}

/// Discover changelogs under `root`, ascending by version, within `[min, max]`.
pub fn discover(
    root: &Path,
    min_version: Option<&Version>,
    max_version: Option<&Version>,
) -> Result<Vec<Changelog>> {
    if !root.is_dir() {
        return Err(StrataError::InvalidChangelog(format!(
            "Changelogs directory '{}' does not exist",
            root.display()
        )));
    }

    let entries = std::fs::read_dir(root).map_err(|e| {
        StrataError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read changelogs directory '{}': {}", root.display(), e),
        ))
    })?;

    let mut changelogs = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }
        changelogs.push(Changelog::from_dir(&path)?);
    }

    changelogs.sort_by(|a, b| a.version.cmp(&b.version));

    for pair in changelogs.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(StrataError::InvalidChangelog(format!(
                "Duplicate changelog version: '{}' and '{}'",
                pair[0].dir.display(),
                pair[1].dir.display()
            )));
        }
    }

    Ok(changelogs
        .into_iter()
        .filter(|c| min_version.is_none_or(|min| &c.version >= min))
        .filter(|c| max_version.is_none_or(|max| &c.version <= max))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_changelog(root: &Path, version: &str, files: &[(&str, &str)]) {
        let dir = root.join(version);
        fs::create_dir_all(&dir).unwrap();
        for (name, sql) in files {
            fs::write(dir.join(name), sql).unwrap();
        }
    }

    #[test]
    fn test_discover_sorts_numerically() {
        let root = tempfile::tempdir().unwrap();
        write_changelog(root.path(), "1.10.0", &[("01.sql", "SELECT 1;")]);
        write_changelog(root.path(), "1.2.0", &[("01.sql", "SELECT 1;")]);
        write_changelog(root.path(), "1.9", &[("01.sql", "SELECT 1;")]);
        fs::write(root.path().join("README.md"), "not a changelog").unwrap();

        let changelogs = discover(root.path(), None, None).unwrap();
        let versions: Vec<&str> = changelogs.iter().map(|c| c.version().as_str()).collect();
        assert_eq!(versions, vec!["1.2.0", "1.9", "1.10.0"]);
    }

    #[test]
    fn test_discover_range_is_inclusive() {
        let root = tempfile::tempdir().unwrap();
        for v in ["1.0.0", "1.1.0", "1.2.0", "2.0.0"] {
            write_changelog(root.path(), v, &[("01.sql", "SELECT 1;")]);
        }
        let min = Version::parse("1.1.0").unwrap();
        let max = Version::parse("1.2.0").unwrap();
        let changelogs = discover(root.path(), Some(&min), Some(&max)).unwrap();
        let versions: Vec<&str> = changelogs.iter().map(|c| c.version().as_str()).collect();
        assert_eq!(versions, vec!["1.1.0", "1.2.0"]);
    }

    #[test]
    fn test_discover_rejects_bad_directory_name() {
        let root = tempfile::tempdir().unwrap();
        write_changelog(root.path(), "1.0.0", &[("01.sql", "SELECT 1;")]);
        write_changelog(root.path(), "next", &[("01.sql", "SELECT 1;")]);
        let err = discover(root.path(), None, None).unwrap_err();
        assert!(matches!(err, StrataError::InvalidChangelog(_)));
    }

    #[test]
    fn test_discover_rejects_duplicate_versions() {
        let root = tempfile::tempdir().unwrap();
        write_changelog(root.path(), "1.2", &[("01.sql", "SELECT 1;")]);
        write_changelog(root.path(), "1.2.0", &[("01.sql", "SELECT 1;")]);
        assert!(discover(root.path(), None, None).is_err());
    }

    #[test]
    fn test_discover_missing_root() {
        let root = tempfile::tempdir().unwrap();
        assert!(discover(&root.path().join("absent"), None, None).is_err());
    }

    #[test]
    fn test_files_are_sorted_and_filtered() {
        let root = tempfile::tempdir().unwrap();
        write_changelog(
            root.path(),
            "1.0.0",
            &[
                ("02_data.sql", "SELECT 2;"),
                ("01_schema.sql", "SELECT 1;"),
                ("notes.txt", "ignore me"),
            ],
        );
        fs::create_dir_all(root.path().join("1.0.0").join("nested.sql")).unwrap();

        let changelog = Changelog::from_dir(&root.path().join("1.0.0")).unwrap();
        let names: Vec<String> = changelog
            .files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["01_schema.sql", "02_data.sql"]);
    }

    #[test]
    fn test_validate_empty_directory() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("1.0.0")).unwrap();
        let changelog = Changelog::from_dir(&root.path().join("1.0.0")).unwrap();
        assert!(changelog.validate(&ParameterSet::new()).is_err());
    }

    #[test]
    fn test_validate_reports_offending_file() {
        let root = tempfile::tempdir().unwrap();
        write_changelog(
            root.path(),
            "1.0.0",
            &[("01_ok.sql", "SELECT 1;"), ("02_bad.sql", "BEGIN; SELECT 1; COMMIT;")],
        );
        let changelog = Changelog::from_dir(&root.path().join("1.0.0")).unwrap();
        let err = changelog.validate(&ParameterSet::new()).unwrap_err();
        assert!(err.to_string().contains("02_bad.sql"));
    }

    #[test]
    fn test_validate_checks_placeholders() {
        let root = tempfile::tempdir().unwrap();
        write_changelog(
            root.path(),
            "1.0.0",
            &[("01.sql", "CREATE TABLE foo (name VARCHAR(${field_length}));")],
        );
        let changelog = Changelog::from_dir(&root.path().join("1.0.0")).unwrap();
        assert!(changelog.validate(&ParameterSet::new()).is_err());

        let mut params = ParameterSet::new();
        params.insert("field_length", crate::parameter::ParameterValue::Integer(50));
        assert!(changelog.validate(&params).is_ok());
    }
}
