//! Hooks: inline SQL, SQL files, or registered code run at fixed points of a migration.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::Connection;
use crate::error::{Result, StrataError};
use crate::parameter::ParameterSet;
use crate::sql::SqlContent;

/// The point of a migration at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    DropApp,
    CreateApp,
    Uninstall,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::DropApp => write!(f, "drop-app"),
            HookPhase::CreateApp => write!(f, "create-app"),
            HookPhase::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// Where a hook's body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSource {
    /// Inline SQL text.
    Code(String),
    /// A `.sql` file, or any other file resolved through the [`HookRegistry`].
    File(PathBuf),
}

/// A hook implemented in Rust.
///
/// ```ignore
/// struct RefreshViews;
///
/// #[async_trait::async_trait]
/// impl CodeHook for RefreshViews {
///     fn parameters(&self) -> Vec<String> {
///         vec!["srid".to_string()]
///     }
///
///     async fn run(&self, conn: &Connection, args: &ParameterSet) -> Result<()> {
///         conn.batch_execute("REFRESH MATERIALIZED VIEW app.v_summary").await
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait CodeHook: Send + Sync {
    /// Names of the parameters this hook reads. Only these are passed to [`CodeHook::run`].
    fn parameters(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, conn: &Connection, args: &ParameterSet) -> Result<()>;
}

/// Code hooks keyed by the file path they are declared under.
///
/// Built for one engine run; a different changelog root gets a new registry.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<PathBuf, Arc<dyn CodeHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<PathBuf>, hook: Arc<dyn CodeHook>) {
        self.hooks.insert(path.into(), hook);
    }

    pub fn get(&self, path: &Path) -> Option<Arc<dyn CodeHook>> {
        self.hooks.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("paths", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

enum ResolvedHook {
    Sql(SqlContent),
    Code(Arc<dyn CodeHook>),
}

/// A hook declared for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDefinition {
    pub phase: HookPhase,
    pub source: HookSource,
}

impl HookDefinition {
    pub fn new(phase: HookPhase, source: HookSource) -> Self {
        Self { phase, source }
    }

    /// Path of the hook file, or `inline SQL`.
    pub fn describe(&self) -> String {
        match &self.source {
            HookSource::Code(_) => "inline SQL".to_string(),
            HookSource::File(path) => path.display().to_string(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> StrataError {
        StrataError::HookFailed {
            phase: self.phase.to_string(),
            hook: self.describe(),
            reason: reason.into(),
        }
    }

    fn resolve(&self, registry: &HookRegistry) -> Result<ResolvedHook> {
        let phase = format!("{} hook", self.phase);
        match &self.source {
            HookSource::Code(sql) => Ok(ResolvedHook::Sql(
                SqlContent::inline(sql.clone()).with_phase(phase),
            )),
            HookSource::File(path) if path.extension().is_some_and(|e| e == "sql") => {
                if !path.is_file() {
                    return Err(self.failed("hook file not found"));
                }
                Ok(ResolvedHook::Sql(SqlContent::file(path).with_phase(phase)))
            }
            HookSource::File(path) => registry
                .get(path)
                .map(ResolvedHook::Code)
                .ok_or_else(|| self.failed("unsupported hook file: no code hook is registered for this path")),
        }
    }

    fn missing_parameters(hook: &dyn CodeHook, parameters: &ParameterSet) -> Vec<String> {
        hook.parameters()
            .into_iter()
            .filter(|name| !parameters.contains(name))
            .collect()
    }

    /// Check the hook resolves and everything it needs is available in `parameters`.
    pub fn validate(&self, parameters: &ParameterSet, registry: &HookRegistry) -> Result<()> {
        match self.resolve(registry)? {
            ResolvedHook::Sql(content) => content.validate(&parameters.sql_parameters()),
            ResolvedHook::Code(hook) => {
                let missing = Self::missing_parameters(hook.as_ref(), parameters);
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(self.failed(format!(
                        "declared parameter(s) not configured: {}",
                        missing.join(", ")
                    )))
                }
            }
        }
    }

    /// Run the hook. Code hooks get only the parameters they declared.
    pub async fn execute(
        &self,
        conn: &Connection,
        commit: bool,
        parameters: &ParameterSet,
        registry: &HookRegistry,
    ) -> Result<()> {
        tracing::info!(phase = %self.phase, hook = %self.describe(), "Running hook");

        match self.resolve(registry)? {
            ResolvedHook::Sql(content) => {
                content
                    .execute(conn, &parameters.sql_parameters(), commit)
                    .await?;
            }
            ResolvedHook::Code(hook) => {
                let missing = Self::missing_parameters(hook.as_ref(), parameters);
                if !missing.is_empty() {
                    return Err(self.failed(format!(
                        "declared parameter(s) not configured: {}",
                        missing.join(", ")
                    )));
                }
                let declared = hook.parameters();
                let names: Vec<&str> = declared.iter().map(String::as_str).collect();
                let args = parameters.subset(&names);

                hook.run(conn, &args)
                    .await
                    .map_err(|e| self.failed(e.reason()))?;

                if commit {
                    conn.commit().await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterValue;
    use std::fs;

    struct NeedsSrid;

    #[async_trait::async_trait]
    impl CodeHook for NeedsSrid {
        fn parameters(&self) -> Vec<String> {
            vec!["srid".to_string()]
        }

        async fn run(&self, _conn: &Connection, _args: &ParameterSet) -> Result<()> {
            Ok(())
        }
    }

    fn srid_set() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert("srid", ParameterValue::Integer(2056));
        params
    }

    #[test]
    fn test_inline_hook_validates() {
        let hook = HookDefinition::new(
            HookPhase::CreateApp,
            HookSource::Code("CREATE VIEW v AS SELECT ${srid} AS srid;".to_string()),
        );
        assert!(hook.validate(&srid_set(), &HookRegistry::new()).is_ok());
        assert!(hook.validate(&ParameterSet::new(), &HookRegistry::new()).is_err());
    }

    #[test]
    fn test_sql_file_hook_with_begin_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop_app.sql");
        fs::write(&path, "BEGIN;\nDROP SCHEMA app CASCADE;\nCOMMIT;\n").unwrap();

        let hook = HookDefinition::new(HookPhase::DropApp, HookSource::File(path));
        let err = hook
            .validate(&ParameterSet::new(), &HookRegistry::new())
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidSql { .. }));
    }

    #[test]
    fn test_missing_sql_file_hook() {
        let hook = HookDefinition::new(
            HookPhase::DropApp,
            HookSource::File(PathBuf::from("/nonexistent/drop_app.sql")),
        );
        assert!(matches!(
            hook.validate(&ParameterSet::new(), &HookRegistry::new()),
            Err(StrataError::HookFailed { .. })
        ));
    }

    #[test]
    fn test_unregistered_code_hook_is_unsupported() {
        let hook = HookDefinition::new(
            HookPhase::CreateApp,
            HookSource::File(PathBuf::from("app/create_app.rs")),
        );
        let err = hook
            .validate(&ParameterSet::new(), &HookRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("unsupported hook file"));
    }

    #[test]
    fn test_code_hook_parameters_checked_at_validation() {
        let path = PathBuf::from("app/create_app.rs");
        let mut registry = HookRegistry::new();
        registry.register(path.clone(), Arc::new(NeedsSrid));

        let hook = HookDefinition::new(HookPhase::CreateApp, HookSource::File(path));
        assert!(hook.validate(&srid_set(), &registry).is_ok());

        let err = hook.validate(&ParameterSet::new(), &registry).unwrap_err();
        match err {
            StrataError::HookFailed { phase, hook, reason } => {
                assert_eq!(phase, "create-app");
                assert_eq!(hook, "app/create_app.rs");
                assert!(reason.contains("srid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(HookPhase::DropApp.to_string(), "drop-app");
        assert_eq!(HookPhase::CreateApp.to_string(), "create-app");
        assert_eq!(HookPhase::Uninstall.to_string(), "uninstall");
    }
}
