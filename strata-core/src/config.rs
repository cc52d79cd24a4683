use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, StrataError};
use crate::hooks::{HookDefinition, HookPhase, HookSource};
use crate::parameter::{ParameterDefinition, ParameterSet, ParameterType};

/// SSL/TLS connection mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Try TLS first, fall back to plaintext.
    #[default]
    Prefer,
    /// Require TLS; fail if the handshake fails.
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = StrataError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" | "required" => Ok(SslMode::Require),
            _ => Err(StrataError::ConfigError(format!(
                "Invalid SSL mode '{}'. Use 'disable', 'prefer', or 'require'.",
                s
            ))),
        }
    }
}

/// Top-level configuration for Strata.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    pub database: DatabaseConfig,
    pub module: ModuleSettings,
    /// Directory the config file lives in; relative paths resolve against it.
    pub base_path: PathBuf,
    pub changelogs_directory: PathBuf,
    pub parameters: Vec<ParameterDefinition>,
    /// Parameter values from `STRATA_PARAMETER_<NAME>` variables.
    pub parameter_overrides: HashMap<String, String>,
    pub hooks: HooksConfig,
    /// Named SQL files that can be loaded after an install.
    pub demo_data: Vec<DemoData>,
}

/// A named demo data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoData {
    pub name: String,
    pub file: PathBuf,
}

/// Database connection configuration.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub connect_retries: u32,
    pub ssl_mode: SslMode,
    pub connect_timeout_secs: u32,
    pub statement_timeout_secs: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            connect_retries: 0,
            ssl_mode: SslMode::Prefer,
            connect_timeout_secs: 30,
            statement_timeout_secs: 0,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("connect_retries", &self.connect_retries)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .finish()
    }
}

/// The migrated module and where its ledger lives.
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub name: Option<String>,
    pub schema: String,
    pub table: String,
    pub allow_multiple_modules: bool,
    pub validate_on_run: bool,
    pub advisory_lock: bool,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            name: None,
            schema: "public".to_string(),
            table: "strata_migrations".to_string(),
            allow_multiple_modules: false,
            validate_on_run: true,
            advisory_lock: true,
        }
    }
}

/// Hooks per phase, in declared order.
#[derive(Debug, Clone, Default)]
pub struct HooksConfig {
    pub drop_app: Vec<HookDefinition>,
    pub create_app: Vec<HookDefinition>,
    pub uninstall: Vec<HookDefinition>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            module: ModuleSettings::default(),
            base_path: PathBuf::from("."),
            changelogs_directory: PathBuf::from("changelogs"),
            parameters: Vec::new(),
            parameter_overrides: HashMap::new(),
            hooks: HooksConfig::default(),
            demo_data: Vec::new(),
        }
    }
}

// ── TOML deserialization structs ──

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    changelogs_directory: Option<String>,
    database: Option<TomlDatabaseConfig>,
    module: Option<TomlModuleSettings>,
    parameters: Option<Vec<TomlParameter>>,
    application: Option<TomlApplicationHooks>,
    uninstall: Option<Vec<TomlHook>>,
    demo_data: Option<Vec<TomlDemoData>>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlDatabaseConfig {
    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    connect_retries: Option<u32>,
    ssl_mode: Option<String>,
    connect_timeout: Option<u32>,
    statement_timeout: Option<u32>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlModuleSettings {
    name: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    allow_multiple_modules: Option<bool>,
    validate_on_run: Option<bool>,
    advisory_lock: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlParameter {
    name: String,
    #[serde(rename = "type")]
    param_type: Option<String>,
    default: Option<toml::Value>,
    description: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlApplicationHooks {
    drop: Option<Vec<TomlHook>>,
    create: Option<Vec<TomlHook>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlHook {
    file: Option<String>,
    code: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlDemoData {
    name: String,
    file: String,
}

/// CLI overrides that take highest priority.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub url: Option<String>,
    pub module: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub changelogs: Option<PathBuf>,
    pub validate_on_run: Option<bool>,
    pub connect_retries: Option<u32>,
    pub ssl_mode: Option<String>,
    pub connect_timeout: Option<u32>,
    pub statement_timeout: Option<u32>,
}

impl StrataConfig {
    /// Load configuration with the following priority (highest wins):
    /// 1. CLI arguments
    /// 2. Environment variables
    /// 3. TOML config file
    /// 4. Built-in defaults
    pub fn load(config_path: Option<&str>, overrides: &CliOverrides) -> Result<Self> {
        let mut config = StrataConfig::default();

        // Layer 3: TOML config file
        let toml_path = config_path.unwrap_or("strata.toml");
        if let Ok(content) = std::fs::read_to_string(toml_path) {
            // Warn if config file has overly permissive permissions (Unix only)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(toml_path) {
                    let mode = meta.permissions().mode();
                    if mode & 0o077 != 0 {
                        tracing::warn!(
                            path = %toml_path,
                            mode = format!("{:o}", mode),
                            "Config file has overly permissive permissions. Consider chmod 600."
                        );
                    }
                }
            }
            config.base_path = Path::new(toml_path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));

            let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
                StrataError::ConfigError(format!(
                    "Failed to parse config file '{}': {}",
                    toml_path, e
                ))
            })?;
            config.apply_toml(toml_config)?;
        } else if config_path.is_some() {
            return Err(StrataError::ConfigError(format!(
                "Config file '{}' not found",
                toml_path
            )));
        }

        // Layer 2: Environment variables
        config.apply_env()?;

        // Layer 1: CLI overrides
        config.apply_cli(overrides)?;

        config.validate()?;

        // Cap connect_retries at 20
        if config.database.connect_retries > 20 {
            config.database.connect_retries = 20;
            tracing::warn!("connect_retries capped at 20");
        }

        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, resolving paths against `base_path`.
    pub fn from_toml_str(content: &str, base_path: &Path) -> Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .map_err(|e| StrataError::ConfigError(format!("Failed to parse config: {}", e)))?;
        let mut config = StrataConfig {
            base_path: base_path.to_path_buf(),
            ..StrataConfig::default()
        };
        config.apply_toml(toml_config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_toml(&mut self, toml: TomlConfig) -> Result<()> {
        if let Some(db) = toml.database {
            if let Some(v) = db.url { self.database.url = Some(v); }
            if let Some(v) = db.host { self.database.host = Some(v); }
            if let Some(v) = db.port { self.database.port = Some(v); }
            if let Some(v) = db.user { self.database.user = Some(v); }
            if let Some(v) = db.password { self.database.password = Some(v); }
            if let Some(v) = db.database { self.database.database = Some(v); }
            if let Some(v) = db.connect_retries { self.database.connect_retries = v; }
            if let Some(v) = db.ssl_mode { self.database.ssl_mode = v.parse()?; }
            if let Some(v) = db.connect_timeout { self.database.connect_timeout_secs = v; }
            if let Some(v) = db.statement_timeout { self.database.statement_timeout_secs = v; }
        }

        if let Some(m) = toml.module {
            if let Some(v) = m.name { self.module.name = Some(v); }
            if let Some(v) = m.schema { self.module.schema = v; }
            if let Some(v) = m.table { self.module.table = v; }
            if let Some(v) = m.allow_multiple_modules { self.module.allow_multiple_modules = v; }
            if let Some(v) = m.validate_on_run { self.module.validate_on_run = v; }
            if let Some(v) = m.advisory_lock { self.module.advisory_lock = v; }
        }

        if let Some(dir) = toml.changelogs_directory {
            self.changelogs_directory = PathBuf::from(dir);
        }

        if let Some(params) = toml.parameters {
            self.parameters = params
                .into_iter()
                .map(parameter_definition)
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(app) = toml.application {
            if let Some(hooks) = app.drop {
                self.hooks.drop_app = hooks
                    .into_iter()
                    .map(|h| hook_definition(h, HookPhase::DropApp))
                    .collect::<Result<Vec<_>>>()?;
            }
            if let Some(hooks) = app.create {
                self.hooks.create_app = hooks
                    .into_iter()
                    .map(|h| hook_definition(h, HookPhase::CreateApp))
                    .collect::<Result<Vec<_>>>()?;
            }
        }

        if let Some(hooks) = toml.uninstall {
            self.hooks.uninstall = hooks
                .into_iter()
                .map(|h| hook_definition(h, HookPhase::Uninstall))
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(demo) = toml.demo_data {
            self.demo_data = demo
                .into_iter()
                .map(|d| DemoData {
                    name: d.name,
                    file: PathBuf::from(d.file),
                })
                .collect();
        }

        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("STRATA_DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = std::env::var("STRATA_DATABASE_HOST") {
            self.database.host = Some(v);
        }
        if let Ok(v) = std::env::var("STRATA_DATABASE_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.database.port = Some(port);
            }
        }
        if let Ok(v) = std::env::var("STRATA_DATABASE_USER") {
            self.database.user = Some(v);
        }
        if let Ok(v) = std::env::var("STRATA_DATABASE_PASSWORD") {
            self.database.password = Some(v);
        }
        if let Ok(v) = std::env::var("STRATA_DATABASE_NAME") {
            self.database.database = Some(v);
        }
        if let Ok(v) = std::env::var("STRATA_CONNECT_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.connect_retries = n;
            }
        }
        if let Ok(v) = std::env::var("STRATA_SSL_MODE") {
            self.database.ssl_mode = v.parse()?;
        }
        if let Ok(v) = std::env::var("STRATA_CONNECT_TIMEOUT") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.connect_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("STRATA_STATEMENT_TIMEOUT") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.statement_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("STRATA_MODULE_NAME") {
            self.module.name = Some(v);
        }
        if let Ok(v) = std::env::var("STRATA_MODULE_SCHEMA") {
            self.module.schema = v;
        }
        if let Ok(v) = std::env::var("STRATA_MODULE_TABLE") {
            self.module.table = v;
        }
        if let Ok(v) = std::env::var("STRATA_CHANGELOGS_DIRECTORY") {
            self.changelogs_directory = PathBuf::from(v);
        }

        // STRATA_PARAMETER_{NAME}
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("STRATA_PARAMETER_") {
                self.parameter_overrides.insert(name.to_lowercase(), value);
            }
        }
        Ok(())
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) -> Result<()> {
        if let Some(ref v) = overrides.url {
            self.database.url = Some(v.clone());
        }
        if let Some(ref v) = overrides.module {
            self.module.name = Some(v.clone());
        }
        if let Some(ref v) = overrides.schema {
            self.module.schema = v.clone();
        }
        if let Some(ref v) = overrides.table {
            self.module.table = v.clone();
        }
        if let Some(ref v) = overrides.changelogs {
            // Given on the command line, so relative to the working directory.
            self.changelogs_directory = v.clone();
            if v.is_relative() {
                self.changelogs_directory = std::env::current_dir()?.join(v);
            }
        }
        if let Some(v) = overrides.validate_on_run {
            self.module.validate_on_run = v;
        }
        if let Some(v) = overrides.connect_retries {
            self.database.connect_retries = v;
        }
        if let Some(ref v) = overrides.ssl_mode {
            self.database.ssl_mode = v.parse()?;
        }
        if let Some(v) = overrides.connect_timeout {
            self.database.connect_timeout_secs = v;
        }
        if let Some(v) = overrides.statement_timeout {
            self.database.statement_timeout_secs = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        crate::db::validate_identifier(&self.module.schema)?;
        crate::db::validate_identifier(&self.module.table)?;

        if let Some(ref name) = self.module.name {
            if name.trim().is_empty() || name.len() > 50 {
                return Err(StrataError::ConfigError(format!(
                    "Module name '{}' must be between 1 and 50 characters",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for def in &self.parameters {
            let valid_name = def
                .name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && def.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_name {
                return Err(StrataError::ConfigError(format!(
                    "Parameter name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                    def.name
                )));
            }
            if !seen.insert(def.name.to_lowercase()) {
                return Err(StrataError::ConfigError(format!(
                    "Parameter '{}' is declared more than once",
                    def.name
                )));
            }
        }
        Ok(())
    }

    /// Changelogs root, resolved against the config file's directory.
    pub fn changelogs_root(&self) -> PathBuf {
        self.resolve_path(&self.changelogs_directory)
    }

    /// Resolve a path from the config file against its directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    /// Hooks of one phase with file paths resolved against the base path.
    pub fn hooks_for(&self, phase: HookPhase) -> Vec<HookDefinition> {
        let hooks = match phase {
            HookPhase::DropApp => &self.hooks.drop_app,
            HookPhase::CreateApp => &self.hooks.create_app,
            HookPhase::Uninstall => &self.hooks.uninstall,
        };
        hooks
            .iter()
            .map(|h| match &h.source {
                HookSource::File(path) => {
                    HookDefinition::new(h.phase, HookSource::File(self.resolve_path(path)))
                }
                HookSource::Code(_) => h.clone(),
            })
            .collect()
    }

    /// Resolved path of the demo data file called `name`.
    pub fn demo_data_file(&self, name: &str) -> Result<PathBuf> {
        self.demo_data
            .iter()
            .find(|d| d.name == name)
            .map(|d| self.resolve_path(&d.file))
            .ok_or_else(|| {
                StrataError::ConfigError(format!(
                    "Unknown demo data '{}'. Available: {}",
                    name,
                    if self.demo_data.is_empty() {
                        "(none)".to_string()
                    } else {
                        self.demo_data
                            .iter()
                            .map(|d| d.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    }
                ))
            })
    }

    /// Defaults, then environment overrides, then `overrides`.
    ///
    /// Names match declared parameters case-insensitively.
    pub fn resolve_parameters(&self, overrides: &HashMap<String, String>) -> Result<ParameterSet> {
        let declared = |name: &str| {
            self.parameters
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(name))
                .map(|d| d.name.clone())
        };

        let mut merged = HashMap::new();
        for (name, value) in &self.parameter_overrides {
            match declared(name) {
                Some(declared) => {
                    merged.insert(declared, value.clone());
                }
                None => tracing::warn!(
                    parameter = %name,
                    "Ignoring STRATA_PARAMETER_ variable for an undeclared parameter"
                ),
            }
        }
        for (name, value) in overrides {
            merged.insert(declared(name).unwrap_or_else(|| name.clone()), value.clone());
        }
        ParameterSet::resolve(&self.parameters, &merged)
    }

    /// Build a connection string from the config.
    /// Prefers `url` if set; otherwise builds from individual fields.
    /// Handles JDBC-style URLs by stripping the `jdbc:` prefix and
    /// extracting `user` and `password` query parameters.
    pub fn connection_string(&self) -> Result<String> {
        if let Some(ref url) = self.database.url {
            return Ok(normalize_jdbc_url(url));
        }

        let host = self.database.host.as_deref().unwrap_or("localhost");
        let port = self.database.port.unwrap_or(5432);
        let user = self.database.user.as_deref().ok_or_else(|| {
            StrataError::ConfigError("Database user is required".to_string())
        })?;
        let database = self.database.database.as_deref().ok_or_else(|| {
            StrataError::ConfigError("Database name is required".to_string())
        })?;

        let mut url = format!("host={} port={} user={} dbname={}", host, port, user, database);

        if let Some(ref password) = self.database.password {
            url.push_str(&format!(" password={}", password));
        }

        Ok(url)
    }
}

fn parameter_definition(toml: TomlParameter) -> Result<ParameterDefinition> {
    let param_type: ParameterType = match toml.param_type {
        Some(t) => t.parse()?,
        None => ParameterType::default(),
    };

    let default = match toml.default {
        None => None,
        Some(value) => {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(StrataError::ConfigError(format!(
                        "Default of parameter '{}' must be a string, number or boolean, got {}",
                        toml.name,
                        other.type_str()
                    )))
                }
            };
            Some(param_type.coerce(&toml.name, &text)?)
        }
    };

    Ok(ParameterDefinition {
        name: toml.name,
        param_type,
        default,
        description: toml.description,
    })
}

fn hook_definition(toml: TomlHook, phase: HookPhase) -> Result<HookDefinition> {
    let source = match (toml.file, toml.code) {
        (Some(file), None) => HookSource::File(PathBuf::from(file)),
        (None, Some(code)) => HookSource::Code(code),
        _ => {
            return Err(StrataError::ConfigError(format!(
                "Exactly one of 'file' or 'code' must be set in a {} hook",
                phase
            )))
        }
    };
    Ok(HookDefinition::new(phase, source))
}

/// Normalize a JDBC-style URL to a standard PostgreSQL connection string.
///
/// Handles:
///   - `jdbc:postgresql://host:port/db?user=x&password=y`  →  `postgresql://x:y@host:port/db`
///   - `postgresql://...` passed through as-is
///   - `postgres://...` passed through as-is
fn normalize_jdbc_url(url: &str) -> String {
    let url = url.strip_prefix("jdbc:").unwrap_or(url);

    if let Some((base, query)) = url.split_once('?') {
        let mut user = None;
        let mut password = None;
        let mut other_params = Vec::new();

        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                match key.to_lowercase().as_str() {
                    "user" => user = Some(value.to_string()),
                    "password" => password = Some(value.to_string()),
                    _ => other_params.push(param.to_string()),
                }
            }
        }

        if user.is_some() || password.is_some() {
            if let Some(rest) = base
                .strip_prefix("postgresql://")
                .or_else(|| base.strip_prefix("postgres://"))
            {
                let scheme = if base.starts_with("postgresql://") {
                    "postgresql"
                } else {
                    "postgres"
                };

                let auth = match (user, password) {
                    (Some(u), Some(p)) => format!("{}:{}@", u, p),
                    (Some(u), None) => format!("{}@", u),
                    (None, Some(p)) => format!(":{p}@"),
                    (None, None) => String::new(),
                };

                let mut result = format!("{}://{}{}", scheme, auth, rest);
                if !other_params.is_empty() {
                    result.push('?');
                    result.push_str(&other_params.join("&"));
                }
                return result;
            }
        }

        if other_params.is_empty() {
            return base.to_string();
        }
        return format!("{}?{}", base, other_params.join("&"));
    }

    url.to_string()
}
