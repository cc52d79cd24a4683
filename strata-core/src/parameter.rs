//! Typed migration parameters and their SQL rendering.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::db::{quote_ident, quote_literal};
use crate::error::{Result, StrataError};

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Boolean,
    Integer,
    #[default]
    Text,
    Decimal,
    Path,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterType::Boolean => write!(f, "boolean"),
            ParameterType::Integer => write!(f, "integer"),
            ParameterType::Text => write!(f, "text"),
            ParameterType::Decimal => write!(f, "decimal"),
            ParameterType::Path => write!(f, "path"),
        }
    }
}

impl std::str::FromStr for ParameterType {
    type Err = StrataError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "boolean" | "bool" => Ok(ParameterType::Boolean),
            "integer" | "int" => Ok(ParameterType::Integer),
            "text" | "string" => Ok(ParameterType::Text),
            "decimal" => Ok(ParameterType::Decimal),
            "path" => Ok(ParameterType::Path),
            _ => Err(StrataError::ConfigError(format!(
                "Invalid parameter type '{}'. Use 'boolean', 'integer', 'text', 'decimal' or 'path'.",
                s
            ))),
        }
    }
}

/// Tokens that coerce to `true` for boolean parameters (case-insensitive).
const TRUE_TOKENS: &[&str] = &["true", "1", "yes"];

impl ParameterType {
    /// Convert textual input into a value of this type.
    pub fn coerce(&self, name: &str, input: &str) -> Result<ParameterValue> {
        let invalid = |reason: String| {
            StrataError::ConfigError(format!(
                "Invalid value '{}' for {} parameter '{}': {}",
                input, self, name, reason
            ))
        };

        match self {
            ParameterType::Boolean => {
                let token = input.trim().to_lowercase();
                Ok(ParameterValue::Boolean(TRUE_TOKENS.contains(&token.as_str())))
            }
            ParameterType::Integer => input
                .trim()
                .parse::<i64>()
                .map(ParameterValue::Integer)
                .map_err(|e| invalid(e.to_string())),
            ParameterType::Decimal => {
                let value = input
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| invalid(e.to_string()))?;
                if !value.is_finite() {
                    return Err(invalid("value must be finite".to_string()));
                }
                Ok(ParameterValue::Decimal(value))
            }
            ParameterType::Text => Ok(ParameterValue::Text(input.to_string())),
            ParameterType::Path => Ok(ParameterValue::Path(PathBuf::from(input))),
        }
    }
}

/// A parameter declaration from the configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDefinition {
    pub name: String,
    pub param_type: ParameterType,
    pub default: Option<ParameterValue>,
    pub description: Option<String>,
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
    Path(PathBuf),
}

impl ParameterValue {
    /// Render the value as a SQL literal.
    pub fn to_sql_literal(&self) -> String {
        match self {
            ParameterValue::Boolean(true) => "TRUE".to_string(),
            ParameterValue::Boolean(false) => "FALSE".to_string(),
            ParameterValue::Integer(v) => v.to_string(),
            ParameterValue::Decimal(v) => v.to_string(),
            ParameterValue::Text(v) => quote_literal(v),
            ParameterValue::Path(p) => quote_literal(&p.to_string_lossy()),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(v) => write!(f, "{}", v),
            ParameterValue::Integer(v) => write!(f, "{}", v),
            ParameterValue::Decimal(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => write!(f, "{}", v),
            ParameterValue::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// A value bound to a `${name}` placeholder in SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParameter {
    Literal(ParameterValue),
    Identifier(String),
}

impl SqlParameter {
    pub fn render(&self) -> String {
        match self {
            SqlParameter::Literal(value) => value.to_sql_literal(),
            SqlParameter::Identifier(name) => quote_ident(name),
        }
    }
}

/// Resolved parameter values for one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the declared defaults.
    pub fn from_defaults(definitions: &[ParameterDefinition]) -> Self {
        let values = definitions
            .iter()
            .filter_map(|d| d.default.clone().map(|v| (d.name.clone(), v)))
            .collect();
        Self { values }
    }

    /// Defaults overlaid with caller-supplied textual values, coerced to their declared type.
    ///
    /// Supplying a name that is not declared is an error.
    pub fn resolve(
        definitions: &[ParameterDefinition],
        overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut set = Self::from_defaults(definitions);
        let mut names: Vec<&String> = overrides.keys().collect();
        names.sort();

        for name in names {
            let definition = definitions
                .iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| {
                    StrataError::ConfigError(format!(
                        "Unknown parameter '{}'. Declared parameters: {}",
                        name,
                        if definitions.is_empty() {
                            "(none)".to_string()
                        } else {
                            definitions
                                .iter()
                                .map(|d| d.name.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        }
                    ))
                })?;
            let value = definition.param_type.coerce(name, &overrides[name])?;
            set.values.insert(name.clone(), value);
        }

        Ok(set)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.values.iter()
    }

    /// Keep only the named parameters.
    pub fn subset(&self, names: &[&str]) -> ParameterSet {
        let values = self
            .values
            .iter()
            .filter(|(k, _)| names.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ParameterSet { values }
    }

    /// Bind every value as a SQL literal.
    pub fn sql_parameters(&self) -> HashMap<String, SqlParameter> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), SqlParameter::Literal(v.clone())))
            .collect()
    }

    /// JSON object stored in the ledger.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}
