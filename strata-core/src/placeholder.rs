use std::collections::HashMap;
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::error::{Result, StrataError};
use crate::parameter::SqlParameter;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace all `${name}` placeholders in the given SQL string with their bound values.
///
/// Lookup is case-insensitive. A placeholder with no bound value is an error;
/// bound values that are never referenced are ignored.
pub fn replace_placeholders(sql: &str, parameters: &HashMap<String, SqlParameter>) -> Result<String> {
    let lower_map: HashMap<String, &SqlParameter> = parameters
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let mut result = String::with_capacity(sql.len());
    let mut last_end = 0;

    for caps in PLACEHOLDER_RE.captures_iter(sql) {
        let (Some(full_match), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let key = key.as_str();

        result.push_str(&sql[last_end..full_match.start()]);

        match lower_map.get(&key.to_lowercase()) {
            Some(value) => result.push_str(&value.render()),
            None => {
                let mut available: Vec<&str> = parameters.keys().map(|k| k.as_str()).collect();
                available.sort();
                return Err(StrataError::PlaceholderNotFound {
                    key: key.to_string(),
                    available: if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available.join(", ")
                    },
                });
            }
        }

        last_end = full_match.end();
    }

    result.push_str(&sql[last_end..]);
    Ok(result)
}

/// Names of all placeholders referenced in the SQL text, in order of appearance.
pub fn placeholder_names(sql: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(sql)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterValue;

    fn literal(v: ParameterValue) -> SqlParameter {
        SqlParameter::Literal(v)
    }

    #[test]
    fn test_replace_literals_and_identifiers() {
        let mut params = HashMap::new();
        params.insert("schema".to_string(), SqlParameter::Identifier("app".to_string()));
        params.insert("len".to_string(), literal(ParameterValue::Integer(50)));
        params.insert("label".to_string(), literal(ParameterValue::Text("a'b".to_string())));

        let sql = "CREATE TABLE ${schema}.foo (name VARCHAR(${len}) DEFAULT ${label});";
        let result = replace_placeholders(sql, &params).unwrap();
        assert_eq!(
            result,
            "CREATE TABLE \"app\".foo (name VARCHAR(50) DEFAULT 'a''b');"
        );
    }

    #[test]
    fn test_replace_placeholders_case_insensitive() {
        let mut params = HashMap::new();
        params.insert("SRID".to_string(), literal(ParameterValue::Integer(2056)));

        let result = replace_placeholders("SELECT ${srid};", &params).unwrap();
        assert_eq!(result, "SELECT 2056;");
    }

    #[test]
    fn test_missing_placeholder_is_an_error() {
        let params = HashMap::new();
        let err = replace_placeholders("SELECT ${missing};", &params).unwrap_err();
        match err {
            StrataError::PlaceholderNotFound { key, available } => {
                assert_eq!(key, "missing");
                assert_eq!(available, "(none)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unused_parameters_are_ignored() {
        let mut params = HashMap::new();
        params.insert("unused".to_string(), literal(ParameterValue::Boolean(true)));
        assert_eq!(replace_placeholders("SELECT 1;", &params).unwrap(), "SELECT 1;");
    }

    #[test]
    fn test_dollar_quotes_are_not_placeholders() {
        let params = HashMap::new();
        let sql = "CREATE FUNCTION f() RETURNS int AS $$ SELECT 1; $$ LANGUAGE sql";
        assert_eq!(replace_placeholders(sql, &params).unwrap(), sql);
        assert!(placeholder_names(sql).is_empty());
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(
            placeholder_names("SELECT ${a}, ${b}, ${a}"),
            vec!["a".to_string(), "b".to_string(), "a".to_string()]
        );
    }
}
