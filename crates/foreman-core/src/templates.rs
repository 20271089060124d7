//! Thin template service. The core only needs keyed lookup with `%{name}`
//! interpolation; where translations come from is someone else's problem.

use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("missing template key: {0}")]
    MissingKey(String),

    #[error("template {key} is not a string")]
    NotAString { key: String },
}

pub trait Templates {
    /// Interpolated string at `key`. `%{name}` placeholders are replaced from
    /// `attrs`; placeholders with no matching attribute are left verbatim.
    fn t(&self, key: &str, attrs: &serde_json::Map<String, Value>) -> Result<String, TemplateError>;

    fn exists(&self, key: &str) -> bool;

    /// Raw value at `key`, for list- or schema-shaped entries.
    fn value(&self, key: &str) -> Option<Value>;

    /// Convenience: a list of strings at `key`, or `None` when absent.
    fn strings(&self, key: &str) -> Option<Vec<String>> {
        let value = self.value(key)?;
        match value {
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect(),
            ),
            Value::String(s) => Some(vec![s]),
            _ => None,
        }
    }
}

/// Replace `%{name}` placeholders from `attrs`. Values render without JSON
/// string quoting.
pub fn interpolate(template: &str, attrs: &serde_json::Map<String, Value>) -> String {
    let mut out = template.to_owned();
    for (name, value) in attrs {
        let needle = format!("%{{{name}}}");
        if !out.contains(&needle) {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &rendered);
    }
    out
}

/// Flat key → value map, the in-memory implementation used by tests and by
/// callers that assemble prompts in code.
#[derive(Clone, Debug, Default)]
pub struct StaticTemplates {
    entries: HashMap<String, Value>,
}

impl StaticTemplates {
    pub fn new(entries: HashMap<String, Value>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }
}

impl Templates for StaticTemplates {
    fn t(&self, key: &str, attrs: &serde_json::Map<String, Value>) -> Result<String, TemplateError> {
        let value = self
            .entries
            .get(key)
            .ok_or_else(|| TemplateError::MissingKey(key.to_owned()))?;
        let template = value.as_str().ok_or_else(|| TemplateError::NotAString {
            key: key.to_owned(),
        })?;
        Ok(interpolate(template, attrs))
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn interpolates_string_attrs() {
        let out = interpolate("write about %{topic}", &attrs(&[("topic", json!("crabs"))]));
        assert_eq!(out, "write about crabs");
    }

    #[test]
    fn interpolates_non_string_attrs_unquoted() {
        let out = interpolate("retry %{count} times", &attrs(&[("count", json!(3))]));
        assert_eq!(out, "retry 3 times");
    }

    #[test]
    fn unknown_placeholder_left_verbatim() {
        let out = interpolate("hello %{name}", &attrs(&[]));
        assert_eq!(out, "hello %{name}");
    }

    #[test]
    fn t_missing_key_errors() {
        let templates = StaticTemplates::default();
        let err = templates.t("draft.prompt", &attrs(&[])).unwrap_err();
        assert!(matches!(err, TemplateError::MissingKey(k) if k == "draft.prompt"));
    }

    #[test]
    fn t_non_string_errors() {
        let mut templates = StaticTemplates::default();
        templates.insert("draft.tools", json!(["read", "edit"]));
        let err = templates.t("draft.tools", &attrs(&[])).unwrap_err();
        assert!(matches!(err, TemplateError::NotAString { .. }));
    }

    #[test]
    fn strings_accepts_list_and_scalar() {
        let mut templates = StaticTemplates::default();
        templates.insert("a.tools", json!(["read", "edit"]));
        templates.insert("a.prompt", json!("just one"));
        assert_eq!(templates.strings("a.tools").unwrap(), vec!["read", "edit"]);
        assert_eq!(templates.strings("a.prompt").unwrap(), vec!["just one"]);
        assert!(templates.strings("a.missing").is_none());
    }
}
