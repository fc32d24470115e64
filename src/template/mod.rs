//! Body rendering.
//!
//! Templates use `{{ name }}` placeholders. Substituted values are
//! HTML-escaped; a placeholder with no value renders as nothing.

use std::collections::BTreeMap;

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};

use crate::errors::TemplateError;

/// A value substituted into a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaceholderValue {
    /// JSON `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer or float.
    Number(serde_json::Number),
    /// Text.
    String(String),
    /// Sequence of values.
    List(Vec<PlaceholderValue>),
    /// Nested mapping.
    Map(BTreeMap<String, PlaceholderValue>),
}

impl From<&str> for PlaceholderValue {
    fn from(value: &str) -> Self {
        PlaceholderValue::String(value.to_string())
    }
}

impl From<String> for PlaceholderValue {
    fn from(value: String) -> Self {
        PlaceholderValue::String(value)
    }
}

impl From<bool> for PlaceholderValue {
    fn from(value: bool) -> Self {
        PlaceholderValue::Bool(value)
    }
}

impl From<i64> for PlaceholderValue {
    fn from(value: i64) -> Self {
        PlaceholderValue::Number(value.into())
    }
}

/// One `{key, value}` entry of a request's placeholder list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    /// Placeholder name.
    pub key: String,
    /// Value; absent means `null`.
    #[serde(default = "null_value")]
    pub value: PlaceholderValue,
}

fn null_value() -> PlaceholderValue {
    PlaceholderValue::Null
}

/// Values available to a template, by name.
pub type TemplateData = BTreeMap<String, PlaceholderValue>;

/// Collects a placeholder list into template data. Later keys win.
pub fn data_from_placeholders<I>(placeholders: I) -> TemplateData
where
    I: IntoIterator<Item = Placeholder>,
{
    placeholders
        .into_iter()
        .map(|placeholder| (placeholder.key, placeholder.value))
        .collect()
}

/// Renders `template` with `data`.
pub fn render(template: &str, data: &TemplateData) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_auto_escape_callback(|_| AutoEscape::Html);

    Ok(env.render_str(template, data)?)
}
