//! Declarative provider options.
//!
//! Every provider publishes the options it understands as a plain data
//! schema; the CLI binder validates user input against it and hands the
//! resolved key/value map onward. Components receive the map by value — no
//! global registry.

use std::collections::BTreeMap;

use crate::error::{PipeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKind {
    Scalar,
    /// Comma-separated values.
    List,
    /// One of a fixed set.
    Enum(&'static [&'static str]),
}

/// One declared option.
#[derive(Debug, Clone)]
pub struct OptionField {
    pub name: &'static str,
    pub description: &'static str,
    pub default: Option<&'static str>,
    pub kind: OptionKind,
    /// Hidden fields are accepted but not listed in help output.
    pub hidden: bool,
}

impl OptionField {
    pub const fn scalar(
        name: &'static str,
        description: &'static str,
        default: Option<&'static str>,
    ) -> Self {
        OptionField {
            name,
            description,
            default,
            kind: OptionKind::Scalar,
            hidden: false,
        }
    }
}

/// The option set one provider understands.
#[derive(Debug, Clone)]
pub struct OptionSchema {
    pub provider: &'static str,
    pub fields: Vec<OptionField>,
}

impl OptionSchema {
    /// Validate raw user pairs and fold in declared defaults.
    pub fn bind(&self, raw: &BTreeMap<String, String>) -> Result<Options> {
        for key in raw.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                return Err(PipeError::InvalidConfiguration(format!(
                    "provider '{}' does not understand option '{key}'",
                    self.provider
                )));
            }
        }
        let mut values = raw.clone();
        for field in &self.fields {
            if let OptionKind::Enum(allowed) = &field.kind {
                if let Some(v) = values.get(field.name) {
                    if !allowed.contains(&v.as_str()) {
                        return Err(PipeError::InvalidConfiguration(format!(
                            "option '{}' must be one of {allowed:?}, got '{v}'",
                            field.name
                        )));
                    }
                }
            }
            if let (Some(default), None) = (field.default, values.get(field.name)) {
                values.insert(field.name.to_string(), default.to_string());
            }
        }
        Ok(Options { values })
    }
}

/// The resolved key/value map a component receives.
#[derive(Debug, Clone, Default)]
pub struct Options {
    values: BTreeMap<String, String>,
}

impl Options {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Options {
            values: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &'static str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(PipeError::InvalidConfiguration(format!(
                "option '{key}' expects true/false, got '{other}'"
            ))),
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                PipeError::InvalidConfiguration(format!(
                    "option '{key}' expects an integer, got '{raw}'"
                ))
            }),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                PipeError::InvalidConfiguration(format!(
                    "option '{key}' expects a number, got '{raw}'"
                ))
            }),
        }
    }

    pub fn get_char(&self, key: &str, default: char) -> Result<char> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => {
                let mut chars = raw.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(c),
                    _ => Err(PipeError::InvalidConfiguration(format!(
                        "option '{key}' expects a single character, got '{raw}'"
                    ))),
                }
            }
        }
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}
