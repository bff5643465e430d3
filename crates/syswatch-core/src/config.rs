//! Typed access to one `INI` section.
//!
//! Values are kept as strings until a module asks for them. Every setting
//! the probes read is either a scalar with a default (capacities, prefix
//! size) or a comma separated list (discarded prefixes, open flags, errno
//! names), so that's all this exposes.

use std::{collections::HashMap, fmt::Display, str::FromStr};

use thiserror::Error;

/// Settings of a single module
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    values: HashMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.values.insert(key, value)
    }

    /// Blank values (`key=`) count as missing.
    fn value(&self, field: &str) -> Option<&str> {
        self.values
            .get(field)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Parse `field`, or return `default` if it's not set.
    pub fn with_default<T>(&self, field: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.value(field) {
            Some(value) => parse(field, value),
            None => Ok(default),
        }
    }

    /// Parse a comma separated list. Empty items are skipped, a missing
    /// field is an empty list.
    pub fn get_list<T>(&self, field: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.value(field)
            .into_iter()
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(field, item))
            .collect()
    }

    /// Like [`ModuleConfig::get_list`], but a missing field yields `default`.
    /// A present but empty field (`key=`) clears the default.
    pub fn get_list_with_default<T>(
        &self,
        field: &str,
        default: Vec<T>,
    ) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if self.values.contains_key(field) {
            self.get_list(field)
        } else {
            Ok(default)
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn parse<T>(field: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}
