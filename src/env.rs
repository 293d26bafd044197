//! Typed access to environment variables.
//!
//! Values are captured once into an [`EnvSnapshot`] so that configuration
//! resolution sees a consistent view and tests never touch process state.
//! Every accessor returns `None` when a variable is missing, empty or
//! unparseable, keeping "absent" distinct from a zero value.

use std::collections::HashMap;

/// An immutable copy of a set of environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    ///
    /// Variables that are not valid unicode are skipped.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Build a snapshot from explicit key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a string value.
    pub fn string(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    /// Look up a boolean value.
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.vars.get(key).and_then(|value| parse_bool(value))
    }

    /// Look up a base-10 signed integer value.
    pub fn int(&self, key: &str) -> Option<i64> {
        self.vars.get(key).and_then(|value| value.parse().ok())
    }

    /// Iterate over the names of all variables starting with `prefix`.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.vars
            .keys()
            .map(String::as_str)
            .filter(move |key| key.starts_with(prefix))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
