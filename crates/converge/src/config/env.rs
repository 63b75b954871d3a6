use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Read-only view of environment variables.
///
/// Components never read `std::env` directly; they go through this so a run
/// can be driven by an explicit variable set.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Snapshot of the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Empty values count as unset, matching `${VAR:-default}` in shell.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn home(&self) -> Option<&str> {
        self.get("HOME")
    }

    /// Boolean flag: `true/1/yes/on` or `false/0/no/off`, case-insensitive.
    pub fn flag(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        parse_bool(raw).map(Some).ok_or_else(|| {
            Error::permanent(format!(
                "environment variable {key}='{raw}' is not a boolean (use true/false)"
            ))
        })
    }

    pub fn flag_or(&self, key: Option<&str>, default: bool) -> Result<bool> {
        match key {
            Some(k) => Ok(self.flag(k)?.unwrap_or(default)),
            None => Ok(default),
        }
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_and_reject_garbage() {
        let env = Environment::from_pairs([
            ("ENABLE_CCUSAGE", "false"),
            ("OVERRIDE_THEME", "Yes"),
            ("BROKEN", "maybe"),
            ("EMPTY", ""),
        ]);
        assert_eq!(env.flag("ENABLE_CCUSAGE").unwrap(), Some(false));
        assert_eq!(env.flag("OVERRIDE_THEME").unwrap(), Some(true));
        assert_eq!(env.flag("EMPTY").unwrap(), None);
        assert_eq!(env.flag("MISSING").unwrap(), None);
        assert!(env.flag("BROKEN").is_err());
        assert!(env.flag_or(Some("MISSING"), true).unwrap());
        assert!(!env.flag_or(None, false).unwrap());
    }
}
