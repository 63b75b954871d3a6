use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{Environment, VarSpec};
use crate::error::{Error, Result};

/// Resolved variable values for one component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars {
    values: BTreeMap<String, String>,
    home: Option<String>,
}

impl Vars {
    /// Values come from the named env var, then the default. A required
    /// variable with neither is a permanent error.
    pub fn resolve(
        component: &str,
        specs: &BTreeMap<String, VarSpec>,
        env: &Environment,
    ) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (name, spec) in specs {
            let from_env = spec.env.as_deref().and_then(|k| env.get(k));
            let value = from_env
                .map(str::to_string)
                .or_else(|| spec.default.clone());
            match value {
                Some(v) => {
                    values.insert(name.clone(), v);
                }
                None if spec.required => {
                    let hint = spec
                        .env
                        .as_deref()
                        .map(|k| format!(" (set {k})"))
                        .unwrap_or_default();
                    return Err(Error::permanent(format!(
                        "component '{component}' requires variable '{name}'{hint}"
                    )));
                }
                None => {
                    values.insert(name.clone(), String::new());
                }
            }
        }
        Ok(Self {
            values,
            home: env.home().map(str::to_string),
        })
    }

    pub fn from_pairs<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
        Self {
            values: pairs.into_iter().collect(),
            home: None,
        }
    }

    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Replace `{name}` placeholders. `{{` and `}}` are literal braces.
    /// An unknown name is a permanent error.
    pub fn expand(&self, raw: &str) -> Result<String> {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(Error::permanent(format!(
                            "unterminated placeholder in '{raw}'"
                        )));
                    }
                    let Some(v) = self.values.get(name.trim()) else {
                        return Err(Error::permanent(format!(
                            "unknown variable '{{{name}}}' in '{raw}'"
                        )));
                    };
                    out.push_str(v);
                }
                c => out.push(c),
            }
        }
        Ok(out)
    }

    /// Expand placeholders and a leading `~`, then anchor relative paths at `base`.
    pub fn expand_path(&self, raw: &str, base: &Path) -> Result<PathBuf> {
        let s = self.expand(raw.trim())?;
        if s.is_empty() {
            return Err(Error::permanent("empty path"));
        }
        let p = if s == "~" || s.starts_with("~/") {
            let Some(home) = self.home.as_deref() else {
                return Err(Error::permanent(format!(
                    "cannot expand '{s}': HOME is not set"
                )));
            };
            PathBuf::from(home).join(s.trim_start_matches('~').trim_start_matches('/'))
        } else {
            PathBuf::from(s)
        };
        Ok(if p.is_absolute() { p } else { base.join(p) })
    }
}
