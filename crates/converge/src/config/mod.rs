use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub mod env;

pub use env::Environment;

/// A loaded setup file with `extends`/`imports` already folded in.
#[derive(Debug, Clone)]
pub struct SetupDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl SetupDoc {
    pub fn from_str(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw).map_err(|e| {
            Error::permanent(format!("TOML parse error in {}: {e}", path.display()))
        })?;
        Ok(Self { path, value })
    }

    /// Directory relative paths in the file are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        dir_of(&self.path)
    }

    pub fn config(&self) -> Result<SetupConfig> {
        self.value.clone().try_into().map_err(|e| {
            Error::permanent(format!(
                "invalid setup config {}: {e}",
                self.path.display()
            ))
        })
    }

    pub fn to_toml_pretty(&self) -> Result<String> {
        toml::to_string_pretty(&self.value)
            .map_err(|e| Error::msg(format!("failed to render config: {e}")))
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SetupConfig {
    pub state: StateConfig,
    pub defaults: DefaultsConfig,
    #[serde(rename = "component")]
    pub components: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StateConfig {
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout_secs: default_timeout_secs(),
            required: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    #[default]
    Command,
    Template,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Command => "command",
            ComponentKind::Template => "template",
        }
    }
}

/// An external command: either an argv list or a string run by `sh -c`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FailurePatterns {
    pub transient: Vec<String>,
    pub permanent: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VarSpec {
    pub env: Option<String>,
    pub default: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: ComponentKind,
    pub depends_on: Vec<String>,
    pub required: Option<bool>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub enabled_env: Option<String>,
    pub resources: Vec<String>,
    pub retry: Option<RetryPolicy>,
    pub timeout_secs: Option<u64>,
    pub vars: BTreeMap<String, VarSpec>,
    /// Relative paths resolve against this; the loader sets it to the
    /// directory of the defining file.
    pub base_dir: Option<String>,

    // command
    pub apply: Option<CommandSpec>,
    pub verify: Option<CommandSpec>,
    pub verify_expect: Option<String>,
    pub clean: Vec<String>,
    pub adopt_existing: bool,
    pub failures: FailurePatterns,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,

    // template
    pub source: Option<String>,
    pub dest: Option<String>,
    pub overwrite: bool,
    pub overwrite_env: Option<String>,
    pub mode: Option<u32>,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ComponentKind::Command,
            depends_on: Vec::new(),
            required: None,
            enabled: true,
            enabled_env: None,
            resources: Vec::new(),
            retry: None,
            timeout_secs: None,
            vars: BTreeMap::new(),
            base_dir: None,
            apply: None,
            verify: None,
            verify_expect: None,
            clean: Vec::new(),
            adopt_existing: false,
            failures: FailurePatterns::default(),
            env: BTreeMap::new(),
            cwd: None,
            source: None,
            dest: None,
            overwrite: false,
            overwrite_env: None,
            mode: None,
        }
    }
}

fn dir_of(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Stamp each `[[component]]` of one file with that file's directory, so
/// its relative paths survive being merged into another file.
fn stamp_base_dir(path: &Path, table: &mut toml::value::Table) {
    let Some(Value::Array(items)) = table.get_mut("component") else {
        return;
    };
    let dir = dir_of(path).to_string_lossy().into_owned();
    for item in items {
        if let Value::Table(t) = item {
            if !t.contains_key("base_dir") {
                t.insert("base_dir".into(), Value::String(dir.clone()));
            }
        }
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        // Component lists concatenate so imported files can each contribute.
        (Value::Array(base_arr), Value::Array(child_arr)) => {
            base_arr.extend(child_arr);
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::permanent(format!(
            "'imports' in {} must be an array of paths",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::permanent(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::permanent(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path).map_err(|e| {
        Error::permanent(format!("failed to read config {}: {e}", path.display()))
    })?;
    let mut value: Value = toml::from_str(&data).map_err(|e| {
        Error::permanent(format!("TOML parse error in {}: {e}", path.display()))
    })?;
    let Some(tbl) = value.as_table_mut() else {
        return Err(Error::permanent(format!(
            "config root in {} is not a table",
            path.display()
        )));
    };
    stamp_base_dir(path, tbl);

    // Precedence, lowest first: extends base, imports in order, this file.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = tbl.remove("extends") {
        let Some(ext) = ext.as_str() else {
            return Err(Error::permanent(format!(
                "'extends' in {} must be a path string",
                path.display()
            )));
        };
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    for imp in take_imports(path, tbl)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<SetupDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(SetupDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components_with_defaults() {
        let doc = SetupDoc::from_str(
            "/etc/converge/setup.toml",
            r#"
[defaults]
timeout_secs = 60

[defaults.retry]
max_attempts = 5
backoff = "exponential"

[[component]]
name = "ccusage"
apply = ["npm", "install", "-g", "ccusage"]
verify = "ccusage --version"
depends_on = ["node"]

[[component]]
name = "zsh-theme"
kind = "template"
source = "templates/theme.zsh"
dest = "~/.zsh/theme.zsh"
"#,
        )
        .unwrap();
        let cfg = doc.config().unwrap();
        assert_eq!(cfg.defaults.timeout_secs, 60);
        assert_eq!(cfg.defaults.retry.max_attempts, 5);
        assert_eq!(cfg.defaults.retry.delay_ms, 2000);
        assert_eq!(cfg.components.len(), 2);
        let cc = &cfg.components[0];
        assert!(cc.enabled);
        assert_eq!(cc.kind, ComponentKind::Command);
        assert!(matches!(cc.apply, Some(CommandSpec::Argv(ref v)) if v.len() == 4));
        assert!(matches!(cc.verify, Some(CommandSpec::Shell(_))));
        assert_eq!(cfg.components[1].kind, ComponentKind::Template);
        assert_eq!(doc.base_dir(), PathBuf::from("/etc/converge"));
    }

    #[test]
    fn unknown_kind_is_a_permanent_error() {
        let doc = SetupDoc::from_str(
            "setup.toml",
            r#"
[[component]]
name = "x"
kind = "docker"
"#,
        )
        .unwrap();
        let err = doc.config().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Permanent);
    }

    #[test]
    fn imports_concatenate_components_and_local_wins() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            r#"
[defaults]
timeout_secs = 10

[[component]]
name = "node"
apply = "true"
"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join("tools.toml"),
            r#"
[[component]]
name = "ccusage"
apply = "true"
depends_on = ["node"]
"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join("setup.toml"),
            r#"
extends = "base.toml"
imports = ["tools.toml"]

[defaults]
timeout_secs = 20
"#,
        )
        .unwrap();

        let doc = load(&tmp.path().join("setup.toml")).unwrap();
        let cfg = doc.config().unwrap();
        assert_eq!(cfg.defaults.timeout_secs, 20);
        let names: Vec<&str> = cfg.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["node", "ccusage"]);
    }

    #[test]
    fn imported_components_keep_their_own_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("shell")).unwrap();
        fs::write(
            tmp.path().join("shell/zsh.toml"),
            "[[component]]\nname = \"zsh-theme\"\nkind = \"template\"\nsource = \"theme.zsh\"\ndest = \"/tmp/theme.zsh\"\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("setup.toml"),
            "imports = [\"shell/zsh.toml\"]\n\n[[component]]\nname = \"node\"\napply = \"true\"\n",
        )
        .unwrap();

        let cfg = load(&tmp.path().join("setup.toml")).unwrap().config().unwrap();
        let dirs: Vec<PathBuf> = cfg
            .components
            .iter()
            .map(|c| PathBuf::from(c.base_dir.clone().unwrap()))
            .collect();
        assert_eq!(dirs, vec![tmp.path().join("shell"), tmp.path().to_path_buf()]);
    }

    #[test]
    fn import_cycle_detected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "imports = [\"b.toml\"]\n").unwrap();
        fs::write(tmp.path().join("b.toml"), "imports = [\"a.toml\"]\n").unwrap();
        let err = load(&tmp.path().join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
    }
}
