use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::components::{Component, ComponentSpec, Vars, fingerprint_of, resolve_vars};
use crate::config::{CommandSpec, ComponentConfig, Environment, FailurePatterns};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CmdOutput, ExecCtx};

/// Maps a failed command's output onto a failure class. Permanent patterns
/// win over transient ones; anything unmatched is treated as transient.
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    transient: Vec<Regex>,
    permanent: Vec<Regex>,
}

impl FailureClassifier {
    pub fn new(patterns: &FailurePatterns, vars: &Vars) -> Result<Self> {
        Ok(Self {
            transient: compile_all(&patterns.transient, vars)?,
            permanent: compile_all(&patterns.permanent, vars)?,
        })
    }

    pub fn classify(&self, what: &str, out: &CmdOutput) -> Error {
        let text = out.tail.joined();
        let detail = out
            .tail
            .last()
            .map(|l| format!(": {l}"))
            .unwrap_or_default();
        let msg = format!("{what} exited with {}{detail}", out.status);
        if let Some(re) = self.permanent.iter().find(|re| re.is_match(&text)) {
            return Error::permanent(format!("{msg} (matched permanent pattern '{re}')"));
        }
        if let Some(re) = self.transient.iter().find(|re| re.is_match(&text)) {
            return Error::transient(format!("{msg} (matched transient pattern '{re}')"));
        }
        Error::transient(msg)
    }
}

fn compile_all(raw: &[String], vars: &Vars) -> Result<Vec<Regex>> {
    raw.iter()
        .map(|p| {
            let p = vars.expand(p)?;
            Regex::new(&p)
                .map_err(|e| Error::permanent(format!("invalid failure pattern '{p}': {e}")))
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Resolved {
    apply: Vec<String>,
    verify: Vec<String>,
    verify_expect: Option<String>,
    clean: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    classifier: FailureClassifier,
    vars: Vars,
}

/// Installs by running an external command and verifies by running another.
pub struct CommandComponent {
    spec: ComponentSpec,
    adopt: bool,
    resolved: std::result::Result<Resolved, crate::error::Error>,
    fingerprint: String,
}

impl CommandComponent {
    pub fn from_config(
        spec: ComponentSpec,
        c: &ComponentConfig,
        env: &Environment,
        base: &Path,
    ) -> Result<Self> {
        let Some(apply) = c.apply.as_ref() else {
            return Err(Error::permanent(format!(
                "command component '{}' has no 'apply' command",
                spec.name
            )));
        };
        let Some(verify) = c.verify.as_ref() else {
            return Err(Error::permanent(format!(
                "command component '{}' has no 'verify' command",
                spec.name
            )));
        };
        if matches!(apply, CommandSpec::Argv(v) if v.is_empty())
            || matches!(verify, CommandSpec::Argv(v) if v.is_empty())
        {
            return Err(Error::permanent(format!(
                "command component '{}' has an empty argv",
                spec.name
            )));
        }

        // Bad regexes are config errors regardless of variable values.
        for p in c.failures.transient.iter().chain(&c.failures.permanent) {
            if !p.contains('{') {
                Regex::new(p).map_err(|e| {
                    Error::permanent(format!(
                        "component '{}': invalid failure pattern '{p}': {e}",
                        spec.name
                    ))
                })?;
            }
        }

        let resolved = resolve_vars(c, env).and_then(|vars| {
            Ok(Resolved {
                apply: argv(apply, &vars)?,
                verify: argv(verify, &vars)?,
                verify_expect: c
                    .verify_expect
                    .as_deref()
                    .map(|s| vars.expand(s))
                    .transpose()?,
                clean: c
                    .clean
                    .iter()
                    .map(|p| vars.expand_path(p, base))
                    .collect::<Result<Vec<_>>>()?,
                env: c
                    .env
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), vars.expand(v)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
                cwd: c
                    .cwd
                    .as_deref()
                    .map(|p| vars.expand_path(p, base))
                    .transpose()?,
                classifier: FailureClassifier::new(&c.failures, &vars)?,
                vars,
            })
        });
        let resolved = resolved.map_err(|e| e.context(&spec.name));

        let fingerprint = match &resolved {
            Ok(r) => fingerprint_of(&serde_json::json!({
                "name": spec.name,
                "kind": "command",
                "apply": r.apply,
                "verify": r.verify,
                "verify_expect": r.verify_expect,
                "env": r.env,
                "vars": r.vars.values(),
            })),
            Err(e) => fingerprint_of(&serde_json::json!({
                "name": spec.name,
                "error": e.to_string(),
            })),
        };

        Ok(Self {
            spec,
            adopt: c.adopt_existing,
            resolved,
            fingerprint,
        })
    }

    fn resolved(&self) -> Result<&Resolved> {
        self.resolved.as_ref().map_err(Clone::clone)
    }

    fn command(&self, r: &Resolved, argv: &[String]) -> Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::permanent(format!(
                "component '{}' has an empty command",
                self.spec.name
            )));
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&r.env);
        if let Some(dir) = &r.cwd {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

fn argv(spec: &CommandSpec, vars: &Vars) -> Result<Vec<String>> {
    match spec {
        CommandSpec::Argv(v) => v.iter().map(|a| vars.expand(a)).collect(),
        CommandSpec::Shell(s) => Ok(vec!["sh".into(), "-c".into(), vars.expand(s)?]),
    }
}

impl Component for CommandComponent {
    fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    fn apply(&self, ctx: &mut ExecCtx, attempt: u32) -> Result<()> {
        let r = self.resolved()?;
        ctx.log(&format!("apply (attempt {attempt}): {}", r.apply.join(" ")));
        let out = ctx.run_cmd(self.command(r, &r.apply)?)?;
        if !out.success() {
            return Err(r.classifier.classify("apply", &out));
        }
        Ok(())
    }

    fn verify(&self, ctx: &mut ExecCtx) -> Result<()> {
        let r = self.resolved()?;
        let expect = r.verify_expect.as_deref();
        let mut mentioned = false;
        let run = ctx.run_cmd_observed(self.command(r, &r.verify)?, |line| {
            if expect.is_some_and(|want| line.contains(want)) {
                mentioned = true;
            }
        });
        let out = match run {
            Ok(out) => out,
            // A verify binary that is not there yet is a failed verification,
            // not a broken config.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::verification(e.to_string()));
            }
            Err(e) => return Err(e),
        };
        if !out.success() {
            let detail = out.tail.last().map(|l| format!(": {l}")).unwrap_or_default();
            return Err(Error::verification(format!(
                "verify exited with {}{detail}",
                out.status
            )));
        }
        if let Some(expect) = expect {
            if !mentioned {
                return Err(Error::verification(format!(
                    "verify output does not mention '{expect}'"
                )));
            }
        }
        Ok(())
    }

    fn clean(&self, ctx: &mut ExecCtx) -> Result<()> {
        let r = self.resolved()?;
        for p in &r.clean {
            if remove_path(p)? {
                ctx.log(&format!("removed leftover {}", p.display()));
            }
        }
        Ok(())
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn adopt_existing(&self) -> bool {
        self.adopt
    }
}

/// Remove a file, symlink or directory tree. `false` if nothing was there.
pub fn remove_path(p: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(p) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(Error::transient(format!(
                "failed to stat {}: {e}",
                p.display()
            )));
        }
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(p)
    } else {
        fs::remove_file(p)
    };
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::transient(format!(
            "failed to remove {}: {e}",
            p.display()
        ))),
    }
}
