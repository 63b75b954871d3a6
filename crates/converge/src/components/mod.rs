use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::config::{ComponentConfig, ComponentKind, Environment, SetupDoc};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{DEFAULT_TIMEOUT, ExecCtx};
use crate::markers::StateMarker;
use crate::retry::RetryPolicy;

pub mod command;
pub mod template;
pub mod vars;

pub use vars::Vars;

/// Static description of a component, shared by every kind.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: String,
    pub depends_on: Vec<String>,
    pub retry: RetryPolicy,
    pub required: bool,
    pub enabled: bool,
    /// Shared targets `apply` writes; writers of the same resource never overlap.
    pub resources: Vec<String>,
    pub timeout: Duration,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "custom".into(),
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            required: true,
            enabled: true,
            resources: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }
}

/// What `check` concluded about a component before any work is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// Marker is current and the artifact verifies.
    Satisfied,
    /// No marker, but the artifact already verifies and may be adopted.
    Adoptable,
    /// No marker; needs `apply`.
    Missing,
    /// Marker exists but describes a different definition.
    Stale { reason: String },
    /// Marker exists but the artifact no longer verifies.
    Broken { reason: String },
}

impl Check {
    /// A marker that must be dropped before re-applying.
    pub fn invalidates_marker(&self) -> bool {
        matches!(self, Check::Stale { .. } | Check::Broken { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            Check::Satisfied => "satisfied".into(),
            Check::Adoptable => "already present".into(),
            Check::Missing => "not installed".into(),
            Check::Stale { reason } | Check::Broken { reason } => reason.clone(),
        }
    }
}

/// A unit of idempotent setup work.
pub trait Component: Send + Sync {
    fn spec(&self) -> &ComponentSpec;

    /// Install or configure. `attempt` is 1-based.
    fn apply(&self, ctx: &mut ExecCtx, attempt: u32) -> Result<()>;

    /// Functional check that the artifact works, not just that it exists.
    fn verify(&self, ctx: &mut ExecCtx) -> Result<()>;

    /// Remove known-conflicting leftovers of a partial install. Must be a
    /// no-op when nothing is there.
    fn clean(&self, _ctx: &mut ExecCtx) -> Result<()> {
        Ok(())
    }

    /// Digest of the resolved definition; a marker with a different
    /// fingerprint is stale.
    fn fingerprint(&self) -> String {
        fingerprint_of(&serde_json::json!({
            "name": self.spec().name,
            "kind": self.spec().kind,
        }))
    }

    /// Whether an artifact that verifies without a marker counts as done.
    fn adopt_existing(&self) -> bool {
        false
    }

    /// Marker presence alone is never trusted: a current marker still has to
    /// pass `verify`.
    fn check(&self, ctx: &mut ExecCtx, marker: Option<&StateMarker>) -> Result<Check> {
        let Some(marker) = marker else {
            if self.adopt_existing() {
                return match self.verify(ctx) {
                    Ok(()) => Ok(Check::Adoptable),
                    Err(e) if e.kind() == ErrorKind::Cancelled => Err(e),
                    Err(_) => Ok(Check::Missing),
                };
            }
            return Ok(Check::Missing);
        };
        let current = self.fingerprint();
        if marker.fingerprint != current {
            return Ok(Check::Stale {
                reason: "definition changed since last apply".into(),
            });
        }
        match self.verify(ctx) {
            Ok(()) => Ok(Check::Satisfied),
            Err(e) if e.kind() == ErrorKind::Cancelled => Err(e),
            Err(e) => Ok(Check::Broken {
                reason: format!("marker present but verification failed: {e}"),
            }),
        }
    }
}

pub fn fingerprint_of<T: Serialize>(payload: &T) -> String {
    use sha2::{Digest, Sha256};
    let body = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&body))
}

/// Build the configured components in file order. Malformed definitions
/// (bad kind fields, invalid patterns, non-boolean flags) fail the load.
pub fn from_config(doc: &SetupDoc, env: &Environment) -> Result<Vec<Box<dyn Component>>> {
    let cfg = doc.config()?;
    let root = doc.base_dir();
    let mut out: Vec<Box<dyn Component>> = Vec::with_capacity(cfg.components.len());
    for c in &cfg.components {
        let name = c.name.trim();
        if name.is_empty() {
            return Err(Error::permanent("component with empty name"));
        }
        let spec = spec_from_config(c, &cfg.defaults, env)?;
        let base = c
            .base_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| root.clone());
        let component: Box<dyn Component> = match c.kind {
            ComponentKind::Command => Box::new(command::CommandComponent::from_config(
                spec, c, env, &base,
            )?),
            ComponentKind::Template => Box::new(template::TemplateComponent::from_config(
                spec, c, env, &base,
            )?),
        };
        out.push(component);
    }
    Ok(out)
}

fn spec_from_config(
    c: &ComponentConfig,
    defaults: &crate::config::DefaultsConfig,
    env: &Environment,
) -> Result<ComponentSpec> {
    let enabled = env.flag_or(c.enabled_env.as_deref(), c.enabled)?;
    Ok(ComponentSpec {
        name: c.name.trim().to_string(),
        kind: c.kind.as_str().to_string(),
        depends_on: c
            .depends_on
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect(),
        retry: c.retry.unwrap_or(defaults.retry),
        required: c.required.unwrap_or(defaults.required),
        enabled,
        resources: c.resources.clone(),
        timeout: Duration::from_secs(c.timeout_secs.unwrap_or(defaults.timeout_secs).max(1)),
    })
}

/// Variable errors are kept by the component and surfaced from `apply` and
/// `verify`, so one missing variable fails one component, not the load.
pub(crate) fn resolve_vars(c: &ComponentConfig, env: &Environment) -> Result<Vars> {
    Vars::resolve(c.name.trim(), &c.vars, env)
}
