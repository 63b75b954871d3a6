//! Drives registered components to their desired state.
//!
//! For each component in dependency order: `check`, then `apply` + `verify`
//! under the component's retry policy, then persist a marker. A failure is
//! recorded and cascades to dependents; it never aborts the rest of the run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use std::time::Instant;

use crate::components::{Check, Component};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{ExecCtx, ExecEvent};
use crate::lock::ResourceLocks;
use crate::markers::{MarkerEntry, MarkerStore, StateMarker};
use crate::planner::{Node, Plan};
use crate::retry::{interruptible_sleep, retry};

mod result;

pub use result::{ComponentReport, Outcome, RunResult};

/// Knobs for one `run`. Dry-run lives on [`ExecCtx`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Re-apply even when `check` is satisfied.
    pub force: bool,
    /// Restrict the run to these components and their dependencies.
    pub only: Vec<String>,
    /// Worker count; 0 and 1 both mean sequential.
    pub max_parallel: usize,
}

pub struct Orchestrator {
    components: BTreeMap<String, Box<dyn Component>>,
    markers: MarkerStore,
    options: RunOptions,
    resources: ResourceLocks,
}

impl Orchestrator {
    pub fn new(markers: MarkerStore) -> Self {
        Self {
            components: BTreeMap::new(),
            markers,
            options: RunOptions::default(),
            resources: ResourceLocks::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn register(&mut self, component: Box<dyn Component>) -> Result<()> {
        let name = component.spec().name.clone();
        if name.trim().is_empty() {
            return Err(Error::permanent("component with empty name"));
        }
        if self.components.contains_key(&name) {
            return Err(Error::permanent(format!(
                "duplicate component name '{name}'"
            )));
        }
        self.components.insert(name.clone(), component);
        if let Err(e) = self.registered_graph().and_then(|g| g.ordered().map(|_| ())) {
            self.components.remove(&name);
            return Err(e.context(format!("cannot register '{name}'")));
        }
        Ok(())
    }

    /// Graph of what is registered so far. Dependencies not registered yet
    /// are left out; `plan` reports the ones still missing at run time.
    fn registered_graph(&self) -> Result<Plan> {
        let mut graph = Plan::default();
        for c in self.components.values() {
            let spec = c.spec();
            let after = spec
                .depends_on
                .iter()
                .filter(|d| {
                    let dep = d.strip_suffix('?').unwrap_or(d.as_str());
                    self.components.contains_key(dep)
                })
                .cloned()
                .collect();
            graph.add(Node::new(spec.name.clone(), spec.kind.clone(), after))?;
        }
        Ok(graph)
    }

    pub fn register_all<I>(&mut self, components: I) -> Result<()>
    where
        I: IntoIterator<Item = Box<dyn Component>>,
    {
        for c in components {
            self.register(c)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Component> {
        self.components.get(name).map(|c| c.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// The full dependency graph, or the `only` selection of it. Dangling
    /// dependencies are reported here, before anything runs.
    pub fn plan(&self) -> Result<Plan> {
        let mut plan = Plan::default();
        for c in self.components.values() {
            let spec = c.spec();
            plan.add(Node::new(
                spec.name.clone(),
                spec.kind.clone(),
                spec.depends_on.clone(),
            ))?;
        }
        plan.ordered()?;
        if self.options.only.is_empty() {
            Ok(plan)
        } else {
            plan.select(&self.options.only)
        }
    }

    /// Delete a component's marker so the next run re-checks from scratch.
    pub fn invalidate(&self, name: &str) -> Result<bool> {
        if !self.components.contains_key(name) {
            return Err(Error::permanent(format!("unknown component '{name}'")));
        }
        let removed = self.markers.remove(name)?;
        tracing::info!(component = name, removed, "marker invalidated");
        Ok(removed)
    }

    pub fn run(&self, ctx: &ExecCtx) -> Result<RunResult> {
        let plan = self.plan()?;
        let workers = self.options.max_parallel.max(1);
        tracing::debug!(
            components = plan.len(),
            workers,
            dry_run = ctx.dry_run,
            force = self.options.force,
            "starting run"
        );
        let result = if workers <= 1 {
            self.run_sequential(&plan, ctx)?
        } else {
            self.run_parallel(&plan, ctx, workers)?
        };
        ctx.sink.emit(ExecEvent::RunDone {
            ok: result.success(),
            error: None,
        });
        Ok(result)
    }

    fn run_sequential(&self, plan: &Plan, ctx: &ExecCtx) -> Result<RunResult> {
        let mut result = RunResult::default();
        for node in plan.ordered()? {
            let report = match self.precluded(plan, &node.id, &result, ctx)? {
                Some(report) => report,
                None => {
                    let mut local = ctx.clone();
                    self.converge(self.component(&node.id)?, &mut local)
                }
            };
            self.finish(plan, ctx, &mut result, report)?;
        }
        Ok(result)
    }

    fn run_parallel(&self, plan: &Plan, ctx: &ExecCtx, workers: usize) -> Result<RunResult> {
        let dependents = plan.dependents()?;
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        for node in plan.nodes() {
            pending.insert(node.id.as_str(), plan.deps_of(&node.id)?.len());
        }
        // Deterministic ready set.
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();

        let total = pending.len();
        let mut result = RunResult::default();

        std::thread::scope(|scope| -> Result<()> {
            let (tx, rx) = mpsc::channel::<ComponentReport>();
            let mut running = 0usize;

            while result.len() < total {
                // Fill worker slots.
                while running < workers {
                    let Some(id) = ready.pop_first() else {
                        break;
                    };
                    if let Some(report) = self.precluded(plan, id, &result, ctx)? {
                        self.finish(plan, ctx, &mut result, report)?;
                        release(id, &dependents, &mut pending, &mut ready);
                        continue;
                    }
                    let component = self.component(id)?;
                    let tx = tx.clone();
                    let mut local = ctx.clone();
                    scope.spawn(move || {
                        let report = self.converge(component, &mut local);
                        let _ = tx.send(report);
                    });
                    running += 1;
                }

                if result.len() == total {
                    break;
                }
                if running == 0 {
                    if ready.is_empty() {
                        let remaining: Vec<&str> = pending
                            .iter()
                            .filter_map(|(k, v)| (*v > 0).then_some(*k))
                            .collect();
                        return Err(Error::msg(format!(
                            "cannot make progress; remaining: {}",
                            remaining.join(", ")
                        )));
                    }
                    continue;
                }

                let report = rx
                    .recv()
                    .map_err(|e| Error::msg(format!("worker channel closed: {e}")))?;
                running -= 1;
                let Some((&id, _)) = pending.get_key_value(report.name.as_str()) else {
                    return Err(Error::msg(format!(
                        "worker reported unknown component '{}'",
                        report.name
                    )));
                };
                self.finish(plan, ctx, &mut result, report)?;
                release(id, &dependents, &mut pending, &mut ready);
            }
            Ok(())
        })?;

        Ok(result)
    }

    fn component(&self, name: &str) -> Result<&dyn Component> {
        self.get(name)
            .ok_or_else(|| Error::msg(format!("no component registered as '{name}'")))
    }

    /// Outcome decided without touching the component: a failed or
    /// cancelled dependency, or a cancelled run.
    fn precluded(
        &self,
        plan: &Plan,
        id: &str,
        done: &RunResult,
        ctx: &ExecCtx,
    ) -> Result<Option<ComponentReport>> {
        let required = self.component(id)?.spec().required;
        let report = |outcome: Outcome| ComponentReport {
            name: id.to_string(),
            outcome,
            attempts: 0,
            required,
            elapsed_ms: 0,
        };
        for dep in plan.deps_of(id)? {
            match done.outcome(dep) {
                Some(Outcome::Failed { .. }) => {
                    return Ok(Some(report(Outcome::DependencyFailed {
                        dependency: dep.to_string(),
                    })));
                }
                Some(Outcome::DependencyFailed { dependency }) => {
                    return Ok(Some(report(Outcome::DependencyFailed {
                        dependency: dependency.clone(),
                    })));
                }
                Some(Outcome::Cancelled) => return Ok(Some(report(Outcome::Cancelled))),
                _ => {}
            }
        }
        if ctx.cancelled() {
            return Ok(Some(report(Outcome::Cancelled)));
        }
        Ok(None)
    }

    fn finish(
        &self,
        plan: &Plan,
        ctx: &ExecCtx,
        result: &mut RunResult,
        report: ComponentReport,
    ) -> Result<()> {
        if matches!(report.outcome, Outcome::Failed { .. }) {
            let skipped = plan.dependents_closure(&report.name)?;
            if !skipped.is_empty() {
                tracing::warn!(
                    component = report.name.as_str(),
                    dependents = ?skipped,
                    "failure cascades to dependents"
                );
            }
        }
        ctx.sink.emit(ExecEvent::ComponentFinished {
            name: report.name.clone(),
            outcome: report.outcome.clone(),
            attempts: report.attempts,
            elapsed_ms: report.elapsed_ms,
        });
        result.push(report);
        Ok(())
    }

    /// Check, apply, verify and record one component. Never returns an
    /// error: every failure becomes an [`Outcome`].
    fn converge(&self, component: &dyn Component, ctx: &mut ExecCtx) -> ComponentReport {
        let spec = component.spec();
        let start = Instant::now();
        ctx.set_component(spec.name.clone(), spec.timeout);

        let (outcome, attempts) = if spec.enabled {
            ctx.sink.emit(ExecEvent::ComponentStarted {
                name: spec.name.clone(),
            });
            self.converge_enabled(component, ctx)
        } else {
            (Outcome::Disabled, 0)
        };

        let elapsed_ms = start.elapsed().as_millis();
        match &outcome {
            Outcome::Failed { kind, reason } => tracing::warn!(
                component = spec.name.as_str(),
                kind = kind.as_str(),
                attempts,
                reason = reason.as_str(),
                "component failed"
            ),
            other => tracing::info!(
                component = spec.name.as_str(),
                outcome = other.label(),
                attempts,
                elapsed_ms = elapsed_ms as u64,
                "component finished"
            ),
        }
        ComponentReport {
            name: spec.name.clone(),
            outcome,
            attempts,
            required: spec.required,
            elapsed_ms,
        }
    }

    fn converge_enabled(&self, component: &dyn Component, ctx: &mut ExecCtx) -> (Outcome, u32) {
        let spec = component.spec();
        let name = spec.name.as_str();

        let marker = match self.markers.read(name) {
            Ok(MarkerEntry::Valid(m)) => Some(m),
            Ok(MarkerEntry::Missing) => None,
            Ok(MarkerEntry::Corrupt) => {
                if !ctx.dry_run {
                    if let Err(e) = self.markers.remove(name) {
                        return (failed(&e.context("failed to discard marker")), 0);
                    }
                    ctx.log("discarded unreadable marker");
                }
                None
            }
            Err(e) => return (failed(&e.context("failed to read marker")), 0),
        };

        let check = if self.options.force {
            Check::Stale {
                reason: "forced".into(),
            }
        } else {
            match component.check(ctx, marker.as_ref()) {
                Ok(c) => c,
                Err(e) if e.kind() == ErrorKind::Cancelled => return (Outcome::Cancelled, 0),
                Err(e) => return (failed(&e.context("check failed")), 0),
            }
        };
        tracing::debug!(component = name, check = ?check, "checked");

        match check {
            Check::Satisfied => return (Outcome::Skipped, 0),
            Check::Adoptable => {
                if ctx.dry_run {
                    return (
                        Outcome::WouldApply {
                            reason: "adopt existing install".into(),
                        },
                        0,
                    );
                }
                let m = StateMarker::new(name, "adopted", component.fingerprint(), 0);
                return match self.markers.write(&m) {
                    Ok(_) => (Outcome::Adopted, 0),
                    Err(e) => (failed(&e.context("failed to write marker")), 0),
                };
            }
            _ => {}
        }

        if ctx.dry_run {
            return (
                Outcome::WouldApply {
                    reason: check.reason(),
                },
                0,
            );
        }

        if marker.is_some() && check.invalidates_marker() {
            ctx.log(&format!("invalidating marker: {}", check.reason()));
            if let Err(e) = self.markers.remove(name) {
                return (failed(&e.context("failed to remove marker")), 0);
            }
        }
        let clean_first = check.invalidates_marker();

        let _guard = self.resources.acquire(&spec.resources);
        let policy = spec.retry;
        let max_attempts = policy.attempts();
        let watch = ctx.clone();

        let outcome = retry(
            &policy,
            |attempt| {
                let r = attempt_once(component, ctx, attempt, clean_first || attempt > 1);
                if let Err(e) = &r {
                    ctx.sink.emit(ExecEvent::AttemptFailed {
                        name: name.to_string(),
                        attempt,
                        max_attempts,
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
                r
            },
            |d| interruptible_sleep(d, || watch.cancelled()),
        );

        match outcome.result {
            Ok(()) => {
                let m = StateMarker::new(name, "apply", component.fingerprint(), outcome.attempts);
                match self.markers.write(&m) {
                    Ok(_) => (Outcome::Applied, outcome.attempts),
                    Err(e) => (failed(&e.context("failed to write marker")), outcome.attempts),
                }
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => (Outcome::Cancelled, outcome.attempts),
            Err(e) => (failed(&e), outcome.attempts),
        }
    }
}

fn attempt_once(
    component: &dyn Component,
    ctx: &mut ExecCtx,
    attempt: u32,
    clean: bool,
) -> Result<()> {
    if ctx.cancelled() {
        return Err(Error::cancelled());
    }
    if clean {
        component.clean(ctx).map_err(|e| e.context("clean"))?;
    }
    component.apply(ctx, attempt)?;
    component.verify(ctx).map_err(|e| match e.kind() {
        ErrorKind::Verification | ErrorKind::Cancelled | ErrorKind::Timeout => e,
        _ => Error::verification(e.to_string()),
    })
}

fn failed(e: &Error) -> Outcome {
    Outcome::Failed {
        kind: e.kind(),
        reason: e.to_string(),
    }
}

fn release<'a>(
    id: &str,
    dependents: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    pending: &mut BTreeMap<&'a str, usize>,
    ready: &mut BTreeSet<&'a str>,
) {
    let Some(children) = dependents.get(id) else {
        return;
    };
    for &c in children {
        if let Some(slot) = pending.get_mut(c) {
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                ready.insert(c);
            }
        }
    }
}
