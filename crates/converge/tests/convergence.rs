use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use converge::components::{Component, ComponentSpec, fingerprint_of};
use converge::error::{Error, ErrorKind};
use converge::executor::{ExecCtx, ExecEvent, MemorySink};
use converge::markers::MarkerStore;
use converge::orchestrator::{Orchestrator, Outcome, RunOptions};
use converge::retry::RetryPolicy;

/// Stand-in for the machine: the set of installed artifacts.
#[derive(Default)]
struct World {
    installed: Mutex<BTreeSet<String>>,
}

impl World {
    fn has(&self, name: &str) -> bool {
        self.installed.lock().unwrap().contains(name)
    }

    fn uninstall(&self, name: &str) {
        self.installed.lock().unwrap().remove(name);
    }
}

struct Fake {
    spec: ComponentSpec,
    world: Arc<World>,
    version: String,
    fail_first: u32,
    fail_kind: ErrorKind,
    broken: Arc<AtomicBool>,
    applies: Arc<AtomicU32>,
    adopt: bool,
}

impl Fake {
    fn new(name: &str, world: &Arc<World>) -> Self {
        Self {
            spec: ComponentSpec::new(name).retry(RetryPolicy::new(3, Duration::ZERO)),
            world: world.clone(),
            version: "1".into(),
            fail_first: 0,
            fail_kind: ErrorKind::Transient,
            broken: Arc::new(AtomicBool::new(false)),
            applies: Arc::new(AtomicU32::new(0)),
            adopt: false,
        }
    }

    fn adopting(mut self) -> Self {
        self.adopt = true;
        self
    }

    fn after(mut self, deps: &[&str]) -> Self {
        self.spec = self.spec.depends_on(deps.iter().copied());
        self
    }

    fn max_attempts(mut self, n: u32) -> Self {
        self.spec = self.spec.retry(RetryPolicy::new(n, Duration::ZERO));
        self
    }

    fn failing_first(mut self, n: u32, kind: ErrorKind) -> Self {
        self.fail_first = n;
        self.fail_kind = kind;
        self
    }

    fn version(mut self, v: &str) -> Self {
        self.version = v.into();
        self
    }

    fn applies(&self) -> Arc<AtomicU32> {
        self.applies.clone()
    }

    fn broken(&self) -> Arc<AtomicBool> {
        self.broken.clone()
    }
}

impl Component for Fake {
    fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    fn apply(&self, _ctx: &mut ExecCtx, attempt: u32) -> converge::Result<()> {
        let n = self.applies.fetch_add(1, Ordering::SeqCst) + 1;
        if self.broken.load(Ordering::SeqCst) || n <= self.fail_first {
            return Err(Error::new(
                self.fail_kind,
                format!("{} attempt {attempt} failed", self.spec.name),
            ));
        }
        self.world
            .installed
            .lock()
            .unwrap()
            .insert(self.spec.name.clone());
        Ok(())
    }

    fn verify(&self, _ctx: &mut ExecCtx) -> converge::Result<()> {
        if self.world.has(&self.spec.name) {
            Ok(())
        } else {
            Err(Error::verification(format!("{} not installed", self.spec.name)))
        }
    }

    fn fingerprint(&self) -> String {
        fingerprint_of(&serde_json::json!({
            "name": self.spec.name,
            "version": self.version,
        }))
    }

    fn adopt_existing(&self) -> bool {
        self.adopt
    }
}

fn ctx() -> (ExecCtx, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let ctx = ExecCtx::new(false, sink.clone());
    (ctx, sink)
}

fn orch(dir: &Path, components: Vec<Fake>) -> Orchestrator {
    let mut orch = Orchestrator::new(MarkerStore::new(dir.join("state")));
    for c in components {
        orch.register(Box::new(c)).unwrap();
    }
    orch
}

#[test]
fn flaky_middle_component_converges_within_budget() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());

    let a = Fake::new("a", &world);
    let b = Fake::new("b", &world)
        .after(&["a"])
        .failing_first(2, ErrorKind::Transient);
    let c = Fake::new("c", &world).after(&["b"]);
    let b_applies = b.applies();

    let (ctx, sink) = ctx();
    let res = orch(tmp.path(), vec![a, b, c]).run(&ctx).unwrap();

    assert!(res.success());
    assert_eq!(res.outcome("a"), Some(&Outcome::Applied));
    assert_eq!(res.outcome("b"), Some(&Outcome::Applied));
    assert_eq!(res.outcome("c"), Some(&Outcome::Applied));
    assert_eq!(res.get("b").unwrap().attempts, 3);
    assert_eq!(b_applies.load(Ordering::SeqCst), 3);

    let order: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ExecEvent::ComponentStarted { name } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    let store = MarkerStore::new(tmp.path().join("state"));
    assert_eq!(store.load("b").unwrap().unwrap().attempts, 3);
}

#[test]
fn exhausted_dependency_skips_dependents() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());

    let a = Fake::new("a", &world)
        .max_attempts(2)
        .failing_first(u32::MAX, ErrorKind::Transient);
    let b = Fake::new("b", &world).after(&["a"]);
    let d = Fake::new("d", &world).after(&["b"]);
    let a_applies = a.applies();
    let b_applies = b.applies();

    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), vec![a, b, d]).run(&ctx).unwrap();

    assert!(!res.success());
    let a = res.get("a").unwrap();
    assert!(matches!(a.outcome, Outcome::Failed { kind: ErrorKind::Transient, .. }));
    assert_eq!(a.attempts, 2);
    assert_eq!(a_applies.load(Ordering::SeqCst), 2);
    assert_eq!(
        res.outcome("b"),
        Some(&Outcome::DependencyFailed {
            dependency: "a".into()
        })
    );
    assert_eq!(
        res.outcome("d"),
        Some(&Outcome::DependencyFailed {
            dependency: "a".into()
        })
    );
    assert_eq!(b_applies.load(Ordering::SeqCst), 0);
    assert!(MarkerStore::new(tmp.path().join("state")).list().unwrap().is_empty());
}

#[test]
fn independent_failure_does_not_abort_run() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let a = Fake::new("a", &world).failing_first(u32::MAX, ErrorKind::Transient);
    let z = Fake::new("z", &world);

    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), vec![a, z]).run(&ctx).unwrap();
    assert!(res.outcome("a").is_some_and(Outcome::is_failure));
    assert_eq!(res.outcome("z"), Some(&Outcome::Applied));
}

#[test]
fn second_run_is_a_no_op() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let build = || {
        vec![
            Fake::new("a", &world),
            Fake::new("b", &world).after(&["a"]),
        ]
    };

    let (ctx, _sink) = ctx();
    assert!(orch(tmp.path(), build()).run(&ctx).unwrap().success());
    let store = MarkerStore::new(tmp.path().join("state"));
    let markers_before = store.list().unwrap();
    let files_before = state_files(tmp.path());
    assert_eq!(markers_before.len(), 2);

    let again = build();
    let counters: Vec<_> = again.iter().map(Fake::applies).collect();
    let res = orch(tmp.path(), again).run(&ctx).unwrap();
    assert_eq!(res.outcome("a"), Some(&Outcome::Skipped));
    assert_eq!(res.outcome("b"), Some(&Outcome::Skipped));
    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 0));
    assert_eq!(store.list().unwrap(), markers_before);
    assert_eq!(state_files(tmp.path()), files_before);
}

/// Names and modification times of everything in the state dir.
fn state_files(dir: &Path) -> Vec<(String, std::time::SystemTime)> {
    let mut out: Vec<_> = std::fs::read_dir(dir.join("state"))
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            let modified = e.metadata().unwrap().modified().unwrap();
            (e.file_name().to_string_lossy().into_owned(), modified)
        })
        .collect();
    out.sort();
    out
}

#[test]
fn rerun_after_partial_failure_completes_the_rest() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());

    let a = Fake::new("a", &world);
    let b = Fake::new("b", &world).after(&["a"]);
    let outage = b.broken();
    outage.store(true, Ordering::SeqCst);
    let c = Fake::new("c", &world).after(&["b"]);

    let (ctx, _sink) = ctx();
    let first = orch(tmp.path(), vec![a, b, c]).run(&ctx).unwrap();
    assert!(!first.success());
    assert_eq!(first.outcome("a"), Some(&Outcome::Applied));

    // Condition cleared; same definitions.
    let a = Fake::new("a", &world);
    let a_applies = a.applies();
    let b = Fake::new("b", &world).after(&["a"]);
    let c = Fake::new("c", &world).after(&["b"]);
    let second = orch(tmp.path(), vec![a, b, c]).run(&ctx).unwrap();
    assert!(second.success());
    assert_eq!(second.outcome("a"), Some(&Outcome::Skipped));
    assert_eq!(a_applies.load(Ordering::SeqCst), 0);
    assert_eq!(second.outcome("b"), Some(&Outcome::Applied));
    assert_eq!(second.outcome("c"), Some(&Outcome::Applied));
}

#[test]
fn marker_without_working_artifact_is_repaired() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());

    let (ctx, sink) = ctx();
    orch(tmp.path(), vec![Fake::new("tool", &world)])
        .run(&ctx)
        .unwrap();
    world.uninstall("tool");

    let tool = Fake::new("tool", &world);
    let applies = tool.applies();
    let res = orch(tmp.path(), vec![tool]).run(&ctx).unwrap();
    assert_eq!(res.outcome("tool"), Some(&Outcome::Applied));
    assert_eq!(applies.load(Ordering::SeqCst), 1);
    assert!(world.has("tool"));
    assert!(
        sink.logs_for("tool")
            .iter()
            .any(|l| l.starts_with("invalidating marker"))
    );
}

#[test]
fn invalidate_forces_reapply() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let (ctx, _sink) = ctx();
    orch(tmp.path(), vec![Fake::new("tool", &world)])
        .run(&ctx)
        .unwrap();

    let tool = Fake::new("tool", &world);
    let applies = tool.applies();
    let o = orch(tmp.path(), vec![tool]);
    assert!(o.invalidate("tool").unwrap());
    assert!(!o.invalidate("tool").unwrap());
    assert_eq!(o.run(&ctx).unwrap().outcome("tool"), Some(&Outcome::Applied));
    assert_eq!(applies.load(Ordering::SeqCst), 1);
}

#[test]
fn permanent_error_is_attempted_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let a = Fake::new("a", &world)
        .max_attempts(5)
        .failing_first(u32::MAX, ErrorKind::Permanent);
    let applies = a.applies();

    let (ctx, sink) = ctx();
    let res = orch(tmp.path(), vec![a]).run(&ctx).unwrap();
    assert!(matches!(
        res.outcome("a"),
        Some(Outcome::Failed {
            kind: ErrorKind::Permanent,
            ..
        })
    ));
    assert_eq!(applies.load(Ordering::SeqCst), 1);
    let failed_attempts = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, ExecEvent::AttemptFailed { .. }))
        .count();
    assert_eq!(failed_attempts, 1);
}

#[test]
fn changed_definition_reapplies() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let (ctx, _sink) = ctx();
    orch(tmp.path(), vec![Fake::new("node", &world)])
        .run(&ctx)
        .unwrap();

    let same = Fake::new("node", &world);
    assert_eq!(
        orch(tmp.path(), vec![same]).run(&ctx).unwrap().outcome("node"),
        Some(&Outcome::Skipped)
    );

    let bumped = Fake::new("node", &world).version("2");
    let applies = bumped.applies();
    assert_eq!(
        orch(tmp.path(), vec![bumped]).run(&ctx).unwrap().outcome("node"),
        Some(&Outcome::Applied)
    );
    assert_eq!(applies.load(Ordering::SeqCst), 1);
}

#[test]
fn dry_run_changes_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let a = Fake::new("a", &world);
    let b = Fake::new("b", &world).after(&["a"]);
    let a_applies = a.applies();

    let sink = Arc::new(MemorySink::default());
    let ctx = ExecCtx::new(true, sink);
    let res = orch(tmp.path(), vec![a, b]).run(&ctx).unwrap();

    assert!(matches!(res.outcome("a"), Some(Outcome::WouldApply { .. })));
    assert!(matches!(res.outcome("b"), Some(Outcome::WouldApply { .. })));
    assert_eq!(a_applies.load(Ordering::SeqCst), 0);
    assert!(!world.has("a"));
    assert!(!tmp.path().join("state").exists());
}

#[test]
fn dry_run_leaves_unreadable_marker_in_place() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let store = MarkerStore::new(tmp.path().join("state"));
    std::fs::create_dir_all(store.dir()).unwrap();
    std::fs::write(store.path_for("x"), "{").unwrap();

    let dry = ExecCtx::new(true, Arc::new(MemorySink::default()));
    let res = orch(tmp.path(), vec![Fake::new("x", &world)])
        .run(&dry)
        .unwrap();
    assert!(matches!(res.outcome("x"), Some(Outcome::WouldApply { .. })));
    assert_eq!(std::fs::read_to_string(store.path_for("x")).unwrap(), "{");

    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), vec![Fake::new("x", &world)])
        .run(&ctx)
        .unwrap();
    assert_eq!(res.outcome("x"), Some(&Outcome::Applied));
    assert_eq!(store.load("x").unwrap().map(|m| m.method), Some("apply".into()));
}

#[test]
fn dry_run_reports_pending_adoption() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    world.installed.lock().unwrap().insert("git".into());

    let dry = ExecCtx::new(true, Arc::new(MemorySink::default()));
    let res = orch(tmp.path(), vec![Fake::new("git", &world).adopting()])
        .run(&dry)
        .unwrap();
    assert_eq!(
        res.outcome("git"),
        Some(&Outcome::WouldApply {
            reason: "adopt existing install".into()
        })
    );
    assert!(MarkerStore::new(tmp.path().join("state")).load("git").unwrap().is_none());

    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), vec![Fake::new("git", &world).adopting()])
        .run(&ctx)
        .unwrap();
    assert_eq!(res.outcome("git"), Some(&Outcome::Adopted));
}

#[test]
fn only_runs_selection_and_its_dependencies() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let comps = vec![
        Fake::new("node", &world),
        Fake::new("ccusage", &world).after(&["node"]),
        Fake::new("zsh", &world),
    ];
    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), comps)
        .with_options(RunOptions {
            only: vec!["ccusage".into()],
            ..RunOptions::default()
        })
        .run(&ctx)
        .unwrap();
    assert_eq!(res.len(), 2);
    assert_eq!(res.outcome("node"), Some(&Outcome::Applied));
    assert_eq!(res.outcome("ccusage"), Some(&Outcome::Applied));
    assert!(res.get("zsh").is_none());
    assert!(!world.has("zsh"));
}

#[test]
fn force_reapplies_satisfied_components() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let (ctx, _sink) = ctx();
    orch(tmp.path(), vec![Fake::new("a", &world)]).run(&ctx).unwrap();

    let a = Fake::new("a", &world);
    let applies = a.applies();
    let res = orch(tmp.path(), vec![a])
        .with_options(RunOptions {
            force: true,
            ..RunOptions::default()
        })
        .run(&ctx)
        .unwrap();
    assert_eq!(res.outcome("a"), Some(&Outcome::Applied));
    assert_eq!(applies.load(Ordering::SeqCst), 1);
}

#[test]
fn dangling_dependency_is_rejected_before_apply() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let a = Fake::new("a", &world).after(&["ghost"]);
    let applies = a.applies();
    let (ctx, _sink) = ctx();
    let err = orch(tmp.path(), vec![a]).run(&ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(err.to_string().contains("ghost"));
    assert_eq!(applies.load(Ordering::SeqCst), 0);
}

#[test]
fn optional_dependency_may_be_absent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let a = Fake::new("a", &world).after(&["ghost?"]);
    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), vec![a]).run(&ctx).unwrap();
    assert_eq!(res.outcome("a"), Some(&Outcome::Applied));
}

/// Tracks how many `apply` calls are inside a shared resource at once.
struct Contender {
    spec: ComponentSpec,
    inside: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
    done: AtomicBool,
}

impl Component for Contender {
    fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    fn apply(&self, _ctx: &mut ExecCtx, _attempt: u32) -> converge::Result<()> {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn verify(&self, _ctx: &mut ExecCtx) -> converge::Result<()> {
        if self.done.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::verification("not yet"))
        }
    }
}

#[test]
fn shared_resource_writers_never_overlap_in_parallel() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let inside = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut o = Orchestrator::new(MarkerStore::new(tmp.path().join("state"))).with_options(
        RunOptions {
            max_parallel: 4,
            ..RunOptions::default()
        },
    );
    for name in ["ccusage", "prettier", "tsx", "eslint"] {
        o.register(Box::new(Contender {
            spec: ComponentSpec::new(name).resources(["npm-global"]),
            inside: inside.clone(),
            peak: peak.clone(),
            done: AtomicBool::new(false),
        }))
        .unwrap();
    }

    let (ctx, _sink) = ctx();
    let res = o.run(&ctx).unwrap();
    assert!(res.success());
    assert_eq!(res.len(), 4);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn parallel_run_cascades_failures_like_sequential() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let world = Arc::new(World::default());
    let comps = vec![
        Fake::new("a", &world).failing_first(u32::MAX, ErrorKind::Permanent),
        Fake::new("b", &world).after(&["a"]),
        Fake::new("c", &world),
        Fake::new("d", &world).after(&["c"]),
    ];
    let (ctx, _sink) = ctx();
    let res = orch(tmp.path(), comps)
        .with_options(RunOptions {
            max_parallel: 3,
            ..RunOptions::default()
        })
        .run(&ctx)
        .unwrap();
    assert_eq!(res.len(), 4);
    assert!(matches!(res.outcome("b"), Some(Outcome::DependencyFailed { .. })));
    assert_eq!(res.outcome("c"), Some(&Outcome::Applied));
    assert_eq!(res.outcome("d"), Some(&Outcome::Applied));
}
