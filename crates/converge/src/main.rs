use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use converge::Result;
use converge::components::{self, Vars};
use converge::config::{self, Environment, SetupDoc};
use converge::error::{Error, ErrorKind};
use converge::executor::{ExecCtx, StdoutSink};
use converge::lock::StateLock;
use converge::markers::MarkerStore;
use converge::orchestrator::{Orchestrator, RunOptions};

#[derive(Debug, Parser)]
#[command(author, version, about = "Idempotent, self-healing environment setup")]
struct Args {
    /// Path to the setup definition TOML
    #[arg(
        long,
        short,
        global = true,
        env = "CONVERGE_CONFIG",
        default_value = "converge.toml"
    )]
    config: PathBuf,
    /// Directory holding completion markers (overrides `state.dir`)
    #[arg(long, global = true, env = "CONVERGE_STATE_DIR")]
    state_dir: Option<PathBuf>,
    /// Debug diagnostics on stderr (otherwise RUST_LOG, default warn)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring every component to its desired state
    Run {
        /// Only these components (and what they depend on)
        #[arg(long)]
        only: Vec<String>,
        /// Re-apply even if already satisfied
        #[arg(long)]
        force: bool,
        /// Run checks only; apply nothing and write no markers
        #[arg(long)]
        dry_run: bool,
        /// Components to converge concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 1)]
        max_parallel: usize,
        /// Exit 0 even when required components fail
        #[arg(long)]
        allow_partial: bool,
    },
    /// List components with their kind, dependencies and marker
    List,
    /// Print the dependency-ordered plan
    Plan {
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Delete markers so the named components are re-checked and re-applied
    Invalidate {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show stored markers and whether they match the current definitions
    Status,
    /// Print the fully-resolved TOML (after imports/extends)
    Resolve,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    match dispatch(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e}");
            match e.kind() {
                ErrorKind::Permanent => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn dispatch(args: Args) -> Result<bool> {
    let doc = config::load(&args.config)?;
    if let Command::Resolve = args.cmd {
        print!("{}", doc.to_toml_pretty()?);
        return Ok(true);
    }

    let env = Environment::from_process();
    let state_dir = resolve_state_dir(args.state_dir.as_deref(), &doc, &env)?;
    tracing::debug!(config = %args.config.display(), state_dir = %state_dir.display(), "loaded");

    match args.cmd {
        Command::Run {
            only,
            force,
            dry_run,
            max_parallel,
            allow_partial,
        } => {
            let max_parallel = if max_parallel == 0 {
                num_cpus::get().max(1)
            } else {
                max_parallel
            };
            let options = RunOptions {
                force,
                only,
                max_parallel,
            };
            let ok = cmd_run(&doc, &env, &state_dir, options, dry_run)?;
            Ok(ok || allow_partial)
        }
        Command::List => cmd_list(&orchestrator(&doc, &env, &state_dir)?),
        Command::Plan { dot } => cmd_plan(&orchestrator(&doc, &env, &state_dir)?, dot),
        Command::Invalidate { names } => {
            let orch = orchestrator(&doc, &env, &state_dir)?;
            let _lock = StateLock::acquire(&state_dir, "invalidate")?;
            for name in &names {
                if orch.invalidate(name)? {
                    println!("invalidated {name}");
                } else {
                    println!("{name}: no marker");
                }
            }
            Ok(true)
        }
        Command::Status => cmd_status(&orchestrator(&doc, &env, &state_dir)?),
        Command::Resolve => Ok(true),
    }
}

/// `--state-dir`, then `state.dir` from the config (relative to it), then
/// `~/.local/state/converge`.
fn resolve_state_dir(flag: Option<&Path>, doc: &SetupDoc, env: &Environment) -> Result<PathBuf> {
    if let Some(p) = flag {
        return Ok(p.to_path_buf());
    }
    let vars = match env.home() {
        Some(home) => Vars::default().with_home(home),
        None => Vars::default(),
    };
    if let Some(dir) = doc.config()?.state.dir.as_deref() {
        return vars.expand_path(dir, &doc.base_dir());
    }
    vars.expand_path("~/.local/state/converge", Path::new("/"))
        .map_err(|e| Error::permanent(format!("no state dir: {e}; pass --state-dir")))
}

fn orchestrator(doc: &SetupDoc, env: &Environment, state_dir: &Path) -> Result<Orchestrator> {
    let mut orch = Orchestrator::new(MarkerStore::new(state_dir));
    orch.register_all(components::from_config(doc, env)?)?;
    Ok(orch)
}

fn cmd_run(
    doc: &SetupDoc,
    env: &Environment,
    state_dir: &Path,
    options: RunOptions,
    dry_run: bool,
) -> Result<bool> {
    let orch = orchestrator(doc, env, state_dir)?.with_options(options);
    // Fail on a bad graph before taking the lock.
    orch.plan()?;

    converge::signal::install_handlers();
    let _lock = if dry_run {
        None
    } else {
        Some(StateLock::acquire(state_dir, "run")?)
    };

    let sink = Arc::new(StdoutSink::default());
    let ctx = ExecCtx::new(dry_run, sink);
    let result = orch.run(&ctx)?;
    Ok(result.success())
}

fn cmd_list(orch: &Orchestrator) -> Result<bool> {
    let plan = orch.plan()?;
    for node in plan.ordered()? {
        let marker = match orch.markers().load(&node.id)? {
            Some(m) => format!("{} {}", m.method, m.completed_at),
            None => "-".into(),
        };
        let deps = plan.deps_of(&node.id)?.join(",");
        let enabled = orch.get(&node.id).is_some_and(|c| c.spec().enabled);
        println!(
            "{:<24} {:<9} {:<8} {:<30} {}",
            node.id,
            node.kind,
            if enabled { "enabled" } else { "disabled" },
            if deps.is_empty() { "-" } else { deps.as_str() },
            marker
        );
    }
    Ok(true)
}

fn cmd_plan(orch: &Orchestrator, dot: bool) -> Result<bool> {
    let plan = orch.plan()?;
    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(true);
    }
    for (i, node) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<24} {:<9} {}",
            i + 1,
            node.id,
            node.kind,
            node.after.join(", ")
        );
    }
    Ok(true)
}

fn cmd_status(orch: &Orchestrator) -> Result<bool> {
    let markers = orch.markers().list()?;
    if markers.is_empty() {
        println!("no markers in {}", orch.markers().dir().display());
        return Ok(true);
    }
    for m in markers {
        let state = match orch.get(&m.component) {
            Some(c) if c.fingerprint() == m.fingerprint => "current",
            Some(_) => "stale",
            None => "orphan",
        };
        println!(
            "{:<24} {:<8} {:<8} attempts={} {}",
            m.component, state, m.method, m.attempts, m.completed_at
        );
    }
    Ok(true)
}
