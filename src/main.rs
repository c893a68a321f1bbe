//! `proctor`: runs a Procfile's processes in dependency order, with
//! readiness probing, file-watch reload, and crash backoff.
//!
//! The binary is deliberately thin: parse flags, read and parse the
//! Procfile, wire up the concrete host services, and hand control to
//! [`proctor::orchestrator::Orchestrator`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use proctor::config::RuntimeConfig;
use proctor::graph::{ProcId, ProcessGraph};
use proctor::host::{FileEvents, NotifyFileEvents, ReqwestNet, StdoutTerminal, TokioClock, TokioSpawner};
use proctor::multiplex::Multiplexer;
use proctor::orchestrator::{Orchestrator, ShutdownSignal};
use proctor::supervisor::HostServices;
use proctor::{parser, watch};

/// Path argument defaults to `Procfile`; flags mirror spec §6's CLI-surface
/// bullet list. `PROCTOR_FLAGS` (read before parsing, in `run`) is
/// prepended to argv exactly like the teacher's own env-driven flag
/// plumbing, just without a config-file layer underneath it.
#[derive(Debug, Parser)]
#[command(
    name = "proctor",
    version,
    about = "Runs a Procfile's processes in dependency order, with readiness probing, file-watch reload, and crash backoff."
)]
struct Cli {
    /// Path to the Procfile.
    #[arg(default_value = "Procfile")]
    path: PathBuf,
    /// Prefix every multiplexed line with an elapsed-time timestamp.
    #[arg(long)]
    timestamps: bool,
    /// Print the parsed process graph without spawning anything.
    #[arg(long)]
    dry_run: bool,
    /// Parse and validate the Procfile, print the startup order, and exit.
    #[arg(long)]
    check: bool,
    /// Log additional engine-level lifecycle diagnostics.
    #[arg(long)]
    verbose: bool,
    /// Milliseconds after an initial SIGINT in which a second one escalates
    /// to an immediate force-kill of every process group.
    #[arg(long, default_value_t = proctor::config::DEFAULT_SIGINT_ESCALATE_AFTER.as_millis() as u64)]
    sigint_escalate_after_ms: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match run().await {
        Ok(code) => code_to_exit(code),
        Err(err) => {
            eprintln!("proctor: {err:#}");
            code_to_exit(1)
        }
    }
}

fn code_to_exit(code: i32) -> std::process::ExitCode {
    std::process::ExitCode::from(code.clamp(0, 255) as u8)
}

async fn run() -> Result<i32> {
    let cli = Cli::parse_from(argv_with_proctor_flags()?);

    let config = RuntimeConfig {
        timestamps: cli.timestamps,
        dry_run: cli.dry_run,
        check: cli.check,
        verbose: cli.verbose,
        sigint_escalate_after: std::time::Duration::from_millis(cli.sigint_escalate_after_ms),
    };

    let source = std::fs::read_to_string(&cli.path)
        .with_context(|| format!("failed to read {}", cli.path.display()))?;

    let (graph, global_env) = match parser::parse(&source) {
        Ok(parsed) => parsed,
        Err(errors) => {
            for err in errors.errors() {
                eprintln!("proctor: {err}");
            }
            return Ok(1);
        }
    };

    if config.check {
        print_startup_order(&graph);
        return Ok(0);
    }

    if config.dry_run {
        print_graph(&graph);
        return Ok(0);
    }

    let procfile_dir = cli
        .path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let terminal = Arc::new(StdoutTerminal::new());
    let names: Vec<&str> = graph.ids().map(|id| graph.spec(id).name.as_str()).collect();
    let mux = Arc::new(Multiplexer::new(terminal, names, config.timestamps));

    let net = Arc::new(ReqwestNet::new());
    let orchestrator = Orchestrator::new(
        graph,
        global_env,
        move || HostServices {
            spawner: Arc::new(TokioSpawner),
            clock: Arc::new(TokioClock),
            net: net.clone(),
        },
        mux.clone(),
        config.verbose,
        config.sigint_escalate_after,
    );

    wire_file_watcher(&orchestrator, &procfile_dir)?;

    let (sig_tx, sig_rx) = mpsc::unbounded_channel();
    spawn_signal_listener(sig_tx);

    Ok(orchestrator.run(sig_rx).await)
}

/// Reads `PROCTOR_FLAGS` (spec §6) and splices its shell-tokenised words
/// right after argv[0], so they take the same precedence as if the user
/// had typed them first and CLI-supplied flags further right still win.
fn argv_with_proctor_flags() -> Result<Vec<String>> {
    let mut argv: Vec<String> = std::env::args().collect();
    if let Ok(flags) = std::env::var("PROCTOR_FLAGS") {
        if !flags.trim().is_empty() {
            let extra = shell_words::split(&flags).context("failed to parse PROCTOR_FLAGS")?;
            argv.splice(1..1, extra);
        }
    }
    Ok(argv)
}

/// Subscribes the single recursive file watcher and forwards each matched
/// process's changes into its Supervisor. The forwarding tasks hold a
/// cloned [`proctor::supervisor::SupervisorHandle`] rather than a borrow
/// of `orchestrator`, since [`Orchestrator::run`] consumes it.
fn wire_file_watcher(orchestrator: &Orchestrator, procfile_dir: &Path) -> Result<()> {
    let graph = orchestrator.graph();
    let mut targets: HashMap<ProcId, mpsc::UnboundedSender<PathBuf>> = HashMap::new();
    for id in graph.ids() {
        if !graph.spec(id).has_watches() {
            continue;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let handle = orchestrator.handle_for(id);
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                handle.notify_change(path);
            }
        });
        targets.insert(id, tx);
    }
    if targets.is_empty() {
        return Ok(());
    }
    let file_events: Arc<dyn FileEvents> = Arc::new(NotifyFileEvents);
    watch::spawn_watchers(file_events, graph, procfile_dir, &targets)
        .context("failed to start file watcher")
}

/// Delivers one [`ShutdownSignal`] per `SIGINT`/`SIGTERM` the process
/// receives, tagged by kind; the Orchestrator decides whether a given
/// `SIGINT` is the first (graceful shutdown) or a second one within the
/// escalation window (force-kill), per spec §5. `SIGTERM` is never treated
/// as escalating.
fn spawn_signal_listener(tx: mpsc::UnboundedSender<ShutdownSignal>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    if tx.send(ShutdownSignal::Sigint).is_err() {
                        return;
                    }
                }
                _ = sigterm.recv() => {
                    if tx.send(ShutdownSignal::Sigterm).is_err() {
                        return;
                    }
                }
            }
        }
    });
}

fn print_startup_order(graph: &ProcessGraph) {
    println!("{} process(es), startup order:", graph.len());
    for id in graph.topological_order() {
        println!("  {}", graph.spec(*id).name);
    }
}

fn print_graph(graph: &ProcessGraph) {
    for id in graph.topological_order() {
        let spec = graph.spec(*id);
        println!("{} ({:?})", spec.name, spec.kind);
        println!("  command: {}", spec.command);
        println!("  dir: {}", spec.dir);
        if !spec.dependencies.is_empty() {
            println!("  after: {}", spec.dependencies.join(", "));
        }
        if spec.has_watches() {
            println!("  watch: {}", spec.watch_includes.join(", "));
            if !spec.watch_excludes.is_empty() {
                println!("  watch-exclude: {}", spec.watch_excludes.join(", "));
            }
        }
    }
}
