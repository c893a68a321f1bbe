//! The Orchestrator (component C7): owns the [`ProcessGraph`] and a
//! registry of [`SupervisorHandle`]s, drives startup in topological order,
//! cascades reloads to transitive dependents, and runs the reverse-
//! topological shutdown protocol (spec §4.7).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::env::GlobalEnv;
use crate::graph::{ProcId, ProcessGraph};
use crate::multiplex::Multiplexer;
use crate::supervisor::{self, HostServices, SupervisorEvent, SupervisorHandle};

/// A shutdown-triggering signal the host process received, as distinguished
/// by `main.rs`'s signal listener. Only a second `Sigint` within the
/// escalation window forces a kill (spec §5); `Sigterm` never escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
}

pub struct Orchestrator {
    graph: Arc<ProcessGraph>,
    handles: Vec<SupervisorHandle>,
    events_rx: mpsc::UnboundedReceiver<(ProcId, SupervisorEvent)>,
    mux: Arc<Multiplexer>,
    /// Window after an initial shutdown signal in which a second one
    /// escalates to an unconditional force-kill of every process group
    /// (spec §5; tunable via `RuntimeConfig::sigint_escalate_after`).
    sigint_escalate_after: Duration,

    indegree: Vec<usize>,
    /// Every process that has reached `Ready`/`Completed` at least once;
    /// a later `Ready`/`Completed` for the same id is a reload completion,
    /// not an initial startup release (spec §4.7).
    seen_ready: HashSet<ProcId>,
    stopped: HashSet<ProcId>,

    /// A single, engine-wide FIFO of pending cascade-reload steps. Cascades
    /// triggered by different processes are serialised through this one
    /// queue rather than run as independent concurrent chains — a
    /// deliberate simplification recorded in DESIGN.md.
    cascade_queue: VecDeque<ProcId>,
    cascade_in_flight: Option<ProcId>,

    shutting_down: bool,
    had_failure: bool,
    had_escalation: bool,
    verbose: bool,
}

impl Orchestrator {
    pub fn new(
        graph: ProcessGraph,
        global_env: GlobalEnv,
        host_factory: impl Fn() -> HostServices,
        mux: Arc<Multiplexer>,
        verbose: bool,
        sigint_escalate_after: Duration,
    ) -> Self {
        let graph = Arc::new(graph);
        let global_env = Arc::new(global_env);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(graph.len());
        for id in graph.ids() {
            let spec = graph.spec(id).clone();
            let handle = supervisor::spawn(
                id,
                spec,
                global_env.clone(),
                host_factory(),
                mux.clone(),
                events_tx.clone(),
            );
            handles.push(handle);
        }

        let indegree = graph.ids().map(|id| graph.predecessors(id).len()).collect();

        Self {
            graph,
            handles,
            events_rx,
            mux,
            sigint_escalate_after,
            indegree,
            seen_ready: HashSet::new(),
            stopped: HashSet::new(),
            cascade_queue: VecDeque::new(),
            cascade_in_flight: None,
            shutting_down: false,
            had_failure: false,
            had_escalation: false,
            verbose,
        }
    }

    /// Hands the Orchestrator a raw filesystem change: dispatched by
    /// `main.rs`'s watcher wiring to the directly-matched process's
    /// Supervisor. The cascade to dependents happens implicitly once that
    /// Supervisor reports readiness again (spec §4.4/§4.7).
    pub fn notify_change(&self, id: ProcId, path: std::path::PathBuf) {
        self.handles[id.index()].notify_change(path);
    }

    /// The underlying process graph, e.g. for `main.rs` to wire up
    /// [`crate::watch::spawn_watchers`] before handing control to [`Self::run`].
    pub fn graph(&self) -> &Arc<ProcessGraph> {
        &self.graph
    }

    /// A cloneable handle to process `id`'s Supervisor, independent of
    /// `self`'s lifetime — used to wire a watcher's forwarding task, since
    /// [`Self::run`] consumes the Orchestrator itself.
    pub fn handle_for(&self, id: ProcId) -> SupervisorHandle {
        self.handles[id.index()].clone()
    }

    /// Runs the engine to completion: starts every source process, reacts
    /// to Supervisor events until every process has stopped, and returns
    /// the process exit code (spec §6: "0 on clean shutdown, non-zero if
    /// any process escalated or failed during startup"). `signals` yields
    /// one [`ShutdownSignal`] per `SIGINT`/`SIGTERM` the host received; a
    /// second `SIGINT` within the escalation window forces an immediate
    /// kill of everything (spec §5). `SIGTERM` always just begins the
    /// graceful shutdown, however many times it arrives.
    pub async fn run(mut self, mut signals: mpsc::UnboundedReceiver<ShutdownSignal>) -> i32 {
        for id in self.graph.sources() {
            self.handles[id.index()].start();
        }

        let mut first_sigint_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                got = signals.recv() => {
                    let Some(signal) = got else { continue };
                    match signal {
                        ShutdownSignal::Sigint => {
                            let now = Instant::now();
                            let escalate = matches!(first_sigint_at, Some(at) if now.saturating_duration_since(at) <= self.sigint_escalate_after);
                            if escalate {
                                self.mux.log_engine("second SIGINT received, force-killing all processes").await;
                                self.force_kill_all();
                            } else {
                                first_sigint_at = Some(now);
                                self.mux.log_engine("received SIGINT, stopping processes").await;
                                self.begin_shutdown().await;
                            }
                        }
                        ShutdownSignal::Sigterm => {
                            self.mux.log_engine("received SIGTERM, stopping processes").await;
                            self.begin_shutdown().await;
                        }
                    }
                }

                maybe_event = self.events_rx.recv() => {
                    let Some((id, event)) = maybe_event else { break };
                    self.handle_event(id, event).await;
                    if self.shutting_down && self.stopped.len() == self.graph.len() {
                        break;
                    }
                }
            }
        }

        if self.had_failure || self.had_escalation {
            1
        } else {
            0
        }
    }

    async fn handle_event(&mut self, id: ProcId, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Ready => {
                if self.verbose {
                    let name = self.graph.spec(id).name.clone();
                    self.mux.log_engine(format!("{name}: ready")).await;
                }
                self.on_process_ready(id).await;
            }
            SupervisorEvent::Completed => {
                if self.verbose {
                    let name = self.graph.spec(id).name.clone();
                    self.mux.log_engine(format!("{name}: completed")).await;
                }
                self.on_process_ready(id).await;
            }
            SupervisorEvent::Crashed => {
                // Logged by the Supervisor itself; backoff/restart is
                // entirely internal to it, nothing further to do here.
            }
            SupervisorEvent::Escalated => {
                self.had_escalation = true;
            }
            SupervisorEvent::Failed => {
                self.had_failure = true;
                if !self.shutting_down {
                    let name = self.graph.spec(id).name.clone();
                    self.mux
                        .log_engine(format!("{name}: failed during startup, shutting down"))
                        .await;
                    self.begin_shutdown().await;
                }
            }
            SupervisorEvent::Stopped => {
                if self.verbose {
                    let name = self.graph.spec(id).name.clone();
                    self.mux.log_engine(format!("{name}: stopped")).await;
                }
                self.stopped.insert(id);
                self.advance_shutdown();
            }
        }
    }

    async fn on_process_ready(&mut self, id: ProcId) {
        if self.seen_ready.insert(id) {
            // First time ready: release any dependents whose indegree hits zero.
            for &succ in self.graph.successors(id) {
                self.indegree[succ.index()] -= 1;
                if self.indegree[succ.index()] == 0 {
                    self.handles[succ.index()].start();
                }
            }
        } else {
            // A reload completed: cascade to the transitive dependent set.
            let succs = self.graph.transitive_successors_in_topo_order(id);
            self.cascade_queue.extend(succs);
        }

        if self.cascade_in_flight == Some(id) {
            self.cascade_in_flight = None;
        }
        self.advance_cascade();
    }

    fn advance_cascade(&mut self) {
        if self.cascade_in_flight.is_some() {
            return; // already waiting on one step; its Ready will call us again
        }
        if let Some(next) = self.cascade_queue.pop_front() {
            self.cascade_in_flight = Some(next);
            self.handles[next.index()].cascade_reload();
        }
    }

    async fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.cascade_queue.clear();
        self.cascade_in_flight = None;
        self.advance_shutdown();
    }

    /// Issues `stop()` to every process in reverse-topological order whose
    /// dependents have already stopped (spec §4.7: "strict reverse
    /// topological, gated per node on its dependents having fully stopped").
    fn advance_shutdown(&mut self) {
        for id in self.graph.reverse_topological_order() {
            if self.stopped.contains(&id) {
                continue;
            }
            let dependents_stopped = self
                .graph
                .successors(id)
                .iter()
                .all(|s| self.stopped.contains(s));
            if dependents_stopped {
                self.handles[id.index()].stop();
            }
        }
    }

    fn force_kill_all(&mut self) {
        self.shutting_down = true;
        for handle in &self.handles {
            handle.force_kill();
        }
    }
}
