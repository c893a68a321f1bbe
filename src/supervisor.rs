//! The per-process Supervisor (component C6): start, ready, reload, crash,
//! shutdown. One Supervisor actor runs for the lifetime of the engine per
//! [`ProcId`] (spec §3 "Runtime process state", §4.6, §9 "Supervisor as
//! actor"). It owns a mailbox (the [`Message`] enum: orchestrator-issued
//! commands *and* the events its own background tasks — the child actor,
//! readiness probe, debounce timer, backoff timer — report back through
//! the same channel) and drives the state table in spec §4.6.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::env::{merge_env, GlobalEnv};
use crate::graph::ProcId;
use crate::host::{ChildHandle, Clock, Net, Signal, Spawner};
use crate::multiplex::Multiplexer;
use crate::process::{Kind, ProcessSpec};
use crate::ready::{self, ProbeOutcome};

/// Runtime phase, exactly spec §3/§4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Starting,
    Ready,
    Running,
    Reloading,
    Completed,
    Crashed,
    Stopping,
    Stopped,
    Failed,
}

/// Notifications a Supervisor sends to the [`crate::orchestrator::Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Ready,
    Completed,
    Crashed,
    /// A kill protocol had to escalate to `SIGKILL` (spec §7 `ShutdownEscalation`).
    Escalated,
    Stopped,
    /// `SpawnError` on a one-shot, or non-zero exit of a one-shot (`OneShotFailure`).
    Failed,
}

enum Message {
    Start,
    Stop,
    /// Immediate termination, bypassing signal/grace (double-`SIGINT` escalation, spec §5).
    ForceKill,
    /// A raw file-change path from the watcher; debounced internally.
    RawChange(PathBuf),
    DebounceFired {
        generation: u64,
    },
    /// Orchestrator-driven cascade reload: applied immediately, no debounce
    /// (spec §4.7: "the cascade to dependents is implicit").
    CascadeReload,
    ChildExited {
        epoch: u64,
        status: anyhow::Result<std::process::ExitStatus>,
    },
    ProbeDone {
        epoch: u64,
        outcome: ProbeOutcome,
    },
    BackoffElapsed {
        token: u64,
    },
}

/// Commands sent to the dedicated child-actor task that exclusively owns
/// one incarnation's [`ChildHandle`] for its whole lifetime.
enum ChildCommand {
    Kill,
    /// Deliver `signal`, wait up to `grace` for a natural exit, else
    /// escalate to `SIGKILL`. Replies whether it had to escalate.
    GracefulStop {
        signal: Signal,
        grace: Duration,
        reply: oneshot::Sender<bool>,
    },
}

/// A cheap, cloneable handle the Orchestrator holds to address one Supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    pub id: ProcId,
    tx: mpsc::UnboundedSender<Message>,
}

impl SupervisorHandle {
    pub fn start(&self) {
        let _ = self.tx.send(Message::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    pub fn force_kill(&self) {
        let _ = self.tx.send(Message::ForceKill);
    }

    pub fn notify_change(&self, path: PathBuf) {
        let _ = self.tx.send(Message::RawChange(path));
    }

    pub fn cascade_reload(&self) {
        let _ = self.tx.send(Message::CascadeReload);
    }
}

pub struct HostServices {
    pub spawner: Arc<dyn Spawner>,
    pub clock: Arc<dyn Clock>,
    pub net: Arc<dyn Net>,
}

/// Spawns the Supervisor actor for `spec` and returns the handle the
/// Orchestrator uses to drive it. `events_tx` carries every
/// [`SupervisorEvent`] this Supervisor reports, tagged with its [`ProcId`].
pub fn spawn(
    id: ProcId,
    spec: ProcessSpec,
    global_env: Arc<GlobalEnv>,
    host: HostServices,
    mux: Arc<Multiplexer>,
    events_tx: mpsc::UnboundedSender<(ProcId, SupervisorEvent)>,
) -> SupervisorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SupervisorHandle { id, tx: tx.clone() };
    let supervisor = Supervisor {
        id,
        spec,
        global_env,
        host,
        mux,
        events_tx,
        self_tx: tx,
        rx,
        phase: Phase::Pending,
        child: None,
        epoch: 0,
        backoff_level: 0,
        backoff_token: 0,
        last_ready_instant: None,
        pending_change: Vec::new(),
        debounce_generation: 0,
        stopping: false,
        probe_cancel: None,
    };
    tokio::spawn(supervisor.run());
    handle
}

struct Supervisor {
    id: ProcId,
    spec: ProcessSpec,
    global_env: Arc<GlobalEnv>,
    host: HostServices,
    mux: Arc<Multiplexer>,
    events_tx: mpsc::UnboundedSender<(ProcId, SupervisorEvent)>,
    self_tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,

    phase: Phase,
    /// Command channel into the current incarnation's child-actor task;
    /// `None` once that incarnation has exited.
    child: Option<mpsc::UnboundedSender<ChildCommand>>,
    epoch: u64,
    backoff_level: u32,
    /// Bumped whenever a pending backoff wait is superseded (stop/reload
    /// while `Crashed`), so a late `BackoffElapsed` is ignored.
    backoff_token: u64,
    last_ready_instant: Option<Instant>,
    pending_change: Vec<PathBuf>,
    debounce_generation: u64,
    stopping: bool,
    /// Fires the in-flight readiness probe's cancellation, if any (spec
    /// §5: "a `stop()` or a superseding reload cancels outstanding probes").
    probe_cancel: Option<oneshot::Sender<()>>,
}

impl Supervisor {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
            if self.phase == Phase::Stopped {
                break;
            }
        }
    }

    async fn handle(&mut self, msg: Message) {
        match msg {
            Message::Start => self.on_start().await,
            Message::Stop => self.on_stop().await,
            Message::ForceKill => self.on_force_kill().await,
            Message::RawChange(path) => self.on_raw_change(path).await,
            Message::DebounceFired { generation } => self.on_debounce_fired(generation).await,
            Message::CascadeReload => self.on_cascade_reload().await,
            Message::ChildExited { epoch, status } => self.on_child_exited(epoch, status).await,
            Message::ProbeDone { epoch, outcome } => self.on_probe_done(epoch, outcome).await,
            Message::BackoffElapsed { token } => self.on_backoff_elapsed(token).await,
        }
    }

    async fn on_start(&mut self) {
        if self.phase != Phase::Pending {
            return;
        }
        self.start_incarnation().await;
    }

    /// Spawns a new child incarnation, bumping the epoch. Shared by the
    /// initial start, crash-backoff restarts, and reload respawns.
    async fn start_incarnation(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.phase = Phase::Starting;

        let env = merge_env(std::env::vars(), &self.global_env, &self.spec.inline_env);
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();

        match self
            .host
            .spawner
            .spawn(&self.spec.command, &self.spec.dir, &env, line_tx)
            .await
        {
            Ok(child) => {
                let mux = self.mux.clone();
                let name = self.spec.name.clone();
                tokio::spawn(async move {
                    while let Some((stream, line)) = line_rx.recv().await {
                        mux.log_line(&name, stream, &line).await;
                    }
                });

                self.child = Some(spawn_child_actor(
                    child,
                    epoch,
                    self.host.clock.clone(),
                    self.self_tx.clone(),
                ));

                match (self.spec.kind, &self.spec.ready_spec) {
                    (Kind::OneShot, _) => {
                        // Readiness for a one-shot is its own exit(0); handled in on_child_exited.
                    }
                    (Kind::LongRunning, None) => {
                        self.become_ready().await;
                    }
                    (Kind::LongRunning, Some(ready_spec)) => {
                        self.spawn_probe(epoch, ready_spec.clone(), env);
                    }
                }
            }
            Err(err) => {
                self.mux
                    .log_engine(format!("{}: failed to spawn: {err:#}", self.spec.name))
                    .await;
                match self.spec.kind {
                    Kind::OneShot => {
                        self.phase = Phase::Failed;
                        self.report(SupervisorEvent::Failed).await;
                    }
                    Kind::LongRunning => {
                        self.enter_crashed().await;
                    }
                }
            }
        }
    }

    async fn become_ready(&mut self) {
        self.phase = Phase::Ready;
        self.last_ready_instant = Some(self.host.clock.now());
        self.report(SupervisorEvent::Ready).await;
    }

    async fn on_stop(&mut self) {
        if matches!(self.phase, Phase::Stopped | Phase::Stopping) {
            return;
        }
        self.stopping = true;
        self.backoff_token += 1; // cancel any pending backoff wait
        self.phase = Phase::Stopping;
        let escalated = self.kill_current_child().await;
        if escalated {
            self.mux
                .log_engine(format!(
                    "{}: did not exit within {:?}, sent SIGKILL",
                    self.spec.name, self.spec.shutdown_grace
                ))
                .await;
            self.report(SupervisorEvent::Escalated).await;
        }
        self.phase = Phase::Stopped;
        self.report(SupervisorEvent::Stopped).await;
    }

    async fn on_force_kill(&mut self) {
        if matches!(self.phase, Phase::Stopped) {
            return;
        }
        self.stopping = true;
        self.backoff_token += 1;
        if let Some(cancel) = self.probe_cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(cmd_tx) = self.child.take() {
            let _ = cmd_tx.send(ChildCommand::Kill);
        }
        self.phase = Phase::Stopped;
        self.report(SupervisorEvent::Stopped).await;
    }

    /// Delivers `signal`, waits up to `shutdown_grace`, escalates to
    /// `SIGKILL` if the child is still alive. Returns whether it escalated.
    /// No-ops (and returns `false`) if there's no live child to kill —
    /// covering the one-shot-already-exited case (spec §4.6).
    async fn kill_current_child(&mut self) -> bool {
        if let Some(cancel) = self.probe_cancel.take() {
            let _ = cancel.send(());
        }
        let Some(cmd_tx) = self.child.take() else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let sig = Signal::parse(&self.spec.signal).unwrap_or(Signal::Term);
        let sent = cmd_tx.send(ChildCommand::GracefulStop {
            signal: sig,
            grace: self.spec.shutdown_grace,
            reply: reply_tx,
        });
        if sent.is_err() {
            return false; // child actor already wound down on its own
        }
        reply_rx.await.unwrap_or(false)
    }

    async fn on_raw_change(&mut self, path: PathBuf) {
        if !matches!(self.phase, Phase::Ready | Phase::Running) {
            return; // not ready to be reloaded yet; change is dropped (spec is silent on this edge case)
        }
        self.pending_change.push(path);
        self.debounce_generation += 1;
        let generation = self.debounce_generation;
        let tx = self.self_tx.clone();
        let clock = self.host.clock.clone();
        let debounce = self.spec.debounce;
        tokio::spawn(async move {
            clock.sleep(debounce).await;
            let _ = tx.send(Message::DebounceFired { generation });
        });
    }

    async fn on_debounce_fired(&mut self, generation: u64) {
        if generation != self.debounce_generation {
            return; // a later change reset the timer; this firing is stale
        }
        if !matches!(self.phase, Phase::Ready | Phase::Running) {
            return;
        }
        self.pending_change.clear();
        self.begin_reload().await;
    }

    async fn on_cascade_reload(&mut self) {
        if !matches!(self.phase, Phase::Ready | Phase::Running | Phase::Completed) {
            return;
        }
        self.begin_reload().await;
    }

    async fn begin_reload(&mut self) {
        self.phase = Phase::Reloading;
        let escalated = self.kill_current_child().await;
        if escalated {
            self.report(SupervisorEvent::Escalated).await;
        }
        self.start_incarnation().await;
    }

    async fn on_child_exited(&mut self, epoch: u64, status: anyhow::Result<std::process::ExitStatus>) {
        if epoch != self.epoch {
            return; // stale incarnation (spec §4.6 "epoch guard")
        }
        self.child = None;
        if self.stopping || matches!(self.phase, Phase::Stopping | Phase::Stopped) {
            return;
        }
        match self.spec.kind {
            Kind::OneShot => match status {
                Ok(status) if status.success() => {
                    self.phase = Phase::Completed;
                    self.last_ready_instant = Some(self.host.clock.now());
                    self.report(SupervisorEvent::Completed).await;
                }
                _ => {
                    self.phase = Phase::Failed;
                    self.report(SupervisorEvent::Failed).await;
                }
            },
            Kind::LongRunning => {
                // An exit during `Reloading` is the deliberate kill, already
                // accounted for by `begin_reload`; only an exit observed
                // while `Ready`/`Running` is an unexpected crash.
                if matches!(self.phase, Phase::Ready | Phase::Running) {
                    self.enter_crashed().await;
                }
            }
        }
    }

    async fn enter_crashed(&mut self) {
        self.phase = Phase::Crashed;
        self.mux
            .log_engine(format!("{}: crashed, backing off", self.spec.name))
            .await;
        self.report(SupervisorEvent::Crashed).await;
        self.schedule_backoff().await;
    }

    async fn schedule_backoff(&mut self) {
        let now = self.host.clock.now();
        if let Some(ready_at) = self.last_ready_instant.take() {
            let threshold = backoff_delay(self.backoff_level.saturating_sub(1));
            if now.saturating_duration_since(ready_at) >= threshold {
                self.backoff_level = self.backoff_level.saturating_sub(1);
            }
        }
        let delay = backoff_delay(self.backoff_level);
        self.backoff_level = self.backoff_level.saturating_add(1);

        self.backoff_token += 1;
        let token = self.backoff_token;
        let tx = self.self_tx.clone();
        let clock = self.host.clock.clone();
        tokio::spawn(async move {
            clock.sleep(delay).await;
            let _ = tx.send(Message::BackoffElapsed { token });
        });
    }

    async fn on_backoff_elapsed(&mut self, token: u64) {
        if token != self.backoff_token || self.phase != Phase::Crashed {
            return;
        }
        self.start_incarnation().await;
    }

    async fn on_probe_done(&mut self, epoch: u64, outcome: ProbeOutcome) {
        if epoch != self.epoch || self.phase != Phase::Starting {
            return;
        }
        match outcome {
            ProbeOutcome::Ready => self.become_ready().await,
            ProbeOutcome::TimedOut => {
                self.mux
                    .log_engine(format!(
                        "{}: readiness probe timed out after {:?}",
                        self.spec.name,
                        ready::PROBE_TIMEOUT
                    ))
                    .await;
                // spec §4.5: dependents remain blocked; the process itself
                // is left running (it may still be starting up).
                self.phase = Phase::Running;
            }
            ProbeOutcome::Cancelled => {}
        }
    }

    fn spawn_probe(&mut self, epoch: u64, ready_spec: crate::process::ReadySpec, env: Vec<(String, String)>) {
        let tx = self.self_tx.clone();
        let net = self.host.net.clone();
        let clock = self.host.clock.clone();
        let spawner = self.host.spawner.clone();
        let dir = self.spec.dir.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.probe_cancel = Some(cancel_tx);
        tokio::spawn(async move {
            let outcome = ready::probe(
                &ready_spec,
                net.as_ref(),
                clock.as_ref(),
                spawner.as_ref(),
                &dir,
                &env,
                cancel_rx,
            )
            .await;
            let _ = tx.send(Message::ProbeDone { epoch, outcome });
        });
    }

    async fn report(&self, event: SupervisorEvent) {
        let _ = self.events_tx.send((self.id, event));
    }
}

fn backoff_delay(n: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(n).min(32))
}

/// Spawns the task that exclusively owns one incarnation's [`ChildHandle`]
/// for its whole lifetime: races its exit against incoming
/// [`ChildCommand`]s, and reports every exit — natural, killed, or
/// escalated — back to the Supervisor as `Message::ChildExited`. Keeping
/// the handle behind a single owning task means signalling and waiting
/// never race each other.
fn spawn_child_actor(
    mut child: Box<dyn ChildHandle>,
    epoch: u64,
    clock: Arc<dyn Clock>,
    supervisor_tx: mpsc::UnboundedSender<Message>,
) -> mpsc::UnboundedSender<ChildCommand> {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ChildCommand>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let _ = supervisor_tx.send(Message::ChildExited { epoch, status });
                    return;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => continue,
                        Some(ChildCommand::Kill) => {
                            let _ = child.kill().await;
                        }
                        Some(ChildCommand::GracefulStop { signal, grace, reply }) => {
                            let _ = child.signal(signal);
                            tokio::select! {
                                status = child.wait() => {
                                    let _ = supervisor_tx.send(Message::ChildExited { epoch, status });
                                    let _ = reply.send(false);
                                }
                                _ = clock.sleep(grace) => {
                                    let _ = child.kill().await;
                                    let status = child.wait().await;
                                    let _ = supervisor_tx.send(Message::ChildExited { epoch, status });
                                    let _ = reply.send(true);
                                }
                            }
                            return;
                        }
                    }
                }
            }
        }
    });
    cmd_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_follows_power_of_two_capped_at_32() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
    }
}
