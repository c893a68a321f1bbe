//! Host services consumed by the core engine (spec §6): spawning,
//! file-change events, the clock, network probing, and the terminal.
//! Each is a small `async_trait` port with one production implementation
//! wired up by `main.rs`; the engine itself only ever holds `Arc<dyn Trait>`,
//! so an alternate implementation (e.g. for tests) is a drop-in.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

/// A POSIX signal the engine may need to deliver to a child's process
/// group. The Non-goals in spec §1 restrict the engine to POSIX-like
/// hosts, so there is no Windows fallback here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Term,
    Usr1,
    Usr2,
    Kill,
}

impl Signal {
    /// Parses a signal name as it appears in a `signal=` option, e.g. `TERM`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "HUP" => Some(Signal::Hup),
            "INT" => Some(Signal::Int),
            "QUIT" => Some(Signal::Quit),
            "TERM" => Some(Signal::Term),
            "USR1" => Some(Signal::Usr1),
            "USR2" => Some(Signal::Usr2),
            "KILL" => Some(Signal::Kill),
            _ => None,
        }
    }

    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Term => libc::SIGTERM,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A handle to a running child's process group.
#[async_trait]
pub trait ChildHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// Delivers `sig` to the whole process group (spec §4.6: "always
    /// signal the process group (negative PID)").
    fn signal(&self, sig: Signal) -> Result<()>;
    async fn try_wait(&mut self) -> Result<Option<ExitStatus>>;
    async fn wait(&mut self) -> Result<ExitStatus>;
    async fn kill(&mut self) -> Result<()>;
}

/// Spawns commands through `$SHELL -c` (or `/bin/sh -c`), each in its own
/// process group, and streams their stdout/stderr as lines.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        command: &str,
        dir: &str,
        env: &[(String, String)],
        on_line: UnboundedSender<(OutputStream, String)>,
    ) -> Result<Box<dyn ChildHandle>>;

    /// Runs `command` to completion without streaming output, used by
    /// the `Exec` readiness check (spec §4.5).
    async fn run_to_completion(
        &self,
        command: &str,
        dir: &str,
        env: &[(String, String)],
    ) -> Result<ExitStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A wall clock, abstracted so probes/timers/backoff delays are
/// observable and cancellable rather than hard-coded onto `tokio::time`.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> tokio::time::Instant;
    async fn sleep(&self, duration: Duration);
}

/// TCP/HTTP probing for readiness checks (spec §4.5).
#[async_trait]
pub trait Net: Send + Sync {
    async fn tcp_connect(&self, host: &str, port: u16) -> Result<()>;
    /// Returns the HTTP status code, or an error for connection-level failures.
    async fn http_get(&self, url: &str) -> Result<u16>;
}

#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    pub path: PathBuf,
}

/// Recursive filesystem watching, dispatched from one OS-level watcher
/// per subscribed root (spec §4.4/§5: "single instance, dispatches to
/// many supervisors").
pub trait FileEvents: Send + Sync {
    fn subscribe(&self, root: &Path, tx: UnboundedSender<FileChangeEvent>) -> Result<()>;
}

/// The single serialised sink for everything the log multiplexer writes.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn write_line(&self, bytes: Vec<u8>);
}

// ---------------------------------------------------------------------
// Production implementations
// ---------------------------------------------------------------------

fn shell() -> (String, &'static str) {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    (shell, "-c")
}

fn build_command(command: &str, dir: &str, env: &[(String, String)]) -> Command {
    let (shell, flag) = shell();
    let mut cmd = Command::new(shell);
    cmd.arg(flag).arg(command);
    cmd.current_dir(dir);
    cmd.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    cmd.kill_on_drop(true);
    // SAFETY: the closure only calls async-signal-safe libc functions
    // before exec, per the tokio::process::CommandExt::pre_exec contract.
    unsafe {
        cmd.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd
}

pub struct TokioChildHandle {
    child: tokio::process::Child,
    pid: Option<u32>,
}

#[async_trait]
impl ChildHandle for TokioChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // Negative PID targets the whole process group (spec §4.6).
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig.as_raw()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid {
            let _ = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        }
        let _ = self.child.kill().await;
        Ok(())
    }
}

pub struct TokioSpawner;

#[async_trait]
impl Spawner for TokioSpawner {
    async fn spawn(
        &self,
        command: &str,
        dir: &str,
        env: &[(String, String)],
        on_line: UnboundedSender<(OutputStream, String)>,
    ) -> Result<Box<dyn ChildHandle>> {
        let mut cmd = build_command(command, dir, env);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{command}`"))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let tx = on_line.clone();
            tokio::spawn(pump_lines(stdout, OutputStream::Stdout, tx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, OutputStream::Stderr, on_line));
        }

        Ok(Box::new(TokioChildHandle { child, pid }))
    }

    async fn run_to_completion(
        &self,
        command: &str,
        dir: &str,
        env: &[(String, String)],
    ) -> Result<ExitStatus> {
        let mut cmd = build_command(command, dir, env);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        let status = cmd
            .status()
            .await
            .with_context(|| format!("failed to run `{command}`"))?;
        Ok(status)
    }
}

async fn pump_lines<R>(reader: R, stream: OutputStream, tx: UnboundedSender<(OutputStream, String)>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).is_err() {
            break;
        }
    }
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct ReqwestNet {
    client: reqwest::Client,
}

impl ReqwestNet {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds with default TLS config"),
        }
    }
}

impl Default for ReqwestNet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Net for ReqwestNet {
    async fn tcp_connect(&self, host: &str, port: u16) -> Result<()> {
        tokio::net::TcpStream::connect((host, port)).await?;
        Ok(())
    }

    async fn http_get(&self, url: &str) -> Result<u16> {
        let resp = self.client.get(url).send().await?;
        Ok(resp.status().as_u16())
    }
}

pub struct NotifyFileEvents;

impl FileEvents for NotifyFileEvents {
    fn subscribe(&self, root: &Path, tx: UnboundedSender<FileChangeEvent>) -> Result<()> {
        use notify::{RecommendedWatcher, RecursiveMode, Watcher};

        let root = root.to_path_buf();
        std::thread::spawn(move || {
            let (raw_tx, raw_rx) = std::sync::mpsc::channel();
            let mut watcher = match RecommendedWatcher::new(
                move |res| {
                    let _ = raw_tx.send(res);
                },
                notify::Config::default(),
            ) {
                Ok(w) => w,
                Err(_) => return,
            };
            if watcher.watch(&root, RecursiveMode::Recursive).is_err() {
                return;
            }
            while let Ok(Ok(event)) = raw_rx.recv() {
                for path in event.paths {
                    if tx.send(FileChangeEvent { path }).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(())
    }
}

pub struct StdoutTerminal {
    out: Mutex<std::io::Stdout>,
}

impl StdoutTerminal {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(std::io::stdout()),
        }
    }
}

impl Default for StdoutTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Terminal for StdoutTerminal {
    async fn write_line(&self, bytes: Vec<u8>) {
        use std::io::Write;
        let mut out = self.out.lock().expect("stdout mutex poisoned");
        let _ = out.write_all(&bytes);
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    }
}
