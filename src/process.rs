//! The immutable process specification produced by the parser (spec §3).

use std::time::Duration;

/// Whether the parser expects a process to exit or to keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Expected to run to completion; ready upon `exit 0`.
    OneShot,
    /// Expected to stay alive; ready per probe or immediately.
    LongRunning,
}

/// A parsed `ready=` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySpec {
    Tcp(u16),
    Http {
        port: u16,
        path: String,
        expected_status: Option<u16>,
    },
    Exec(String),
}

/// One process declaration, as produced by [`crate::parser::parse`].
///
/// Immutable after parsing; every Supervisor is handed a cloned, owned
/// copy for the lifetime of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub kind: Kind,
    pub command: String,
    pub inline_env: Vec<(String, String)>,
    pub watch_includes: Vec<String>,
    pub watch_excludes: Vec<String>,
    pub dependencies: Vec<String>,
    pub ready_spec: Option<ReadySpec>,
    pub signal: String,
    pub debounce: Duration,
    pub dir: String,
    pub shutdown_grace: Duration,
}

impl ProcessSpec {
    pub fn has_watches(&self) -> bool {
        !self.watch_includes.is_empty()
    }
}

pub const DEFAULT_SIGNAL: &str = "TERM";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
