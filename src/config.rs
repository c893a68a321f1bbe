//! Runtime configuration handed to the engine by `main.rs` (spec §1: "a
//! runtime configuration struct"). Built entirely from `clap` flags and the
//! `PROCTOR_FLAGS` env var (spec §6) — no `serde`/TOML, since the Procfile
//! itself is the engine's one configuration surface and it is not a
//! serialized format but a bespoke grammar handled by `parser.rs`.

use std::time::Duration;

/// The window after an initial shutdown signal in which a second one
/// escalates to an unconditional force-kill (spec §5).
pub const DEFAULT_SIGINT_ESCALATE_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Prefix every multiplexed line with a timestamp.
    pub timestamps: bool,
    /// Print the parsed process graph without spawning anything.
    pub dry_run: bool,
    /// Parse and validate the Procfile, print the topological order, exit.
    pub check: bool,
    pub verbose: bool,
    pub sigint_escalate_after: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timestamps: false,
            dry_run: false,
            check: false,
            verbose: false,
            sigint_escalate_after: DEFAULT_SIGINT_ESCALATE_AFTER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_escalation_window() {
        assert_eq!(
            RuntimeConfig::default().sigint_escalate_after,
            Duration::from_secs(2)
        );
    }
}
