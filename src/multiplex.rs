//! The log multiplexer (component C8): tees every child's stdout/stderr,
//! plus the engine's own diagnostics, to one serialised terminal sink with
//! a right-padded, coloured `<name> | ` prefix per spec §4.8.
//!
//! Colour assignment is a hash of the process name modulo a curated
//! 256-colour palette, computed once; the padding width is likewise fixed
//! once all process names are known, right after the Procfile is parsed.

use std::sync::Arc;

use crate::host::{OutputStream, Terminal};

/// 256-colour codes that read neither near-black nor near-white: the
/// 6x6x6 colour cube minus its absolute corners, which keeps prefixes
/// legible on both light and dark terminal backgrounds.
const PALETTE_LO: u8 = 17;
const PALETTE_HI: u8 = 230;

/// The colour reserved for the engine's own `proctor` prefix, kept out of
/// the hashed palette so it never collides with a process's colour.
const ENGINE_COLOUR: u8 = 244;
const ENGINE_PREFIX: &str = "proctor";

/// Longest single physical line C8 will ever emit for one read; longer
/// reads are split across multiple prefixed lines (spec §4.8).
const LINE_CAP: usize = 8 * 1024;

/// Stable, non-cryptographic hash (FNV-1a) used for palette assignment.
/// Deterministic across runs and platforms, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn colour_for(name: &str) -> u8 {
    let span = (PALETTE_HI - PALETTE_LO) as u64 + 1;
    PALETTE_LO + (fnv1a(name.as_bytes()) % span) as u8
}

fn fg(code: u8) -> String {
    format!("\x1b[38;5;{code}m")
}

/// A dimmed variant of `code`'s colour, used for stderr lines.
fn fg_dim(code: u8) -> String {
    format!("\x1b[38;5;{code};2m")
}

const RESET: &str = "\x1b[0m";

/// Serialises and formats every line the engine writes to the terminal.
pub struct Multiplexer {
    terminal: Arc<dyn Terminal>,
    pad_width: usize,
    timestamps: bool,
    start: std::time::Instant,
}

impl Multiplexer {
    /// `names` is every process name known after parsing; the padding
    /// width is fixed at construction and never recomputed (spec §4.8:
    /// "`pad_width = max(len(name) for name in processes)`" — scoped to
    /// process names only, not the engine's own reserved prefix, which
    /// `pad()` renders unpadded whenever it's the longer of the two).
    /// `timestamps` enables the `--timestamps` CLI flag's `MM:SS`
    /// elapsed-time prefix.
    pub fn new(
        terminal: Arc<dyn Terminal>,
        names: impl IntoIterator<Item = impl AsRef<str>>,
        timestamps: bool,
    ) -> Self {
        let pad_width = names
            .into_iter()
            .map(|n| n.as_ref().chars().count())
            .max()
            .unwrap_or(0);
        Self {
            terminal,
            pad_width,
            timestamps,
            start: std::time::Instant::now(),
        }
    }

    fn elapsed_prefix(&self) -> String {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs();
        format!("{:02}:{:02} ", secs / 60, secs % 60)
    }

    /// Writes one already-complete line of a child's output, splitting it
    /// into `LINE_CAP`-sized chunks if it is unusually long so no single
    /// write balloons the terminal buffer.
    pub async fn log_line(&self, name: &str, stream: OutputStream, line: &str) {
        let colour = colour_for(name);
        let prefix_colour = match stream {
            OutputStream::Stdout => fg(colour),
            OutputStream::Stderr => fg_dim(colour),
        };
        for chunk in split_at_cap(line, LINE_CAP) {
            self.write_prefixed(name, &prefix_colour, chunk).await;
        }
    }

    /// Writes an engine-authored diagnostic line (spec §7: "every abnormal
    /// transition is logged via C8 using a synthetic `proctor` prefix").
    pub async fn log_engine(&self, line: impl std::fmt::Display) {
        let text = line.to_string();
        for chunk in split_at_cap(&text, LINE_CAP) {
            self.write_prefixed(ENGINE_PREFIX, &fg(ENGINE_COLOUR), chunk)
                .await;
        }
    }

    async fn write_prefixed(&self, name: &str, colour_code: &str, body: &str) {
        let mut out = String::with_capacity(colour_code.len() + self.pad_width + body.len() + 8);
        if self.timestamps {
            out.push_str(&self.elapsed_prefix());
        }
        out.push_str(colour_code);
        out.push_str(&pad(name, self.pad_width));
        out.push_str(" |");
        out.push_str(RESET);
        out.push(' ');
        out.push_str(body);
        self.terminal.write_line(out.into_bytes()).await;
    }
}

fn pad(name: &str, width: usize) -> String {
    let len = name.chars().count();
    if len >= width {
        name.to_string()
    } else {
        let mut s = String::with_capacity(width);
        s.push_str(name);
        s.extend(std::iter::repeat(' ').take(width - len));
        s
    }
}

/// Splits `text` into chunks of at most `cap` bytes, always on a char
/// boundary. A line shorter than `cap` yields exactly one chunk, even an
/// empty string.
fn split_at_cap(text: &str, cap: usize) -> Vec<&str> {
    if text.len() <= cap {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > cap {
        let mut split_at = cap;
        while !rest.is_char_boundary(split_at) {
            split_at -= 1;
        }
        let (chunk, tail) = rest.split_at(split_at);
        chunks.push(chunk);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTerminal {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Terminal for RecordingTerminal {
        async fn write_line(&self, bytes: Vec<u8>) {
            self.lines
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    fn strip_colour(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
                continue;
            }
            out.push(c);
        }
        out
    }

    #[test]
    fn colour_assignment_is_stable() {
        assert_eq!(colour_for("api"), colour_for("api"));
    }

    #[test]
    fn palette_stays_within_curated_range() {
        for name in ["api", "web", "db", "worker", "lib", "cache"] {
            let c = colour_for(name);
            assert!((PALETTE_LO..=PALETTE_HI).contains(&c));
        }
    }

    #[test]
    fn pad_width_covers_longest_process_name_only() {
        let mux = Multiplexer::new(
            Arc::new(RecordingTerminal { lines: Mutex::new(Vec::new()) }),
            ["a", "longname"],
            false,
        );
        assert_eq!(mux.pad_width, "longname".len());
    }

    #[tokio::test]
    async fn short_process_names_are_not_padded_to_engine_prefix_width() {
        let terminal = Arc::new(RecordingTerminal { lines: Mutex::new(Vec::new()) });
        let mux = Multiplexer::new(terminal.clone(), ["a"], false);
        mux.log_line("a", OutputStream::Stdout, "hi").await;
        let lines = terminal.lines.lock().unwrap();
        assert_eq!(strip_colour(&lines[0]), "a | hi");
    }

    #[tokio::test]
    async fn prefix_and_body_are_rendered() {
        let terminal = Arc::new(RecordingTerminal { lines: Mutex::new(Vec::new()) });
        let mux = Multiplexer::new(terminal.clone(), ["api", "web"], false);
        mux.log_line("api", OutputStream::Stdout, "listening on :3000").await;
        let lines = terminal.lines.lock().unwrap();
        assert_eq!(strip_colour(&lines[0]), "api | listening on :3000");
    }

    #[tokio::test]
    async fn long_lines_are_split_at_the_cap() {
        let terminal = Arc::new(RecordingTerminal { lines: Mutex::new(Vec::new()) });
        let mux = Multiplexer::new(terminal.clone(), ["api"], false);
        let huge = "x".repeat(LINE_CAP * 2 + 5);
        mux.log_line("api", OutputStream::Stdout, &huge).await;
        let lines = terminal.lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn engine_diagnostics_use_reserved_prefix() {
        let terminal = Arc::new(RecordingTerminal { lines: Mutex::new(Vec::new()) });
        let mux = Multiplexer::new(terminal.clone(), ["api"], false);
        mux.log_engine("shutting down").await;
        let lines = terminal.lines.lock().unwrap();
        assert_eq!(strip_colour(&lines[0]), "proctor | shutting down");
    }
}
