//! The Procfile parser (component C2): turns source text into a validated
//! [`ProcessGraph`] plus a [`GlobalEnv`] (spec §4.2, §6 EBNF).
//!
//! Parsing never aborts at the first problem — every invariant violation
//! found is collected into a [`ParseErrors`] and returned together, so an
//! operator sees the whole list of mistakes in one pass.

use std::time::Duration;

use crate::env::GlobalEnv;
use crate::error::{ParseError, ParseErrors, SyntaxError};
use crate::graph::ProcessGraph;
use crate::host::Signal;
use crate::process::{
    Kind, ProcessSpec, ReadySpec, DEFAULT_DEBOUNCE, DEFAULT_SHUTDOWN_GRACE, DEFAULT_SIGNAL,
};
use crate::ready;
use crate::token::{tokenize, Spanned, Token};

const OPTION_KEYS: &[&str] = &["after", "ready", "signal", "debounce", "dir", "shutdown"];

struct LogicalLine {
    line_no: usize,
    /// The declaration (and, for single-line commands, the full text
    /// including the command) as it reads after continuation-joining.
    text: String,
    /// Present when the declaration used block-command form (`name:` at
    /// end of line, body on following indented lines).
    block: Option<String>,
}

/// Parses an entire Procfile, returning the validated graph and global
/// env, or every [`ParseError`] found.
pub fn parse(source: &str) -> Result<(ProcessGraph, GlobalEnv), ParseErrors> {
    let (lines, syntax_errors) = read_logical_lines(source);

    let mut errors: Vec<ParseError> = syntax_errors.into_iter().map(ParseError::from).collect();
    let mut global_env = GlobalEnv::default();
    let mut specs: Vec<ProcessSpec> = Vec::new();

    for line in &lines {
        match parse_logical_line(line) {
            Ok(ParsedLine::GlobalEnv(key, value)) => global_env.0.push((key, value)),
            Ok(ParsedLine::Process(spec)) => specs.push(spec),
            Err(errs) => errors.extend(errs),
        }
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.name.clone()) {
            errors.push(ParseError::DuplicateName {
                name: spec.name.clone(),
            });
        }
    }

    let names: std::collections::HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    for spec in &specs {
        for dep in &spec.dependencies {
            if !names.contains(dep.as_str()) {
                errors.push(ParseError::UnknownDependency {
                    name: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(ParseErrors(errors));
    }

    match ProcessGraph::build(specs) {
        Ok(graph) => Ok((graph, global_env)),
        Err(err) => Err(ParseErrors(vec![err])),
    }
}

enum ParsedLine {
    GlobalEnv(String, String),
    Process(ProcessSpec),
}

fn parse_logical_line(line: &LogicalLine) -> Result<ParsedLine, Vec<ParseError>> {
    let tokens = tokenize(&line.text, line.line_no)
        .map_err(|e| vec![ParseError::from(e)])?;

    let has_colon = tokens.iter().any(|t| t.token == Token::Colon);

    if !has_colon && line.block.is_none() {
        if let [Spanned { token: Token::Word(word), .. }] = tokens.as_slice() {
            if let Some((key, value)) = split_global_env(word) {
                return Ok(ParsedLine::GlobalEnv(key, value));
            }
        }
        return Err(vec![ParseError::Syntax {
            line: line.line_no,
            col: 1,
            reason: "expected a global KEY=VALUE binding or a process definition (missing ':')"
                .to_string(),
        }]);
    }

    parse_process_definition(line, &tokens).map(ParsedLine::Process)
}

fn split_global_env(word: &str) -> Option<(String, String)> {
    let (key, value) = word.split_once('=')?;
    if is_identifier(key) {
        Some((key.to_string(), value.to_string()))
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_uppercase_first_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_process_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_process_definition(
    line: &LogicalLine,
    tokens: &[Spanned],
) -> Result<ProcessSpec, Vec<ParseError>> {
    let colon_idx = tokens
        .iter()
        .position(|t| t.token == Token::Colon)
        .expect("process definitions always contain a colon");
    let decl_tokens = &tokens[..colon_idx];

    let mut errors = Vec::new();

    let Some(Spanned { token: Token::Word(raw_name), .. }) = decl_tokens.first() else {
        errors.push(ParseError::Syntax {
            line: line.line_no,
            col: 1,
            reason: "process definition is missing a name".to_string(),
        });
        return Err(errors);
    };

    let (name, kind) = match raw_name.strip_suffix('!') {
        Some(stripped) => (stripped.to_string(), Kind::OneShot),
        None => (raw_name.clone(), Kind::LongRunning),
    };

    if !is_process_name(&name) {
        errors.push(ParseError::Syntax {
            line: line.line_no,
            col: decl_tokens[0].col,
            reason: format!(
                "invalid process name {name:?}: must match [A-Za-z0-9_-]+"
            ),
        });
    }

    let mut dependencies: Vec<String> = Vec::new();
    let mut ready_spec: Option<ReadySpec> = None;
    let mut signal = DEFAULT_SIGNAL.to_string();
    let mut debounce = DEFAULT_DEBOUNCE;
    let mut dir = ".".to_string();
    let mut shutdown_grace = DEFAULT_SHUTDOWN_GRACE;
    let mut watch_includes: Vec<String> = Vec::new();
    let mut watch_excludes: Vec<String> = Vec::new();

    for spanned in &decl_tokens[1..] {
        let Token::Word(word) = &spanned.token else {
            continue;
        };
        if let Some((key, value)) = option_shaped(word) {
            if !OPTION_KEYS.contains(&key) {
                errors.push(ParseError::UnknownOption {
                    name: name.clone(),
                    key: key.to_string(),
                });
                continue;
            }
            match key {
                "after" => {
                    for dep in value.split(',') {
                        let dep = dep.trim();
                        if !dep.is_empty() {
                            dependencies.push(dep.to_string());
                        }
                    }
                }
                "ready" => match ready::parse_ready_spec(value) {
                    Ok(spec) => ready_spec = Some(spec),
                    Err(reason) => errors.push(ParseError::InvalidOptionValue {
                        name: name.clone(),
                        key: key.to_string(),
                        value: value.to_string(),
                        reason,
                    }),
                },
                "signal" => {
                    if Signal::parse(value).is_some() {
                        signal = value.to_uppercase();
                    } else {
                        errors.push(ParseError::InvalidOptionValue {
                            name: name.clone(),
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: "unrecognised POSIX signal name".to_string(),
                        });
                    }
                }
                "debounce" => match parse_duration(value) {
                    Ok(d) => debounce = d,
                    Err(reason) => errors.push(ParseError::InvalidOptionValue {
                        name: name.clone(),
                        key: key.to_string(),
                        value: value.to_string(),
                        reason,
                    }),
                },
                "dir" => dir = value.to_string(),
                "shutdown" => match parse_duration(value) {
                    Ok(d) => shutdown_grace = d,
                    Err(reason) => errors.push(ParseError::InvalidOptionValue {
                        name: name.clone(),
                        key: key.to_string(),
                        value: value.to_string(),
                        reason,
                    }),
                },
                _ => unreachable!("OPTION_KEYS exhaustively matched above"),
            }
        } else if let Some(pattern) = word.strip_prefix('!') {
            watch_excludes.push(pattern.to_string());
        } else {
            watch_includes.push(word.clone());
        }
    }

    if ready_spec.is_some() && kind == Kind::OneShot {
        errors.push(ParseError::ReadyOnOneShot { name: name.clone() });
    }

    for pattern in watch_includes.iter().chain(watch_excludes.iter()) {
        if let Err(err) = globset::Glob::new(pattern) {
            errors.push(ParseError::InvalidGlob {
                name: name.clone(),
                pattern: pattern.clone(),
                reason: err.to_string(),
            });
        }
    }

    let (inline_env, command) = match &line.block {
        Some(block) => (Vec::new(), block.clone()),
        None => {
            let colon_end_col = tokens[colon_idx].end_col;
            let remainder_start = char_index_to_byte_index(&line.text, colon_end_col - 1);
            let remainder = line.text[remainder_start..].trim_start();
            parse_command_tail(remainder, line.line_no)
                .map_err(|e| vec![ParseError::from(e)])?
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ProcessSpec {
        name,
        kind,
        command,
        inline_env,
        watch_includes,
        watch_excludes,
        dependencies,
        ready_spec,
        signal,
        debounce,
        dir,
        shutdown_grace,
    })
}

/// Splits a declaration-side token of the shape `key=value` into its
/// parts, but only when `key` looks like it was attempting option
/// syntax (a plain lowercase-led identifier). Anything else — globs,
/// `!exclude` patterns, stray `=` inside a pattern — is left alone and
/// falls through to watch-pattern handling.
fn option_shaped(word: &str) -> Option<(&str, &str)> {
    let (key, value) = word.split_once('=')?;
    if is_identifier(key) && key.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        Some((key, value))
    } else {
        None
    }
}

/// Parses the execution side of a single-line `cmdTail`: leading
/// `KEY=VALUE` tokens (uppercase-first identifier) become inline env
/// until the first non-assignment token, after which everything to
/// end-of-line is the command string, with its original spacing intact.
fn parse_command_tail(remainder: &str, line_no: usize) -> Result<(Vec<(String, String)>, String), SyntaxError> {
    let tokens = tokenize(remainder, line_no)?;
    let mut inline_env = Vec::new();
    let mut command_start_col: Option<usize> = None;

    for spanned in &tokens {
        let Token::Word(word) = &spanned.token else {
            command_start_col = Some(spanned.col);
            break;
        };
        match word.split_once('=') {
            Some((key, value)) if is_uppercase_first_identifier(key) => {
                inline_env.push((key.to_string(), value.to_string()));
            }
            _ => {
                command_start_col = Some(spanned.col);
                break;
            }
        }
    }

    let command = match command_start_col {
        Some(col) => {
            let byte_idx = char_index_to_byte_index(remainder, col - 1);
            remainder[byte_idx..].to_string()
        }
        None => String::new(),
    };

    Ok((inline_env, command))
}

fn char_index_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(byte_idx, _)| byte_idx)
        .unwrap_or(s.len())
}

/// Parses a duration option value: a bare integer is milliseconds; `Nms`
/// and `Ns` suffixes are also accepted.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration {value:?}");
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid());
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid());
    }
    value.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
}

// ---------------------------------------------------------------------
// Logical-line assembly (spec §4.2): continuation joining, block-command
// extraction, comment/blank filtering.
// ---------------------------------------------------------------------

/// Assembles logical lines (continuation joins, block-command extraction)
/// for the whole file. A line whose tokenising fails (e.g. an unterminated
/// quote) is recorded as a [`SyntaxError`] and skipped rather than aborting
/// the scan, so assembly keeps going and later lines are still checked
/// (module doc comment above: every error found is collected, not just the
/// first).
fn read_logical_lines(source: &str) -> (Vec<LogicalLine>, Vec<SyntaxError>) {
    let raw_lines: Vec<&str> = source.lines().collect();
    let mut out = Vec::new();
    let mut errors = Vec::new();
    let mut i = 0usize;

    while i < raw_lines.len() {
        let line_no = i + 1;
        let first = raw_lines[i];
        if first.trim().is_empty() {
            i += 1;
            continue;
        }
        if first.trim_start().starts_with('#') {
            i += 1;
            continue;
        }

        let mut joined = first.to_string();
        let mut consumed = 1usize;
        loop {
            let trailing_backslashes = joined.chars().rev().take_while(|&c| c == '\\').count();
            if trailing_backslashes % 2 == 1 && i + consumed < raw_lines.len() {
                joined.pop();
                let next = raw_lines[i + consumed];
                joined.push_str(next.strip_prefix(' ').unwrap_or(next));
                consumed += 1;
            } else {
                break;
            }
        }

        let decl_indent = first.len() - first.trim_start().len();

        match ends_with_bare_colon(&joined, line_no) {
            Err(err) => {
                errors.push(err);
                i += consumed;
            }
            Ok(true) => {
                let mut block_raw: Vec<&str> = Vec::new();
                let mut j = i + consumed;
                while j < raw_lines.len() {
                    let candidate = raw_lines[j];
                    if candidate.trim().is_empty() {
                        block_raw.push("");
                        j += 1;
                        continue;
                    }
                    let indent = candidate.len() - candidate.trim_start().len();
                    if indent > decl_indent {
                        block_raw.push(candidate);
                        j += 1;
                    } else {
                        break;
                    }
                }
                let block_text = strip_common_indent(&block_raw);
                out.push(LogicalLine {
                    line_no,
                    text: joined,
                    block: Some(block_text),
                });
                i = j;
            }
            Ok(false) => {
                out.push(LogicalLine {
                    line_no,
                    text: joined,
                    block: None,
                });
                i += consumed;
            }
        }
    }

    (out, errors)
}

fn ends_with_bare_colon(line: &str, line_no: usize) -> Result<bool, SyntaxError> {
    let tokens = tokenize(line, line_no)?;
    Ok(matches!(tokens.last(), Some(Spanned { token: Token::Colon, .. })))
}

fn strip_common_indent(lines: &[&str]) -> String {
    let min_indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                l.chars().skip(min_indent).collect::<String>()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_start_scenario() {
        let (graph, _env) = parse("a: echo hi\n").unwrap();
        assert_eq!(graph.len(), 1);
        let a = graph.id_of("a").unwrap();
        assert_eq!(graph.spec(a).command, "echo hi");
        assert_eq!(graph.spec(a).kind, Kind::LongRunning);
    }

    #[test]
    fn one_shot_gating_scenario() {
        let src = "init!: true\napi after=init: sleep 1\n";
        let (graph, _) = parse(src).unwrap();
        let init = graph.id_of("init").unwrap();
        let api = graph.id_of("api").unwrap();
        assert_eq!(graph.spec(init).kind, Kind::OneShot);
        assert_eq!(graph.predecessors(api), &[init]);
    }

    #[test]
    fn cycle_scenario_is_rejected() {
        let src = "a after=b: true\nb after=a: true\n";
        let err = parse(src).unwrap_err();
        assert!(matches!(err.errors()[0], ParseError::Cycle { .. }));
    }

    #[test]
    fn reload_cascade_scenario_parses_watch_sets() {
        let src = "lib **/*.go: build-lib\napp after=lib **/*.go: run-app\n";
        let (graph, _) = parse(src).unwrap();
        let lib = graph.id_of("lib").unwrap();
        assert_eq!(graph.spec(lib).watch_includes, vec!["**/*.go"]);
        let app = graph.id_of("app").unwrap();
        assert_eq!(app.index(), 1);
        assert_eq!(graph.spec(app).watch_includes, vec!["**/*.go"]);
        assert_eq!(graph.spec(app).dependencies, vec!["lib"]);
    }

    #[test]
    fn duplicate_names_are_reported() {
        let src = "a: true\na: false\n";
        let err = parse(src).unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| matches!(e, ParseError::DuplicateName { name } if name == "a")));
    }

    #[test]
    fn an_unterminated_quote_does_not_abort_scanning_later_lines() {
        let src = "a: echo 'unterminated\nb after=ghost: true\n";
        let err = parse(src).unwrap_err();
        assert!(err.errors().iter().any(|e| matches!(e, ParseError::Syntax { .. })));
        assert!(err
            .errors()
            .iter()
            .any(|e| matches!(e, ParseError::UnknownDependency { .. })));
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let src = "a after=ghost: true\n";
        let err = parse(src).unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| matches!(e, ParseError::UnknownDependency { .. })));
    }

    #[test]
    fn unknown_option_key_is_a_hard_error() {
        let src = "a afterr=b: true\n";
        let err = parse(src).unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| matches!(e, ParseError::UnknownOption { key, .. } if key == "afterr")));
    }

    #[test]
    fn ready_on_one_shot_is_rejected() {
        let src = "a! ready=3000: true\n";
        let err = parse(src).unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| matches!(e, ParseError::ReadyOnOneShot { .. })));
    }

    #[test]
    fn global_env_binding_is_collected() {
        let (_, env) = parse("PORT=3000\na: true\n").unwrap();
        assert_eq!(env.0, vec![("PORT".to_string(), "3000".to_string())]);
    }

    #[test]
    fn inline_env_precedes_command() {
        let (graph, _) = parse("a: FOO=bar BAZ=qux echo hi\n").unwrap();
        let a = graph.id_of("a").unwrap();
        let spec = graph.spec(a);
        assert_eq!(
            spec.inline_env,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "qux".to_string())
            ]
        );
        assert_eq!(spec.command, "echo hi");
    }

    #[test]
    fn command_preserves_internal_spacing() {
        let (graph, _) = parse("a: echo   'multi   space'\n").unwrap();
        let a = graph.id_of("a").unwrap();
        assert_eq!(graph.spec(a).command, "echo   'multi   space'");
    }

    #[test]
    fn block_command_strips_common_indent() {
        let src = "a:\n    line one\n      line two\n    line three\nb: true\n";
        let (graph, _) = parse(src).unwrap();
        let a = graph.id_of("a").unwrap();
        assert_eq!(graph.spec(a).command, "line one\n  line two\nline three");
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn line_continuation_joins_with_single_space_trim() {
        let src = "a: echo hi \\\n  there\n";
        let (graph, _) = parse(src).unwrap();
        let a = graph.id_of("a").unwrap();
        assert_eq!(graph.spec(a).command, "echo hi  there");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let src = "# a comment\n\n  \na: true\n";
        let (graph, _) = parse(src).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn options_carry_defaults_when_absent() {
        let (graph, _) = parse("a: true\n").unwrap();
        let a = graph.id_of("a").unwrap();
        let spec = graph.spec(a);
        assert_eq!(spec.signal, "TERM");
        assert_eq!(spec.debounce, DEFAULT_DEBOUNCE);
        assert_eq!(spec.dir, ".");
        assert_eq!(spec.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }

    #[test]
    fn explicit_options_override_defaults() {
        let (graph, _) =
            parse("a after=b signal=INT debounce=250ms dir=sub shutdown=2s: true\nb: true\n")
                .unwrap();
        let a = graph.id_of("a").unwrap();
        let spec = graph.spec(a);
        assert_eq!(spec.signal, "INT");
        assert_eq!(spec.debounce, Duration::from_millis(250));
        assert_eq!(spec.dir, "sub");
        assert_eq!(spec.shutdown_grace, Duration::from_secs(2));
        assert_eq!(spec.dependencies, vec!["b"]);
    }

    #[test]
    fn exclude_patterns_are_separated_from_includes() {
        let (graph, _) = parse("a *.rs !target/**: true\n").unwrap();
        let a = graph.id_of("a").unwrap();
        let spec = graph.spec(a);
        assert_eq!(spec.watch_includes, vec!["*.rs"]);
        assert_eq!(spec.watch_excludes, vec!["target/**"]);
    }

    #[test]
    fn parsing_is_deterministic() {
        let src = "lib **/*.go: build-lib\napp after=lib **/*.go: run-app\n";
        let (g1, e1) = parse(src).unwrap();
        let (g2, e2) = parse(src).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(g1.topological_order().len(), g2.topological_order().len());
        for id in g1.ids() {
            assert_eq!(g1.spec(id), g2.spec(id));
        }
    }
}
