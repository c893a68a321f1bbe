//! File watching (component C4): a single recursive watch rooted at the
//! Procfile's directory, demultiplexed to every process with a non-empty
//! `watch` set (spec §4.4, and the "single instance, dispatches to many
//! supervisors" note in [`crate::host::FileEvents`]).
//!
//! Debouncing is deliberately not done here — the supervisor owns the
//! debounce timer per spec §4.6, since only it knows whether a process is
//! mid-restart when another change lands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc::UnboundedSender;

use crate::graph::{ProcId, ProcessGraph};
use crate::host::{FileChangeEvent, FileEvents};
use crate::ignore::IgnoreMatcher;
use crate::process::ProcessSpec;

struct ProcessMatcher {
    id: ProcId,
    includes: GlobSet,
    excludes: GlobSet,
}

impl ProcessMatcher {
    fn build(id: ProcId, procfile_dir_rel: &str, spec: &ProcessSpec) -> Result<Self> {
        Ok(Self {
            id,
            includes: build_globset(procfile_dir_rel, &spec.watch_includes)?,
            excludes: build_globset(procfile_dir_rel, &spec.watch_excludes)?,
        })
    }

    fn matches(&self, relative: &Path) -> bool {
        self.includes.is_match(relative) && !self.excludes.is_match(relative)
    }
}

fn build_globset(dir: &str, patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(&anchor_pattern(dir, pattern))?);
    }
    Ok(builder.build()?)
}

/// Anchors a `watch=`/exclude pattern to the path it is matched against.
/// A pattern starting with `/` is rooted at the Procfile's own directory;
/// anything else is rooted at the process's `dir=` (spec §4.4).
fn anchor_pattern(dir: &str, pattern: &str) -> String {
    if let Some(rooted) = pattern.strip_prefix('/') {
        rooted.to_string()
    } else if dir == "." || dir.is_empty() {
        pattern.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), pattern)
    }
}

/// Subscribes one recursive watch at `procfile_dir` and fans filtered
/// change events out to every process that declared a `watch` set.
/// `targets` receives the raw changed path for a matching process;
/// whichever debounce/coalescing happens downstream is the caller's job.
pub fn spawn_watchers(
    file_events: Arc<dyn FileEvents>,
    graph: &ProcessGraph,
    procfile_dir: &Path,
    targets: &std::collections::HashMap<ProcId, UnboundedSender<PathBuf>>,
) -> Result<()> {
    let mut matchers = Vec::new();
    for id in graph.ids() {
        let spec = graph.spec(id);
        if !spec.has_watches() {
            continue;
        }
        matchers.push(ProcessMatcher::build(id, &spec.dir, spec)?);
    }
    if matchers.is_empty() {
        return Ok(());
    }

    let ignore = IgnoreMatcher::build(procfile_dir);
    let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel::<FileChangeEvent>();
    file_events.subscribe(procfile_dir, raw_tx)?;

    let procfile_dir = procfile_dir.to_path_buf();
    let targets = targets.clone();
    tokio::spawn(async move {
        while let Some(event) = raw_rx.recv().await {
            if ignore.is_ignored(&event.path) {
                continue;
            }
            let Ok(relative) = event.path.strip_prefix(&procfile_dir) else {
                continue;
            };
            for matcher in &matchers {
                if matcher.matches(relative) {
                    if let Some(tx) = targets.get(&matcher.id) {
                        let _ = tx.send(event.path.clone());
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_pattern_anchors_to_process_dir() {
        assert_eq!(anchor_pattern("services/api", "**/*.go"), "services/api/**/*.go");
    }

    #[test]
    fn rooted_pattern_anchors_to_procfile_dir() {
        assert_eq!(anchor_pattern("services/api", "/shared/**"), "shared/**");
    }

    #[test]
    fn dot_dir_leaves_pattern_untouched() {
        assert_eq!(anchor_pattern(".", "*.rs"), "*.rs");
    }

    #[test]
    fn process_matcher_excludes_take_precedence() {
        let id = ProcId(0);
        let matcher = ProcessMatcher {
            id,
            includes: build_globset(".", &["**/*.rs".to_string()]).unwrap(),
            excludes: build_globset(".", &["target/**".to_string()]).unwrap(),
        };
        assert!(matcher.matches(Path::new("src/main.rs")));
        assert!(!matcher.matches(Path::new("target/debug/main.rs")));
    }
}
