//! Gitignore-aware path exclusion (component C3): consulted by the file
//! watcher before a raw filesystem event is ever offered to a process's
//! own include/exclude globs (spec §4.4: "gitignore rules always apply,
//! watch patterns layer on top").

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Builds a combined matcher for everything below `root`: every
/// `.gitignore` from `root` down to each file's own directory, plus
/// `.git/info/exclude`, the same precedence git itself uses.
pub struct IgnoreMatcher {
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    pub fn build(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        for ancestor in root.ancestors() {
            let gitignore = ancestor.join(".gitignore");
            if gitignore.exists() {
                builder.add(gitignore);
            }
            let exclude = ancestor.join(".git").join("info").join("exclude");
            if exclude.exists() {
                builder.add(exclude);
            }
        }
        let gitignore = builder.build().unwrap_or_else(|_| Gitignore::empty());
        Self { gitignore }
    }

    /// Whether `path` should be hidden from the watcher: anything inside
    /// `.git/`, or matched by an applicable `.gitignore`/exclude rule.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if path.components().any(|c| c.as_os_str() == ".git") {
            return true;
        }
        let is_dir = path.is_dir();
        self.gitignore.matched(path, is_dir).is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn git_directory_is_always_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = IgnoreMatcher::build(dir.path());
        assert!(matcher.is_ignored(&dir.path().join(".git").join("HEAD")));
    }

    #[test]
    fn gitignore_patterns_are_honoured() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "target/\n*.log\n").unwrap();
        let matcher = IgnoreMatcher::build(dir.path());
        assert!(matcher.is_ignored(&dir.path().join("target").join("debug").join("app")));
        assert!(matcher.is_ignored(&dir.path().join("server.log")));
        assert!(!matcher.is_ignored(&dir.path().join("src").join("main.rs")));
    }

    #[test]
    fn missing_gitignore_ignores_nothing_but_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = IgnoreMatcher::build(dir.path());
        assert!(!matcher.is_ignored(&dir.path().join("main.rs")));
    }
}
