//! Compilation of the `;`-delimited pattern list.

use crate::WatchError;
use glob::Pattern;
use std::collections::BTreeSet;

/// Characters that mark a pattern entry as a wildcard.
const WILDCARD_CHARS: [char; 3] = ['*', '?', '['];

/// A parsed pattern list.
///
/// Exact entries form the expected set that gates batch completion;
/// wildcard entries match opportunistically and never gate anything. A
/// list with no exact entries puts the watcher in per-file mode.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    exact: BTreeSet<String>,
    globs: Vec<Pattern>,
}

impl CompiledPatterns {
    /// Parses a `;`-delimited list of exact names and glob patterns.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::EmptyPattern`] for a blank list and
    /// [`WatchError::Pattern`] for a wildcard entry that does not compile.
    pub fn parse(patterns: &str) -> Result<Self, WatchError> {
        let mut exact = BTreeSet::new();
        let mut globs = Vec::new();
        for entry in patterns.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            if entry.contains(WILDCARD_CHARS) {
                let compiled = Pattern::new(entry).map_err(|source| WatchError::Pattern {
                    pattern: entry.to_string(),
                    source,
                })?;
                globs.push(compiled);
            } else {
                exact.insert(entry.to_string());
            }
        }
        if exact.is_empty() && globs.is_empty() {
            return Err(WatchError::EmptyPattern);
        }
        Ok(Self { exact, globs })
    }

    /// Returns true if `file_name` matches any entry.
    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        self.exact.contains(file_name) || self.globs.iter().any(|g| g.matches(file_name))
    }

    /// The exact names that must all arrive before a batch job is created.
    #[must_use]
    pub const fn expected(&self) -> &BTreeSet<String> {
        &self.exact
    }

    /// True when the watcher collects toward one batch job; false when
    /// every qualifying file spawns its own job.
    #[must_use]
    pub fn is_batch(&self) -> bool {
        !self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_glob_split() {
        let patterns = CompiledPatterns::parse("sample_A.raw;sample_B.raw;*.mzML").unwrap();
        assert!(patterns.is_batch());
        assert_eq!(patterns.expected().len(), 2);
        assert!(patterns.matches("sample_A.raw"));
        assert!(patterns.matches("anything.mzML"));
        assert!(!patterns.matches("sample_C.raw"));
    }

    #[test]
    fn test_pure_wildcard_is_per_file() {
        let patterns = CompiledPatterns::parse("*.raw").unwrap();
        assert!(!patterns.is_batch());
        assert!(patterns.expected().is_empty());
        assert!(patterns.matches("run_042.raw"));
        assert!(!patterns.matches("run_042.mzML"));
    }

    #[test]
    fn test_question_mark_and_class_are_wildcards() {
        let patterns = CompiledPatterns::parse("run_?.raw;sample_[ab].raw").unwrap();
        assert!(!patterns.is_batch());
        assert!(patterns.matches("run_1.raw"));
        assert!(patterns.matches("sample_a.raw"));
        assert!(!patterns.matches("sample_c.raw"));
    }

    #[test]
    fn test_blank_list_is_rejected() {
        assert!(matches!(
            CompiledPatterns::parse(" ; ;"),
            Err(WatchError::EmptyPattern)
        ));
    }

    #[test]
    fn test_bad_glob_is_rejected() {
        let err = CompiledPatterns::parse("sample_[.raw").unwrap_err();
        assert!(matches!(err, WatchError::Pattern { .. }));
    }
}
