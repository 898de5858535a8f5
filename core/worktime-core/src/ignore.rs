//! Glob-based suppression of capture for configured directories.

use crate::error::ConfigError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    set: GlobSet,
    patterns: usize,
}

impl IgnoreMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|err| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                details: err.kind().to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|err| ConfigError::InvalidPattern {
            pattern: patterns.join(", "),
            details: err.to_string(),
        })?;
        Ok(Self {
            set,
            patterns: patterns.len(),
        })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns == 0
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        !self.is_empty() && self.set.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> IgnoreMatcher {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        IgnoreMatcher::new(&patterns).expect("valid globs")
    }

    #[test]
    fn empty_matcher_ignores_nothing() {
        let m = IgnoreMatcher::empty();
        assert!(m.is_empty());
        assert!(!m.is_ignored(Path::new("/tmp/scratch")));
    }

    #[test]
    fn matches_nested_paths() {
        let m = matcher(&["/tmp/**", "**/secret-*"]);
        assert!(m.is_ignored(Path::new("/tmp/scratch/a")));
        assert!(m.is_ignored(Path::new("/home/u/secret-client")));
        assert!(!m.is_ignored(Path::new("/home/u/code/app")));
    }

    #[test]
    fn rejects_invalid_pattern() {
        let err = IgnoreMatcher::new(&["a[".to_string()]).unwrap_err();
        match err {
            ConfigError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "a["),
            other => panic!("unexpected error: {other}"),
        }
    }
}
