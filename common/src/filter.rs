//! Pattern-based inclusion filtering
//!
//! This module decides which paths take part in mirroring. Filtering is an allow-list: with no
//! patterns every path is included, otherwise a path must match at least one pattern.
//!
//! # Pattern Syntax
//!
//! Patterns are plain, case-sensitive substrings. There are no wildcards: `*.txt` only matches
//! names that literally contain `*.txt`. An empty pattern matches every path.
//!
//! # Scopes
//!
//! - [`FilterScope::FileName`] matches a pattern against the base name only
//! - [`FilterScope::FileOrDirectory`] also matches against the containing directory, taken
//!   relative to the source root, which is what makes "mirror only this subfolder" work
//!
//! # Examples
//!
//! ```
//! use common::filter::{FilterScope, InclusionRule};
//! use std::path::Path;
//!
//! let rule = InclusionRule::new(["report", "photos"]);
//! let root = Path::new("/data");
//!
//! assert!(rule.included(Path::new("/data/report.csv"), root, FilterScope::FileName));
//! assert!(!rule.included(Path::new("/data/image.png"), root, FilterScope::FileName));
//! // a file inside an included folder
//! assert!(rule.included(Path::new("/data/photos/2024/a.jpg"), root, FilterScope::FileOrDirectory));
//! assert!(!rule.included(Path::new("/data/photos/2024/a.jpg"), root, FilterScope::FileName));
//! ```

use anyhow::Context;
use std::path::Path;

/// Which parts of a path are matched against the patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterScope {
    /// base name only
    FileName,
    /// base name or containing directory
    #[default]
    FileOrDirectory,
}

/// Result of checking whether a path should be included
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    /// no patterns configured
    Included,
    /// path matched the given pattern
    IncludedByPattern(String),
    /// patterns exist but none matched
    ExcludedByDefault,
}

impl FilterResult {
    pub fn is_included(&self) -> bool {
        !matches!(self, FilterResult::ExcludedByDefault)
    }
}

/// Ordered allow-list of substring patterns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InclusionRule {
    patterns: Vec<String>,
}

impl InclusionRule {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Rule that includes everything
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Determine whether `path` participates in mirroring.
    ///
    /// `root` is the source root; the containing directory is matched relative to it so that
    /// the name of the root itself never matches. Paths outside of `root` are matched against
    /// their full parent path.
    pub fn should_include(&self, path: &Path, root: &Path, scope: FilterScope) -> FilterResult {
        if self.patterns.is_empty() {
            return FilterResult::Included;
        }
        let name = path
            .file_name()
            .unwrap_or(path.as_os_str())
            .to_string_lossy();
        if let Some(pattern) = self.patterns.iter().find(|p| name.contains(p.as_str())) {
            return FilterResult::IncludedByPattern(pattern.clone());
        }
        if scope == FilterScope::FileOrDirectory
            && let Some(parent) = path.parent()
        {
            let parent = parent.strip_prefix(root).unwrap_or(parent).to_string_lossy();
            if let Some(pattern) = self.patterns.iter().find(|p| parent.contains(p.as_str())) {
                return FilterResult::IncludedByPattern(pattern.clone());
            }
        }
        FilterResult::ExcludedByDefault
    }

    pub fn included(&self, path: &Path, root: &Path, scope: FilterScope) -> bool {
        self.should_include(path, root, scope).is_included()
    }

    /// Read patterns from a file, one per line
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read include file: {:?}", path))?;
        Ok(Self::parse_content(&content))
    }

    /// Parse patterns from text. Blank lines and lines starting with `#` are skipped;
    /// surrounding whitespace is trimmed.
    pub fn parse_content(content: &str) -> Self {
        Self::new(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }
}

impl std::fmt::Display for InclusionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.patterns.is_empty() {
            return write!(f, "<all>");
        }
        write!(f, "{}", self.patterns.join(","))
    }
}
