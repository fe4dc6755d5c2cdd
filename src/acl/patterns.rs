//! Branch pattern matching for collaborator grants
//!
//! A collaborator grant carries a comma-separated list of shell-style globs
//! written against the basic branch name. Each element is qualified with
//! `refs/heads/` before matching, so `f*` covers `refs/heads/f33` but never
//! `refs/tags/f33`.

use glob::{MatchOptions, Pattern};

/// Prefix every branch pattern is anchored under
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled branch pattern matcher
#[derive(Debug, Clone)]
pub struct BranchPatternMatcher {
    patterns: Vec<CompiledPattern>,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    qualified: String,
    glob: Option<Pattern>,
}

impl CompiledPattern {
    fn compile(source: &str) -> Self {
        let qualified = format!("{}{}", BRANCH_REF_PREFIX, source);
        // `*` runs collapse to one: fnmatch semantics, and `glob` rejects a
        // `**` that is not a whole path component.
        let normalized = collapse_stars(&qualified);
        let glob = Pattern::new(&normalized)
            .or_else(|_| Pattern::new(&Pattern::escape(&qualified)))
            .ok();

        Self {
            source: source.to_string(),
            qualified,
            glob,
        }
    }

    fn matches(&self, refname: &str) -> bool {
        match &self.glob {
            Some(glob) => glob.matches_with(refname, MATCH_OPTIONS),
            None => self.qualified == refname,
        }
    }
}

impl BranchPatternMatcher {
    /// Compile a comma-separated pattern list
    ///
    /// Elements are trimmed; empty elements are skipped. A pattern the glob
    /// engine cannot parse (an unclosed `[` for instance) is compared
    /// literally instead.
    pub fn new(pattern_list: &str) -> Self {
        let patterns = split_patterns(pattern_list)
            .map(CompiledPattern::compile)
            .collect();

        Self { patterns }
    }

    /// Create an empty matcher (matches nothing)
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Check if a fully qualified ref matches any pattern
    pub fn matches(&self, refname: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(refname))
    }

    /// Check if a ref matches any pattern, returning the matching bare pattern
    pub fn find_match(&self, refname: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.matches(refname))
            .map(|p| p.source.as_str())
    }

    /// Bare patterns, in declaration order
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.source.as_str())
    }

    /// `refs/heads/`-qualified patterns, in declaration order
    pub fn qualified(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.qualified.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for BranchPatternMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

/// Check a comma-separated pattern list against a fully qualified ref
pub fn matches(pattern_list: &str, refname: &str) -> bool {
    BranchPatternMatcher::new(pattern_list).matches(refname)
}

/// Split a pattern list into trimmed, non-empty elements
pub fn split_patterns(pattern_list: &str) -> impl Iterator<Item = &str> {
    pattern_list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

/// Check that every element of a pattern list parses as a glob
///
/// Returns the first element that does not, with the parser's reason.
pub fn validate_patterns(pattern_list: &str) -> Result<(), String> {
    for source in split_patterns(pattern_list) {
        let qualified = format!("{}{}", BRANCH_REF_PREFIX, source);
        if let Err(e) = Pattern::new(&collapse_stars(&qualified)) {
            return Err(format!("invalid branch pattern '{}': {}", source, e.msg));
        }
    }
    Ok(())
}

fn collapse_stars(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut previous_star = false;
    for c in pattern.chars() {
        if c == '*' && previous_star {
            continue;
        }
        previous_star = c == '*';
        out.push(c);
    }
    out
}
