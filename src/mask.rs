//! Mask algebra (spec.md §4, "mask algebra"): composable predicates over
//! names and paths, used by the backup and restore walkers to decide
//! in/out for name masks (`-X`/`-I`), path masks (`-P`/`-g`) and the
//! compression mask.
//!
//! Leaves use `globset` for glob patterns and `regex` for regex patterns,
//! the same crates the pack's own filesystem-walking tools reach for
//! rather than hand-rolling glob matching.

use globset::Glob;
use regex::Regex;

use crate::path::DarPath;

/// A composable predicate over a name or a path.
pub enum Mask {
    Glob(globset::GlobMatcher),
    Regex(Regex),
    /// True for every name/path under (or equal to) this path prefix.
    PathScope(DarPath),
    And(Box<Mask>, Box<Mask>),
    Or(Box<Mask>, Box<Mask>),
    Not(Box<Mask>),
    All,
    None,
}

impl Mask {
    pub fn glob(pattern: &str) -> Result<Self, globset::Error>
    {
        Ok(Mask::Glob(Glob::new(pattern)?.compile_matcher()))
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error>
    {
        Ok(Mask::Regex(Regex::new(pattern)?))
    }

    pub fn path_scope(path: DarPath) -> Self
    {
        Mask::PathScope(path)
    }

    pub fn and(self, other: Mask) -> Self
    {
        Mask::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Mask) -> Self
    {
        Mask::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Self
    {
        Mask::Not(Box::new(self))
    }

    /// Evaluate against a plain name (no path separators expected).
    pub fn matches_name(&self, name: &str) -> bool
    {
        match self {
            Mask::Glob(m) => m.is_match(name),
            Mask::Regex(r) => r.is_match(name),
            Mask::PathScope(p) => p.components().last().map(|c| c == name).unwrap_or(false),
            Mask::And(a, b) => a.matches_name(name) && b.matches_name(name),
            Mask::Or(a, b) => a.matches_name(name) || b.matches_name(name),
            Mask::Not(a) => !a.matches_name(name),
            Mask::All => true,
            Mask::None => false,
        }
    }

    /// Evaluate against a full path; `PathScope` checks prefix containment
    /// rather than name equality.
    pub fn matches_path(&self, path: &DarPath) -> bool
    {
        match self {
            Mask::Glob(m) => m.is_match(path.to_string()),
            Mask::Regex(r) => r.is_match(&path.to_string()),
            Mask::PathScope(scope) => {
                let sc = scope.components();
                let pc = path.components();
                pc.len() >= sc.len() && &pc[..sc.len()] == sc
            }
            Mask::And(a, b) => a.matches_path(path) && b.matches_path(path),
            Mask::Or(a, b) => a.matches_path(path) || b.matches_path(path),
            Mask::Not(a) => !a.matches_path(path),
            Mask::All => true,
            Mask::None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_name()
    {
        let m = Mask::glob("*.txt").unwrap();
        assert!(m.matches_name("notes.txt"));
        assert!(!m.matches_name("notes.bin"));
    }

    #[test]
    fn regex_matches_name()
    {
        let m = Mask::regex("^core\\.[0-9]+$").unwrap();
        assert!(m.matches_name("core.1234"));
        assert!(!m.matches_name("core"));
    }

    #[test]
    fn not_inverts()
    {
        let m = Mask::glob("*.tmp").unwrap().not();
        assert!(!m.matches_name("a.tmp"));
        assert!(m.matches_name("a.rs"));
    }

    #[test]
    fn and_or_compose()
    {
        let a = Mask::glob("*.rs").unwrap();
        let b = Mask::glob("main.*").unwrap();
        let and = Mask::glob("*.rs").unwrap().and(Mask::glob("main.*").unwrap());
        assert!(and.matches_name("main.rs"));
        assert!(!and.matches_name("lib.rs"));

        let or = a.or(b);
        assert!(or.matches_name("lib.rs"));
        assert!(or.matches_name("main.c"));
        assert!(!or.matches_name("lib.c"));
    }

    #[test]
    fn path_scope_matches_prefix_only()
    {
        let scope = Mask::path_scope(DarPath::parse("/etc/ssh"));
        assert!(scope.matches_path(&DarPath::parse("/etc/ssh/sshd_config")));
        assert!(!scope.matches_path(&DarPath::parse("/etc/other")));
    }

    #[test]
    fn all_and_none()
    {
        assert!(Mask::All.matches_name("anything"));
        assert!(!Mask::None.matches_name("anything"));
    }
}
