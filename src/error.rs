//! Error kinds shared by every layer of the archive stack.
//!
//! The original tool annotates call chains by stacking exceptions and
//! catching a dedicated cancellation exception at well-known points. We
//! re-express that as a single `ErrorKind` discriminant carried by a
//! `thiserror`-derived error, with `anyhow::Context` used at call sites that
//! only need to append a frame of context, the way `fsfill` wraps its own
//! I/O errors with `anyhow!` in `filesys/detect.rs`.

use std::fmt;

/// The kind of failure, independent of the human-readable message.
///
/// This is the thing callers are expected to match on; the message text is
/// for humans only and may change between versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument, bad computed value, CRC mismatch, malformed on-disk data.
    Range,
    /// A decimal/textual-to-numeric conversion failed.
    Deci,
    /// Allocation failure.
    Memory,
    /// I/O error reported verbatim from the OS.
    Hardware,
    /// A compile-time-absent feature was requested (cipher, compression, EA).
    Feature,
    /// The user declined a confirmation prompt.
    UserAbort,
    /// At least one entry could not be saved/restored/matched.
    Data,
    /// Cooperative cancellation is in progress.
    ThreadCancel,
    /// An internal invariant was violated.
    Bug,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        let s = match self {
            ErrorKind::Range => "range",
            ErrorKind::Deci => "deci",
            ErrorKind::Memory => "memory",
            ErrorKind::Hardware => "hardware",
            ErrorKind::Feature => "feature",
            ErrorKind::UserAbort => "user-abort",
            ErrorKind::Data => "data",
            ErrorKind::ThreadCancel => "thread-cancel",
            ErrorKind::Bug => "bug",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type.
///
/// Every fallible call site that needs to distinguish *why* it failed
/// returns this, rather than a bare `anyhow::Error`. Context frames can
/// still be layered on top with `anyhow::Context` once a `DarError` has been
/// converted into an `anyhow::Error` (it implements `std::error::Error`, so
/// `?` composes with `anyhow::Result` normally).
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct DarError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DarError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self
    {
        Self { kind, message: message.into() }
    }

    pub fn range(message: impl Into<String>) -> Self
    {
        Self::new(ErrorKind::Range, message)
    }

    pub fn bug(message: impl Into<String>) -> Self
    {
        Self::new(ErrorKind::Bug, message)
    }

    pub fn feature(message: impl Into<String>) -> Self
    {
        Self::new(ErrorKind::Feature, message)
    }

    pub fn cancelled() -> Self
    {
        Self::new(ErrorKind::ThreadCancel, "operation cancelled")
    }

    pub fn user_abort() -> Self
    {
        Self::new(ErrorKind::UserAbort, "aborted by user")
    }
}

impl From<std::io::Error> for DarError {
    fn from(e: std::io::Error) -> Self
    {
        Self::new(ErrorKind::Hardware, e.to_string())
    }
}

/// Per-category tallies of *data* errors accumulated over a whole walk.
///
/// *data* errors (spec.md §7) do not abort the walker; they are counted and
/// surfaced only as the process exit code once the walk finishes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub saved: u64,
    pub not_changed: u64,
    pub skipped_by_filter: u64,
    pub too_old: u64,
    pub errored: u64,
    pub removed: u64,
}

impl RunCounters {
    pub fn new() -> Self
    {
        Self::default()
    }

    /// True if at least one entry could not be saved/restored/matched, i.e.
    /// the run should exit with the "data" exit code (4) rather than 0.
    pub fn has_data_errors(&self) -> bool
    {
        self.errored > 0
    }

    pub fn merge(&mut self, other: &RunCounters)
    {
        self.saved += other.saved;
        self.not_changed += other.not_changed;
        self.skipped_by_filter += other.skipped_by_filter;
        self.too_old += other.too_old;
        self.errored += other.errored;
        self.removed += other.removed;
    }
}

/// Process exit codes, per spec.md §6.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const SYNTAX: i32 = 1;
    pub const SCRIPT_HOOK: i32 = 2;
    pub const BUG: i32 = 3;
    pub const DATA: i32 = 4;
    pub const ABORTED: i32 = 5;
    pub const FEATURE_MISSING: i32 = 6;
    pub const DISK_FULL: i32 = 7;
    pub const OPEN_ERROR: i32 = 8;
    pub const CRC_ERROR: i32 = 11;
}

/// Maps an error kind (or a successful run with data errors) to the exit
/// code table in spec.md §6.
pub fn exit_code_for(kind: ErrorKind, counters: &RunCounters) -> i32
{
    match kind {
        ErrorKind::UserAbort => exit_code::ABORTED,
        ErrorKind::Feature => exit_code::FEATURE_MISSING,
        ErrorKind::Bug => exit_code::BUG,
        ErrorKind::Range if counters.has_data_errors() => exit_code::DATA,
        _ if counters.has_data_errors() => exit_code::DATA,
        _ => exit_code::OK,
    }
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_spec_names()
    {
        assert_eq!(ErrorKind::Range.to_string(), "range");
        assert_eq!(ErrorKind::ThreadCancel.to_string(), "thread-cancel");
        assert_eq!(ErrorKind::UserAbort.to_string(), "user-abort");
    }

    #[test]
    fn counters_merge()
    {
        let mut a = RunCounters { saved: 1, errored: 2, ..Default::default() };
        let b = RunCounters { saved: 3, errored: 1, removed: 5, ..Default::default() };
        a.merge(&b);

        assert_eq!(a.saved, 4);
        assert_eq!(a.errored, 3);
        assert_eq!(a.removed, 5);
        assert!(a.has_data_errors());
    }

    #[test]
    fn exit_code_table()
    {
        let clean = RunCounters::new();
        assert_eq!(exit_code_for(ErrorKind::Bug, &clean), exit_code::BUG);
        assert_eq!(exit_code_for(ErrorKind::UserAbort, &clean), exit_code::ABORTED);
        assert_eq!(exit_code_for(ErrorKind::Hardware, &clean), exit_code::OK);

        let dirty = RunCounters { errored: 1, ..Default::default() };
        assert_eq!(exit_code_for(ErrorKind::Hardware, &dirty), exit_code::DATA);
    }
}
