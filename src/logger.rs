//! A verbosity-gated logger, generalised from `fsfill`'s own `Logger` to
//! also carry the per-category counters spec.md §7 requires: every walker
//! reports its per-entry outcome through [`Logger::note`], which both
//! prints it (if the verbosity level asks for it) and folds it into the
//! [`RunCounters`] the CLI prints as a summary and maps to an exit code.

use std::fs::File;
use std::io::Write;

use crate::error::RunCounters;

/// What happened to one entry, as seen by a walker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryOutcome {
    Saved,
    NotChanged,
    SkippedByFilter,
    TooOld,
    Errored,
    Removed,
}

/// A verbosity-gated logger that also accumulates [`RunCounters`].
#[derive(Debug)]
pub struct Logger {
    verbosity: u32,
    log_file: Option<File>,
    counters: RunCounters,
}

impl Logger {
    /// Create a new logger.
    pub fn new(verbosity: u32, log_file: Option<File>) -> Self
    {
        Self { verbosity, log_file, counters: RunCounters::new() }
    }

    /// Log a message, with a specified level.
    /// Logs also into the log file, if present.
    pub fn log(&mut self, level: u32, msg: &str)
    {
        if self.verbosity >= level {
            eprintln!("{}", msg);

            if let Some(log_file) = &mut self.log_file {
                writeln!(log_file, "{}", msg).unwrap_or_else(|_| {
                    eprintln!("error: couldn't write into the log file")
                });
            }
        }
    }

    /// Records one entry's outcome (spec.md §7's per-category tallies),
    /// and at verbosity 1+ prints a one-line "action: path" record the way
    /// dar's own `-v` listing does.
    pub fn note(&mut self, outcome: EntryOutcome, path: &str)
    {
        match outcome {
            EntryOutcome::Saved => self.counters.saved += 1,
            EntryOutcome::NotChanged => self.counters.not_changed += 1,
            EntryOutcome::SkippedByFilter => self.counters.skipped_by_filter += 1,
            EntryOutcome::TooOld => self.counters.too_old += 1,
            EntryOutcome::Errored => self.counters.errored += 1,
            EntryOutcome::Removed => self.counters.removed += 1,
        }
        let label = match outcome {
            EntryOutcome::Saved => "saved",
            EntryOutcome::NotChanged => "unchanged",
            EntryOutcome::SkippedByFilter => "excluded",
            EntryOutcome::TooOld => "too old",
            EntryOutcome::Errored => "error",
            EntryOutcome::Removed => "removed",
        };
        self.log(1, &format!("{}: {}", label, path));
    }

    pub fn counters(&self) -> &RunCounters
    {
        &self.counters
    }

    /// Prints the final per-category summary (spec.md §7), at verbosity 0+.
    pub fn summary(&mut self)
    {
        let c = self.counters;
        self.log(0, &format!(
            "saved: {}, unchanged: {}, excluded: {}, too-old: {}, errored: {}, removed: {}",
            c.saved, c.not_changed, c.skipped_by_filter, c.too_old, c.errored, c.removed,
        ));
    }
}
