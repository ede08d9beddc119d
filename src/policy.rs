//! Overwriting policy engine (spec.md §4.8), grounded on
//! `examples/original_source/src/libdar/crit_action.hpp`'s `crit_action`
//! hierarchy (`crit_constant_action` / `testing` / `crit_chain`) and its
//! `over_action_data` / `over_action_ea` enums — re-expressed as a closed
//! Rust enum tree evaluated by a single pure function instead of a
//! `clone()`-based virtual-dispatch hierarchy, the same "sum type instead
//! of inheritance" move `catalog::entry::Entry` makes over the original's
//! `cat_nomme` hierarchy.

use crate::catalog::entry::Entry;
use crate::error::DarError;

/// What to do with an entry's *data* (spec.md §4.8;
/// `over_action_data` in the original).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataAction {
    Preserve,
    Overwrite,
    PreserveMarkAlreadySaved,
    OverwriteMarkAlreadySaved,
    Remove,
    Undefined,
    Ask,
}

/// What to do with an entry's *metadata* (EA/FSA) (spec.md §4.8;
/// `over_action_ea` in the original, generalised here to cover FSA too).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetaAction {
    Preserve,
    Overwrite,
    Clear,
    PreserveMarkAlreadySaved,
    OverwriteMarkAlreadySaved,
    MergePreserve,
    MergeOverwrite,
    Undefined,
    Ask,
}

/// Which fields the restore walker's in-place/incoming comparison looks
/// at before resolving an [`Action`] (spec.md §4.10's "what-to-check";
/// `comparison_fields` in the original): `All` considers every field a
/// timestamp tie would fall back to including ownership, `IgnoreOwner`
/// drops ownership from that comparison, and `Mtime` looks at nothing but
/// modification time. `Nothing` is this crate's own addition for a
/// restore that never needs to compare against what's already in place
/// (e.g. `--empty`/dry-run): the incoming entry always wins.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComparisonFields {
    All,
    IgnoreOwner,
    Mtime,
    Nothing,
}

/// The resolved (data, meta) decision for one in-place/incoming pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActionPair {
    pub data: DataAction,
    pub meta: MetaAction,
}

impl ActionPair {
    pub const fn new(data: DataAction, meta: MetaAction) -> Self
    {
        Self { data, meta }
    }
}

/// A predicate over an (in-place, incoming) entry pair. `Entry::mtime`
/// already folds every inode kind down to a comparable timestamp, so most
/// leaves just compare that.
pub enum Criterion {
    IncomingMoreRecent,
    InPlaceMoreRecent,
    SameType,
    IncomingIsDirectory,
    InPlaceIsDirectory,
    IncomingIsDeleted,
    InPlaceIsDeleted,
    And(Box<Criterion>, Box<Criterion>),
    Or(Box<Criterion>, Box<Criterion>),
    Not(Box<Criterion>),
}

impl Criterion {
    pub fn and(self, other: Criterion) -> Self
    {
        Criterion::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Criterion) -> Self
    {
        Criterion::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Self
    {
        Criterion::Not(Box::new(self))
    }

    pub fn eval(&self, in_place: &Entry, incoming: &Entry) -> bool
    {
        match self {
            Criterion::IncomingMoreRecent => match (in_place.mtime(), incoming.mtime()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
            Criterion::InPlaceMoreRecent => match (in_place.mtime(), incoming.mtime()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Criterion::SameType => in_place.kind_byte().to_ascii_lowercase() == incoming.kind_byte().to_ascii_lowercase(),
            Criterion::IncomingIsDirectory => incoming.is_directory(),
            Criterion::InPlaceIsDirectory => in_place.is_directory(),
            Criterion::IncomingIsDeleted => matches!(incoming, Entry::Deleted(_)),
            Criterion::InPlaceIsDeleted => matches!(in_place, Entry::Deleted(_)),
            Criterion::And(a, b) => a.eval(in_place, incoming) && b.eval(in_place, incoming),
            Criterion::Or(a, b) => a.eval(in_place, incoming) || b.eval(in_place, incoming),
            Criterion::Not(a) => !a.eval(in_place, incoming),
        }
    }
}

/// The policy tree itself (spec.md §4.8; `crit_action`/`crit_constant_action`/
/// `testing`/`crit_chain` in the original).
pub enum Action {
    /// `crit_constant_action`: always the same decision.
    Const(ActionPair),
    /// `testing`: branch on a criterion.
    Testing(Criterion, Box<Action>, Box<Action>),
    /// `crit_chain`: evaluate sub-actions left to right, keeping the first
    /// defined value for each of `data`/`meta` independently, stopping
    /// once both are defined.
    Chain(Vec<Action>),
}

impl Action {
    /// Evaluates the policy for one pair, dispatching to `ask` whenever a
    /// leaf resolves to `Ask` (interactive callback; the CLI wires this to
    /// a stdin prompt, tests wire it to a fixed answer). Returns a `Bug`
    /// error if the policy leaves a field `Undefined` even after asking —
    /// a well-formed policy always bottoms out in a constant.
    pub fn evaluate(
        &self,
        in_place: &Entry,
        incoming: &Entry,
        ask: &mut dyn FnMut(&Entry, &Entry) -> ActionPair,
    ) -> Result<ActionPair, DarError>
    {
        let mut pair = self.evaluate_raw(in_place, incoming);
        if pair.data == DataAction::Ask || pair.meta == MetaAction::Ask {
            let resolved = ask(in_place, incoming);
            if pair.data == DataAction::Ask {
                pair.data = resolved.data;
            }
            if pair.meta == MetaAction::Ask {
                pair.meta = resolved.meta;
            }
        }
        if pair.data == DataAction::Undefined || pair.meta == MetaAction::Undefined {
            return Err(DarError::bug("overwriting policy left an action undefined"));
        }
        Ok(pair)
    }

    fn evaluate_raw(&self, in_place: &Entry, incoming: &Entry) -> ActionPair
    {
        match self {
            Action::Const(pair) => *pair,
            Action::Testing(criterion, then_branch, else_branch) => {
                if criterion.eval(in_place, incoming) {
                    then_branch.evaluate_raw(in_place, incoming)
                } else {
                    else_branch.evaluate_raw(in_place, incoming)
                }
            }
            Action::Chain(actions) => {
                let mut data = DataAction::Undefined;
                let mut meta = MetaAction::Undefined;
                for action in actions {
                    if data != DataAction::Undefined && meta != MetaAction::Undefined {
                        break;
                    }
                    let pair = action.evaluate_raw(in_place, incoming);
                    if data == DataAction::Undefined {
                        data = pair.data;
                    }
                    if meta == MetaAction::Undefined {
                        meta = pair.meta;
                    }
                }
                ActionPair { data, meta }
            }
        }
    }
}

/// The `-n`/`-w`-style default: never overwrite anything already present.
pub fn default_preserve() -> Action
{
    Action::Const(ActionPair::new(DataAction::Preserve, MetaAction::Preserve))
}

/// The `-w`-unset default for a plain restore/merge: overwrite whatever is
/// in place with the incoming entry.
pub fn default_overwrite() -> Action
{
    Action::Const(ActionPair::new(DataAction::Overwrite, MetaAction::Overwrite))
}

/// `-am` ("only if newer"): overwrite only when the incoming entry is more
/// recent than what's already there.
pub fn overwrite_if_newer() -> Action
{
    Action::Testing(
        Criterion::IncomingMoreRecent,
        Box::new(default_overwrite()),
        Box::new(default_preserve()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::{Inode, SavedStatus, Symlink};
    use crate::datetime::DarDateTime;
    use crate::fsattr::{EaSavedStatus, FsaSavedStatus};

    fn link(name: &str, mtime_secs: i64) -> Entry
    {
        Entry::Symlink(Symlink {
            inode: Inode {
                name: name.to_string(), uid: 0, gid: 0, mode: 0,
                atime: DarDateTime::epoch(),
                mtime: DarDateTime::new(mtime_secs, 0, crate::datetime::TimeUnit::Second),
                ctime: DarDateTime::epoch(),
                saved: SavedStatus::Saved, ea_status: EaSavedStatus::None, fsa_status: FsaSavedStatus::None,
                ea: Vec::new(), fsa: Vec::new(), device_id: 0,
            },
            target: "x".to_string(),
        })
    }

    #[test]
    fn constant_action_ignores_entries()
    {
        let action = default_preserve();
        let mut ask = |_: &Entry, _: &Entry| unreachable!("constant action must never ask");
        let pair = action.evaluate(&link("a", 1), &link("b", 2), &mut ask).unwrap();
        assert_eq!(pair, ActionPair::new(DataAction::Preserve, MetaAction::Preserve));
    }

    #[test]
    fn testing_branches_on_recency()
    {
        let action = overwrite_if_newer();
        let mut ask = |_: &Entry, _: &Entry| unreachable!();
        let older_incoming = action.evaluate(&link("a", 100), &link("a", 50), &mut ask).unwrap();
        assert_eq!(older_incoming.data, DataAction::Preserve);
        let newer_incoming = action.evaluate(&link("a", 50), &link("a", 100), &mut ask).unwrap();
        assert_eq!(newer_incoming.data, DataAction::Overwrite);
    }

    #[test]
    fn chain_takes_first_defined_field_independently()
    {
        let chain = Action::Chain(vec![
            Action::Const(ActionPair::new(DataAction::Undefined, MetaAction::Clear)),
            Action::Const(ActionPair::new(DataAction::Remove, MetaAction::Overwrite)),
        ]);
        let mut ask = |_: &Entry, _: &Entry| unreachable!();
        let pair = chain.evaluate(&link("a", 1), &link("b", 2), &mut ask).unwrap();
        assert_eq!(pair, ActionPair::new(DataAction::Remove, MetaAction::Clear));
    }

    #[test]
    fn ask_is_invoked_only_when_requested()
    {
        let action = Action::Const(ActionPair::new(DataAction::Ask, MetaAction::Preserve));
        let mut calls = 0;
        let mut ask = |_: &Entry, _: &Entry| { calls += 1; ActionPair::new(DataAction::Overwrite, MetaAction::Preserve) };
        let pair = action.evaluate(&link("a", 1), &link("b", 2), &mut ask).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(pair.data, DataAction::Overwrite);
    }
}
