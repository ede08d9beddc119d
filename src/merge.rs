//! Merge walker (spec.md §4.11): combines two catalogues, and the data
//! they reference, into a third. Walks both [`Directory`] trees in
//! lockstep by name rather than through [`Catalog`]'s sequential
//! `read`/`compare` cursors (those are built for one tree against a
//! filesystem or a single reference, not two trees against each other),
//! the same "direct struct recursion where the sequential cursor doesn't
//! fit" choice `catalog::tree::Catalog::update_destroyed_with` makes.

use crate::archive::Archive;
use crate::catalog::entry::{Directory, Entry, Inode, PlainFile, SavedStatus};
use crate::catalog::Catalog;
use crate::channel::ByteChannel;
use crate::compress::CompressionAlgo;
use crate::crc::{width_for_size, CrcAccumulator};
use crate::error::DarError;
use crate::escape::MarkType;
use crate::logger::{EntryOutcome, Logger};
use crate::policy::{Action, ActionPair, DataAction};

/// Which side (if either) an entry in the merged tree was taken from;
/// `Neither` never appears in the result, it just drives which source
/// archive [`copy_file_content`] reads a `File`'s bytes back out of.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Side {
    A,
    B,
}

pub struct MergeOptions {
    /// Resolves same-path conflicts between the two inputs (spec.md
    /// §4.8/§4.11); consulted only when a name exists on both sides.
    pub action: Action,
    /// Decremental mode (spec.md §4.11): the result is `b`'s entries as
    /// deleted-markers plus `a`'s entries that are new or newer, instead
    /// of a conflict-resolved union.
    pub decremental: bool,
}

/// Copies one plain file's content from whichever source archive backs
/// it into `dest`'s body, returning a [`PlainFile`] with a fresh offset
/// into `dest` and the same recorded CRC (content is never
/// recompressed across the copy; re-compression per a `keep_compressed`
/// toggle is listed as future work, see DESIGN.md).
fn copy_file_content<SA: ByteChannel, SB: ByteChannel, D: ByteChannel>(
    side: Side,
    src_a: &mut Archive<SA>,
    src_b: &mut Archive<SB>,
    dest: &mut Archive<D>,
    f: &PlainFile,
) -> Result<PlainFile, DarError>
{
    let mut out = f.clone();
    let Some(offset) = f.offset else {
        return Ok(out);
    };

    let mut buf = vec![0u8; f.stored_size as usize];
    match side {
        Side::A => {
            src_a.body().skip(offset)?;
            crate::channel::read_exact(src_a.body(), &mut buf)?;
        }
        Side::B => {
            src_b.body().skip(offset)?;
            crate::channel::read_exact(src_b.body(), &mut buf)?;
        }
    }

    dest.body().flush_compressed_run()?;
    let new_offset = dest.body().current_position()?;
    dest.body().add_mark(MarkType::File)?;
    dest.body().write(&buf)?;
    dest.body().flush_compressed_run()?;

    out.offset = Some(new_offset);
    Ok(out)
}

/// Materialises one resolved entry into the destination tree, copying its
/// file content across if it carries any.
fn place<SA: ByteChannel, SB: ByteChannel, D: ByteChannel>(
    side: Side,
    entry: Entry,
    src_a: &mut Archive<SA>,
    src_b: &mut Archive<SB>,
    dest: &mut Archive<D>,
) -> Result<Entry, DarError>
{
    match entry {
        Entry::File(f) if f.offset.is_some() => {
            let copied = copy_file_content(side, src_a, src_b, dest, &f)?;
            Ok(Entry::File(copied))
        }
        other => Ok(other),
    }
}

fn merge_dir<SA: ByteChannel, SB: ByteChannel, D: ByteChannel>(
    a: &Directory,
    b: &Directory,
    opts: &MergeOptions,
    src_a: &mut Archive<SA>,
    src_b: &mut Archive<SB>,
    dest: &mut Archive<D>,
    logger: &mut Logger,
    ask: &mut dyn FnMut(&Entry, &Entry) -> ActionPair,
) -> Result<Directory, DarError>
{
    let mut out = Directory::new(a.inode().clone());
    let mut seen = std::collections::HashSet::new();

    for child_a in &a.children {
        let Some(name) = child_a.name() else { continue };
        seen.insert(name.to_string());

        match b.find(name) {
            Some(Entry::Directory(dir_b)) if child_a.is_directory() => {
                let Entry::Directory(dir_a) = child_a else { unreachable!() };
                let merged = merge_dir(dir_a, dir_b, opts, src_a, src_b, dest, logger, ask)?;
                out.push_child(Entry::Directory(merged));
                logger.note(EntryOutcome::Saved, name);
            }
            Some(other_b) => {
                let pair = opts.action.evaluate(child_a, other_b, ask)?;
                let keep_a = matches!(pair.data, DataAction::Preserve | DataAction::PreserveMarkAlreadySaved);
                let (side, winner) = if keep_a { (Side::A, child_a.clone()) } else { (Side::B, other_b.clone()) };
                let placed = place(side, winner, src_a, src_b, dest)?;
                out.push_child(placed);
                logger.note(EntryOutcome::Saved, name);
            }
            None => {
                let placed = place(Side::A, child_a.clone(), src_a, src_b, dest)?;
                out.push_child(placed);
                logger.note(EntryOutcome::Saved, name);
            }
        }
    }

    for child_b in &b.children {
        let Some(name) = child_b.name() else { continue };
        if seen.contains(name) {
            continue;
        }
        let placed = if let Entry::Directory(dir_b) = child_b {
            let empty_a = Directory::new(dir_b.inode().clone());
            Entry::Directory(merge_dir(&empty_a, dir_b, opts, src_a, src_b, dest, logger, ask)?)
        } else {
            place(Side::B, child_b.clone(), src_a, src_b, dest)?
        };
        out.push_child(placed);
        logger.note(EntryOutcome::Saved, name);
    }

    out.push_child(Entry::EndOfDirectory);
    Ok(out)
}

/// Decremental merge (spec.md §4.11): `b`'s entries become deleted-markers
/// (they are the older state being rolled back past) and `a`'s entries
/// survive only when they are new relative to `b`, or strictly newer.
fn decremental_dir(a: &Directory, b: &Directory, logger: &mut Logger) -> Directory
{
    let mut out = Directory::new(a.inode().clone());

    for child_b in &b.children {
        let Some(name) = child_b.name() else { continue };
        if let (Entry::Directory(dir_b), Some(Entry::Directory(dir_a))) = (child_b, a.find(name)) {
            out.push_child(Entry::Directory(decremental_dir(dir_a, dir_b, logger)));
            continue;
        }
        out.push_child(Entry::Deleted(crate::catalog::entry::DeletedMarker {
            name: name.to_string(),
            original_kind: child_b.kind_byte(),
        }));
        logger.note(EntryOutcome::Removed, name);
    }

    for child_a in &a.children {
        let Some(name) = child_a.name() else { continue };
        if child_a.is_directory() {
            continue; // directories are only ever reached via the b-side pairing above.
        }
        let newer_or_new = match b.find(name) {
            None => true,
            Some(existing) => match (existing.mtime(), child_a.mtime()) {
                (Some(old), Some(new)) => new > old,
                _ => false,
            },
        };
        if newer_or_new {
            out.push_child(child_a.clone());
            logger.note(EntryOutcome::Saved, name);
        }
    }

    out.push_child(Entry::EndOfDirectory);
    out
}

/// Runs the merge walker (spec.md §4.11) over two already-open archives,
/// writing the chosen entries' data into `dest` and returning the merged
/// catalogue; the caller still owns calling [`Archive::finish_create`] on
/// `dest` with it.
pub fn run_merge<SA: ByteChannel, SB: ByteChannel, D: ByteChannel>(
    src_a: &mut Archive<SA>,
    cat_a: &Catalog,
    src_b: &mut Archive<SB>,
    cat_b: &Catalog,
    dest: &mut Archive<D>,
    opts: &MergeOptions,
    logger: &mut Logger,
    ask: &mut dyn FnMut(&Entry, &Entry) -> ActionPair,
) -> Result<Catalog, DarError>
{
    let root = if opts.decremental {
        decremental_dir(cat_a.root(), cat_b.root(), logger)
    } else {
        merge_dir(cat_a.root(), cat_b.root(), opts, src_a, src_b, dest, logger, ask)?
    };
    Ok(Catalog::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime::DarDateTime;
    use crate::fsattr::{EaSavedStatus, FsaSavedStatus};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn inode(name: &str, mtime_secs: i64) -> Inode
    {
        Inode {
            name: name.to_string(), uid: 0, gid: 0, mode: 0o644,
            atime: DarDateTime::epoch(),
            mtime: DarDateTime::new(mtime_secs, 0, crate::datetime::TimeUnit::Second),
            ctime: DarDateTime::epoch(),
            saved: SavedStatus::Saved, ea_status: EaSavedStatus::None, fsa_status: FsaSavedStatus::None,
            ea: Vec::new(), fsa: Vec::new(), device_id: 0,
        }
    }

    struct MemChannel(Rc<RefCell<Cursor<Vec<u8>>>>);
    impl ByteChannel for MemChannel {
        fn mode(&self) -> crate::channel::ChannelMode { crate::channel::ChannelMode::ReadWrite }
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> { std::io::Read::read(&mut *self.0.borrow_mut(), buf) }
        fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
            use std::io::Write as _;
            let mut cur = self.0.borrow_mut();
            let pos = cur.position() as usize;
            if pos + buf.len() > cur.get_ref().len() {
                let new_len = pos + buf.len();
                cur.get_mut().resize(new_len, 0);
            }
            cur.write_all(buf)
        }
        fn skip(&mut self, absolute: u64) -> std::io::Result<()> { self.0.borrow_mut().set_position(absolute); Ok(()) }
        fn skip_to_eof(&mut self) -> std::io::Result<()> {
            let mut cur = self.0.borrow_mut();
            let l = cur.get_ref().len() as u64;
            cur.set_position(l);
            Ok(())
        }
        fn skip_relative(&mut self, delta: i64) -> std::io::Result<()> {
            let mut cur = self.0.borrow_mut();
            let p = (cur.position() as i64 + delta).max(0) as u64;
            cur.set_position(p);
            Ok(())
        }
        fn current_position(&mut self) -> std::io::Result<u64> { Ok(self.0.borrow().position()) }
        fn sync_write(&mut self) -> std::io::Result<()> { Ok(()) }
        fn terminate(&mut self) -> std::io::Result<()> { Ok(()) }
        fn skippable(&self, _d: crate::channel::SkipDirection, _a: u64) -> bool { true }
    }
    impl Clone for MemChannel {
        fn clone(&self) -> Self { MemChannel(self.0.clone()) }
    }

    fn new_archive(label: u8) -> Archive<MemChannel>
    {
        let backing = Rc::new(RefCell::new(Cursor::new(Vec::new())));
        crate::archive::create(
            MemChannel(backing),
            CompressionAlgo::None,
            crate::header::HeaderFlags::default(),
            "darc -+ test",
            [label; 16],
        ).unwrap()
    }

    #[test]
    fn only_in_one_side_passes_through_unchanged()
    {
        let mut src_a = new_archive(1);
        let mut src_b = new_archive(2);
        let mut dest = new_archive(3);

        let mut cat_a = Catalog::new(Directory::new(inode("", 0)));
        cat_a.add(Entry::Symlink(crate::catalog::entry::Symlink { inode: inode("only_a", 10), target: "x".into() }));
        cat_a.add(Entry::EndOfDirectory);

        let mut cat_b = Catalog::new(Directory::new(inode("", 0)));
        cat_b.add(Entry::EndOfDirectory);

        let opts = MergeOptions { action: crate::policy::default_overwrite(), decremental: false };
        let mut logger = Logger::new(0, None);
        let mut ask = |_: &Entry, _: &Entry| unreachable!("no conflicting names here");

        let merged = run_merge(&mut src_a, &cat_a, &mut src_b, &cat_b, &mut dest, &opts, &mut logger, &mut ask).unwrap();
        assert!(merged.root().find("only_a").is_some());
    }

    #[test]
    fn conflicting_name_resolved_by_policy()
    {
        let mut src_a = new_archive(1);
        let mut src_b = new_archive(2);
        let mut dest = new_archive(3);

        let mut cat_a = Catalog::new(Directory::new(inode("", 0)));
        cat_a.add(Entry::Symlink(crate::catalog::entry::Symlink { inode: inode("f", 10), target: "old".into() }));
        cat_a.add(Entry::EndOfDirectory);

        let mut cat_b = Catalog::new(Directory::new(inode("", 0)));
        cat_b.add(Entry::Symlink(crate::catalog::entry::Symlink { inode: inode("f", 20), target: "new".into() }));
        cat_b.add(Entry::EndOfDirectory);

        let opts = MergeOptions { action: crate::policy::overwrite_if_newer(), decremental: false };
        let mut logger = Logger::new(0, None);
        let mut ask = |_: &Entry, _: &Entry| unreachable!();

        let merged = run_merge(&mut src_a, &cat_a, &mut src_b, &cat_b, &mut dest, &opts, &mut logger, &mut ask).unwrap();
        match merged.root().find("f") {
            Some(Entry::Symlink(s)) => assert_eq!(s.target, "new"),
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn decremental_marks_b_deleted_and_keeps_a_new_entries()
    {
        let mut cat_a = Catalog::new(Directory::new(inode("", 0)));
        cat_a.add(Entry::Symlink(crate::catalog::entry::Symlink { inode: inode("fresh", 10), target: "x".into() }));
        cat_a.add(Entry::EndOfDirectory);

        let mut cat_b = Catalog::new(Directory::new(inode("", 0)));
        cat_b.add(Entry::Symlink(crate::catalog::entry::Symlink { inode: inode("gone", 5), target: "y".into() }));
        cat_b.add(Entry::EndOfDirectory);

        let mut src_a = new_archive(1);
        let mut src_b = new_archive(2);
        let mut dest = new_archive(3);
        let opts = MergeOptions { action: crate::policy::default_overwrite(), decremental: true };
        let mut logger = Logger::new(0, None);
        let mut ask = |_: &Entry, _: &Entry| unreachable!();

        let merged = run_merge(&mut src_a, &cat_a, &mut src_b, &cat_b, &mut dest, &opts, &mut logger, &mut ask).unwrap();
        assert!(matches!(merged.root().find("gone"), Some(Entry::Deleted(_))));
        assert!(matches!(merged.root().find("fresh"), Some(Entry::Symlink(_))));
    }
}
