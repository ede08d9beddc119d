//! The catalogue tree (spec.md §4.6): a root [`Directory`] plus the
//! traversal cursors the walkers drive it through. The real entries live
//! in [`Directory::children`]; everything here is bookkeeping over index
//! paths from the root, so that `add`/`read`/`compare` can all be small,
//! cheap, restartable cursors instead of a borrowed-reference iterator.

use std::io::{self, Read, Write};

use super::entry::{DeletedMarker, Directory, Entry};
use super::hardlink::LoadLinkMap;
use crate::path::DarPath;

/// The in-memory catalogue tree and its traversal cursors.
pub struct Catalog {
    root: Directory,
    add_cursor: Vec<usize>,
    read_path: Vec<usize>,
    read_pos: Vec<usize>,
    sub_read_floor: Option<usize>,
    sub_read_done: bool,
    compare_stack: Vec<Option<usize>>,
}

impl Catalog {
    pub fn new(root: Directory) -> Self
    {
        Self {
            root,
            add_cursor: Vec::new(),
            read_path: Vec::new(),
            read_pos: vec![0],
            sub_read_floor: None,
            sub_read_done: false,
            compare_stack: Vec::new(),
        }
    }

    pub fn root(&self) -> &Directory
    {
        &self.root
    }

    pub fn into_root(self) -> Directory
    {
        self.root
    }

    fn dir_at(&self, path: &[usize]) -> &Directory
    {
        let mut dir = &self.root;
        for &i in path {
            dir = match &dir.children[i] {
                Entry::Directory(d) => d,
                _ => panic!("catalogue index path does not resolve to a directory"),
            };
        }
        dir
    }

    // ---- add: sequential append, as the backup walker discovers entries ----

    /// Clears the add cursor, so the next [`Self::add`] appends at the
    /// root.
    pub fn reset_add(&mut self)
    {
        self.add_cursor.clear();
    }

    fn current_add_dir_mut(&mut self) -> &mut Directory
    {
        let mut dir = &mut self.root;
        for &i in &self.add_cursor {
            dir = match &mut dir.children[i] {
                Entry::Directory(d) => d,
                _ => panic!("catalogue add cursor does not resolve to a directory"),
            };
        }
        dir
    }

    /// Appends `entry` at the current add cursor. Pushing a [`Entry::Directory`]
    /// descends the cursor into it (subsequent adds become its children)
    /// until a matching [`Entry::EndOfDirectory`] is added, which pops back
    /// out to the parent — mirroring the depth-first recursion the backup
    /// walker itself performs.
    pub fn add(&mut self, entry: Entry)
    {
        if matches!(entry, Entry::EndOfDirectory) {
            self.add_cursor.pop();
            return;
        }
        let is_dir = entry.is_directory();
        let dir = self.current_add_dir_mut();
        dir.push_child(entry);
        if is_dir {
            let idx = dir.children.len() - 1;
            self.add_cursor.push(idx);
        }
    }

    // ---- read: sequential depth-first consumption, as the restore/merge
    // walkers and the dump code replay the tree ----

    pub fn reset_read(&mut self)
    {
        self.read_path.clear();
        self.read_pos = vec![0];
        self.sub_read_floor = None;
    }

    /// Returns the next entry in depth-first order. Directory entries are
    /// yielded with an empty `children` list (their children are the
    /// subsequent reads); every directory's children are terminated by an
    /// explicit [`Entry::EndOfDirectory`], including the implicit root
    /// directory's own children, by which point `read` returns `None`.
    pub fn read(&mut self) -> Option<Entry>
    {
        loop {
            let level = self.read_pos.len() - 1;
            let dir = self.dir_at(&self.read_path);
            let pos = self.read_pos[level];
            if pos >= dir.children.len() {
                if self.read_path.is_empty() {
                    return None;
                }
                self.read_path.pop();
                self.read_pos.pop();
                return Some(Entry::EndOfDirectory);
            }
            self.read_pos[level] += 1;
            match &dir.children[pos] {
                Entry::Directory(d) => {
                    let header = Entry::Directory(d.header_only());
                    self.read_path.push(pos);
                    self.read_pos.push(0);
                    return Some(header);
                }
                other => return Some(other.clone()),
            }
        }
    }

    /// Undoes the automatic descent `read` just performed for a directory
    /// entry it returned, so the walker can skip straight to that
    /// directory's sibling instead of visiting its children.
    pub fn skip_read_to_parent_dir(&mut self)
    {
        if self.read_pos.len() > 1 {
            self.read_path.pop();
            self.read_pos.pop();
        }
    }

    /// Restricts subsequent [`Self::sub_read`] calls to the subtree rooted
    /// at `path` (which must name a directory): the first `sub_read` call
    /// returns that directory's own entry (with the usual auto-descent),
    /// and the stream ends with the closing end-of-directory marker for it.
    pub fn reset_sub_read(&mut self, path: &DarPath) -> io::Result<()>
    {
        if path.components().is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "sub_read requires a non-root path"));
        }
        let mut indices = Vec::new();
        let mut dir = &self.root;
        for comp in path.components() {
            let idx = *dir
                .name_index
                .get(comp)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "sub_read path not found"))?;
            indices.push(idx);
            dir = match &dir.children[idx] {
                Entry::Directory(d) => d,
                _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "sub_read path is not a directory")),
            };
        }
        let target_idx = *indices.last().unwrap();
        indices.pop();
        let floor = indices.len();
        self.read_path = indices;
        self.read_pos = vec![0; floor + 1];
        self.read_pos[floor] = target_idx;
        self.sub_read_floor = Some(floor);
        self.sub_read_done = false;
        Ok(())
    }

    /// Yields the bracketed subtree set up by [`Self::reset_sub_read`]: the
    /// target directory's own entry, its descendants, and the matching
    /// end-of-directory marker that closes it — then `None`.
    pub fn sub_read(&mut self) -> Option<Entry>
    {
        let floor = self.sub_read_floor?;
        if self.sub_read_done {
            return None;
        }
        let entry = self.read()?;
        if matches!(entry, Entry::EndOfDirectory) && self.read_path.len() == floor {
            self.sub_read_done = true;
        }
        Some(entry)
    }

    // ---- direct lookup by full path ----

    pub fn direct_read(&self, path: &DarPath) -> Option<Entry>
    {
        let comps = path.components();
        if comps.is_empty() {
            return Some(Entry::Directory(self.root.clone()));
        }
        let mut dir = &self.root;
        for (i, comp) in comps.iter().enumerate() {
            let idx = *dir.name_index.get(comp)?;
            let child = &dir.children[idx];
            if i == comps.len() - 1 {
                return Some(child.clone());
            }
            match child {
                Entry::Directory(d) => dir = d,
                _ => return None,
            }
        }
        None
    }

    // ---- compare: differential-backup lookup against a reference catalogue ----

    pub fn reset_compare(&mut self)
    {
        self.compare_stack.clear();
    }

    fn compare_dir(&self) -> Option<&Directory>
    {
        let mut dir = &self.root;
        for slot in &self.compare_stack {
            match slot {
                Some(idx) => match &dir.children[*idx] {
                    Entry::Directory(d) => dir = d,
                    _ => return None,
                },
                None => return None,
            }
        }
        Some(dir)
    }

    /// Looks up `incoming_name` in this (reference) catalogue at the
    /// walker's current directory. `None` means "not present", including
    /// when an ancestor directory was itself missing from the reference —
    /// the walker can keep recursing without special-casing that.
    pub fn compare(&self, incoming_name: &str) -> Option<Entry>
    {
        self.compare_dir().and_then(|d| d.find(incoming_name)).cloned()
    }

    /// Descends the compare cursor into the subdirectory named `name`
    /// (called when the walker itself descends into a directory with that
    /// name). Records a missing ancestor, rather than erroring, if `name`
    /// wasn't a directory present at the current compare position.
    pub fn compare_descend(&mut self, name: &str)
    {
        let idx = self.compare_dir().and_then(|d| match d.find(name) {
            Some(Entry::Directory(_)) => d.name_index.get(name).copied(),
            _ => None,
        });
        self.compare_stack.push(idx);
    }

    pub fn compare_ascend(&mut self)
    {
        self.compare_stack.pop();
    }

    // ---- deletion-marker synthesis for differential archives ----

    /// Inserts a [`Entry::Deleted`] marker for every name present in
    /// `previous` but absent from `self`, recursing into directories that
    /// survive under the same name in both trees (spec.md §4.6).
    pub fn update_destroyed_with(&mut self, previous: &Catalog)
    {
        Self::sync_destroyed_dir(&mut self.root, &previous.root);
    }

    fn sync_destroyed_dir(cur: &mut Directory, prev: &Directory)
    {
        for prev_child in &prev.children {
            let name = match prev_child.name() {
                Some(n) => n,
                None => continue,
            };
            match cur.name_index.get(name).copied() {
                None => {
                    let original_kind = prev_child.kind_byte();
                    cur.push_child(Entry::Deleted(DeletedMarker { name: name.to_string(), original_kind }));
                }
                Some(idx) => {
                    if let Entry::Directory(prev_dir) = prev_child {
                        if let Entry::Directory(cur_dir) = &mut cur.children[idx] {
                            Self::sync_destroyed_dir(cur_dir, prev_dir);
                        }
                    }
                }
            }
        }
    }

    // ---- whole-tree dump/load ----

    pub fn dump<W: Write>(&self, w: &mut W) -> io::Result<()>
    {
        Entry::Directory(self.root.clone()).dump(w, false)
    }

    pub fn load<R: Read>(r: &mut R) -> io::Result<Self>
    {
        let entry = Entry::load(r, false)?;
        let mut root = match entry {
            Entry::Directory(d) => d,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "catalogue root is not a directory")),
        };
        let mut link_map = LoadLinkMap::new();
        Self::resolve_mirages(&mut root, &mut link_map);
        Ok(Self::new(root))
    }

    fn resolve_mirages(dir: &mut Directory, map: &mut LoadLinkMap)
    {
        for child in &mut dir.children {
            match child {
                Entry::Mirage(m) => {
                    if m.is_first {
                        map.register(m.etiquette, m.star.clone());
                    } else if let Some(star) = map.resolve(m.etiquette) {
                        m.star = star;
                    }
                }
                Entry::Directory(d) => Self::resolve_mirages(d, map),
                _ => {}
            }
        }
    }
}

impl Directory {
    /// A copy of this directory's own fields with an empty children list,
    /// used when the sequential reader yields a directory entry without
    /// eagerly cloning its whole subtree.
    fn header_only(&self) -> Directory
    {
        Directory {
            inode_opt: self.inode_opt.clone(),
            children: Vec::new(),
            name_index: std::collections::HashMap::new(),
            recursive_has_changed: self.recursive_has_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::{Inode, SavedStatus, Symlink};
    use crate::datetime::DarDateTime;
    use crate::fsattr::{EaSavedStatus, FsaSavedStatus};

    fn inode(name: &str) -> Inode
    {
        Inode {
            name: name.to_string(),
            uid: 0, gid: 0, mode: 0o644,
            atime: DarDateTime::epoch(), mtime: DarDateTime::epoch(), ctime: DarDateTime::epoch(),
            saved: SavedStatus::Saved,
            ea_status: EaSavedStatus::None,
            fsa_status: FsaSavedStatus::None,
            ea: Vec::new(), fsa: Vec::new(), device_id: 0,
        }
    }

    fn small_tree() -> Catalog
    {
        let mut catalog = Catalog::new(Directory::new(inode("")));
        catalog.reset_add();
        catalog.add(Entry::Directory(Directory::new(inode("etc"))));
        catalog.add(Entry::Symlink(Symlink { inode: inode("motd"), target: "/var/motd".to_string() }));
        catalog.add(Entry::EndOfDirectory); // close "etc"
        catalog.add(Entry::Symlink(Symlink { inode: inode("top-link"), target: "/dev/null".to_string() }));
        catalog
    }

    #[test]
    fn add_then_read_round_trips_depth_first_with_eod()
    {
        let mut catalog = small_tree();
        catalog.reset_read();
        let mut names = Vec::new();
        while let Some(entry) = catalog.read() {
            names.push(match &entry {
                Entry::EndOfDirectory => "<eod>".to_string(),
                other => other.name().unwrap_or("?").to_string(),
            });
        }
        assert_eq!(names, vec!["etc", "motd", "<eod>", "top-link", "<eod>"]);
    }

    #[test]
    fn direct_read_finds_nested_entry()
    {
        let catalog = small_tree();
        let found = catalog.direct_read(&DarPath::parse("/etc/motd"));
        assert!(matches!(found, Some(Entry::Symlink(_))));
    }

    #[test]
    fn update_destroyed_with_synthesises_deletion()
    {
        let previous = small_tree();
        let mut current = Catalog::new(Directory::new(inode("")));
        current.reset_add();
        current.add(Entry::Directory(Directory::new(inode("etc"))));
        current.add(Entry::EndOfDirectory); // "motd" is gone this time

        current.update_destroyed_with(&previous);

        let etc = current.root().find("etc").unwrap();
        let dir = match etc {
            Entry::Directory(d) => d,
            _ => panic!("expected directory"),
        };
        assert!(matches!(dir.find("motd"), Some(Entry::Deleted(_))));
        assert!(matches!(current.root().find("top-link"), Some(Entry::Deleted(_))));
    }

    #[test]
    fn sub_read_is_bracketed_by_target_and_its_closing_eod()
    {
        let mut catalog = small_tree();
        catalog.reset_sub_read(&DarPath::parse("/etc")).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = catalog.sub_read() {
            names.push(match &entry {
                Entry::EndOfDirectory => "<eod>".to_string(),
                other => other.name().unwrap_or("?").to_string(),
            });
        }
        assert_eq!(names, vec!["etc", "motd", "<eod>"]);
    }

    #[test]
    fn dump_load_round_trips_whole_tree()
    {
        let catalog = small_tree();
        let mut buf = Vec::new();
        catalog.dump(&mut buf).unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let loaded = Catalog::load(&mut cur).unwrap();
        assert!(matches!(loaded.root().find("etc"), Some(Entry::Directory(_))));
    }
}
