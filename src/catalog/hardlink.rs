//! Hard-link maps (spec.md §4.7): the read-side map (filesystem → catalogue),
//! keyed by `(device, inode)`, and the write-side map (catalogue →
//! filesystem), keyed by an archive-local etiquette integer. A third,
//! load-side map resolves etiquettes back to stars while parsing an
//! existing archive's catalogue.

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;

use super::entry::{SharedPayload, Star};

/// Read side: as the backup walker discovers filesystem entries, every
/// `(device, inode)` pair with `nlink > 1` is tracked here so that only
/// the first occurrence gets a real inode entry; the rest become mirages
/// sharing its star.
#[derive(Default)]
pub struct ReadLinkMap {
    by_dev_inode: HashMap<(u64, u64), (Rc<RefCell<Star>>, u64, u32)>,
    next_etiquette: u64,
}

impl ReadLinkMap {
    pub fn new() -> Self
    {
        Self { by_dev_inode: HashMap::new(), next_etiquette: 1 }
    }

    /// Called once per filesystem entry with `nlink > 1`. Returns
    /// `Some(star, etiquette)` if this `(dev, inode)` was already seen
    /// (the caller should emit a mirage pointing at it); `None` means the
    /// caller owns the first occurrence and should register it with
    /// [`Self::register_first`].
    pub fn lookup(&mut self, dev: u64, inode: u64) -> Option<(Rc<RefCell<Star>>, u64)>
    {
        if let Some((star, etiquette, remaining)) = self.by_dev_inode.get_mut(&(dev, inode)) {
            let result = (star.clone(), *etiquette);
            *remaining -= 1;
            star.borrow_mut().refcount -= 1;
            if *remaining == 0 {
                self.by_dev_inode.remove(&(dev, inode));
            }
            return Some(result);
        }
        None
    }

    /// Registers the first occurrence of a hard-linked inode: `nlink-1`
    /// more mirages are still expected.
    pub fn register_first(&mut self, dev: u64, inode: u64, nlink: u32, payload: SharedPayload) -> (Rc<RefCell<Star>>, u64)
    {
        let etiquette = self.next_etiquette;
        self.next_etiquette += 1;
        let star = Rc::new(RefCell::new(Star { refcount: nlink.saturating_sub(1), payload, materialised_path: None }));
        if nlink > 1 {
            self.by_dev_inode.insert((dev, inode), (star.clone(), etiquette, nlink - 1));
        }
        (star, etiquette)
    }
}

/// Write side: as the restore (or merge) walker materialises mirages onto
/// a target filesystem, the first mirage for a given etiquette creates the
/// real inode and records its path; later mirages for the same etiquette
/// hard-link to that path, falling back to duplicating the inode with a
/// warning if `link()` fails (spec.md §4.7).
#[derive(Default)]
pub struct WriteLinkMap {
    by_etiquette: HashMap<u64, std::path::PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// This etiquette's inode has not been materialised yet; caller
    /// should create it and call [`WriteLinkMap::record`].
    MustCreate,
    /// Already materialised; caller should `link()` to the recorded path.
    Linkable,
}

impl WriteLinkMap {
    pub fn new() -> Self
    {
        Self { by_etiquette: HashMap::new() }
    }

    pub fn outcome(&self, etiquette: u64) -> LinkOutcome
    {
        if self.by_etiquette.contains_key(&etiquette) {
            LinkOutcome::Linkable
        } else {
            LinkOutcome::MustCreate
        }
    }

    pub fn record(&mut self, etiquette: u64, path: std::path::PathBuf)
    {
        self.by_etiquette.insert(etiquette, path);
    }

    pub fn path_for(&self, etiquette: u64) -> Option<&std::path::Path>
    {
        self.by_etiquette.get(&etiquette).map(|p| p.as_path())
    }
}

/// Load side: while parsing an on-disk catalogue, the first mirage for an
/// etiquette carries the real `Star`; subsequent mirages only carry the
/// etiquette integer and must be patched up to point at the same `Star`
/// (and have its refcount bumped) rather than the placeholder
/// `Entry::load` invents for them.
#[derive(Default)]
pub struct LoadLinkMap {
    by_etiquette: HashMap<u64, Rc<RefCell<Star>>>,
}

impl LoadLinkMap {
    pub fn new() -> Self
    {
        Self { by_etiquette: HashMap::new() }
    }

    pub fn register(&mut self, etiquette: u64, star: Rc<RefCell<Star>>)
    {
        self.by_etiquette.insert(etiquette, star);
    }

    pub fn resolve(&mut self, etiquette: u64) -> Option<Rc<RefCell<Star>>>
    {
        let star = self.by_etiquette.get(&etiquette)?.clone();
        star.borrow_mut().refcount += 1;
        Some(star)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::{Inode, SavedStatus};
    use crate::datetime::DarDateTime;
    use crate::fsattr::{EaSavedStatus, FsaSavedStatus};

    fn dummy_payload() -> SharedPayload
    {
        SharedPayload::Pipe(Inode {
            name: "p".to_string(), uid: 0, gid: 0, mode: 0,
            atime: DarDateTime::epoch(), mtime: DarDateTime::epoch(), ctime: DarDateTime::epoch(),
            saved: SavedStatus::Saved, ea_status: EaSavedStatus::None, fsa_status: FsaSavedStatus::None,
            ea: Vec::new(), fsa: Vec::new(), device_id: 1,
        })
    }

    #[test]
    fn read_side_shares_star_across_all_mirages_and_self_destructs()
    {
        let mut map = ReadLinkMap::new();
        assert!(map.lookup(5, 100).is_none());
        let (star, etiquette) = map.register_first(5, 100, 3, dummy_payload());
        assert_eq!(star.borrow().refcount, 2);

        let (star2, et2) = map.lookup(5, 100).unwrap();
        assert_eq!(et2, etiquette);
        assert_eq!(star2.borrow().refcount, 1);
        assert!(Rc::ptr_eq(&star, &star2));

        let (_star3, _et3) = map.lookup(5, 100).unwrap();
        // Refcount has dropped to zero and the key is gone.
        assert!(map.lookup(5, 100).is_none());
    }

    #[test]
    fn write_side_tracks_first_vs_linkable()
    {
        let mut map = WriteLinkMap::new();
        assert_eq!(map.outcome(7), LinkOutcome::MustCreate);
        map.record(7, std::path::PathBuf::from("/tmp/a"));
        assert_eq!(map.outcome(7), LinkOutcome::Linkable);
        assert_eq!(map.path_for(7), Some(std::path::Path::new("/tmp/a")));
    }

    #[test]
    fn load_side_resolves_and_bumps_refcount()
    {
        let mut map = LoadLinkMap::new();
        let star = Rc::new(RefCell::new(Star { refcount: 1, payload: dummy_payload(), materialised_path: None }));
        map.register(42, star.clone());
        let resolved = map.resolve(42).unwrap();
        assert!(Rc::ptr_eq(&star, &resolved));
        assert_eq!(resolved.borrow().refcount, 2);
    }
}
