//! Catalogue: the in-memory tree of archived entries (spec.md §3, §4.6)
//! plus its hard-link bookkeeping (spec.md §4.7).

pub mod entry;
pub mod hardlink;
pub mod tree;

pub use entry::{
    DeletedMarker, Device, Directory, Entry, Inode, Mirage, PlainFile, SavedStatus,
    SharedPayload, Star, Symlink,
};
pub use hardlink::{LoadLinkMap, ReadLinkMap, WriteLinkMap};
pub use tree::Catalog;
