//! Backup walker (spec.md §4.9): walks a filesystem subtree with `walkdir`,
//! the same flat directory-stack traversal `examples/ShinyJonny-fsfill`
//! drives its own `filesys` passes with, and folds each entry into a
//! [`Catalog`] while streaming saved content through the archive's body.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::archive::{Archive, Lower};
use crate::catalog::entry::{DeltaSigRef, Device, Directory, Entry, Inode, PlainFile, SavedStatus, SharedPayload, Symlink};
use crate::catalog::{Catalog, ReadLinkMap};
use crate::channel::ByteChannel;
use crate::compress::CompressionAlgo;
use crate::crc::{width_for_size, Crc, CrcAccumulator};
use crate::datetime::{DarDateTime, TimeUnit};
use crate::delta::{self, FileSignature};
use crate::error::DarError;
use crate::escape::MarkType;
use crate::fsattr::{self, EaSavedStatus, FsaSavedStatus};
use crate::logger::{EntryOutcome, Logger};
use crate::mask::Mask;
use crate::path::DarPath;

/// Everything the backup walker needs beyond "where" and "into what".
/// The optional reference catalogue (`-A`) is passed separately to
/// [`run_backup`], since comparing against it needs `&mut` access.
pub struct BackupOptions {
    pub root: PathBuf,
    pub mask: Mask,
    pub record_excluded_dirs: bool,
    pub same_filesystem: bool,
    pub honour_nodump: bool,
    pub save_ea: bool,
    pub save_fsa: bool,
    /// Compute and store a rolling content signature alongside every saved
    /// file (spec.md §4.9's delta signatures), and, when a reference
    /// archive carries one for the same path, diff against it instead of
    /// resaving the whole file (spec.md §4.9's per-entry decision, third
    /// bullet).
    pub delta_sig: bool,
    /// Which files get compressed (spec.md §4.9's `-z`/`-Z` compression
    /// mask; `compr_mask` in the original): a name this mask doesn't match
    /// is saved uncompressed even when the archive as a whole is
    /// compressed. Defaults to [`Mask::All`] to compress everything.
    pub compr_mask: Mask,
    /// Never compress a file smaller than this many bytes (spec.md §4.9's
    /// `min_compr_size` in the original): the framing overhead of a
    /// compression run isn't worth paying below this size.
    pub min_compr_size: u64,
    /// Treat a directory tagged per the cache-directory-tagging standard
    /// (a `CACHEDIR.TAG` file with the standard signature) as excluded,
    /// the same as a directory a mask excludes (spec.md §4.9).
    pub cache_directory_tagging: bool,
}

fn mtime_of(meta: &std::fs::Metadata) -> DarDateTime
{
    DarDateTime::new(meta.mtime(), meta.mtime_nsec() as u32, TimeUnit::Nanosecond)
}

pub(crate) fn metadata_to_inode(name: &str, meta: &std::fs::Metadata) -> Inode
{
    Inode {
        name: name.to_string(),
        uid: meta.uid(),
        gid: meta.gid(),
        mode: (meta.mode() & 0xffff) as u16,
        atime: DarDateTime::new(meta.atime(), meta.atime_nsec() as u32, TimeUnit::Nanosecond),
        mtime: mtime_of(meta),
        ctime: DarDateTime::new(meta.ctime(), meta.ctime_nsec() as u32, TimeUnit::Nanosecond),
        saved: SavedStatus::Saved,
        ea_status: EaSavedStatus::None,
        fsa_status: FsaSavedStatus::None,
        ea: Vec::new(),
        fsa: Vec::new(),
        device_id: meta.dev(),
    }
}

fn attach_ea_fsa(inode: &mut Inode, path: &Path, opts: &BackupOptions) -> Result<(), DarError>
{
    if opts.save_ea {
        let ea = fsattr::read_ea(path)?;
        if !ea.is_empty() {
            inode.ea_status = EaSavedStatus::Full;
            inode.ea = ea;
        }
    }
    if opts.save_fsa {
        let fsa = fsattr::read_fsa(path, opts.honour_nodump)?;
        if !fsa.is_empty() {
            inode.fsa_status = FsaSavedStatus::Full;
            inode.fsa = fsa;
        }
    }
    Ok(())
}

fn dev_major_minor(rdev: u64) -> (u16, u16)
{
    (libc::major(rdev) as u16, libc::minor(rdev) as u16)
}

/// Copies a regular file's content into the archive body, bracketed by a
/// `File` mark and its own compression run (so the resulting `PlainFile`'s
/// `offset` is independently seekable for restore, per spec.md §4.1's
/// "skippable" contract). `compress` gates whether this particular run is
/// compressed at all (spec.md §4.9's compression mask/threshold): when
/// false, compression is suspended for the duration of the write and
/// resumed afterwards, so this file's bytes land literally while its
/// neighbours are unaffected.
fn save_file_content<C: ByteChannel>(archive: &mut Archive<C>, path: &Path, len: u64, compress: bool) -> Result<(u64, Crc), DarError>
{
    archive.body().flush_compressed_run()?;
    let offset = archive.body().current_position()?;
    archive.body().add_mark(MarkType::File)?;
    if !compress {
        archive.body().suspend_compression()?;
    }

    let mut file = File::open(path)?;
    let mut acc = CrcAccumulator::new(width_for_size(len));
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        acc.update(&buf[..n]);
        archive.body().write(&buf[..n])?;
    }
    archive.body().flush_compressed_run()?;
    if !compress {
        archive.body().resume_compression();
    }
    Ok((offset, acc.finish()))
}

/// Writes a rolling content signature into its own bracketed block (spec.md
/// §4.9: "signatures are written between dedicated escape marks and their
/// CRC is stored with the inode record"), returning the [`DeltaSigRef`]
/// the catalogue entry stores to locate it.
fn write_signature<C: ByteChannel>(archive: &mut Archive<C>, sig: &FileSignature) -> Result<DeltaSigRef, DarError>
{
    let mut buf = Vec::new();
    sig.write_to(&mut buf)?;

    archive.body().flush_compressed_run()?;
    let offset = archive.body().current_position()?;
    archive.body().add_mark(MarkType::DeltaSig)?;
    archive.body().write(&buf)?;
    archive.body().flush_compressed_run()?;

    Ok(DeltaSigRef { offset, size: buf.len() as u64, crc: delta::content_crc(&buf) })
}

/// Reads a [`DeltaSigRef`]-located block back out of a (possibly separate)
/// archive and parses it as a [`FileSignature`], verifying its CRC first.
fn read_signature<C: ByteChannel>(archive: &mut Archive<C>, sig_ref: &DeltaSigRef) -> Result<FileSignature, DarError>
{
    archive.body().skip(sig_ref.offset)?;
    let mut buf = vec![0u8; sig_ref.size as usize];
    crate::channel::read_exact(archive.body(), &mut buf)?;
    if delta::content_crc(&buf) != sig_ref.crc {
        return Err(DarError::range("delta signature CRC mismatch"));
    }
    Ok(FileSignature::read_from(&mut std::io::Cursor::new(buf))?)
}

/// The reference entry's own stored signature, if spec.md §4.9's delta
/// path is available for this file: the previous entry must be a plain
/// file carrying a `delta_sig` block, and a CRC to verify the base file
/// against before patching (its full-content CRC if it was a full save,
/// or its own result CRC if it was itself delta-saved).
fn reference_delta_source(entry: &Entry) -> Option<(DeltaSigRef, Crc)>
{
    match entry {
        Entry::File(f) => {
            let sig_ref = f.delta_sig.clone()?;
            let base_crc = f.content_crc.clone().or_else(|| f.result_crc.clone())?;
            Some((sig_ref, base_crc))
        }
        _ => None,
    }
}

/// Builds a delta-saved [`PlainFile`] by diffing `path`'s current content
/// against `ref_archive`'s stored signature for the same path, per
/// spec.md §4.9's third per-entry bullet. Writes the patch into `archive`
/// (the new content-bearing block for this entry) and, if `store_new_sig`
/// is set, a fresh signature of the just-read content for a future backup
/// to chain against.
#[allow(clippy::too_many_arguments)]
fn save_delta_patch<C: ByteChannel>(
    archive: &mut Archive<C>,
    ref_archive: &mut Archive<Lower>,
    path: &Path,
    sig_ref: &DeltaSigRef,
    base_crc: Crc,
    store_new_sig: bool,
    mut inode: Inode,
) -> Result<PlainFile, DarError>
{
    let base_sig = read_signature(ref_archive, sig_ref)?;
    let data = std::fs::read(path)?;
    let result_crc = delta::content_crc(&data);
    let patch = delta::diff(&base_sig, &data);

    let mut patch_bytes = Vec::new();
    patch.write_to(&mut patch_bytes)?;

    archive.body().flush_compressed_run()?;
    let offset = archive.body().current_position()?;
    archive.body().add_mark(MarkType::File)?;
    archive.body().write(&patch_bytes)?;
    archive.body().flush_compressed_run()?;

    let delta_sig = if store_new_sig {
        Some(write_signature(archive, &FileSignature::compute(&data))?)
    } else {
        None
    };

    inode.saved = SavedStatus::Delta;
    Ok(PlainFile {
        inode,
        uncompressed_size: data.len() as u64,
        offset: Some(offset),
        stored_size: patch_bytes.len() as u64,
        content_crc: None,
        compression: CompressionAlgo::None,
        sparse: false,
        dirty: false,
        delta_sig,
        base_crc: Some(base_crc),
        result_crc: Some(result_crc),
    })
}

#[allow(clippy::too_many_arguments)]
fn build_payload<C: ByteChannel>(
    archive: &mut Archive<C>,
    path: &Path,
    meta: &std::fs::Metadata,
    inode: Inode,
    compute_sig: bool,
    compr_mask: &Mask,
    min_compr_size: u64,
) -> Result<SharedPayload, DarError>
{
    let file_type = meta.file_type();
    if file_type.is_file() {
        let len = meta.len();
        let compress = compr_mask.matches_name(&inode.name) && len >= min_compr_size;
        let (offset, crc) = save_file_content(archive, path, len, compress)?;
        let delta_sig = if compute_sig {
            let data = std::fs::read(path)?;
            Some(write_signature(archive, &FileSignature::compute(&data))?)
        } else {
            None
        };
        Ok(SharedPayload::File(PlainFile {
            inode, uncompressed_size: len, offset: Some(offset), stored_size: len,
            content_crc: Some(crc), compression: CompressionAlgo::None, sparse: false,
            dirty: false, delta_sig, base_crc: None, result_crc: None,
        }))
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(path)?;
        Ok(SharedPayload::Symlink(Symlink { inode, target: target.to_string_lossy().into_owned() }))
    } else if file_type.is_char_device() {
        let (major, minor) = dev_major_minor(meta.rdev());
        Ok(SharedPayload::CharDevice(Device { inode, major, minor }))
    } else if file_type.is_block_device() {
        let (major, minor) = dev_major_minor(meta.rdev());
        Ok(SharedPayload::BlockDevice(Device { inode, major, minor }))
    } else if file_type.is_fifo() {
        Ok(SharedPayload::Pipe(inode))
    } else if file_type.is_socket() {
        Ok(SharedPayload::Socket(inode))
    } else {
        Err(DarError::feature(format!("{}: unsupported file type", path.display())))
    }
}

fn payload_to_entry(payload: SharedPayload) -> Entry
{
    match payload {
        SharedPayload::File(f) => Entry::File(f),
        SharedPayload::Symlink(s) => Entry::Symlink(s),
        SharedPayload::CharDevice(d) => Entry::CharDevice(d),
        SharedPayload::BlockDevice(d) => Entry::BlockDevice(d),
        SharedPayload::Pipe(i) => Entry::Pipe(i),
        SharedPayload::Socket(i) => Entry::Socket(i),
        SharedPayload::Door(i) => Entry::Door(i),
    }
}

/// Builds the lightweight entry recorded when content is skipped because
/// it is unchanged since the reference catalogue (spec.md §4.9): same
/// shape as a fresh save, but with no content/offset and `saved` set to
/// [`SavedStatus::NotSaved`].
fn minimal_not_saved_entry(path: &Path, meta: &std::fs::Metadata, inode: Inode) -> Entry
{
    let t = meta.file_type();
    if t.is_symlink() {
        let target = std::fs::read_link(path).unwrap_or_default();
        Entry::Symlink(Symlink { inode, target: target.to_string_lossy().into_owned() })
    } else if t.is_char_device() || t.is_block_device() {
        let (major, minor) = dev_major_minor(meta.rdev());
        if t.is_char_device() {
            Entry::CharDevice(Device { inode, major, minor })
        } else {
            Entry::BlockDevice(Device { inode, major, minor })
        }
    } else if t.is_fifo() {
        Entry::Pipe(inode)
    } else if t.is_socket() {
        Entry::Socket(inode)
    } else {
        Entry::File(PlainFile {
            inode, uncompressed_size: meta.len(), offset: None, stored_size: 0,
            content_crc: None, compression: CompressionAlgo::None, sparse: false,
            dirty: false, delta_sig: None, base_crc: None, result_crc: None,
        })
    }
}

fn entry_kind_matches(entry: &Entry, meta: &std::fs::Metadata) -> bool
{
    let t = meta.file_type();
    match entry {
        Entry::File(_) => t.is_file(),
        Entry::Symlink(_) => t.is_symlink(),
        Entry::CharDevice(_) => t.is_char_device(),
        Entry::BlockDevice(_) => t.is_block_device(),
        Entry::Pipe(_) => t.is_fifo(),
        Entry::Socket(_) => t.is_socket(),
        Entry::Mirage(m) => match &m.star.borrow().payload {
            SharedPayload::File(_) => t.is_file(),
            SharedPayload::Symlink(_) => t.is_symlink(),
            SharedPayload::CharDevice(_) => t.is_char_device(),
            SharedPayload::BlockDevice(_) => t.is_block_device(),
            SharedPayload::Pipe(_) => t.is_fifo(),
            SharedPayload::Socket(_) => t.is_socket(),
            SharedPayload::Door(_) => false,
        },
        _ => false,
    }
}

/// Walks `opts.root`, appending every discovered entry to a fresh
/// [`Catalog`], streaming saved content into `archive`'s body, and logging
/// each entry's outcome. `reference` (spec.md §4.9's `-A`) is consulted to
/// skip unchanged content and, at the end, to synthesise
/// [`Entry::Deleted`] markers for names that vanished. `reference_archive`
/// is the same `-A` archive's still-open byte stream, consulted only when
/// `opts.delta_sig` is set and a candidate file's reference entry carries
/// a stored signature (spec.md §4.9's delta path); hard-linked files are
/// never delta-diffed, to keep the read-side hard-link map's one
/// first-occurrence-writes-the-payload invariant simple. Returns the built
/// catalogue; the caller calls [`Archive::finish_create`] with it.
pub fn run_backup<C: ByteChannel>(
    archive: &mut Archive<C>,
    opts: &BackupOptions,
    mut reference: Option<&mut Catalog>,
    mut reference_archive: Option<&mut Archive<Lower>>,
    logger: &mut Logger,
) -> Result<Catalog, DarError>
{
    let root_meta = std::fs::symlink_metadata(&opts.root)?;
    let root_device = root_meta.dev();
    let root_inode = metadata_to_inode("", &root_meta);
    let mut catalog = Catalog::new(Directory::new(root_inode));

    if let Some(r) = reference.as_mut() {
        r.reset_compare();
    }

    let mut read_links = ReadLinkMap::new();
    let mut open_depths: Vec<usize> = Vec::new();

    let mut it = WalkDir::new(&opts.root).follow_links(false).into_iter();
    while let Some(walked) = it.next() {
        let walked = match walked {
            Ok(e) => e,
            Err(e) => {
                logger.note(EntryOutcome::Errored, &e.to_string());
                continue;
            }
        };
        let depth = walked.depth();

        while let Some(&last) = open_depths.last() {
            if depth <= last {
                catalog.add(Entry::EndOfDirectory);
                open_depths.pop();
                if let Some(r) = reference.as_mut() {
                    r.compare_ascend();
                }
            } else {
                break;
            }
        }

        if depth == 0 {
            continue;
        }

        let path = walked.path();
        let name = walked.file_name().to_string_lossy().into_owned();
        let rel = DarPath::parse(&path.strip_prefix(&opts.root).unwrap_or(path).to_string_lossy());

        let is_dir = walked.file_type().is_dir();
        let cache_tagged = is_dir && opts.cache_directory_tagging && fsattr::is_cache_tagged_directory(path);
        let excluded = opts.mask.matches_name(&name) || opts.mask.matches_path(&rel) || cache_tagged;

        if excluded {
            if is_dir {
                if opts.record_excluded_dirs {
                    catalog.add(Entry::IgnoredDirectory(name));
                }
                it.skip_current_dir();
            } else {
                catalog.add(Entry::Ignored(name));
            }
            logger.note(EntryOutcome::SkippedByFilter, &rel.to_string());
            continue;
        }

        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                logger.note(EntryOutcome::Errored, &format!("{}: {}", rel, e));
                continue;
            }
        };

        if is_dir && opts.same_filesystem && meta.dev() != root_device {
            catalog.add(Entry::IgnoredDirectory(name));
            logger.note(EntryOutcome::SkippedByFilter, &rel.to_string());
            it.skip_current_dir();
            continue;
        }

        if fsattr::should_skip_for_nodump(path, opts.honour_nodump) {
            catalog.add(Entry::Ignored(name));
            logger.note(EntryOutcome::SkippedByFilter, &rel.to_string());
            continue;
        }

        if is_dir {
            let mut inode = metadata_to_inode(&name, &meta);
            if let Err(e) = attach_ea_fsa(&mut inode, path, opts) {
                logger.note(EntryOutcome::Errored, &format!("{}: {}", rel, e));
            }
            catalog.add(Entry::Directory(Directory::new(inode)));
            open_depths.push(depth);
            if let Some(r) = reference.as_mut() {
                r.compare_descend(&name);
            }
            logger.note(EntryOutcome::Saved, &rel.to_string());
            continue;
        }

        let prev_entry = reference.as_deref().and_then(|r| r.compare(&name));
        let unchanged = prev_entry.as_ref().map_or(false, |prev| {
            entry_kind_matches(prev, &meta) && prev.mtime() == Some(mtime_of(&meta))
        });

        let mut inode = metadata_to_inode(&name, &meta);
        if let Err(e) = attach_ea_fsa(&mut inode, path, opts) {
            logger.note(EntryOutcome::Errored, &format!("{}: {}", rel, e));
        }

        if unchanged {
            inode.saved = SavedStatus::NotSaved;
            catalog.add(minimal_not_saved_entry(path, &meta, inode));
            logger.note(EntryOutcome::NotChanged, &rel.to_string());
            continue;
        }

        let nlink = meta.nlink() as u32;
        if nlink > 1 {
            if let Some((star, etiquette)) = read_links.lookup(meta.dev(), meta.ino()) {
                catalog.add(Entry::Mirage(crate::catalog::entry::Mirage { name, etiquette, star, is_first: false }));
                logger.note(EntryOutcome::Saved, &rel.to_string());
                continue;
            }
            match build_payload(archive, path, &meta, inode, opts.delta_sig, &opts.compr_mask, opts.min_compr_size) {
                Ok(payload) => {
                    let (star, etiquette) = read_links.register_first(meta.dev(), meta.ino(), nlink, payload);
                    catalog.add(Entry::Mirage(crate::catalog::entry::Mirage { name, etiquette, star, is_first: true }));
                    logger.note(EntryOutcome::Saved, &rel.to_string());
                }
                Err(e) => logger.note(EntryOutcome::Errored, &format!("{}: {}", rel, e)),
            }
            continue;
        }

        let delta_source = if opts.delta_sig && meta.file_type().is_file() {
            prev_entry.as_ref().and_then(reference_delta_source)
        } else {
            None
        };

        let result = match (delta_source, reference_archive.as_deref_mut()) {
            (Some((sig_ref, base_crc)), Some(ref_archive)) => {
                save_delta_patch(archive, ref_archive, path, &sig_ref, base_crc, opts.delta_sig, inode)
                    .map(Entry::File)
            }
            _ => build_payload(archive, path, &meta, inode, opts.delta_sig, &opts.compr_mask, opts.min_compr_size).map(payload_to_entry),
        };
        match result {
            Ok(entry) => {
                catalog.add(entry);
                logger.note(EntryOutcome::Saved, &rel.to_string());
            }
            Err(e) => logger.note(EntryOutcome::Errored, &format!("{}: {}", rel, e)),
        }
    }

    while open_depths.pop().is_some() {
        catalog.add(Entry::EndOfDirectory);
    }

    if let Some(r) = reference.as_deref() {
        catalog.update_destroyed_with(r);
    }

    Ok(catalog)
}

/// Options for [`run_diff`] (spec.md §1's "comparison ... against the
/// filesystem"): same root/mask shape as a backup, but nothing is written
/// anywhere — every entry is only ever compared, never saved.
pub struct DiffOptions {
    pub root: PathBuf,
    pub mask: Mask,
}

/// Walks `opts.root` exactly as [`run_backup`] does, but against `catalog`
/// purely as a read-only comparison: nothing is archived. Reuses
/// [`Catalog::compare`]/`compare_descend`/`compare_ascend`, the same
/// differential-backup lookup cursor `run_backup` drives its `-A`
/// reference catalogue with, reappropriated here as the sole source of
/// truth rather than a fallback. Outcomes are folded into `logger`'s
/// existing categories: [`EntryOutcome::NotChanged`] for an identical
/// match, [`EntryOutcome::Saved`] for a type/size/mtime mismatch (what a
/// backup would re-save), [`EntryOutcome::Errored`] for an entry on one
/// side only.
pub fn run_diff(opts: &DiffOptions, catalog: &mut Catalog, logger: &mut Logger) -> Result<(), DarError>
{
    catalog.reset_compare();

    let mut open_depths: Vec<usize> = Vec::new();
    let mut it = WalkDir::new(&opts.root).follow_links(false).into_iter();
    while let Some(walked) = it.next() {
        let walked = match walked {
            Ok(e) => e,
            Err(e) => {
                logger.note(EntryOutcome::Errored, &e.to_string());
                continue;
            }
        };
        let depth = walked.depth();

        while let Some(&last) = open_depths.last() {
            if depth <= last {
                open_depths.pop();
                catalog.compare_ascend();
            } else {
                break;
            }
        }

        if depth == 0 {
            continue;
        }

        let path = walked.path();
        let name = walked.file_name().to_string_lossy().into_owned();
        let rel = DarPath::parse(&path.strip_prefix(&opts.root).unwrap_or(path).to_string_lossy());

        if opts.mask.matches_name(&name) || opts.mask.matches_path(&rel) {
            if walked.file_type().is_dir() {
                it.skip_current_dir();
            }
            logger.note(EntryOutcome::SkippedByFilter, &rel.to_string());
            continue;
        }

        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                logger.note(EntryOutcome::Errored, &format!("{}: {}", rel, e));
                continue;
            }
        };

        let reference = catalog.compare(&name);

        if walked.file_type().is_dir() {
            match &reference {
                Some(e) if e.is_directory() => logger.note(EntryOutcome::NotChanged, &rel.to_string()),
                Some(_) => logger.note(EntryOutcome::Saved, &rel.to_string()),
                None => logger.note(EntryOutcome::Errored, &rel.to_string()),
            }
            open_depths.push(depth);
            catalog.compare_descend(&name);
            continue;
        }

        match reference {
            Some(e) if entry_kind_matches(&e, &meta) && e.mtime() == Some(mtime_of(&meta)) => {
                logger.note(EntryOutcome::NotChanged, &rel.to_string());
            }
            Some(_) => logger.note(EntryOutcome::Saved, &rel.to_string()),
            None => logger.note(EntryOutcome::Errored, &rel.to_string()),
        }
    }

    while open_depths.pop().is_some() {
        catalog.compare_ascend();
    }

    Ok(())
}
