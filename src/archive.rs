//! Archive façade (spec.md §4.12): assembles the byte-stream stack — slice
//! manager, optional cipher, compressor, escape framing — into the single
//! `create`/`open` entry points the walkers and the CLI drive, and owns
//! the leading-header / tail-catalogue / trailer bracketing that every
//! archive carries.
//!
//! Grounded on `examples/ShinyJonny-fsfill`'s own layering idiom (each
//! pass wraps the previous one's `Context`/channel rather than the caller
//! assembling raw `File`s itself) generalised from one fixed layer to a
//! stack whose shape (cipher present or not) is chosen at open/create time.

use std::io::{self, Read, Write};

use crate::catalog::Catalog;
use crate::channel::{read_exact, ByteChannel, ChannelMode, SkipDirection};
use crate::cipher::CipherChannel;
use crate::compress::CompressionChannel;
pub use crate::compress::CompressionAlgo;
use crate::error::DarError;
use crate::escape::{EscapeChannel, MarkType};
pub use crate::header::HeaderFlags;
use crate::header::{ArchiveHeader, ArchiveTrailer, CatalogueHeader};
use crate::number::Infinint;
use crate::slice::{SliceConfig, SliceManager};

/// Adapts a `&mut dyn ByteChannel` to `std::io::Write`, for the
/// `Read`/`Write`-generic wire-format code (`ArchiveHeader`, `Catalog`,
/// entry dumps) to run directly over an archive-stack layer.
struct ChannelWriter<'a, C: ByteChannel + ?Sized>(&'a mut C);

impl<'a, C: ByteChannel + ?Sized> Write for ChannelWriter<'a, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>
    {
        self.0.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()>
    {
        self.0.sync_write()
    }
}

struct ChannelReader<'a, C: ByteChannel + ?Sized>(&'a mut C);

impl<'a, C: ByteChannel + ?Sized> Read for ChannelReader<'a, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        self.0.read(buf)
    }
}

/// The compressed, escape-framed body of an archive: every layer above
/// the raw slice/cipher channel, kept concrete (not `Box<dyn ByteChannel>`)
/// so callers can still reach `CompressionChannel`'s and `EscapeChannel`'s
/// own inherent methods (`flush_write`, `add_mark_at_current_position`,
/// ...) that don't belong on the `ByteChannel` trait itself.
pub struct ArchiveStack<C: ByteChannel> {
    escape: EscapeChannel<CompressionChannel<C>>,
}

impl<C: ByteChannel> ArchiveStack<C> {
    pub fn new(inner: C, algo: CompressionAlgo, mode: ChannelMode) -> Self
    {
        let compression = CompressionChannel::new(inner, algo, mode);
        Self { escape: EscapeChannel::new(compression, mode) }
    }

    pub fn add_mark(&mut self, mark: MarkType) -> io::Result<()>
    {
        self.escape.add_mark_at_current_position(mark)
    }

    pub fn next_is_mark(&mut self, mark: MarkType) -> io::Result<bool>
    {
        self.escape.next_to_read_is_mark(mark)
    }

    /// Consumes tokens forward until `mark` is found (returning `true`) or
    /// the stream runs out (`false`) — the sequential fallback spec.md
    /// §4.12 describes for locating the tail catalogue.
    pub fn skip_to_mark(&mut self, mark: MarkType) -> io::Result<bool>
    {
        self.escape.skip_to_next_mark(mark, true)
    }

    /// Ends the current compression run, so whatever is written next
    /// starts a fresh, independently seekable frame (mirrors
    /// `CipherChannel`'s per-block independence: each file gets its own
    /// frame so `skip` can land on it without decompressing its neighbours).
    pub fn flush_compressed_run(&mut self) -> io::Result<()>
    {
        self.escape.inner_mut().flush_write()
    }

    pub fn suspend_compression(&mut self) -> io::Result<()>
    {
        self.escape.inner_mut().suspend_compression()
    }

    pub fn resume_compression(&mut self)
    {
        self.escape.inner_mut().resume_compression()
    }
}

impl<C: ByteChannel> ByteChannel for ArchiveStack<C> {
    fn mode(&self) -> ChannelMode
    {
        self.escape.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        self.escape.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        self.escape.write(buf)
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        self.escape.skip(absolute)
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        self.escape.skip_to_eof()
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        self.escape.skip_relative(delta)
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        self.escape.current_position()
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        self.escape.sync_write()
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        self.escape.terminate()
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool
    {
        self.escape.skippable(direction, amount)
    }
}

/// The disk-backed bottom of the stack: a slice manager, optionally
/// wrapped in a cipher layer. Kept as a closed enum rather than
/// `Box<dyn ByteChannel>` so the common on-disk case still dispatches
/// statically through `ArchiveStack`.
pub enum Lower {
    Plain(SliceManager<'static>),
    Ciphered(CipherChannel<SliceManager<'static>>),
}

impl ByteChannel for Lower {
    fn mode(&self) -> ChannelMode
    {
        match self {
            Lower::Plain(c) => c.mode(),
            Lower::Ciphered(c) => c.mode(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        match self {
            Lower::Plain(c) => c.read(buf),
            Lower::Ciphered(c) => c.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        match self {
            Lower::Plain(c) => c.write(buf),
            Lower::Ciphered(c) => c.write(buf),
        }
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        match self {
            Lower::Plain(c) => c.skip(absolute),
            Lower::Ciphered(c) => c.skip(absolute),
        }
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        match self {
            Lower::Plain(c) => c.skip_to_eof(),
            Lower::Ciphered(c) => c.skip_to_eof(),
        }
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        match self {
            Lower::Plain(c) => c.skip_relative(delta),
            Lower::Ciphered(c) => c.skip_relative(delta),
        }
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        match self {
            Lower::Plain(c) => c.current_position(),
            Lower::Ciphered(c) => c.current_position(),
        }
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        match self {
            Lower::Plain(c) => c.sync_write(),
            Lower::Ciphered(c) => c.sync_write(),
        }
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        match self {
            Lower::Plain(c) => c.terminate(),
            Lower::Ciphered(c) => c.terminate(),
        }
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool
    {
        match self {
            Lower::Plain(c) => c.skippable(direction, amount),
            Lower::Ciphered(c) => c.skippable(direction, amount),
        }
    }
}

/// An open archive: the assembled stack plus the parsed/constructed
/// leading header and the 16-byte label every slice and the tail
/// catalogue are checked against.
pub struct Archive<C: ByteChannel> {
    pub header: ArchiveHeader,
    pub label: [u8; 16],
    stack: ArchiveStack<C>,
}

impl<C: ByteChannel> Archive<C> {
    pub fn body(&mut self) -> &mut ArchiveStack<C>
    {
        &mut self.stack
    }

    /// Writes the tail catalogue and trailer and terminates every layer,
    /// in the order spec.md §4.12/§5 require (tail catalogue strictly
    /// last before the trailer, layers terminated top-down).
    pub fn finish_create(mut self, catalog: &Catalog) -> Result<(), DarError>
    {
        self.stack.flush_compressed_run()?;
        let catalogue_offset = self.stack.current_position()?;
        self.stack.add_mark(MarkType::Catalogue)?;
        let catalogue_header = CatalogueHeader { internal_label: self.label };
        catalogue_header.write_to(&mut ChannelWriter(&mut self.stack))?;
        catalog.dump(&mut ChannelWriter(&mut self.stack))?;
        self.stack.flush_compressed_run()?;

        let total_length = self.stack.current_position()?;
        let trailer = ArchiveTrailer {
            catalogue_offset: Infinint::from(catalogue_offset),
            total_length,
        };
        trailer.write_to(&mut ChannelWriter(&mut self.stack))?;
        self.stack.flush_compressed_run()?;
        self.stack.terminate()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), DarError>
    {
        self.stack.terminate()?;
        Ok(())
    }
}

/// Parameters for creating a fresh archive (spec.md §4.12, §6).
pub struct CreateOptions {
    pub slice_config: SliceConfig,
    pub compression: CompressionAlgo,
    pub password: Option<String>,
    pub provenance: String,
    pub flags: HeaderFlags,
    pub label: [u8; 16],
}

/// Parameters for opening an existing archive.
pub struct OpenOptions {
    pub slice_config: SliceConfig,
    pub password: Option<String>,
}

fn make_lower(slice_config: SliceConfig, password: Option<&str>, mode: ChannelMode) -> Result<Lower, DarError>
{
    let manager = SliceManager::new_sliced(slice_config, mode);
    Ok(match password {
        Some(pw) => Lower::Ciphered(CipherChannel::new(manager, pw.as_bytes(), mode)?),
        None => Lower::Plain(manager),
    })
}

pub fn create_on_disk(opts: CreateOptions) -> Result<Archive<Lower>, DarError>
{
    let lower = make_lower(opts.slice_config, opts.password.as_deref(), ChannelMode::WriteOnly)?;
    create(lower, opts.compression, opts.flags, opts.provenance, opts.label)
}

pub fn open_on_disk(opts: OpenOptions) -> Result<(Archive<Lower>, Catalog), DarError>
{
    let lower = make_lower(opts.slice_config, opts.password.as_deref(), ChannelMode::ReadOnly)?;
    open(lower)
}

/// Writes the leading header (plain, outside compression) then assembles
/// the compressed/escaped body, marking the start of the data region with
/// a `DataName` mark carrying the archive's label.
pub fn create<C: ByteChannel>(
    mut lower: C,
    compression: CompressionAlgo,
    mut flags: HeaderFlags,
    provenance: impl Into<String>,
    label: [u8; 16],
) -> Result<Archive<C>, DarError>
{
    // Random slice-based seeking never locates the tail catalogue in this
    // implementation (see `open` below) — every archive is effectively
    // sequential, so the flag is always set rather than left to the caller.
    flags.sequential_marks_present = true;
    let header = ArchiveHeader::new(compression, flags, provenance);
    header.write_to(&mut ChannelWriter(&mut lower))?;

    let mut stack = ArchiveStack::new(lower, compression, ChannelMode::WriteOnly);
    stack.add_mark(MarkType::DataName)?;
    stack.write(&label)?;
    stack.flush_compressed_run()?;

    Ok(Archive { header, label, stack })
}

/// Opens an archive and locates its tail catalogue.
///
/// This implementation never attempts the trailer-based "seek from EOF"
/// fast path `ArchiveTrailer`'s doc comment describes: `total_length` is
/// the archive's total length, not the trailer's own byte width, so
/// backing up a fixed amount from EOF only ever recovers `total_length`
/// itself, never where the preceding variable-width `catalogue_offset`
/// begins. Every open instead forward-scans for the `Catalogue` mark, the
/// same fallback spec.md §4.12 describes for a truncated/piped archive;
/// `ArchiveTrailer` is still written and read back, but only to validate
/// what the scan found, never to locate it.
pub fn open<C: ByteChannel>(mut lower: C) -> Result<(Archive<C>, Catalog), DarError>
{
    let header = ArchiveHeader::read_from(&mut ChannelReader(&mut lower)).map_err(|e| {
        DarError::new(crate::error::ErrorKind::Range, format!(
            "cannot read archive header (wrong password, or corrupted archive): {e}"
        ))
    })?;

    if header.format_version != crate::header::FORMAT_VERSION {
        return Err(DarError::feature(format!(
            "archive format version {} is not supported", header.format_version
        )));
    }

    let mut stack = ArchiveStack::new(lower, header.compression_algo, ChannelMode::ReadOnly);

    if !stack.skip_to_mark(MarkType::DataName)? {
        return Err(DarError::range("archive body has no data-name mark"));
    }
    let mut label = [0u8; 16];
    read_exact(&mut stack, &mut label)?;

    if !stack.skip_to_mark(MarkType::Catalogue)? {
        return Err(DarError::range("archive is truncated: no tail catalogue found"));
    }
    let catalogue_header = CatalogueHeader::read_from(&mut ChannelReader(&mut stack))?;
    if catalogue_header.internal_label != label {
        return Err(DarError::range("tail catalogue label does not match the archive label"));
    }

    let catalog = Catalog::load(&mut ChannelReader(&mut stack))?;

    Ok((Archive { header, label, stack }, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn root_dir() -> crate::catalog::Directory
    {
        use crate::catalog::entry::{Inode, SavedStatus};
        use crate::datetime::DarDateTime;
        use crate::fsattr::{EaSavedStatus, FsaSavedStatus};

        crate::catalog::Directory::new(Inode {
            name: String::new(), uid: 0, gid: 0, mode: 0o755,
            atime: DarDateTime::epoch(), mtime: DarDateTime::epoch(), ctime: DarDateTime::epoch(),
            saved: SavedStatus::Saved, ea_status: EaSavedStatus::None, fsa_status: FsaSavedStatus::None,
            ea: Vec::new(), fsa: Vec::new(), device_id: 0,
        })
    }

    fn sample_catalog(offset: u64) -> Catalog
    {
        use crate::catalog::entry::{Entry, Inode, PlainFile, SavedStatus};
        use crate::datetime::DarDateTime;
        use crate::fsattr::{EaSavedStatus, FsaSavedStatus};

        let mut cat = Catalog::new(root_dir());
        let inode = Inode {
            name: "hello.txt".to_string(), uid: 0, gid: 0, mode: 0o644,
            atime: DarDateTime::epoch(), mtime: DarDateTime::epoch(), ctime: DarDateTime::epoch(),
            saved: SavedStatus::Saved, ea_status: EaSavedStatus::None, fsa_status: FsaSavedStatus::None,
            ea: Vec::new(), fsa: Vec::new(), device_id: 0,
        };
        let file = PlainFile {
            inode, uncompressed_size: 5, offset: Some(offset), stored_size: 5,
            content_crc: None, compression: CompressionAlgo::None, sparse: false,
            dirty: false, delta_sig: None, base_crc: None, result_crc: None,
        };
        cat.add(Entry::File(file));
        cat.add(Entry::EndOfDirectory);
        cat
    }

    #[test]
    fn create_then_open_roundtrips_via_shared_buffer()
    {
        struct SharedMemChannel(std::rc::Rc<std::cell::RefCell<Cursor<Vec<u8>>>>);
        impl ByteChannel for SharedMemChannel {
            fn mode(&self) -> ChannelMode { ChannelMode::ReadWrite }
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { std::io::Read::read(&mut *self.0.borrow_mut(), buf) }
            fn write(&mut self, buf: &[u8]) -> io::Result<()> {
                use std::io::Write as _;
                let mut cur = self.0.borrow_mut();
                let pos = cur.position() as usize;
                if pos + buf.len() > cur.get_ref().len() {
                    let new_len = pos + buf.len();
                    cur.get_mut().resize(new_len, 0);
                }
                cur.write_all(buf)
            }
            fn skip(&mut self, absolute: u64) -> io::Result<()> { self.0.borrow_mut().set_position(absolute); Ok(()) }
            fn skip_to_eof(&mut self) -> io::Result<()> {
                let mut cur = self.0.borrow_mut();
                let l = cur.get_ref().len() as u64;
                cur.set_position(l);
                Ok(())
            }
            fn skip_relative(&mut self, delta: i64) -> io::Result<()> {
                let mut cur = self.0.borrow_mut();
                let p = (cur.position() as i64 + delta).max(0) as u64;
                cur.set_position(p);
                Ok(())
            }
            fn current_position(&mut self) -> io::Result<u64> { Ok(self.0.borrow().position()) }
            fn sync_write(&mut self) -> io::Result<()> { Ok(()) }
            fn terminate(&mut self) -> io::Result<()> { Ok(()) }
            fn skippable(&self, _d: SkipDirection, _a: u64) -> bool { true }
        }
        impl Clone for SharedMemChannel {
            fn clone(&self) -> Self { SharedMemChannel(self.0.clone()) }
        }

        let backing = std::rc::Rc::new(std::cell::RefCell::new(Cursor::new(Vec::new())));
        let label = [9u8; 16];

        let mut archive = create(
            SharedMemChannel(backing.clone()),
            CompressionAlgo::None,
            HeaderFlags::default(),
            "darc -c -R / test",
            label,
        ).unwrap();

        archive.body().flush_compressed_run().unwrap();
        let data_offset = archive.body().current_position().unwrap();
        archive.body().add_mark(MarkType::File).unwrap();
        archive.body().write(b"hello").unwrap();

        let catalog = sample_catalog(data_offset);
        archive.finish_create(&catalog).unwrap();

        backing.borrow_mut().set_position(0);
        let (mut reopened, loaded_catalog) = open(SharedMemChannel(backing.clone())).unwrap();
        assert_eq!(reopened.label, label);
        assert_eq!(reopened.header.provenance, "darc -c -R / test");

        reopened.body().skip(data_offset).unwrap();
        assert!(reopened.body().next_is_mark(MarkType::File).unwrap());
        reopened.body().skip_to_mark(MarkType::File).unwrap();
        let mut read_back = [0u8; 5];
        read_exact(reopened.body(), &mut read_back).unwrap();
        assert_eq!(&read_back, b"hello");

        let names: Vec<String> = {
            let mut cat = loaded_catalog;
            cat.reset_read();
            let mut out = Vec::new();
            while let Some(entry) = cat.read() {
                if let Some(name) = entry.name() {
                    out.push(name.to_string());
                }
            }
            out
        };
        assert!(names.contains(&"hello.txt".to_string()));
    }
}
