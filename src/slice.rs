//! Slice manager (spec.md §4.2): turns a logical byte stream into a
//! sequence of numbered, fixed-size slice files, each carrying its own
//! header, with optional between-slice hook commands and pause/prompt
//! semantics. Falls back to a single unsplittable, non-seekable slice in
//! piped mode.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::array::Array;
use crate::channel::file::{FileChannel, PipeChannel};
use crate::channel::{ByteChannel, ChannelMode, SkipDirection};
use crate::number::Infinint;

/// 4-byte magic stamped at the head of every slice, taken from the
/// archive's own leading-header magic so a slice can be told apart from
/// an unrelated file at a glance.
pub const SLICE_MAGIC: [u8; 4] = *b"DARc";

/// Per-slice header: magic, an archive-wide internal label (so slice N of
/// archive A is never silently accepted in place of slice N of archive B),
/// the slice number, and a flag byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub magic: [u8; 4],
    pub internal_label: Array<u8, 16>,
    pub slice_number: Infinint,
    pub has_terminal_flag: bool,
    pub is_old_header: bool,
}

impl SliceHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>
    {
        w.write_all(&self.magic)?;
        w.write_all(&self.internal_label.0)?;
        self.slice_number.write_to(w)?;
        let flags = (self.has_terminal_flag as u8) | ((self.is_old_header as u8) << 1);
        w.write_all(&[flags])
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self>
    {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let mut label = [0u8; 16];
        r.read_exact(&mut label)?;
        let slice_number = Infinint::read_from(r)?;
        let mut flags = [0u8; 1];
        r.read_exact(&mut flags)?;
        Ok(Self {
            magic,
            internal_label: Array(label),
            slice_number,
            has_terminal_flag: flags[0] & 1 != 0,
            is_old_header: flags[0] & 2 != 0,
        })
    }
}

/// Configuration for a slice manager: slice sizing, naming, and the
/// optional between-slice interaction points (spec.md §4.2).
#[derive(Clone, Debug)]
pub struct SliceConfig {
    pub basename: PathBuf,
    pub extension: String,
    pub first_slice_size: u64,
    pub other_slice_size: u64,
    pub internal_label: [u8; 16],
    pub between_slice_hook: Option<String>,
    pub pause_between_slices: bool,
}

impl SliceConfig {
    /// Whether this configuration describes an actual multi-slice archive
    /// (as opposed to one unsplittable file).
    pub fn is_sliced(&self) -> bool
    {
        self.other_slice_size > 0
    }

    pub fn slice_path(&self, slice_no: u64) -> PathBuf
    {
        let mut p = self.basename.clone();
        let mut name = p.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.{}", slice_no, self.extension));
        p.set_file_name(name);
        p
    }

    /// Map an absolute logical offset to (1-based slice number, offset
    /// within that slice).
    pub fn locate(&self, offset: u64) -> (u64, u64)
    {
        if !self.is_sliced() || offset < self.first_slice_size {
            return (1, offset);
        }
        let past_first = offset - self.first_slice_size;
        let slice_no = 2 + past_first / self.other_slice_size;
        let within = past_first % self.other_slice_size;
        (slice_no, within)
    }

    pub fn slice_capacity(&self, slice_no: u64) -> u64
    {
        if slice_no == 1 {
            self.first_slice_size
        } else {
            self.other_slice_size
        }
    }
}

/// What went wrong opening/finding a slice, so the caller can offer a
/// retry (spec.md §4.2: "invoke an error callback that may retry").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceError {
    Missing(PathBuf),
    WrongLabel,
    NotSeekable,
}

impl std::fmt::Display for SliceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
    {
        match self {
            SliceError::Missing(p) => write!(f, "missing slice: {}", p.display()),
            SliceError::WrongLabel => write!(f, "slice does not belong to this archive"),
            SliceError::NotSeekable => write!(f, "archive is in piped mode, cannot seek"),
        }
    }
}
impl std::error::Error for SliceError {}

enum Backing {
    Sliced { config: SliceConfig, total_slices_known: Option<u64> },
    Piped,
}

/// Callback invoked when a slice is missing, to let the caller prompt the
/// user and retry, per spec.md §4.2.
pub type MissingSliceHandler<'a> = dyn FnMut(&Path) -> bool + 'a;

pub struct SliceManager<'a> {
    backing: Backing,
    mode: ChannelMode,
    current_slice_no: u64,
    current: Option<FileChannel>,
    piped: Option<PipeChannel<Box<dyn ReadWrite>>>,
    on_missing: Option<Box<MissingSliceHandler<'a>>>,
}

/// Small helper trait so stdin/stdout can share one boxed slot in
/// `piped`, without pulling in a generic parameter on `SliceManager`.
pub trait ReadWrite: Read + Write {}
impl<T: Read + Write> ReadWrite for T {}

impl<'a> SliceManager<'a> {
    pub fn new_sliced(config: SliceConfig, mode: ChannelMode) -> Self
    {
        Self {
            backing: Backing::Sliced { config, total_slices_known: None },
            mode,
            current_slice_no: 0,
            current: None,
            piped: None,
            on_missing: None,
        }
    }

    pub fn new_piped(stream: Box<dyn ReadWrite>, mode: ChannelMode) -> Self
    {
        Self {
            backing: Backing::Piped,
            mode,
            current_slice_no: 1,
            current: None,
            piped: Some(PipeChannel::new(stream, mode)),
            on_missing: None,
        }
    }

    pub fn set_missing_slice_handler(&mut self, f: Box<MissingSliceHandler<'a>>)
    {
        self.on_missing = Some(f);
    }

    fn config(&self) -> io::Result<&SliceConfig>
    {
        match &self.backing {
            Backing::Sliced { config, .. } => Ok(config),
            Backing::Piped => Err(io::Error::new(io::ErrorKind::Unsupported, SliceError::NotSeekable)),
        }
    }

    /// Open (for read) or create (for write) the given slice number,
    /// writing/checking its header.
    fn open_slice(&mut self, slice_no: u64) -> io::Result<()>
    {
        let config = match &self.backing {
            Backing::Sliced { config, .. } => config.clone(),
            Backing::Piped => return Ok(()),
        };

        if let Some(cur) = self.current.as_mut() {
            if self.current_slice_no == slice_no {
                return Ok(());
            }
            cur.terminate()?;
            self.run_hook(&config, self.current_slice_no);
            if config.pause_between_slices {
                // The façade is expected to prompt interactively; here we
                // only mark the boundary by flushing stdout.
                let _ = io::stdout().flush();
            }
        }

        let path = config.slice_path(slice_no);
        let mut opened = loop {
            let result = match self.mode {
                ChannelMode::ReadOnly => OpenOptions::new().read(true).open(&path),
                ChannelMode::WriteOnly => OpenOptions::new().create(true).write(true).truncate(true).open(&path),
                ChannelMode::ReadWrite => OpenOptions::new().create(true).read(true).write(true).open(&path),
            };
            match result {
                Ok(f) => break f,
                Err(e) if e.kind() == io::ErrorKind::NotFound && self.mode == ChannelMode::ReadOnly => {
                    let retry = self.on_missing.as_mut().map(|f| f(&path)).unwrap_or(false);
                    if !retry {
                        return Err(io::Error::new(io::ErrorKind::NotFound, SliceError::Missing(path)));
                    }
                }
                Err(e) => return Err(e),
            }
        };

        if self.mode == ChannelMode::ReadOnly {
            let header = SliceHeader::read_from(&mut opened)?;
            if header.magic != SLICE_MAGIC {
                return Err(io::Error::new(io::ErrorKind::InvalidData, SliceError::WrongLabel));
            }
            if header.internal_label.0 != config.internal_label {
                return Err(io::Error::new(io::ErrorKind::InvalidData, SliceError::WrongLabel));
            }
        } else {
            let header = SliceHeader {
                magic: SLICE_MAGIC,
                internal_label: Array(config.internal_label),
                slice_number: Infinint::from(slice_no),
                has_terminal_flag: false,
                is_old_header: false,
            };
            header.write_to(&mut opened)?;
        }

        self.current = Some(FileChannel::new(opened, self.mode));
        self.current_slice_no = slice_no;
        Ok(())
    }

    fn run_hook(&self, config: &SliceConfig, finished_slice_no: u64)
    {
        if let Some(hook) = &config.between_slice_hook {
            let path = config.slice_path(finished_slice_no);
            let cmd = hook
                .replace("%p", &path.to_string_lossy())
                .replace("%n", &finished_slice_no.to_string());
            let _ = Command::new("sh").arg("-c").arg(cmd).status();
        }
    }

    fn header_len() -> u64
    {
        // magic(4) + label(16) + slice_number infinint(>=1) + flags(1)
        22
    }
}

impl<'a> ByteChannel for SliceManager<'a> {
    fn mode(&self) -> ChannelMode
    {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        if let Some(p) = &mut self.piped {
            return p.read(buf);
        }
        if self.current.is_none() {
            self.open_slice(1)?;
        }
        let config = self.config()?.clone();
        let n = self.current.as_mut().unwrap().read(buf)?;
        if n == 0 {
            let next = self.current_slice_no + 1;
            if next == 1 || config.slice_path(next).exists() {
                self.open_slice(next)?;
                return self.current.as_mut().unwrap().read(buf);
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        if let Some(p) = &mut self.piped {
            return p.write(buf);
        }
        if self.current.is_none() {
            self.open_slice(1)?;
        }
        let config = self.config()?.clone();
        let mut remaining = buf;
        loop {
            let pos = self.current.as_mut().unwrap().current_position()?;
            let capacity = config.slice_capacity(self.current_slice_no);
            let room = capacity.saturating_sub(pos.saturating_sub(Self::header_len()));
            if room == 0 || (remaining.len() as u64) > room {
                let take = room.min(remaining.len() as u64) as usize;
                if take > 0 {
                    self.current.as_mut().unwrap().write(&remaining[..take])?;
                    remaining = &remaining[take..];
                }
                if remaining.is_empty() {
                    return Ok(());
                }
                self.open_slice(self.current_slice_no + 1)?;
                continue;
            }
            self.current.as_mut().unwrap().write(remaining)?;
            return Ok(());
        }
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        if self.piped.is_some() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, SliceError::NotSeekable));
        }
        let config = self.config()?.clone();
        let (slice_no, within) = config.locate(absolute);
        self.open_slice(slice_no)?;
        self.current.as_mut().unwrap().skip(within + Self::header_len())
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        if let Some(p) = &mut self.piped {
            return p.skip_to_eof();
        }
        // Probe forward until the next slice file is missing.
        let mut n = self.current_slice_no.max(1);
        loop {
            let config = self.config()?.clone();
            if !config.slice_path(n + 1).exists() {
                break;
            }
            n += 1;
        }
        self.open_slice(n)?;
        self.current.as_mut().unwrap().skip_to_eof()
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        if self.piped.is_some() {
            return if delta == 0 { Ok(()) } else {
                Err(io::Error::new(io::ErrorKind::Unsupported, SliceError::NotSeekable))
            };
        }
        let cur = self.current_position()?;
        let target = (cur as i64 + delta).max(0) as u64;
        self.skip(target)
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        if let Some(p) = &mut self.piped {
            return p.current_position();
        }
        let config = self.config()?.clone();
        let pos_in_slice = self.current.as_mut().map(|c| c.current_position()).transpose()?.unwrap_or(Self::header_len());
        let within = pos_in_slice.saturating_sub(Self::header_len());
        if self.current_slice_no <= 1 {
            Ok(within)
        } else {
            Ok(config.first_slice_size + (self.current_slice_no - 2) * config.other_slice_size + within)
        }
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        if let Some(p) = &mut self.piped {
            return p.sync_write();
        }
        if let Some(c) = &mut self.current {
            c.sync_write()?;
        }
        Ok(())
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        if let Some(p) = &mut self.piped {
            return p.terminate();
        }
        if let Some(c) = &mut self.current {
            c.terminate()?;
        }
        if let Backing::Sliced { config, .. } = &self.backing {
            self.run_hook(config, self.current_slice_no);
        }
        Ok(())
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool
    {
        if self.piped.is_some() {
            return amount == 0;
        }
        let _ = direction;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(first: u64, other: u64) -> SliceConfig
    {
        SliceConfig {
            basename: PathBuf::from("/tmp/irrelevant"),
            extension: "dar".to_string(),
            first_slice_size: first,
            other_slice_size: other,
            internal_label: [7u8; 16],
            between_slice_hook: None,
            pause_between_slices: false,
        }
    }

    #[test]
    fn locate_within_first_slice()
    {
        let c = config(100, 50);
        assert_eq!(c.locate(0), (1, 0));
        assert_eq!(c.locate(99), (1, 99));
    }

    #[test]
    fn locate_crosses_into_second_slice()
    {
        let c = config(100, 50);
        assert_eq!(c.locate(100), (2, 0));
        assert_eq!(c.locate(149), (2, 49));
        assert_eq!(c.locate(150), (3, 0));
    }

    #[test]
    fn unsliced_config_locates_everything_in_slice_one()
    {
        let c = config(1000, 0);
        assert_eq!(c.locate(999), (1, 999));
    }

    #[test]
    fn header_roundtrips()
    {
        let h = SliceHeader {
            magic: SLICE_MAGIC,
            internal_label: Array([9u8; 16]),
            slice_number: Infinint::from(3u64),
            has_terminal_flag: true,
            is_old_header: false,
        };
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let back = SliceHeader::read_from(&mut cur).unwrap();
        assert_eq!(back, h);
    }
}
