//! Plain-file `ByteChannel`: the bottom of every stack, and the one the
//! slice manager opens/closes/seeks per slice.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::{ByteChannel, ChannelMode, SkipDirection};

pub struct FileChannel {
    file: File,
    mode: ChannelMode,
    terminated: bool,
}

impl FileChannel {
    pub fn new(file: File, mode: ChannelMode) -> Self
    {
        Self { file, mode, terminated: false }
    }

    pub fn len(&self) -> io::Result<u64>
    {
        self.file.metadata().map(|m| m.len())
    }
}

impl ByteChannel for FileChannel {
    fn mode(&self) -> ChannelMode
    {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        self.file.write_all(buf)
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        self.file.seek(SeekFrom::Start(absolute))?;
        Ok(())
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        self.file.seek(SeekFrom::Current(delta))?;
        Ok(())
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        self.file.stream_position()
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        self.file.sync_data()
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        if self.terminated {
            return Ok(());
        }
        if self.mode != ChannelMode::ReadOnly {
            self.file.flush()?;
        }
        self.terminated = true;
        Ok(())
    }

    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool
    {
        true
    }
}

/// Non-seekable channel for piped stdin/stdout, per spec.md §4.2 "piped
/// mode": a single unsplittable slice where seeks fail in a distinguishable
/// way so upper layers fall back to sequential-read mode.
pub struct PipeChannel<T> {
    inner: T,
    mode: ChannelMode,
    position: u64,
    terminated: bool,
}

impl<T> PipeChannel<T> {
    pub fn new(inner: T, mode: ChannelMode) -> Self
    {
        Self { inner, mode, position: 0, terminated: false }
    }
}

impl<T: Read + Write> ByteChannel for PipeChannel<T> {
    fn mode(&self) -> ChannelMode
    {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        self.inner.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        if absolute == self.position {
            return Ok(());
        }
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe channel is not seekable"))
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe channel is not seekable"))
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        if delta == 0 {
            return Ok(());
        }
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe channel is not seekable"))
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        Ok(self.position)
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        self.inner.flush()
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        if self.terminated {
            return Ok(());
        }
        self.inner.flush()?;
        self.terminated = true;
        Ok(())
    }

    fn skippable(&self, _direction: SkipDirection, amount: u64) -> bool
    {
        amount == 0
    }
}
