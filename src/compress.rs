//! Compression layer (spec.md §4.4): streaming compress on write,
//! streaming decompress on read, with explicit `flush_write` (ends a
//! compressed run) and `suspend_compression`/`resume_compression` (write
//! plaintext bytes — archive headers, inline CRC marks — between
//! compressed runs).
//!
//! `flate2` backs the gzip-class algorithm (on-disk tag `z`) and `bzip2`
//! backs the bzip2-class algorithm (tag `y`), the same crates
//! `ankit-chaubey/Archivum` and `proxmox/proxmox-backup` use for their own
//! streaming-compressed archive bodies.

use std::io::{self, Read, Write};

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression as BzCompression;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression as GzCompression;

use crate::channel::{ByteChannel, ChannelMode, SkipDirection};

/// Algorithm tag, matching the single-ASCII-letter on-disk byte in
/// spec.md §6.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionAlgo {
    None,
    Gzip,
    Bzip2,
}

impl CompressionAlgo {
    pub fn tag(self) -> u8
    {
        match self {
            CompressionAlgo::None => b'n',
            CompressionAlgo::Gzip => b'z',
            CompressionAlgo::Bzip2 => b'y',
        }
    }

    pub fn from_tag(tag: u8) -> io::Result<Self>
    {
        match tag {
            b'n' => Ok(CompressionAlgo::None),
            b'z' => Ok(CompressionAlgo::Gzip),
            b'y' => Ok(CompressionAlgo::Bzip2),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported compression algorithm tag")),
        }
    }
}

/// A single compressed "run": bytes written between a `resume_compression`
/// and the matching `flush_write` form one independent compressed frame
/// length-prefixed on the wire, so reads can resynchronise at a run
/// boundary without decompressing the whole stream.
struct Frame {
    algo: CompressionAlgo,
    buf: Vec<u8>,
}

impl Frame {
    fn compress(algo: CompressionAlgo, plain: &[u8]) -> io::Result<Vec<u8>>
    {
        match algo {
            CompressionAlgo::None => Ok(plain.to_vec()),
            CompressionAlgo::Gzip => {
                let mut enc = GzEncoder::new(plain, GzCompression::default());
                let mut out = Vec::new();
                enc.read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionAlgo::Bzip2 => {
                let mut enc = BzEncoder::new(plain, BzCompression::default());
                let mut out = Vec::new();
                enc.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    fn decompress(algo: CompressionAlgo, compressed: &[u8]) -> io::Result<Vec<u8>>
    {
        match algo {
            CompressionAlgo::None => Ok(compressed.to_vec()),
            CompressionAlgo::Gzip => {
                let mut dec = GzDecoder::new(compressed);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionAlgo::Bzip2 => {
                let mut dec = BzDecoder::new(compressed);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

/// Wraps an inner channel with explicit compressed-run framing. Plain
/// writes while `suspended` pass through untouched (used for the leading
/// archive header and inline CRC marks, which must remain readable even
/// if the chosen compressor is unavailable at read time).
pub struct CompressionChannel<C> {
    inner: C,
    algo: CompressionAlgo,
    mode: ChannelMode,
    suspended: bool,
    write_buf: Vec<u8>,
    read_frame: Option<(Vec<u8>, usize)>,
}

impl<C: ByteChannel> CompressionChannel<C> {
    pub fn new(inner: C, algo: CompressionAlgo, mode: ChannelMode) -> Self
    {
        Self { inner, algo, mode, suspended: false, write_buf: Vec::new(), read_frame: None }
    }

    /// Begin writing compressed bytes (the default state); bytes written
    /// before the next `flush_write`/`suspend_compression` form one run.
    pub fn resume_compression(&mut self)
    {
        self.suspended = false;
    }

    /// Switch to writing plaintext bytes directly to the inner channel,
    /// ending any compressed run in progress.
    pub fn suspend_compression(&mut self) -> io::Result<()>
    {
        self.flush_write()?;
        self.suspended = true;
        Ok(())
    }

    /// End the current compressed run, emitting its length-prefixed frame.
    pub fn flush_write(&mut self) -> io::Result<()>
    {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let compressed = Frame::compress(self.algo, &self.write_buf)?;
        self.write_buf.clear();
        let len = compressed.len() as u64;
        self.inner.write(&len.to_be_bytes())?;
        self.inner.write(&[self.algo.tag()])?;
        self.inner.write(&compressed)
    }

    fn fill_read_frame(&mut self) -> io::Result<bool>
    {
        if self.suspended {
            return Ok(false);
        }
        let mut len_buf = [0u8; 8];
        match self.read_exact_or_eof(&mut len_buf)? {
            0 => return Ok(false),
            n if n < 8 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated compression frame length")),
            _ => {}
        }
        let len = u64::from_be_bytes(len_buf) as usize;
        let mut tag = [0u8; 1];
        self.inner.read(&mut tag)?;
        let algo = CompressionAlgo::from_tag(tag[0])?;
        let mut compressed = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.inner.read(&mut compressed[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let plain = Frame::decompress(algo, &compressed)?;
        self.read_frame = Some((plain, 0));
        Ok(true)
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl<C: ByteChannel> ByteChannel for CompressionChannel<C> {
    fn mode(&self) -> ChannelMode
    {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        if self.suspended {
            return self.inner.read(buf);
        }
        loop {
            if let Some((plain, pos)) = &mut self.read_frame {
                if *pos < plain.len() {
                    let n = (plain.len() - *pos).min(buf.len());
                    buf[..n].copy_from_slice(&plain[*pos..*pos + n]);
                    *pos += n;
                    return Ok(n);
                }
                self.read_frame = None;
            }
            if !self.fill_read_frame()? {
                return Ok(0);
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        if self.suspended {
            return self.inner.write(buf);
        }
        self.write_buf.extend_from_slice(buf);
        Ok(())
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        self.flush_write()?;
        self.read_frame = None;
        self.inner.skip(absolute)
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        self.flush_write()?;
        self.inner.skip_to_eof()
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        self.flush_write()?;
        self.read_frame = None;
        self.inner.skip_relative(delta)
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        self.inner.current_position()
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        self.flush_write()?;
        self.inner.sync_write()
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        self.flush_write()?;
        self.inner.terminate()
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool
    {
        // Random seeks within a compressed run require decompressing from
        // the start of that run; only frame-boundary seeks are free.
        amount == 0 && self.inner.skippable(direction, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MemChannel(Cursor<Vec<u8>>);
    impl ByteChannel for MemChannel {
        fn mode(&self) -> ChannelMode { ChannelMode::ReadWrite }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { std::io::Read::read(&mut self.0, buf) }
        fn write(&mut self, buf: &[u8]) -> io::Result<()> {
            use std::io::Write as _;
            let pos = self.0.position() as usize;
            if pos + buf.len() > self.0.get_ref().len() {
                self.0.get_mut().resize(pos + buf.len(), 0);
            }
            self.0.write_all(buf)
        }
        fn skip(&mut self, absolute: u64) -> io::Result<()> { self.0.set_position(absolute); Ok(()) }
        fn skip_to_eof(&mut self) -> io::Result<()> { let l = self.0.get_ref().len() as u64; self.0.set_position(l); Ok(()) }
        fn skip_relative(&mut self, delta: i64) -> io::Result<()> {
            let p = (self.0.position() as i64 + delta).max(0) as u64;
            self.0.set_position(p);
            Ok(())
        }
        fn current_position(&mut self) -> io::Result<u64> { Ok(self.0.position()) }
        fn sync_write(&mut self) -> io::Result<()> { Ok(()) }
        fn terminate(&mut self) -> io::Result<()> { Ok(()) }
        fn skippable(&self, _d: SkipDirection, _a: u64) -> bool { true }
    }

    #[test]
    fn roundtrip_gzip_run()
    {
        let inner = MemChannel(Cursor::new(Vec::new()));
        let mut c = CompressionChannel::new(inner, CompressionAlgo::Gzip, ChannelMode::ReadWrite);
        c.write(b"hello, compressed world").unwrap();
        c.flush_write().unwrap();
        c.skip(0).unwrap();

        let mut out = vec![0u8; 64];
        let n = c.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello, compressed world");
    }

    #[test]
    fn suspend_resume_writes_plaintext_inline()
    {
        let inner = MemChannel(Cursor::new(Vec::new()));
        let mut c = CompressionChannel::new(inner, CompressionAlgo::Gzip, ChannelMode::ReadWrite);
        c.suspend_compression().unwrap();
        c.write(b"HEADER").unwrap();
        c.resume_compression();
        c.write(b"payload").unwrap();
        c.flush_write().unwrap();

        c.skip(0).unwrap();
        c.suspend_compression().unwrap();
        let mut header = [0u8; 6];
        c.read(&mut header).unwrap();
        assert_eq!(&header, b"HEADER");

        c.resume_compression();
        let mut body = vec![0u8; 16];
        let n = c.read(&mut body).unwrap();
        assert_eq!(&body[..n], b"payload");
    }

    #[test]
    fn multiple_runs_are_independent()
    {
        let inner = MemChannel(Cursor::new(Vec::new()));
        let mut c = CompressionChannel::new(inner, CompressionAlgo::Bzip2, ChannelMode::ReadWrite);
        c.write(b"run one").unwrap();
        c.flush_write().unwrap();
        c.write(b"run two").unwrap();
        c.flush_write().unwrap();

        c.skip(0).unwrap();
        let mut a = vec![0u8; 16];
        let na = c.read(&mut a).unwrap();
        assert_eq!(&a[..na], b"run one");
        let mut b = vec![0u8; 16];
        let nb = c.read(&mut b).unwrap();
        assert_eq!(&b[..nb], b"run two");
    }
}
