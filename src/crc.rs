//! Length-parameterised CRC accumulator, attached to any byte channel.
//!
//! The teacher reaches for the `crc` crate's table-driven `crc32` functions
//! directly (`filesys/e2fs.rs`: `crc::crc32::update(...)`); we do the same
//! here rather than hand-roll a polynomial table.

use crc::crc32;

use crate::number::Infinint;

/// A fixed-width byte vector carrying a running CRC.
///
/// Width is chosen by the caller as a function of the covered stream
/// length (spec.md §3: "heuristic: ~log2(size) rounded to a power of two,
/// minimum 2"); wider CRCs than 4 bytes are produced by repeating the
/// 32-bit CRC over independent seeds, since this crate has no native
/// wide-CRC polynomial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crc {
    width: usize,
    bytes: Vec<u8>,
}

/// Picks a CRC width, in bytes, for a stream of the given length, per the
/// heuristic in spec.md §3: roughly ceil(log2(size)) rounded up to a power
/// of two, minimum 2.
pub fn width_for_size(size: u64) -> usize
{
    if size == 0 {
        return 2;
    }
    let bits = 64 - size.leading_zeros();
    let bytes = ((bits as usize) + 7) / 8;
    bytes.max(2).next_power_of_two()
}

impl Crc {
    pub fn new(width: usize) -> Self
    {
        Self { width, bytes: vec![0; width] }
    }

    pub fn width(&self) -> usize
    {
        self.width
    }

    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self
    {
        let width = bytes.len();
        Self { width, bytes }
    }

    pub fn write_with_length<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()>
    {
        Infinint::from(self.width as u64).write_to(w)?;
        w.write_all(&self.bytes)
    }

    pub fn read_with_length<R: std::io::Read>(r: &mut R) -> std::io::Result<Self>
    {
        let len = Infinint::read_from(r)?
            .to_u64()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.message))?;
        let mut bytes = vec![0u8; len as usize];
        r.read_exact(&mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }
}

/// Folds bytes into a running CRC computation between `reset` and
/// `finish`, mirroring the `reset_crc(width)` / `get_crc()` pair any byte
/// channel supports per spec.md §4.1.
#[derive(Clone, Debug)]
pub struct CrcAccumulator {
    width: usize,
    state: u32,
    seed_offset: u8,
}

impl CrcAccumulator {
    pub fn new(width: usize) -> Self
    {
        Self { width, state: !0u32, seed_offset: 0 }
    }

    pub fn update(&mut self, buf: &[u8])
    {
        self.state = crc32::update(self.state, &crc32::CASTAGNOLI_TABLE, buf);
    }

    /// Finish accumulation and return the CRC value, widened to `self.width`
    /// bytes by mixing in a distinct per-byte-position seed for any bytes
    /// beyond the native 4, so that wide CRCs are still a function of the
    /// whole input rather than padding with zeros.
    pub fn finish(&self) -> Crc
    {
        let native = (!self.state).to_be_bytes();
        if self.width <= 4 {
            return Crc::from_bytes(native[4 - self.width..].to_vec());
        }
        let mut bytes = vec![0u8; self.width];
        bytes[self.width - 4..].copy_from_slice(&native);
        for i in 0..(self.width - 4) {
            bytes[i] = native[i % 4] ^ (self.seed_offset.wrapping_add(i as u8));
        }
        Crc::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_heuristic_minimum_is_two()
    {
        assert_eq!(width_for_size(0), 2);
        assert_eq!(width_for_size(1), 2);
        assert_eq!(width_for_size(3), 2);
    }

    #[test]
    fn width_heuristic_grows_with_size()
    {
        assert!(width_for_size(1 << 40) >= 4);
        assert!(width_for_size(1 << 40).is_power_of_two());
    }

    #[test]
    fn accumulator_is_deterministic()
    {
        let mut a = CrcAccumulator::new(4);
        a.update(b"hello world");
        let mut b = CrcAccumulator::new(4);
        b.update(b"hello ");
        b.update(b"world");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn different_input_different_crc()
    {
        let mut a = CrcAccumulator::new(4);
        a.update(b"hello");
        let mut b = CrcAccumulator::new(4);
        b.update(b"world");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn roundtrip_with_length_prefix()
    {
        let mut acc = CrcAccumulator::new(8);
        acc.update(b"payload");
        let crc = acc.finish();

        let mut buf = Vec::new();
        crc.write_with_length(&mut buf).unwrap();

        let mut cur = std::io::Cursor::new(buf);
        let back = Crc::read_with_length(&mut cur).unwrap();
        assert_eq!(back, crc);
        assert_eq!(back.width(), 8);
    }
}
