//! Archive leading header and trailer (spec.md §3, §4.12): the bytes that
//! bracket the whole logical stream, outside the compressed/encrypted
//! region, so that `open` can always make sense of them before the rest
//! of the stack is assembled.

use std::io::{self, Read, Write};

use crate::compress::CompressionAlgo;
use crate::number::Infinint;

/// Current on-disk format version. Bumped whenever the header, trailer or
/// entry-dump wire format changes incompatibly.
pub const FORMAT_VERSION: u8 = 1;

/// Flag word bits (spec.md §3 "archive header"), stored as a `u16` even
/// though the wire form is "variable, at least 2 bytes" — two bytes is
/// enough room for every flag this implementation defines, and leaves
/// headroom for more without another format bump.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    pub ea_root_saved: bool,
    pub ea_user_saved: bool,
    pub scrambled: bool,
    pub sequential_marks_present: bool,
    pub signed: bool,
    pub delta_present: bool,
}

impl HeaderFlags {
    fn to_bits(self) -> u16
    {
        (self.ea_root_saved as u16)
            | ((self.ea_user_saved as u16) << 1)
            | ((self.scrambled as u16) << 2)
            | ((self.sequential_marks_present as u16) << 3)
            | ((self.signed as u16) << 4)
            | ((self.delta_present as u16) << 5)
    }

    fn from_bits(bits: u16) -> Self
    {
        Self {
            ea_root_saved: bits & 1 != 0,
            ea_user_saved: bits & (1 << 1) != 0,
            scrambled: bits & (1 << 2) != 0,
            sequential_marks_present: bits & (1 << 3) != 0,
            signed: bits & (1 << 4) != 0,
            delta_present: bits & (1 << 5) != 0,
        }
    }
}

/// The archive's leading header: everything a reader needs before it can
/// even decide whether a cipher layer is involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub format_version: u8,
    pub compression_algo: CompressionAlgo,
    pub flags: HeaderFlags,
    /// The original command-line-style provenance string (spec.md §3), for
    /// example the joined argv the archive was created with.
    pub provenance: String,
}

impl ArchiveHeader {
    pub fn new(compression_algo: CompressionAlgo, flags: HeaderFlags, provenance: impl Into<String>) -> Self
    {
        Self { format_version: FORMAT_VERSION, compression_algo, flags, provenance: provenance.into() }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>
    {
        w.write_all(&[self.format_version, self.compression_algo.tag()])?;
        w.write_all(&self.flags.to_bits().to_be_bytes())?;
        w.write_all(self.provenance.as_bytes())?;
        w.write_all(&[0])
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self>
    {
        let mut fixed = [0u8; 4];
        r.read_exact(&mut fixed)?;
        let format_version = fixed[0];
        let compression_algo = CompressionAlgo::from_tag(fixed[1])?;
        let flags = HeaderFlags::from_bits(u16::from_be_bytes([fixed[2], fixed[3]]));

        let mut provenance = Vec::new();
        let mut b = [0u8; 1];
        loop {
            r.read_exact(&mut b)?;
            if b[0] == 0 {
                break;
            }
            provenance.push(b[0]);
        }
        Ok(Self { format_version, compression_algo, flags, provenance: String::from_utf8_lossy(&provenance).into_owned() })
    }
}

/// The tail catalogue's own inner header (spec.md §3: "the tail catalogue
/// ... its own inner header followed by the root-directory dump"): just
/// the archive's 16-byte identifying label, so a catalogue located via the
/// trailer can be checked against the one named in the data-name mark or
/// carried by the slices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatalogueHeader {
    pub internal_label: [u8; 16],
}

impl CatalogueHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>
    {
        w.write_all(&self.internal_label)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self>
    {
        let mut internal_label = [0u8; 16];
        r.read_exact(&mut internal_label)?;
        Ok(Self { internal_label })
    }
}

/// The archive trailer (spec.md §3): the absolute offset the tail
/// catalogue begins at, plus a fixed-size total-length field so a reader
/// opening the archive purely by size (no escape marks) can find the
/// trailer by seeking `skip_to_eof` then backing up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveTrailer {
    pub catalogue_offset: Infinint,
    pub total_length: u64,
}

impl ArchiveTrailer {
    /// `catalogue_offset`'s self-delimiting encoding makes the trailer's
    /// own size variable; callers locate it by `total_length`'s fixed
    /// width plus whatever `catalogue_offset` needs, so `total_length`
    /// must be written last at a known fixed offset from the end.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>
    {
        self.catalogue_offset.write_to(w)?;
        w.write_all(&self.total_length.to_be_bytes())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self>
    {
        let catalogue_offset = Infinint::read_from(r)?;
        let mut total_length = [0u8; 8];
        r.read_exact(&mut total_length)?;
        Ok(Self { catalogue_offset, total_length: u64::from_be_bytes(total_length) })
    }

    /// Size, in bytes, of the fixed-width tail of the trailer (the part a
    /// reader can always locate by counting back from EOF without first
    /// knowing how wide `catalogue_offset` is).
    pub const FIXED_TAIL_LEN: u64 = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_with_flags_and_provenance()
    {
        let flags = HeaderFlags { ea_user_saved: true, delta_present: true, ..Default::default() };
        let header = ArchiveHeader::new(CompressionAlgo::Gzip, flags, "darc -c -z6 -R / backup");
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let back = ArchiveHeader::read_from(&mut cur).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn flags_bit_pattern_is_stable()
    {
        let flags = HeaderFlags { ea_root_saved: true, scrambled: true, ..Default::default() };
        assert_eq!(HeaderFlags::from_bits(flags.to_bits()), flags);
    }

    #[test]
    fn trailer_roundtrips()
    {
        let trailer = ArchiveTrailer { catalogue_offset: Infinint::from(123456u64), total_length: 999999 };
        let mut buf = Vec::new();
        trailer.write_to(&mut buf).unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let back = ArchiveTrailer::read_from(&mut cur).unwrap();
        assert_eq!(back, trailer);
    }

    #[test]
    fn catalogue_header_roundtrips()
    {
        let header = CatalogueHeader { internal_label: [7u8; 16] };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let mut cur = std::io::Cursor::new(buf);
        let back = CatalogueHeader::read_from(&mut cur).unwrap();
        assert_eq!(back, header);
    }
}
