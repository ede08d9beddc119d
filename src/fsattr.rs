//! Filesystem attribute I/O (spec.md §4.7... actually §2 "Filesystem
//! attribute I/O", §3 EA/FSA sets): reading and writing extended
//! attributes, and the filesystem-specific attributes called out by name
//! in spec.md — the immutable flag, birthtime, and nodump.
//!
//! `xattr` handles the portable EA surface; the immutable/nodump flags are
//! Linux-specific `ioctl`s on the inode, read through `nix`/`libc` the way
//! `fsfill`'s own `filesys/e2fs.rs` pokes at ext2-specific inode fields
//! directly.

use std::io;
use std::path::Path;

/// One extended attribute: an opaque (key, value) pair, per spec.md §3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedAttribute {
    pub key: String,
    pub value: Vec<u8>,
}

/// How much of an inode's EA set made it into the archive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EaSavedStatus {
    None,
    Partial,
    Full,
    Fake,
    Removed,
}

/// Filesystem-specific attribute family, e.g. "linux-ext" vs "hfs+".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FsaFamily {
    LinuxExt,
    HfsPlus,
}

impl FsaFamily {
    pub fn tag(self) -> u8
    {
        match self {
            FsaFamily::LinuxExt => b'e',
            FsaFamily::HfsPlus => b'h',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self>
    {
        match tag {
            b'e' => Some(FsaFamily::LinuxExt),
            b'h' => Some(FsaFamily::HfsPlus),
            _ => None,
        }
    }
}

/// A single filesystem-specific attribute: a scoped (family, nature,
/// value) triple, per the glossary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsAttribute {
    pub family: FsaFamily,
    pub nature: u8,
    pub value: Vec<u8>,
}

/// Natures within the linux-ext family.
pub mod linux_ext_nature {
    pub const IMMUTABLE: u8 = 1;
    pub const NODUMP: u8 = 2;
}

/// How much of an inode's FSA set made it into the archive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FsaSavedStatus {
    None,
    Partial,
    Full,
}

/// Reads every extended attribute present on `path`.
pub fn read_ea(path: &Path) -> io::Result<Vec<ExtendedAttribute>>
{
    let mut out = Vec::new();
    for key in xattr::list(path)? {
        if let Some(value) = xattr::get(path, &key)? {
            out.push(ExtendedAttribute { key: key.to_string_lossy().into_owned(), value });
        }
    }
    Ok(out)
}

/// Writes a previously-read EA set back onto `path`, overwriting any
/// attribute of the same key.
pub fn write_ea(path: &Path, attrs: &[ExtendedAttribute]) -> io::Result<()>
{
    for attr in attrs {
        xattr::set(path, &attr.key, &attr.value)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod linux_flags {
    use std::fs::OpenOptions;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    const FS_IOC_GETFLAGS: libc::c_ulong = 0x80086601;
    const FS_IOC_SETFLAGS: libc::c_ulong = 0x40086602;
    const FS_IMMUTABLE_FL: libc::c_long = 0x00000010;
    const FS_NODUMP_FL: libc::c_long = 0x00000040;

    fn get_flags(path: &Path) -> io::Result<libc::c_long>
    {
        let file = OpenOptions::new().read(true).open(path)?;
        let mut flags: libc::c_long = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_GETFLAGS as _, &mut flags) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }

    fn set_flag(path: &Path, bit: libc::c_long, on: bool) -> io::Result<()>
    {
        let file = OpenOptions::new().read(true).open(path)?;
        let mut flags = get_flags(path)?;
        if on {
            flags |= bit;
        } else {
            flags &= !bit;
        }
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_SETFLAGS as _, &mut flags) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn is_immutable(path: &Path) -> io::Result<bool>
    {
        Ok(get_flags(path)? & FS_IMMUTABLE_FL != 0)
    }

    pub fn set_immutable(path: &Path, on: bool) -> io::Result<()>
    {
        set_flag(path, FS_IMMUTABLE_FL, on)
    }

    pub fn is_nodump(path: &Path) -> io::Result<bool>
    {
        Ok(get_flags(path)? & FS_NODUMP_FL != 0)
    }

    pub fn set_nodump(path: &Path, on: bool) -> io::Result<()>
    {
        set_flag(path, FS_NODUMP_FL, on)
    }
}

#[cfg(not(target_os = "linux"))]
mod linux_flags {
    use std::io;
    use std::path::Path;

    pub fn is_immutable(_path: &Path) -> io::Result<bool>
    {
        Ok(false)
    }

    pub fn set_immutable(_path: &Path, _on: bool) -> io::Result<()>
    {
        Ok(())
    }

    pub fn is_nodump(_path: &Path) -> io::Result<bool>
    {
        Ok(false)
    }

    pub fn set_nodump(_path: &Path, _on: bool) -> io::Result<()>
    {
        Ok(())
    }
}

/// Reads the linux-ext FSA set for `path`: immutable and nodump flags,
/// present only when set (an unset flag is not recorded, matching
/// "partial" FSA saves for inodes with nothing notable).
pub fn read_fsa(path: &Path, honour_nodump: bool) -> io::Result<Vec<FsAttribute>>
{
    let mut out = Vec::new();
    if linux_flags::is_immutable(path).unwrap_or(false) {
        out.push(FsAttribute { family: FsaFamily::LinuxExt, nature: linux_ext_nature::IMMUTABLE, value: vec![1] });
    }
    if honour_nodump && linux_flags::is_nodump(path).unwrap_or(false) {
        out.push(FsAttribute { family: FsaFamily::LinuxExt, nature: linux_ext_nature::NODUMP, value: vec![1] });
    }
    Ok(out)
}

/// Returns true if `path` should be skipped entirely because the nodump
/// flag is set and the walker was asked to honour it (spec.md §4.9).
pub fn should_skip_for_nodump(path: &Path, honour_nodump: bool) -> bool
{
    honour_nodump && linux_flags::is_nodump(path).unwrap_or(false)
}

pub fn write_fsa(path: &Path, attrs: &[FsAttribute]) -> io::Result<()>
{
    for attr in attrs {
        if attr.family != FsaFamily::LinuxExt {
            continue;
        }
        match attr.nature {
            linux_ext_nature::IMMUTABLE => linux_flags::set_immutable(path, true)?,
            linux_ext_nature::NODUMP => linux_flags::set_nodump(path, true)?,
            _ => {}
        }
    }
    Ok(())
}

/// Removes every extended attribute currently present on `path`, for the
/// `EA_clear` restore action (spec.md §4.10): the in-place set is dropped
/// rather than left alone or replaced wholesale.
pub fn clear_ea(path: &Path) -> io::Result<()>
{
    for key in xattr::list(path)? {
        xattr::remove(path, &key)?;
    }
    Ok(())
}

/// Clears the linux-ext flags FSAs track (immutable, nodump), for the
/// `FSA_clear` restore action.
pub fn clear_fsa(path: &Path) -> io::Result<()>
{
    linux_flags::set_immutable(path, false)?;
    linux_flags::set_nodump(path, false)?;
    Ok(())
}

/// Common key extraction for merging an existing and an incoming
/// attribute set by identity, used by the restore walker's merge actions.
pub trait NamedAttr {
    type Name: PartialEq;
    fn attr_name(&self) -> Self::Name;
}

impl NamedAttr for ExtendedAttribute {
    type Name = String;
    fn attr_name(&self) -> String
    {
        self.key.clone()
    }
}

impl NamedAttr for FsAttribute {
    type Name = (FsaFamily, u8);
    fn attr_name(&self) -> (FsaFamily, u8)
    {
        (self.family, self.nature)
    }
}

/// `CACHEDIR.TAG`-detection for the backup walker's cache-directory
/// tagging option (spec.md §4.9): per the cache directory tagging
/// standard, a directory is a cache directory if it contains a file of
/// this name starting with this exact signature.
pub fn is_cache_tagged_directory(dir: &Path) -> bool
{
    const SIGNATURE: &[u8] = b"Signature: 8a477f597d28d172789f06886806bc55";
    let tag_path = dir.join("CACHEDIR.TAG");
    match std::fs::read(&tag_path) {
        Ok(content) => content.starts_with(SIGNATURE),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ea_roundtrips_through_a_real_file() -> io::Result<()>
    {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        std::fs::write(&path, b"content")?;

        let set_ok = xattr::set(&path, "user.darc.test", b"value").is_ok();
        if !set_ok {
            // xattrs unsupported on this filesystem/sandbox; nothing to assert.
            return Ok(());
        }
        let attrs = read_ea(&path)?;
        assert!(attrs.iter().any(|a| a.key == "user.darc.test" && a.value == b"value"));
        Ok(())
    }

    #[test]
    fn non_cache_tagged_directory_detected_as_such()
    {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_cache_tagged_directory(dir.path()));
    }

    #[test]
    fn cache_tagged_directory_detected()
    {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("CACHEDIR.TAG"),
            b"Signature: 8a477f597d28d172789f06886806bc55\nother content",
        )
        .unwrap();
        assert!(is_cache_tagged_directory(dir.path()));
    }
}
