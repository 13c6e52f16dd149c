//! Inode structures and the lazy inode handle.
//!
//! An [`Inode`] is a lightweight handle: filesystem reference, inode
//! number, and whatever the directory entry that produced it already knew
//! (name, file-type hint, parent). The on-disk record is only read on the
//! first field access, which matters when scanning large trees where most
//! entries are never dereferenced.

use core::cell::OnceCell;
use core::fmt;
use std::io::{Cursor, Read};

use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;

use crate::dir::{DirectoryIterator, Filename};
use crate::err::{Error, Result};
use crate::extent::extent_runs;
use crate::file::{Datarun, InodeStream, RunlistStream};
use crate::indirect::indirect_runs;
use crate::vol::Volume;
use crate::xattr::{self, XAttr, XAttrBlockHeader, XATTR_MAGIC};
use crate::ExtFs;

/// File mode field of an inode: POSIX permission bits plus the file-type
/// bits in the high nibble.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    /// Others may execute.
    pub const S_IXOTH: Self = Self(0o0001);

    /// Others may write.
    pub const S_IWOTH: Self = Self(0o0002);

    /// Others may read.
    pub const S_IROTH: Self = Self(0o0004);

    /// Group may execute.
    pub const S_IXGRP: Self = Self(0o0010);

    /// Group may write.
    pub const S_IWGRP: Self = Self(0o0020);

    /// Group may read.
    pub const S_IRGRP: Self = Self(0o0040);

    /// User may execute.
    pub const S_IXUSR: Self = Self(0o0100);

    /// User may write.
    pub const S_IWUSR: Self = Self(0o0200);

    /// User may read.
    pub const S_IRUSR: Self = Self(0o0400);

    /// Sticky bit.
    pub const S_ISVTX: Self = Self(0o1000);

    /// Set GID.
    pub const S_ISGID: Self = Self(0o2000);

    /// Set UID.
    pub const S_ISUID: Self = Self(0o4000);

    /// FIFO.
    pub const S_IFIFO: Self = Self(0x1000);

    /// Character device.
    pub const S_IFCHR: Self = Self(0x2000);

    /// Directory.
    pub const S_IFDIR: Self = Self(0x4000);

    /// Block device.
    pub const S_IFBLK: Self = Self(0x6000);

    /// Regular file.
    pub const S_IFREG: Self = Self(0x8000);

    /// Symbolic link.
    pub const S_IFLNK: Self = Self(0xA000);

    /// Socket.
    pub const S_IFSOCK: Self = Self(0xC000);

    /// Mask selecting the file-type bits.
    pub const S_IFMT: Self = Self(0xF000);

    pub fn contains(self, mode: Self) -> bool {
        self.0 & mode.0 != 0
    }

    /// The file-type bits alone.
    pub fn format(self) -> Self {
        Self(self.0 & Self::S_IFMT.0)
    }
}

macro_rules! symb_perm {
    ($self: ident, $str: tt, $symbol: literal, $flag: expr) => {
        if $self.contains($flag) {
            $str.push($symbol);
        } else {
            $str.push('-');
        }
    };
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut symbolic = String::new();

        symb_perm!(self, symbolic, 'r', FileMode::S_IRUSR);
        symb_perm!(self, symbolic, 'w', FileMode::S_IWUSR);
        symb_perm!(self, symbolic, 'x', FileMode::S_IXUSR);
        symb_perm!(self, symbolic, 'r', FileMode::S_IRGRP);
        symb_perm!(self, symbolic, 'w', FileMode::S_IWGRP);
        symb_perm!(self, symbolic, 'x', FileMode::S_IXGRP);
        symb_perm!(self, symbolic, 'r', FileMode::S_IROTH);
        symb_perm!(self, symbolic, 'w', FileMode::S_IWOTH);
        symb_perm!(self, symbolic, 'x', FileMode::S_IXOTH);

        f.write_str(&symbolic)
    }
}

/// Type of a filesystem object, from the file-type bits of its mode or
/// from a directory entry's file-type code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
    SymbolicLink,
    Unknown,
}

impl FileType {
    pub fn from_mode(mode: FileMode) -> Self {
        match mode.format() {
            FileMode::S_IFREG => FileType::Regular,
            FileMode::S_IFDIR => FileType::Directory,
            FileMode::S_IFCHR => FileType::CharacterDevice,
            FileMode::S_IFBLK => FileType::BlockDevice,
            FileMode::S_IFIFO => FileType::Fifo,
            FileMode::S_IFSOCK => FileType::Socket,
            FileMode::S_IFLNK => FileType::SymbolicLink,
            _ => FileType::Unknown,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::Regular => "file",
            FileType::Directory => "directory",
            FileType::CharacterDevice => "character device",
            FileType::BlockDevice => "block device",
            FileType::Fifo => "fifo",
            FileType::Socket => "socket",
            FileType::SymbolicLink => "symbolic link",
            FileType::Unknown => "unknown",
        })
    }
}

/// Inode flags field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFlags(pub u32);

impl InodeFlags {
    /// File is immutable.
    pub const IMMUTABLE_FL: Self = Self(0x10);

    /// Writes may only append.
    pub const APPEND_FL: Self = Self(0x20);

    /// Access time is not updated.
    pub const NOATIME_FL: Self = Self(0x80);

    /// Encrypted inode.
    pub const ENCRYPT_FL: Self = Self(0x800);

    /// Directory has hashed indexes.
    pub const INDEX_FL: Self = Self(0x1000);

    /// File data is journaled.
    pub const JOURNAL_DATA_FL: Self = Self(0x4000);

    /// Top of a directory hierarchy.
    pub const TOPDIR_FL: Self = Self(0x20000);

    /// Huge file.
    pub const HUGE_FILE_FL: Self = Self(0x40000);

    /// The inode's block region holds an extent tree.
    pub const EXTENTS_FL: Self = Self(0x80000);

    /// Inode stores a large extended-attribute value.
    pub const EA_INODE_FL: Self = Self(0x20_0000);

    /// File data lives directly in the inode.
    pub const INLINE_DATA_FL: Self = Self(0x1000_0000);

    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }
}

/// Fixed prologue of the on-disk inode record, 160 bytes.
///
/// The record on disk is `s_inode_size` bytes; everything past this
/// prologue is the spare tail that may hold in-inode extended attributes.
/// Records smaller than the prologue (classic 128-byte ext2 inodes) are
/// zero-extended before decoding, so the extended fields read as zero.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct RawInode {
    /// File mode
    pub(crate) i_mode: u16,

    /// Owner UID, low 16 bits
    pub(crate) i_uid: u16,

    /// Size in bytes, low 32 bits
    pub(crate) i_size_lo: u32,

    /// Last access time, in seconds since the epoch
    pub(crate) i_atime: u32,

    /// Last inode change time, in seconds since the epoch
    pub(crate) i_ctime: u32,

    /// Last data modification time, in seconds since the epoch
    pub(crate) i_mtime: u32,

    /// Deletion time, in seconds since the epoch
    pub(crate) i_dtime: u32,

    /// Group ID, low 16 bits
    pub(crate) i_gid: u16,

    /// Hard link count
    pub(crate) i_links_count: u16,

    /// Block count, low 32 bits
    pub(crate) i_blocks_lo: u32,

    /// Inode flags
    pub(crate) i_flags: u32,

    /// OS dependent / version field
    pub(crate) i_version: u32,

    /// Block map, extent tree, or inline data
    pub(crate) i_block: [u8; 60],

    /// File version, for NFS
    pub(crate) i_generation: u32,

    /// File ACL block, low 32 bits
    pub(crate) i_file_acl_lo: u32,

    /// Size in bytes, high 32 bits
    pub(crate) i_size_high: u32,

    /// Obsolete fragment address
    i_obso_faddr: u32,

    /// Block count, high 16 bits
    pub(crate) i_blocks_high: u16,

    /// File ACL block, high 16 bits
    pub(crate) i_file_acl_high: u16,

    /// Owner UID, high 16 bits
    pub(crate) i_uid_high: u16,

    /// Group ID, high 16 bits
    pub(crate) i_gid_high: u16,

    /// Inode checksum, low 16 bits; parsed, never verified
    pub(crate) i_checksum_lo: u16,

    reserved: u16,

    /// Bytes of this record used beyond the original 128-byte inode
    pub(crate) i_extra_isize: u16,

    /// Inode checksum, high 16 bits; parsed, never verified
    pub(crate) i_checksum_hi: u16,

    /// Extra change time bits (nsec << 2 | epoch)
    pub(crate) i_ctime_extra: u32,

    /// Extra modification time bits (nsec << 2 | epoch)
    pub(crate) i_mtime_extra: u32,

    /// Extra access time bits (nsec << 2 | epoch)
    pub(crate) i_atime_extra: u32,

    /// File creation time, in seconds since the epoch
    pub(crate) i_crtime: u32,

    /// Extra creation time bits (nsec << 2 | epoch)
    pub(crate) i_crtime_extra: u32,

    /// Version number, high 32 bits
    pub(crate) i_version_hi: u32,

    /// Project ID
    pub(crate) i_projid: u32,
}

/// Size of the fixed inode prologue.
pub(crate) const RAW_INODE_SIZE: usize = core::mem::size_of::<RawInode>();

/// A fully-read inode record: the fixed prologue plus the spare tail
/// (the bytes past the prologue and the `i_extra_isize` region, which is
/// where in-inode extended attributes live).
#[derive(Clone, Debug)]
pub(crate) struct InodeRecord {
    pub(crate) raw: RawInode,
    pub(crate) extra: Box<[u8]>,
}

impl RawInode {
    pub(crate) fn size(&self) -> u64 {
        u64::from(u32::from_le(self.i_size_lo)) | (u64::from(u32::from_le(self.i_size_high)) << 32)
    }

    pub(crate) fn mode(&self) -> FileMode {
        FileMode(u16::from_le(self.i_mode))
    }

    pub(crate) fn flags(&self) -> InodeFlags {
        InodeFlags(u32::from_le(self.i_flags))
    }

    pub(crate) fn file_acl(&self) -> u64 {
        u64::from(u32::from_le(self.i_file_acl_lo))
            | (u64::from(u16::from_le(self.i_file_acl_high)) << 32)
    }
}

/// Combines a raw 32-bit timestamp with its extension word into a count of
/// nanoseconds since the epoch.
///
/// The low two bits of the extension extend the seconds field past 2038;
/// the remaining 30 bits carry nanoseconds.
pub(crate) fn parse_ns(time: u32, time_extra: u32) -> u64 {
    let seconds = u64::from(time) | (u64::from(time_extra & 0b11) << 32);
    let nanos = u64::from(time_extra >> 2);

    seconds * 1_000_000_000 + nanos
}

/// Converts a nanosecond epoch count into a UTC timestamp.
fn ts_from_unix_ns(ns: u64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
        .ok_or_else(|| Error::InvalidFilesystem("timestamp out of range".into()))
}

/// Handle to one inode of an open filesystem.
///
/// Cheap to create and clone; the on-disk record is loaded through the
/// filesystem's inode cache on first access and memoized in the handle.
pub struct Inode<'fs, V: Volume> {
    fs: &'fs ExtFs<V>,
    inum: u32,
    filename: Option<Filename>,
    filetype_hint: Option<FileType>,
    parent: Option<u32>,
    record: OnceCell<InodeRecord>,
}

impl<V: Volume> Clone for Inode<'_, V> {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs,
            inum: self.inum,
            filename: self.filename.clone(),
            filetype_hint: self.filetype_hint,
            parent: self.parent,
            record: self.record.clone(),
        }
    }
}

impl<V: Volume> fmt::Debug for Inode<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("inum", &self.inum)
            .field("filename", &self.filename)
            .field("filetype_hint", &self.filetype_hint)
            .field("parent", &self.parent)
            .finish()
    }
}

impl<V: Volume> fmt::Display for Inode<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<inode {}>", self.inum)
    }
}

impl<'fs, V: Volume> Inode<'fs, V> {
    pub(crate) fn new(fs: &'fs ExtFs<V>, inum: u32, filename: Option<Filename>) -> Self {
        Self {
            fs,
            inum,
            filename,
            filetype_hint: None,
            parent: None,
            record: OnceCell::new(),
        }
    }

    /// Lazy child handle built while listing a directory.
    pub(crate) fn from_dir_entry(
        fs: &'fs ExtFs<V>,
        inum: u32,
        filename: Filename,
        filetype_hint: Option<FileType>,
        parent: u32,
    ) -> Self {
        Self {
            fs,
            inum,
            filename: Some(filename),
            filetype_hint,
            parent: Some(parent),
            record: OnceCell::new(),
        }
    }

    /// Inode number.
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// Name this inode was reached by, if it came from a directory entry or
    /// the filesystem root.
    pub fn filename(&self) -> Option<&Filename> {
        self.filename.as_ref()
    }

    /// Inode number of the directory this handle was listed from.
    pub fn parent_inum(&self) -> Option<u32> {
        self.parent
    }

    pub(crate) fn record(&self) -> Result<&InodeRecord> {
        if let Some(record) = self.record.get() {
            return Ok(record);
        }

        let record = self.fs.read_inode_record(self.inum)?;
        Ok(self.record.get_or_init(|| record))
    }

    /// File size, in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.record()?.raw.size())
    }

    /// Full mode field, permissions included.
    pub fn mode(&self) -> Result<FileMode> {
        Ok(self.record()?.raw.mode())
    }

    /// Inode flags.
    pub fn flags(&self) -> Result<InodeFlags> {
        Ok(self.record()?.raw.flags())
    }

    /// File type, preferring the directory entry's hint so listing a tree
    /// does not force a record read per entry.
    pub fn filetype(&self) -> Result<FileType> {
        if let Some(hint) = self.filetype_hint {
            return Ok(hint);
        }
        Ok(FileType::from_mode(self.mode()?))
    }

    /// Owner UID, with the high half folded in.
    pub fn uid(&self) -> Result<u32> {
        let raw = &self.record()?.raw;
        Ok(u32::from(u16::from_le(raw.i_uid)) | (u32::from(u16::from_le(raw.i_uid_high)) << 16))
    }

    /// Group ID, with the high half folded in.
    pub fn gid(&self) -> Result<u32> {
        let raw = &self.record()?.raw;
        Ok(u32::from(u16::from_le(raw.i_gid)) | (u32::from(u16::from_le(raw.i_gid_high)) << 16))
    }

    /// Hard link count.
    pub fn links(&self) -> Result<u16> {
        Ok(u16::from_le(self.record()?.raw.i_links_count))
    }

    /// Generation number.
    pub fn generation(&self) -> Result<u32> {
        Ok(u32::from_le(self.record()?.raw.i_generation))
    }

    /// Block holding this inode's out-of-line extended attributes, with
    /// the high half folded in; zero when there is none.
    pub fn file_acl(&self) -> Result<u64> {
        Ok(self.record()?.raw.file_acl())
    }

    fn time_ns(&self, time: u32, time_extra: u32) -> u64 {
        // The extension words are only meaningful on large inode records.
        let extra = if self.fs.inode_size() > 128 {
            time_extra
        } else {
            0
        };
        parse_ns(time, extra)
    }

    /// Last access time, in nanoseconds since the epoch.
    pub fn atime_ns(&self) -> Result<u64> {
        let raw = &self.record()?.raw;
        Ok(self.time_ns(u32::from_le(raw.i_atime), u32::from_le(raw.i_atime_extra)))
    }

    /// Last access time.
    pub fn atime(&self) -> Result<DateTime<Utc>> {
        ts_from_unix_ns(self.atime_ns()?)
    }

    /// Last data modification time, in nanoseconds since the epoch.
    pub fn mtime_ns(&self) -> Result<u64> {
        let raw = &self.record()?.raw;
        Ok(self.time_ns(u32::from_le(raw.i_mtime), u32::from_le(raw.i_mtime_extra)))
    }

    /// Last data modification time.
    pub fn mtime(&self) -> Result<DateTime<Utc>> {
        ts_from_unix_ns(self.mtime_ns()?)
    }

    /// Last inode change time, in nanoseconds since the epoch.
    pub fn ctime_ns(&self) -> Result<u64> {
        let raw = &self.record()?.raw;
        Ok(self.time_ns(u32::from_le(raw.i_ctime), u32::from_le(raw.i_ctime_extra)))
    }

    /// Last inode change time.
    pub fn ctime(&self) -> Result<DateTime<Utc>> {
        ts_from_unix_ns(self.ctime_ns()?)
    }

    /// Creation time in nanoseconds since the epoch, when the inode record
    /// is large enough to store one.
    pub fn crtime_ns(&self) -> Result<Option<u64>> {
        if self.fs.inode_size() <= 128 {
            return Ok(None);
        }

        let raw = &self.record()?.raw;
        Ok(Some(parse_ns(
            u32::from_le(raw.i_crtime),
            u32::from_le(raw.i_crtime_extra),
        )))
    }

    /// Creation time, when available.
    pub fn crtime(&self) -> Result<Option<DateTime<Utc>>> {
        match self.crtime_ns()? {
            Some(ns) => Ok(Some(ts_from_unix_ns(ns)?)),
            None => Ok(None),
        }
    }

    /// Deletion time.
    pub fn dtime(&self) -> Result<DateTime<Utc>> {
        let secs = u32::from_le(self.record()?.raw.i_dtime);
        ts_from_unix_ns(u64::from(secs) * 1_000_000_000)
    }

    /// Target of a symbolic link.
    pub fn link(&self) -> Result<String> {
        if self.filetype()? != FileType::SymbolicLink {
            return Err(Error::NotASymlink(format!("{self} is not a symlink")));
        }

        let size = self.size()? as usize;
        let mut target = vec![0u8; size];
        self.open()?.read_exact(&mut target)?;

        String::from_utf8(target)
            .map_err(|_| Error::InvalidFilesystem(format!("{self} has a non-UTF-8 link target")))
    }

    /// Resolves the symlink target to an inode.
    ///
    /// An absolute target resolves from the root. Relative targets resolve
    /// from the directory this handle was listed from; `.` and `..` are
    /// real directory entries, so targets beginning with them navigate
    /// from there on their own. A relative target on a handle with no
    /// known parent falls back to the root.
    pub fn link_inode(&self) -> Result<Inode<'fs, V>> {
        let link = self.link()?;

        let relnode = if link.starts_with('/') {
            None
        } else {
            match self.parent {
                Some(parent) => Some(self.fs.inode(parent)?),
                None => None,
            }
        };

        self.fs.get_from(&link, relnode.as_ref())
    }

    /// All extended attributes of this inode, in-inode entries first, then
    /// the out-of-line block's.
    pub fn xattr(&self) -> Result<Vec<XAttr>> {
        let record = self.record()?.clone();
        let mut attrs = Vec::new();

        if record.extra.len() >= 4 && record.extra.iter().any(|&b| b != 0) {
            let magic = u32::from_le_bytes(record.extra[0..4].try_into().unwrap());
            if magic != XATTR_MAGIC {
                return Err(Error::InvalidFilesystem("Invalid xattr magic value".into()));
            }

            xattr::decode_region(self.fs, &record.extra, 4, 4, &mut attrs)?;
        }

        let file_acl = record.raw.file_acl();
        if file_acl != 0 {
            let block = self.fs.read_block(file_acl)?;
            let header: XAttrBlockHeader =
                bytemuck::pod_read_unaligned(&block[..core::mem::size_of::<XAttrBlockHeader>()]);
            if u32::from_le(header.magic) != XATTR_MAGIC {
                return Err(Error::InvalidFilesystem("Invalid xattr magic value".into()));
            }

            xattr::decode_region(self.fs, &block, 32, 0, &mut attrs)?;
        }

        Ok(attrs)
    }

    /// The ordered datarun list covering this inode's content.
    pub fn dataruns(&self) -> Result<Vec<Datarun>> {
        let record = self.record()?;
        let size = record.raw.size();

        if record.raw.flags().contains(InodeFlags::EXTENTS_FL) {
            extent_runs(self.fs, record, size)
        } else {
            indirect_runs(self.fs, record, size)
        }
    }

    /// Opens the inode's content as a readable stream.
    ///
    /// Inline data and fast symlinks (targets shorter than the 60-byte
    /// block region) are served straight from the inode record; everything
    /// else goes through the datarun list.
    pub fn open(&self) -> Result<InodeStream<'fs, V>> {
        let record = self.record()?;
        let size = record.raw.size();

        let inline = record.raw.flags().contains(InodeFlags::INLINE_DATA_FL)
            || (self.filetype()? == FileType::SymbolicLink && size < 60);

        if inline {
            let end = (size as usize).min(record.raw.i_block.len());
            return Ok(InodeStream::Inline(Cursor::new(
                record.raw.i_block[..end].to_vec(),
            )));
        }

        Ok(InodeStream::Runs(RunlistStream::new(
            self.fs,
            self.dataruns()?,
            size,
            self.fs.block_size(),
        )))
    }

    /// Iterates this directory's entries in on-disk record order.
    pub fn iter_dir(&self) -> Result<DirectoryIterator<'fs, V>> {
        if self.filetype()? != FileType::Directory {
            return Err(Error::NotADirectory(format!("{self} is not a directory")));
        }

        let size = self.size()?;
        let mut buf = Vec::with_capacity(size as usize);
        self.open()?.read_to_end(&mut buf)?;

        Ok(DirectoryIterator::new(
            self.fs,
            self.inum,
            buf,
            size,
            self.fs.dirent_kind(),
        ))
    }

    /// Lists this directory as a name-to-inode map.
    ///
    /// When a name occurs more than once, the last record wins, exactly as
    /// if the entries had been inserted into the map in stream order.
    pub fn listdir(&self) -> Result<HashMap<Filename, Inode<'fs, V>>> {
        let mut entries = HashMap::new();
        for child in self.iter_dir()? {
            let name = child
                .filename()
                .cloned()
                .unwrap_or_default();
            entries.insert(name, child);
        }
        Ok(entries)
    }
}
