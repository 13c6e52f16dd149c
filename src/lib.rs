//! Read-only parser for the ext2/ext3/ext4 filesystem family and the JBD2
//! journal format.
//!
//! Given any seekable byte source (a raw disk, a partition, or a plain
//! image file), [`ExtFs`] exposes the directory tree, per-file metadata,
//! file contents, extended attributes, and the filesystem journal for
//! inspection. Nothing is ever written back, no checksums are verified,
//! and corrupted regions fail with typed errors instead of being repaired.
//!
//! ```no_run
//! use std::io::Read;
//!
//! # fn main() -> extfs::Result<()> {
//! let image = std::fs::File::open("ext4.bin").map_err(extfs::Error::Io)?;
//! let fs = extfs::ExtFs::new(image)?;
//!
//! for (name, inode) in fs.root()?.listdir()? {
//!     println!("{name} -> inode {}", inode.inum());
//! }
//!
//! let inode = fs.get("/etc/hostname")?;
//! let mut contents = String::new();
//! inode.open()?.read_to_string(&mut contents).map_err(extfs::Error::Io)?;
//! # Ok(())
//! # }
//! ```

use core::cell::RefCell;

use log::info;
use uuid::Uuid;

pub mod block_grp;
mod cache;
pub mod dir;
pub mod err;
pub(crate) mod extent;
pub mod file;
pub(crate) mod indirect;
pub mod inode;
pub mod journal;
pub mod sb;
pub mod vol;
pub mod xattr;

pub use dir::{DirectoryIterator, Filename};
pub use err::{Error, Result};
pub use file::{Datarun, InodeStream, RunlistStream};
pub use inode::{FileMode, FileType, Inode, InodeFlags};
pub use journal::{CommitBlock, DescriptorBlock, DescriptorBlockTag, Jdb2, LogBlock};
pub use sb::{FsType, Superblock, EXT2_SBOFF};
pub use vol::Volume;
pub use xattr::XAttr;

use crate::block_grp::{GroupDescKind, GroupDescriptor};
use crate::cache::LruCache;
use crate::dir::DirEntryKind;
use crate::inode::{InodeRecord, RawInode, RAW_INODE_SIZE};
use crate::sb::{CompatibleFeatureSet, IncompatibleFeatureSet};

/// First usable inode number; inode 1 holds the bad-blocks list.
pub const EXT2_BAD_INO: u32 = 1;

/// Inode number of the root directory.
pub const EXT2_ROOT_INO: u32 = 2;

const INODE_CACHE_CAPACITY: usize = 1024;
const GROUP_DESC_CACHE_CAPACITY: usize = 256;

/// An open ext2/ext3/ext4 filesystem.
///
/// Owns the backing volume and all caches. The volume is a shared mutable
/// cursor, so it sits behind a `RefCell` and every operation pairs its
/// seek and read while holding the borrow; at most one logical read is in
/// flight at a time.
pub struct ExtFs<V: Volume> {
    vol: RefCell<V>,
    sb: Superblock,
    fstype: FsType,
    block_size: u64,
    block_count: u64,
    last_block: u64,
    desc_kind: GroupDescKind,
    desc_size: u64,
    groups_offset: u64,
    groups_count: u64,
    dirent_kind: DirEntryKind,
    uuid: Uuid,
    last_mount: String,
    inode_cache: RefCell<LruCache<u32, InodeRecord>>,
    group_cache: RefCell<LruCache<u32, GroupDescriptor>>,
}

impl<V: Volume> ExtFs<V> {
    /// Opens a filesystem image: reads the superblock at its fixed offset,
    /// validates it, and classifies the filesystem from its feature flags.
    pub fn new(mut vol: V) -> Result<Self> {
        let sb: Superblock = vol::read_record_at(&mut vol, EXT2_SBOFF)?;

        if !sb.magic.is_valid() {
            return Err(Error::InvalidFilesystem(
                "Not a valid ExtFS filesystem (magic mismatch)".into(),
            ));
        }

        if sb.inodes_count() < 10 {
            return Err(Error::InvalidFilesystem(
                "Not a valid ExtFS filesystem (inode count < 10)".into(),
            ));
        }

        if sb.blocks_per_group() == 0 || sb.inodes_per_group() == 0 {
            return Err(Error::InvalidFilesystem(
                "Not a valid ExtFS filesystem (blocks or inodes per group is 0)".into(),
            ));
        }

        if u32::from_le(sb.log_block_size) != u32::from_le(sb.log_cluster_size) {
            return Err(Error::UnsupportedFeature(
                "Different size cluster than blocks is currently not supported".into(),
            ));
        }

        // Block sizes run from 1024 (log 0) to 65536 (log 6); anything else
        // cannot come from a real filesystem, and rejecting it here keeps
        // the shift below defined.
        if u32::from_le(sb.log_block_size) > 6 {
            return Err(Error::InvalidFilesystem(
                "Not a valid ExtFS filesystem (invalid block size)".into(),
            ));
        }

        let block_size = sb.blk_size();

        if sb.inode_size() < 128 {
            return Err(Error::InvalidFilesystem(
                "Not a valid ExtFS filesystem (implausible inode size)".into(),
            ));
        }

        let fstype = sb.fs_type();
        let block_count = sb.blk_count();
        let last_block = block_count.saturating_sub(1);

        let desc_kind = if fstype == FsType::Ext4
            && sb
                .feature_incompat()
                .includes(IncompatibleFeatureSet::BIT64)
            && sb.desc_size() >= 64
        {
            GroupDescKind::V2
        } else {
            GroupDescKind::V1
        };
        let desc_size = if sb.desc_size() != 0 {
            u64::from(sb.desc_size())
        } else {
            desc_kind.record_size()
        };

        // The group-descriptor table starts on the first block boundary
        // past the superblock.
        let goff = EXT2_SBOFF + desc_size;
        let groups_offset = if goff % block_size == 0 {
            goff
        } else {
            goff + block_size - goff % block_size
        };

        let groups_count = (last_block.saturating_sub(u64::from(sb.first_data_block()))
            / u64::from(sb.blocks_per_group()))
            + 1;

        let dirent_kind = if sb
            .feature_incompat()
            .includes(IncompatibleFeatureSet::FILETYPE)
        {
            DirEntryKind::Filetype
        } else {
            DirEntryKind::Classic
        };

        let uuid = Uuid::from_bytes(sb.uuid);
        let last_mount = sb.last_mounted();

        info!(
            target: "extfs",
            "opened {fstype} filesystem: label = {:?}  uuid = {uuid}  inodes = {}  blocks = {block_count}  block size = {block_size}",
            sb.volume_name(),
            sb.inodes_count(),
        );

        Ok(Self {
            vol: RefCell::new(vol),
            sb,
            fstype,
            block_size,
            block_count,
            last_block,
            desc_kind,
            desc_size,
            groups_offset,
            groups_count,
            dirent_kind,
            uuid,
            last_mount,
            inode_cache: RefCell::new(LruCache::new(INODE_CACHE_CAPACITY)),
            group_cache: RefCell::new(LruCache::new(GROUP_DESC_CACHE_CAPACITY)),
        })
    }

    /// The raw superblock record.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Which member of the ext family this filesystem is.
    pub fn fs_type(&self) -> FsType {
        self.fstype
    }

    /// Block size, in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Total number of blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Number of the last block.
    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    /// Byte offset of the group-descriptor table.
    pub fn groups_offset(&self) -> u64 {
        self.groups_offset
    }

    /// Number of block groups.
    pub fn groups_count(&self) -> u64 {
        self.groups_count
    }

    /// Effective size of one group descriptor, in bytes.
    pub fn group_desc_size(&self) -> u64 {
        self.desc_size
    }

    /// Filesystem UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Path the filesystem was last mounted on.
    pub fn last_mount(&self) -> &str {
        &self.last_mount
    }

    /// Volume label.
    pub fn volume_name(&self) -> String {
        self.sb.volume_name()
    }

    /// Size of one on-disk inode record, in bytes.
    pub fn inode_size(&self) -> u16 {
        self.sb.inode_size()
    }

    pub(crate) fn inodes_count(&self) -> u32 {
        self.sb.inodes_count()
    }

    pub(crate) fn dirent_kind(&self) -> DirEntryKind {
        self.dirent_kind
    }

    /// The root directory, inode 2, named `/`.
    pub fn root(&self) -> Result<Inode<'_, V>> {
        let inode = Inode::new(self, EXT2_ROOT_INO, Some(Filename::from("/")));
        inode.record()?;
        Ok(inode)
    }

    /// Loads an inode by number, reading and caching its record.
    pub fn inode(&self, inum: u32) -> Result<Inode<'_, V>> {
        if inum < EXT2_BAD_INO || inum > self.sb.inodes_count() {
            return Err(Error::OutOfRange(format!(
                "inum out of range {EXT2_BAD_INO}-{}: {inum}",
                self.sb.inodes_count()
            )));
        }

        let inode = Inode::new(self, inum, None);
        inode.record()?;
        Ok(inode)
    }

    /// Resolves a `/`-separated path from the root. `\` is accepted as an
    /// alias for `/`, and empty components are skipped.
    pub fn get(&self, path: &str) -> Result<Inode<'_, V>> {
        self.get_from(path, None)
    }

    /// Resolves a path starting from `from` (or the root when absent).
    ///
    /// Whenever the node a component is about to be looked up in is a
    /// symlink, it is transparently followed first; the final component
    /// itself is returned unresolved, so callers can inspect symlinks.
    pub fn get_from<'fs>(
        &'fs self,
        path: &str,
        from: Option<&Inode<'fs, V>>,
    ) -> Result<Inode<'fs, V>> {
        let path = path.replace('\\', "/");

        let mut node = match from {
            Some(node) => node.clone(),
            None => self.root()?,
        };

        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }

            while node.filetype()? == FileType::SymbolicLink {
                node = node.link_inode()?;
            }

            let entries = node.listdir()?;
            node = entries
                .get(&Filename::from(part))
                .cloned()
                .ok_or_else(|| Error::FileNotFound(format!("File not found: {path}")))?;
        }

        Ok(node)
    }

    /// Loads a group descriptor by group number, through the cache.
    pub fn group_desc(&self, group_num: u32) -> Result<GroupDescriptor> {
        if u64::from(group_num) >= self.groups_count {
            return Err(Error::OutOfRange(
                "Group number exceeds amount of groups".into(),
            ));
        }

        if let Some(desc) = self.group_cache.borrow_mut().get(&group_num) {
            return Ok(desc);
        }

        let offset = self.groups_offset + u64::from(group_num) * self.desc_size;
        let bytes = {
            let mut vol = self.vol.borrow_mut();
            vol::read_vec_at(&mut *vol, offset, self.desc_size as usize)?
        };

        let desc = GroupDescriptor::parse(self.desc_kind, &bytes, self.last_block)?;
        self.group_cache.borrow_mut().insert(group_num, desc);

        Ok(desc)
    }

    /// Opens the filesystem journal.
    ///
    /// Requires the `HAS_JOURNAL` feature and an internal journal inode; a
    /// journal on an external device is reported as unavailable.
    pub fn journal(&self) -> Result<Jdb2<InodeStream<'_, V>>> {
        if !self
            .sb
            .feature_compat()
            .includes(CompatibleFeatureSet::HAS_JOURNAL)
        {
            return Err(Error::JournalUnavailable("Journal not supported".into()));
        }

        let inum = self.sb.journal_inum();
        if inum == 0 {
            return Err(Error::JournalUnavailable(
                "Journal inum is 0, could be on an external device".into(),
            ));
        }

        let inode = self.inode(inum)?;
        Jdb2::new(inode.open()?)
    }

    /// Reads one filesystem block.
    pub(crate) fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        if block > self.last_block {
            return Err(Error::OutOfRange(format!(
                "block {block} beyond last block {}",
                self.last_block
            )));
        }

        let mut vol = self.vol.borrow_mut();
        vol::read_vec_at(&mut *vol, block * self.block_size, self.block_size as usize)
    }

    /// Fills `buf` from an absolute byte offset of the volume.
    pub(crate) fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut vol = self.vol.borrow_mut();
        vol::read_exact_at(&mut *vol, offset, buf)
    }

    /// Reads one inode record, through the cache.
    ///
    /// Records smaller than the fixed prologue are zero-extended, so the
    /// extended fields of classic 128-byte inodes read as zero. The spare
    /// tail past the prologue and `i_extra_isize` is kept for the xattr
    /// decoder.
    pub(crate) fn read_inode_record(&self, inum: u32) -> Result<InodeRecord> {
        if let Some(record) = self.inode_cache.borrow_mut().get(&inum) {
            return Ok(record);
        }

        let inodes_per_group = self.sb.inodes_per_group();
        let group_num = (inum - 1) / inodes_per_group;
        let index = (inum - 1) % inodes_per_group;

        let desc = self.group_desc(group_num)?;
        let inode_size = usize::from(self.sb.inode_size());
        let offset = desc.inode_table * self.block_size + u64::from(index) * inode_size as u64;

        let bytes = {
            let mut vol = self.vol.borrow_mut();
            vol::read_vec_at(&mut *vol, offset, inode_size)?
        };

        let mut filled = vec![0u8; RAW_INODE_SIZE.max(inode_size)];
        filled[..inode_size].copy_from_slice(&bytes);
        let raw: RawInode = bytemuck::pod_read_unaligned(&filled[..RAW_INODE_SIZE]);

        let extra: Box<[u8]> = if inode_size > 128 {
            let extra_isize = usize::from(u16::from_le(raw.i_extra_isize));
            let start = RAW_INODE_SIZE.min(inode_size);
            let len = inode_size.saturating_sub(128 + extra_isize);
            let end = (start + len).min(inode_size);
            bytes.get(start..end).unwrap_or_default().into()
        } else {
            Box::default()
        };

        let record = InodeRecord { raw, extra };
        self.inode_cache.borrow_mut().insert(inum, record.clone());

        Ok(record)
    }
}
