//! Block-group descriptor structures.
//!
//! Every block group owns a descriptor locating its bitmaps and its slice
//! of the inode table. Two on-disk layouts exist: the classic 32-byte
//! record, and the 64-byte record used when the filesystem is ext4 with the
//! `BIT64` feature and a recorded descriptor size of at least 64, which
//! adds high 32-bit halves to each block pointer.

use bytemuck::{Pod, Zeroable};

use crate::err::{Error, Result};

/// Classic 32-byte group descriptor (ext2/ext3, and ext4 without `BIT64`).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct GroupDescV1 {
    /// Block bitmap block
    pub(crate) block_bitmap_lo: u32,

    /// Inode bitmap block
    pub(crate) inode_bitmap_lo: u32,

    /// Inode table block
    pub(crate) inode_table_lo: u32,

    /// Free blocks count
    pub(crate) free_blocks_count_lo: u16,

    /// Free inodes count
    pub(crate) free_inodes_count_lo: u16,

    /// Directories count
    pub(crate) used_dirs_count_lo: u16,

    pad: u16,

    reserved: [u32; 3],
}

/// 64-byte group descriptor carrying high halves for the block pointers.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct GroupDescV2 {
    /// Block bitmap block, low 32 bits
    pub(crate) block_bitmap_lo: u32,

    /// Inode bitmap block, low 32 bits
    pub(crate) inode_bitmap_lo: u32,

    /// Inode table block, low 32 bits
    pub(crate) inode_table_lo: u32,

    /// Free blocks count, low 16 bits
    pub(crate) free_blocks_count_lo: u16,

    /// Free inodes count, low 16 bits
    pub(crate) free_inodes_count_lo: u16,

    /// Directories count, low 16 bits
    pub(crate) used_dirs_count_lo: u16,

    /// Group flags (`INODE_UNINIT` and friends)
    pub(crate) flags: u16,

    /// Snapshot exclusion bitmap, low 32 bits
    pub(crate) exclude_bitmap_lo: u32,

    /// Block bitmap checksum, low 16 bits
    pub(crate) block_bitmap_csum_lo: u16,

    /// Inode bitmap checksum, low 16 bits
    pub(crate) inode_bitmap_csum_lo: u16,

    /// Unused inodes count, low 16 bits
    pub(crate) itable_unused_lo: u16,

    /// Group descriptor checksum; parsed, never verified
    pub(crate) checksum: u16,

    /// Block bitmap block, high 32 bits
    pub(crate) block_bitmap_hi: u32,

    /// Inode bitmap block, high 32 bits
    pub(crate) inode_bitmap_hi: u32,

    /// Inode table block, high 32 bits
    pub(crate) inode_table_hi: u32,

    /// Free blocks count, high 16 bits
    pub(crate) free_blocks_count_hi: u16,

    /// Free inodes count, high 16 bits
    pub(crate) free_inodes_count_hi: u16,

    /// Directories count, high 16 bits
    pub(crate) used_dirs_count_hi: u16,

    /// Unused inodes count, high 16 bits
    pub(crate) itable_unused_hi: u16,

    /// Snapshot exclusion bitmap, high 32 bits
    pub(crate) exclude_bitmap_hi: u32,

    /// Block bitmap checksum, high 16 bits
    pub(crate) block_bitmap_csum_hi: u16,

    /// Inode bitmap checksum, high 16 bits
    pub(crate) inode_bitmap_csum_hi: u16,

    reserved: u32,
}

/// Which of the two descriptor layouts a filesystem uses. Decided once when
/// the filesystem is opened, never per record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GroupDescKind {
    V1,
    V2,
}

impl GroupDescKind {
    /// Intrinsic size of the record layout, in bytes.
    pub(crate) fn record_size(self) -> u64 {
        match self {
            GroupDescKind::V1 => core::mem::size_of::<GroupDescV1>() as u64,
            GroupDescKind::V2 => core::mem::size_of::<GroupDescV2>() as u64,
        }
    }
}

/// A fully-decoded group descriptor: the three block pointers the parser
/// consumes, with high halves already folded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupDescriptor {
    /// Block holding the block-allocation bitmap.
    pub block_bitmap: u64,

    /// Block holding the inode-allocation bitmap.
    pub inode_bitmap: u64,

    /// First block of this group's slice of the inode table.
    pub inode_table: u64,
}

impl GroupDescriptor {
    /// Decodes a raw descriptor record of the given layout and bounds-checks
    /// its block pointers against the last block of the filesystem.
    pub(crate) fn parse(kind: GroupDescKind, bytes: &[u8], last_block: u64) -> Result<Self> {
        if (bytes.len() as u64) < kind.record_size() {
            return Err(Error::InvalidFilesystem(
                "group descriptor smaller than its layout".into(),
            ));
        }

        let desc = match kind {
            GroupDescKind::V1 => {
                let raw: GroupDescV1 = bytemuck::pod_read_unaligned(
                    &bytes[..core::mem::size_of::<GroupDescV1>()],
                );
                GroupDescriptor {
                    block_bitmap: u64::from(u32::from_le(raw.block_bitmap_lo)),
                    inode_bitmap: u64::from(u32::from_le(raw.inode_bitmap_lo)),
                    inode_table: u64::from(u32::from_le(raw.inode_table_lo)),
                }
            }
            GroupDescKind::V2 => {
                let raw: GroupDescV2 = bytemuck::pod_read_unaligned(
                    &bytes[..core::mem::size_of::<GroupDescV2>()],
                );
                GroupDescriptor {
                    block_bitmap: u64::from(u32::from_le(raw.block_bitmap_lo))
                        | (u64::from(u32::from_le(raw.block_bitmap_hi)) << 32),
                    inode_bitmap: u64::from(u32::from_le(raw.inode_bitmap_lo))
                        | (u64::from(u32::from_le(raw.inode_bitmap_hi)) << 32),
                    inode_table: u64::from(u32::from_le(raw.inode_table_lo))
                        | (u64::from(u32::from_le(raw.inode_table_hi)) << 32),
                }
            }
        };

        if desc.block_bitmap > last_block
            || desc.inode_bitmap > last_block
            || desc.inode_table > last_block
        {
            return Err(Error::OutOfRange(
                "Group descriptor block locations exceed last block".into(),
            ));
        }

        Ok(desc)
    }
}
