//! Superblock structures.
//!
//! The superblock stores the filesystem's geometry (block size, block and
//! inode counts, group layout) together with the feature flags that select
//! between the on-disk layout variants found across the ext2/ext3/ext4
//! family. It lives at a fixed 1024-byte offset from the start of the
//! volume, regardless of the block size.

use bytemuck::{Pod, Zeroable};

/// Offset of the superblock from the start of the volume, in bytes.
pub const EXT2_SBOFF: u64 = 1024;

/// Smallest block size the format allows; the actual block size is
/// `1024 << s_log_block_size`.
pub const EXT2_MIN_BLOCK_SIZE: u64 = 1024;

/// Largest block size the format allows.
pub const EXT4_MAX_BLOCK_SIZE: u64 = 65536;

/// Defines a feature-set newtype over a flags word of the superblock.
macro_rules! feature_set {
    ($struct_name: tt, $desc: literal) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
        #[repr(transparent)]
        #[doc = $desc]
        pub struct $struct_name(pub u32);

        impl $struct_name {
            /// Empty feature set
            pub const EMPTY_SET: Self = Self(0);

            /// Checks if this feature set is a subset of (included in) the
            /// feature set passed as argument.
            pub fn is_subset_of(self, features: Self) -> bool {
                (self.0 | features.0) ^ features.0 == 0
            }

            /// Checks if this feature set includes the feature set passed as
            /// argument.
            pub fn includes(self, features: Self) -> bool {
                features.is_subset_of(self)
            }
        }

        impl core::ops::BitOr for $struct_name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitAnd for $struct_name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self::Output {
                Self(self.0 & rhs.0)
            }
        }
    };
}

feature_set!(
    CompatibleFeatureSet,
    "Compatible feature set flags. The filesystem may still be read even if \
the parser does not understand every flag set here."
);

impl CompatibleFeatureSet {
    /// Directory preallocation.
    pub const DIR_PREALLOC: Self = Self(0x0001);

    /// Used by AFS to indicate inodes that are not linked into the directory
    /// namespace.
    pub const IMAGIC_INODES: Self = Self(0x0002);

    /// The filesystem keeps a JBD2 journal file.
    pub const HAS_JOURNAL: Self = Self(0x0004);

    /// Extended attributes are in use.
    pub const EXT_ATTR: Self = Self(0x0008);

    /// Space is reserved so the group-descriptor table can grow while the
    /// filesystem is mounted.
    pub const RESIZE_INODE: Self = Self(0x0010);

    /// Hashed B-trees speed up name lookup in large directories.
    pub const DIR_INDEX: Self = Self(0x0020);

    /// At most two backup superblocks are kept.
    pub const SPARSE_SUPER2: Self = Self(0x0200);
}

feature_set!(
    IncompatibleFeatureSet,
    "Incompatible feature set flags. A filesystem carrying flags the parser \
does not understand cannot be interpreted safely."
);

impl IncompatibleFeatureSet {
    /// Compression (never deployed upstream).
    pub const COMPRESSION: Self = Self(0x0001);

    /// Directory entries carry a file-type byte.
    pub const FILETYPE: Self = Self(0x0002);

    /// The filesystem needs journal recovery.
    pub const RECOVER: Self = Self(0x0004);

    /// Set on the superblock of an external journal device.
    pub const JOURNAL_DEV: Self = Self(0x0008);

    /// Meta block groups.
    pub const META_BG: Self = Self(0x0010);

    /// File block mappings use extent trees instead of indirect pointers.
    pub const EXTENTS: Self = Self(0x0040);

    /// The filesystem may be larger than 2^32 blocks; group descriptors grow
    /// to 64 bytes with high halves for their block pointers.
    pub const BIT64: Self = Self(0x0080);

    /// Multiple-mount protection.
    pub const MMP: Self = Self(0x0100);

    /// Flexible block groups.
    pub const FLEX_BG: Self = Self(0x0200);

    /// Extended-attribute values may live in a separate inode's data stream.
    pub const EA_INODE: Self = Self(0x0400);

    /// Data in directory entries.
    pub const DIRDATA: Self = Self(0x1000);

    /// The metadata checksum seed is stored in the superblock.
    pub const CSUM_SEED: Self = Self(0x2000);

    /// Large directories (over 2 GB or a 3-level htree).
    pub const LARGEDIR: Self = Self(0x4000);

    /// Small file data may live directly in the inode.
    pub const INLINE_DATA: Self = Self(0x8000);

    /// Encrypted inodes are present.
    pub const ENCRYPT: Self = Self(0x10000);
}

feature_set!(
    ReadOnlyCompatibleFeatureSet,
    "Read-only compatible feature set flags. A filesystem carrying unknown \
flags from this set may still be mounted read-only, which is all this \
parser ever does."
);

impl ReadOnlyCompatibleFeatureSet {
    /// Backup superblocks exist only in a subset of block groups.
    pub const SPARSE_SUPER: Self = Self(0x0001);

    /// A file larger than 2 GB exists.
    pub const LARGE_FILE: Self = Self(0x0002);

    pub const BTREE_DIR: Self = Self(0x0004);

    /// Files may be larger than 2 TB.
    pub const HUGE_FILE: Self = Self(0x0008);

    /// Group descriptors carry checksums.
    pub const GDT_CSUM: Self = Self(0x0010);

    /// The 65,000 hard-link limit per inode is lifted.
    pub const DIR_NLINK: Self = Self(0x0020);

    /// Inodes reserve space for extended metadata such as nanosecond
    /// timestamps.
    pub const EXTRA_ISIZE: Self = Self(0x0040);

    pub const QUOTA: Self = Self(0x0100);

    pub const BIGALLOC: Self = Self(0x0200);

    /// Metadata checksumming; checksum fields are parsed but not verified.
    pub const METADATA_CSUM: Self = Self(0x0400);

    pub const READONLY: Self = Self(0x1000);

    pub const PROJECT: Self = Self(0x2000);
}

/// Magic number field of the [`Superblock`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FsMagic(pub u16);

impl FsMagic {
    pub const MAGIC: Self = Self(0xEF53);

    pub fn is_valid(self) -> bool {
        Self(u16::from_le(self.0)) == Self::MAGIC
    }
}

/// The member of the ext family a filesystem belongs to, decided from the
/// superblock feature flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
}

impl core::fmt::Display for FsType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
        })
    }
}

/// On-disk superblock record, 1024 bytes.
///
/// All multi-byte fields are little-endian; raw field values must go
/// through the accessor methods to be host-endian correct.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Inodes count
    pub inodes_count: u32,

    /// Blocks count, low 32 bits
    pub blocks_count_lo: u32,

    /// Reserved blocks count, low 32 bits
    pub r_blocks_count_lo: u32,

    /// Free blocks count, low 32 bits
    pub free_blocks_count_lo: u32,

    /// Free inodes count
    pub free_inodes_count: u32,

    /// First data block; the block containing this superblock
    pub first_data_block: u32,

    /// Block size, defined as `log_2(block_size) - 10`
    pub log_block_size: u32,

    /// Allocation cluster size, defined as `log_2(cluster_size) - 10`
    pub log_cluster_size: u32,

    /// Number of blocks in each group
    pub blocks_per_group: u32,

    /// Number of clusters in each group
    pub clusters_per_group: u32,

    /// Number of inodes in each group
    pub inodes_per_group: u32,

    /// Last mount time, in seconds since the epoch
    pub mtime: u32,

    /// Last write time, in seconds since the epoch
    pub wtime: u32,

    /// Mount count since the last consistency check
    pub mnt_count: u16,

    /// Number of mounts allowed before a consistency check is required
    pub max_mnt_count: u16,

    /// Magic signature, `0xEF53`
    pub magic: FsMagic,

    /// Filesystem state
    pub state: u16,

    /// Behaviour when detecting errors
    pub errors: u16,

    /// Minor revision level
    pub minor_rev_level: u16,

    /// Time of last consistency check
    pub lastcheck: u32,

    /// Maximum time between consistency checks
    pub checkinterval: u32,

    /// Operating system the filesystem was created on
    pub creator_os: u32,

    /// Major revision level
    pub rev_level: u32,

    /// Default user ID for reserved blocks
    pub def_resuid: u16,

    /// Default group ID for reserved blocks
    pub def_resgid: u16,

    /// First non-reserved inode
    pub first_ino: u32,

    /// Size of each inode record, in bytes
    pub inode_size: u16,

    /// Block group number of this superblock copy
    pub block_group_nr: u16,

    /// Compatible feature set
    pub feature_compat: u32,

    /// Incompatible feature set
    pub feature_incompat: u32,

    /// Read-only compatible feature set
    pub feature_ro_compat: u32,

    /// 128-bit UUID for the volume
    pub uuid: [u8; 16],

    /// Volume name
    pub volume_name: [u8; 16],

    /// Directory the volume was last mounted on
    pub last_mounted: [u8; 64],

    /// Compression algorithm usage bitmap
    algorithm_usage_bitmap: u32,

    /// Number of blocks to try to preallocate for files
    pub prealloc_blocks: u8,

    /// Number of blocks to preallocate for directories
    pub prealloc_dir_blocks: u8,

    /// Group descriptors reserved for online growth
    pub reserved_gdt_blocks: u16,

    /// UUID of the journal superblock
    pub journal_uuid: [u8; 16],

    /// Inode number of the journal file
    pub journal_inum: u32,

    /// Device number of an external journal
    pub journal_dev: u32,

    /// Head of the list of inodes to delete
    pub last_orphan: u32,

    /// HTREE hash seed
    pub hash_seed: [u8; 16],

    /// Default hash version for directory hashes
    pub def_hash_version: u8,

    pub jnl_backup_type: u8,

    /// Size of group descriptors, in bytes
    pub desc_size: u16,

    /// Default mount options
    pub default_mount_opts: u32,

    /// First meta block group
    pub first_meta_bg: u32,

    /// Filesystem creation time
    pub mkfs_time: u32,

    /// Backup of the journal inode's block array and size fields
    pub jnl_blocks: [u32; 17],

    /// Blocks count, high 32 bits
    pub blocks_count_hi: u32,

    /// Reserved blocks count, high 32 bits
    pub r_blocks_count_hi: u32,

    /// Free blocks count, high 32 bits
    pub free_blocks_count_hi: u32,

    /// All inodes have at least this many extra bytes
    pub min_extra_isize: u16,

    /// New inodes should reserve this many extra bytes
    pub want_extra_isize: u16,

    /// Miscellaneous flags
    pub flags: u32,

    /// RAID stride
    pub raid_stride: u16,

    /// Seconds to wait in multi-mount-protection checking
    pub mmp_update_interval: u16,

    /// Block reserved for multi-mount protection
    pub mmp_block: u64,

    /// Blocks on all data disks (N * stride)
    pub raid_stripe_width: u32,

    /// `FLEX_BG` group size, as `log_2(groups_per_flex)`
    pub log_groups_per_flex: u8,

    /// Metadata checksum algorithm
    pub checksum_type: u8,

    /// Versioning level for encryption
    pub encryption_level: u8,

    reserved_pad: u8,

    /// Lifetime kilobytes written
    pub kbytes_written: u64,

    /// Inode number of the active snapshot
    pub snapshot_inum: u32,

    /// Sequential ID of the active snapshot
    pub snapshot_id: u32,

    /// Blocks reserved for the active snapshot's future use
    pub snapshot_r_blocks_count: u64,

    /// Head of the on-disk snapshot list
    pub snapshot_list: u32,

    /// Number of filesystem errors
    pub error_count: u32,

    /// First time an error happened
    pub first_error_time: u32,

    /// Inode involved in the first error
    pub first_error_ino: u32,

    /// Block involved in the first error
    pub first_error_block: u64,

    /// Function where the first error happened
    first_error_func: [u8; 32],

    /// Line number where the first error happened
    first_error_line: u32,

    /// Most recent time of an error
    pub last_error_time: u32,

    /// Inode involved in the last error
    pub last_error_ino: u32,

    /// Line number where the last error happened
    last_error_line: u32,

    /// Block involved in the last error
    pub last_error_block: u64,

    /// Function where the last error happened
    last_error_func: [u8; 32],

    /// Mount options, as a C string
    pub mount_opts: [u8; 64],

    /// Inode tracking user quota
    pub usr_quota_inum: u32,

    /// Inode tracking group quota
    pub grp_quota_inum: u32,

    /// Overhead blocks/clusters in the filesystem
    pub overhead_clusters: u32,

    /// Groups holding `SPARSE_SUPER2` backup superblocks
    pub backup_bgs: [u32; 2],

    /// Encryption algorithms in use
    pub encrypt_algos: [u8; 4],

    /// Salt for the `string2key` algorithm
    pub encrypt_pw_salt: [u8; 16],

    /// Location of the lost+found inode
    pub lpf_ino: u32,

    /// Inode tracking project quota
    pub prj_quota_inum: u32,

    /// `crc32c(uuid)` when `CSUM_SEED` is set
    pub checksum_seed: u32,

    /// High 8 bits of the last write time
    wtime_hi: u8,

    /// High 8 bits of the last mount time
    mtime_hi: u8,

    /// High 8 bits of the creation time
    mkfs_time_hi: u8,

    /// High 8 bits of the last consistency check time
    lastcheck_hi: u8,

    /// High 8 bits of the first error time
    first_error_time_hi: u8,

    /// High 8 bits of the last error time
    last_error_time_hi: u8,

    /// Error code of the first error
    first_error_errcode: u8,

    /// Error code of the last error
    last_error_errcode: u8,

    /// Filename charset encoding
    encoding: u16,

    /// Filename charset encoding flags
    encoding_flags: u16,

    reserved: [u32; 95],

    /// `crc32c(superblock)`; parsed, never verified
    pub checksum: u32,
}

impl Superblock {
    /// Total block count, combining the low and high halves.
    pub fn blk_count(&self) -> u64 {
        u64::from(u32::from_le(self.blocks_count_lo))
            | (u64::from(u32::from_le(self.blocks_count_hi)) << 32)
    }

    /// Size of a block, in bytes.
    pub fn blk_size(&self) -> u64 {
        EXT2_MIN_BLOCK_SIZE << u32::from_le(self.log_block_size)
    }

    pub fn inodes_count(&self) -> u32 {
        u32::from_le(self.inodes_count)
    }

    pub fn inodes_per_group(&self) -> u32 {
        u32::from_le(self.inodes_per_group)
    }

    pub fn blocks_per_group(&self) -> u32 {
        u32::from_le(self.blocks_per_group)
    }

    pub fn first_data_block(&self) -> u32 {
        u32::from_le(self.first_data_block)
    }

    /// Size of one on-disk inode record, in bytes.
    pub fn inode_size(&self) -> u16 {
        u16::from_le(self.inode_size)
    }

    /// On-disk size of a group descriptor as recorded by the superblock;
    /// zero on filesystems predating the field.
    pub fn desc_size(&self) -> u16 {
        u16::from_le(self.desc_size)
    }

    /// Inode number of the journal file; zero when the journal lives on an
    /// external device.
    pub fn journal_inum(&self) -> u32 {
        u32::from_le(self.journal_inum)
    }

    pub fn feature_compat(&self) -> CompatibleFeatureSet {
        CompatibleFeatureSet(u32::from_le(self.feature_compat))
    }

    pub fn feature_incompat(&self) -> IncompatibleFeatureSet {
        IncompatibleFeatureSet(u32::from_le(self.feature_incompat))
    }

    pub fn feature_ro_compat(&self) -> ReadOnlyCompatibleFeatureSet {
        ReadOnlyCompatibleFeatureSet(u32::from_le(self.feature_ro_compat))
    }

    /// Volume label, with trailing NUL bytes stripped.
    pub fn volume_name(&self) -> String {
        cstr(&self.volume_name)
    }

    /// Path the filesystem was last mounted on.
    pub fn last_mounted(&self) -> String {
        cstr(&self.last_mounted)
    }

    /// Classifies the filesystem from its feature flags.
    ///
    /// Extent support makes it ext4; otherwise the presence of a journal
    /// makes it ext3; anything else is plain ext2.
    pub fn fs_type(&self) -> FsType {
        if self
            .feature_incompat()
            .includes(IncompatibleFeatureSet::EXTENTS)
        {
            FsType::Ext4
        } else if self
            .feature_compat()
            .includes(CompatibleFeatureSet::HAS_JOURNAL)
        {
            FsType::Ext3
        } else {
            FsType::Ext2
        }
    }
}

/// Decodes a NUL-terminated byte field into an owned string, lossily.
pub(crate) fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_record_is_1024_bytes() {
        assert_eq!(core::mem::size_of::<Superblock>(), 1024);
    }

    #[test]
    fn feature_set_inclusion() {
        let set = IncompatibleFeatureSet::EXTENTS | IncompatibleFeatureSet::BIT64;
        assert!(set.includes(IncompatibleFeatureSet::EXTENTS));
        assert!(set.includes(IncompatibleFeatureSet::EXTENTS | IncompatibleFeatureSet::BIT64));
        assert!(!set.includes(IncompatibleFeatureSet::FILETYPE));
        assert!(IncompatibleFeatureSet::EMPTY_SET.is_subset_of(set));
    }

    #[test]
    fn cstr_stops_at_nul() {
        assert_eq!(cstr(b"/tmp/mnt\0\0\0"), "/tmp/mnt");
        assert_eq!(cstr(b"full"), "full");
    }
}
