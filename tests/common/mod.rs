//! In-memory filesystem image builder for the integration tests.
//!
//! Images are assembled byte by byte with explicit little-endian (ext) and
//! big-endian (JBD2) writers, independently of the crate's own record
//! definitions, so the tests exercise the real on-disk layouts rather than
//! whatever the parser believes them to be.

#![allow(dead_code)]

/// Byte layout of the raw image under construction.
pub struct ImageBuilder {
    pub data: Vec<u8>,
    pub block_size: usize,
}

impl ImageBuilder {
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        Self {
            data: vec![0u8; block_size * total_blocks],
            block_size,
        }
    }

    pub fn block(&self, n: u64) -> usize {
        n as usize * self.block_size
    }

    pub fn w8(&mut self, off: usize, v: u8) {
        self.data[off] = v;
    }

    pub fn w16(&mut self, off: usize, v: u16) {
        self.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn w32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn w64(&mut self, off: usize, v: u64) {
        self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn wbe16(&mut self, off: usize, v: u16) {
        self.data[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub fn wbe32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn wbe64(&mut self, off: usize, v: u64) {
        self.data[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    pub fn wbytes(&mut self, off: usize, bytes: &[u8]) {
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
    }
}

// Feature flag values used when composing superblocks.
pub const COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const COMPAT_EXT_ATTR: u32 = 0x0008;
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;

pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFLNK: u16 = 0xA000;

pub const EXTENTS_FL: u32 = 0x80000;

/// The fields of the superblock the tests care about; everything else
/// stays zero.
pub struct SuperblockSpec {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub desc_size: u16,
    pub journal_inum: u32,
    pub uuid: [u8; 16],
    pub volume_name: &'static [u8],
    pub last_mounted: &'static [u8],
}

impl Default for SuperblockSpec {
    fn default() -> Self {
        Self {
            inodes_count: 32,
            blocks_count: 2048,
            first_data_block: 1,
            log_block_size: 0,
            blocks_per_group: 8192,
            inodes_per_group: 32,
            inode_size: 256,
            feature_compat: 0,
            feature_incompat: INCOMPAT_FILETYPE | INCOMPAT_EXTENTS | INCOMPAT_64BIT,
            desc_size: 64,
            journal_inum: 0,
            uuid: [0; 16],
            volume_name: b"extfs_test",
            last_mounted: b"/tmp/mnt",
        }
    }
}

impl ImageBuilder {
    pub fn write_superblock(&mut self, spec: &SuperblockSpec) {
        let o = 1024;
        self.w32(o, spec.inodes_count);
        self.w32(o + 4, spec.blocks_count);
        self.w32(o + 20, spec.first_data_block);
        self.w32(o + 24, spec.log_block_size);
        self.w32(o + 28, spec.log_block_size); // cluster size matches
        self.w32(o + 32, spec.blocks_per_group);
        self.w32(o + 36, spec.blocks_per_group); // clusters per group
        self.w32(o + 40, spec.inodes_per_group);
        self.w16(o + 56, 0xEF53);
        self.w16(o + 58, 0x0001); // cleanly unmounted
        self.w32(o + 76, 1); // dynamic revision
        self.w32(o + 84, 11); // first non-reserved inode
        self.w16(o + 88, spec.inode_size);
        self.w32(o + 92, spec.feature_compat);
        self.w32(o + 96, spec.feature_incompat);
        self.wbytes(o + 104, &spec.uuid);
        self.wbytes(o + 120, spec.volume_name);
        self.wbytes(o + 136, spec.last_mounted);
        self.w32(o + 224, spec.journal_inum);
        self.w16(o + 254, spec.desc_size);
    }

    /// Writes a 64-byte group descriptor at `offset`.
    pub fn write_group_desc_v2(
        &mut self,
        offset: usize,
        block_bitmap: u64,
        inode_bitmap: u64,
        inode_table: u64,
    ) {
        self.w32(offset, block_bitmap as u32);
        self.w32(offset + 4, inode_bitmap as u32);
        self.w32(offset + 8, inode_table as u32);
        self.w32(offset + 32, (block_bitmap >> 32) as u32);
        self.w32(offset + 36, (inode_bitmap >> 32) as u32);
        self.w32(offset + 40, (inode_table >> 32) as u32);
    }

    /// Writes a 32-byte group descriptor at `offset`.
    pub fn write_group_desc_v1(
        &mut self,
        offset: usize,
        block_bitmap: u32,
        inode_bitmap: u32,
        inode_table: u32,
    ) {
        self.w32(offset, block_bitmap);
        self.w32(offset + 4, inode_bitmap);
        self.w32(offset + 8, inode_table);
    }
}

/// The fields of an inode record the tests care about.
pub struct InodeSpec {
    pub mode: u16,
    pub size: u64,
    pub links: u16,
    pub flags: u32,
    pub i_block: [u8; 60],
    pub atime: u32,
    pub atime_extra: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub crtime: u32,
    pub file_acl: u64,
    pub extra_isize: u16,
    pub uid: u16,
    pub gid: u16,
}

impl Default for InodeSpec {
    fn default() -> Self {
        Self {
            mode: S_IFREG | 0o644,
            size: 0,
            links: 1,
            flags: 0,
            i_block: [0; 60],
            atime: 0,
            atime_extra: 0,
            mtime: 0,
            ctime: 0,
            crtime: 0,
            file_acl: 0,
            extra_isize: 32,
            uid: 0,
            gid: 0,
        }
    }
}

impl ImageBuilder {
    /// Writes the record of inode `inum` into the inode table starting at
    /// `table_off` (single block group, records `inode_size` bytes apart).
    pub fn write_inode(
        &mut self,
        table_off: usize,
        inode_size: usize,
        inum: u32,
        spec: &InodeSpec,
    ) {
        let o = table_off + (inum as usize - 1) * inode_size;
        self.w16(o, spec.mode);
        self.w16(o + 2, spec.uid);
        self.w32(o + 4, spec.size as u32);
        self.w32(o + 8, spec.atime);
        self.w32(o + 12, spec.ctime);
        self.w32(o + 16, spec.mtime);
        self.w16(o + 24, spec.gid);
        self.w16(o + 26, spec.links);
        self.w32(o + 32, spec.flags);
        let block = spec.i_block;
        self.wbytes(o + 40, &block);
        self.w32(o + 104, spec.file_acl as u32);
        self.w32(o + 108, (spec.size >> 32) as u32);
        self.w16(o + 118, (spec.file_acl >> 32) as u16);

        if inode_size > 128 {
            self.w16(o + 128, spec.extra_isize);
            self.w32(o + 140, spec.atime_extra);
            self.w32(o + 144, spec.crtime);
        }
    }

    /// Offset of inode `inum`'s record within the image.
    pub fn inode_offset(&self, table_off: usize, inode_size: usize, inum: u32) -> usize {
        table_off + (inum as usize - 1) * inode_size
    }
}

/// Builds a 60-byte extent-tree root whose entries are leaves.
pub fn extent_root_leaves(leaves: &[(u32, u16, u64)]) -> [u8; 60] {
    let mut block = [0u8; 60];
    write_extent_node(&mut block, 0, leaves.len() as u16, 4);
    for (i, &(logical, len, physical)) in leaves.iter().enumerate() {
        write_extent_leaf(&mut block, 12 + i * 12, logical, len, physical);
    }
    block
}

/// Builds a 60-byte extent-tree root whose entries are index nodes.
pub fn extent_root_idx(children: &[(u32, u64)]) -> [u8; 60] {
    let mut block = [0u8; 60];
    write_extent_node(&mut block, 1, children.len() as u16, 4);
    for (i, &(logical, child)) in children.iter().enumerate() {
        let o = 12 + i * 12;
        block[o..o + 4].copy_from_slice(&logical.to_le_bytes());
        block[o + 4..o + 8].copy_from_slice(&((child & 0xFFFF_FFFF) as u32).to_le_bytes());
        block[o + 8..o + 10].copy_from_slice(&((child >> 32) as u16).to_le_bytes());
    }
    block
}

fn write_extent_node(buf: &mut [u8], depth: u16, entries: u16, max: u16) {
    buf[0..2].copy_from_slice(&0xF30Au16.to_le_bytes());
    buf[2..4].copy_from_slice(&entries.to_le_bytes());
    buf[4..6].copy_from_slice(&max.to_le_bytes());
    buf[6..8].copy_from_slice(&depth.to_le_bytes());
}

fn write_extent_leaf(buf: &mut [u8], o: usize, logical: u32, len: u16, physical: u64) {
    buf[o..o + 4].copy_from_slice(&logical.to_le_bytes());
    buf[o + 4..o + 6].copy_from_slice(&len.to_le_bytes());
    buf[o + 6..o + 8].copy_from_slice(&((physical >> 32) as u16).to_le_bytes());
    buf[o + 8..o + 12].copy_from_slice(&((physical & 0xFFFF_FFFF) as u32).to_le_bytes());
}

impl ImageBuilder {
    /// Writes a leaf extent node covering a whole filesystem block.
    pub fn write_extent_leaf_block(&mut self, block: u64, leaves: &[(u32, u16, u64)]) {
        let base = self.block(block);
        let max = ((self.block_size - 12) / 12) as u16;
        let mut node = vec![0u8; 12 + leaves.len() * 12];
        write_extent_node(&mut node, 0, leaves.len() as u16, max);
        for (i, &(logical, len, physical)) in leaves.iter().enumerate() {
            write_extent_leaf(&mut node, 12 + i * 12, logical, len, physical);
        }
        self.wbytes(base, &node);
    }

    /// Appends a `FILETYPE`-layout directory entry at `*off`.
    pub fn dirent_v2(&mut self, off: &mut usize, inum: u32, ftype: u8, name: &[u8], rec_len: u16) {
        let o = *off;
        self.w32(o, inum);
        self.w16(o + 4, rec_len);
        self.w8(o + 6, name.len() as u8);
        self.w8(o + 7, ftype);
        self.wbytes(o + 8, name);
        *off = o + rec_len as usize;
    }

    /// Appends a classic-layout directory entry at `*off`.
    pub fn dirent_v1(&mut self, off: &mut usize, inum: u32, name: &[u8], rec_len: u16) {
        let o = *off;
        self.w32(o, inum);
        self.w16(o + 4, rec_len);
        self.w16(o + 6, name.len() as u16);
        self.wbytes(o + 8, name);
        *off = o + rec_len as usize;
    }
}

// JBD2 writers. All fields big-endian.

pub const JBD2_MAGIC: u32 = 0xC03B_3998;
pub const JBD2_DESCRIPTOR: u32 = 1;
pub const JBD2_COMMIT: u32 = 2;
pub const JBD2_SB_V2: u32 = 4;
pub const JBD2_REVOKE: u32 = 5;
pub const JBD2_SAME_UUID: u32 = 2;
pub const JBD2_LAST_TAG: u32 = 8;
pub const JBD2_INCOMPAT_CSUM_V3: u32 = 0x10;

impl ImageBuilder {
    fn journal_header(&mut self, off: usize, blocktype: u32, sequence: u32) {
        self.wbe32(off, JBD2_MAGIC);
        self.wbe32(off + 4, blocktype);
        self.wbe32(off + 8, sequence);
    }

    /// Writes a journal superblock at `off`.
    pub fn write_journal_sb(
        &mut self,
        off: usize,
        block_size: u32,
        maxlen: u32,
        first: u32,
        sequence: u32,
        feature_incompat: u32,
    ) {
        self.journal_header(off, JBD2_SB_V2, 0);
        self.wbe32(off + 12, block_size);
        self.wbe32(off + 16, maxlen);
        self.wbe32(off + 20, first);
        self.wbe32(off + 24, sequence);
        self.wbe32(off + 28, first);
        self.wbe32(off + 44, feature_incompat);
    }

    /// Writes a descriptor block with 12-byte tags. Each tag is
    /// `(target_block, flags)`; tags without `SAME_UUID` are followed by a
    /// zeroed 16-byte UUID, as on disk.
    pub fn write_journal_desc_v2(&mut self, off: usize, sequence: u32, tags: &[(u64, u32)]) {
        self.journal_header(off, JBD2_DESCRIPTOR, sequence);
        let mut pos = off + 12;
        for &(target, flags) in tags {
            self.wbe32(pos, (target & 0xFFFF_FFFF) as u32);
            self.wbe16(pos + 6, flags as u16);
            self.wbe32(pos + 8, (target >> 32) as u32);
            pos += 12;
            if flags & JBD2_LAST_TAG != 0 {
                break;
            }
            if flags & JBD2_SAME_UUID == 0 {
                pos += 16;
            }
        }
    }

    /// Writes a descriptor block with 16-byte (`CSUM_V3`) tags.
    pub fn write_journal_desc_v3(&mut self, off: usize, sequence: u32, tags: &[(u64, u32)]) {
        self.journal_header(off, JBD2_DESCRIPTOR, sequence);
        let mut pos = off + 12;
        for &(target, flags) in tags {
            self.wbe32(pos, (target & 0xFFFF_FFFF) as u32);
            self.wbe32(pos + 4, flags);
            self.wbe32(pos + 8, (target >> 32) as u32);
            pos += 16;
            if flags & JBD2_LAST_TAG != 0 {
                break;
            }
            if flags & JBD2_SAME_UUID == 0 {
                pos += 16;
            }
        }
    }

    /// Writes a commit block at `off`.
    pub fn write_journal_commit(&mut self, off: usize, sequence: u32, sec: u64, nsec: u32) {
        self.journal_header(off, JBD2_COMMIT, sequence);
        self.w8(off + 12, 4); // crc32c
        self.w8(off + 13, 4);
        self.wbe64(off + 48, sec);
        self.wbe32(off + 56, nsec);
    }

    /// Writes a revoke block header at `off`.
    pub fn write_journal_revoke(&mut self, off: usize, sequence: u32) {
        self.journal_header(off, JBD2_REVOKE, sequence);
    }
}

/// UUID `ab98e08e-e2da-4bc9-bfc6-1ac5eafb1001` as raw bytes.
pub const TEST_UUID: [u8; 16] = [
    0xab, 0x98, 0xe0, 0x8e, 0xe2, 0xda, 0x4b, 0xc9, 0xbf, 0xc6, 0x1a, 0xc5, 0xea, 0xfb, 0x10,
    0x01,
];

/// Builds the reference ext4 image: one block group, a small directory
/// tree, extended attributes, and a two-transaction journal.
///
/// Layout (1024-byte blocks): superblock in block 1, descriptor table in
/// block 2, bitmaps in 3 and 4, inode table in 5..=12, root directory in
/// 13, file data in 14, xattr block 15, journal in 16..=23, lost+found in
/// 24.
pub fn build_basic_ext4() -> Vec<u8> {
    let mut img = ImageBuilder::new(1024, 25);

    img.write_superblock(&SuperblockSpec {
        feature_compat: COMPAT_HAS_JOURNAL | COMPAT_EXT_ATTR,
        journal_inum: 8,
        uuid: TEST_UUID,
        ..Default::default()
    });

    img.write_group_desc_v2(2048, 3, 4, 5);

    let table = 5 * 1024;

    // Root directory.
    img.write_inode(
        table,
        256,
        2,
        &InodeSpec {
            mode: S_IFDIR | 0o755,
            size: 1024,
            links: 3,
            flags: EXTENTS_FL,
            i_block: extent_root_leaves(&[(0, 1, 13)]),
            ..Default::default()
        },
    );

    // Journal inode.
    img.write_inode(
        table,
        256,
        8,
        &InodeSpec {
            mode: S_IFREG | 0o600,
            size: 8 * 1024,
            flags: EXTENTS_FL,
            i_block: extent_root_leaves(&[(0, 8, 16)]),
            ..Default::default()
        },
    );

    // lost+found.
    img.write_inode(
        table,
        256,
        11,
        &InodeSpec {
            mode: S_IFDIR | 0o700,
            size: 1024,
            links: 2,
            flags: EXTENTS_FL,
            i_block: extent_root_leaves(&[(0, 1, 24)]),
            ..Default::default()
        },
    );

    // test_file.
    img.write_inode(
        table,
        256,
        12,
        &InodeSpec {
            mode: S_IFREG | 0o644,
            size: 26,
            flags: EXTENTS_FL,
            i_block: extent_root_leaves(&[(0, 1, 14)]),
            atime: 1_527_584_278,
            mtime: 1_527_584_278,
            ctime: 1_527_584_278,
            ..Default::default()
        },
    );

    // xattr_cap: one in-inode attribute, one in the out-of-line block.
    img.write_inode(
        table,
        256,
        13,
        &InodeSpec {
            mode: S_IFREG | 0o644,
            size: 0,
            flags: EXTENTS_FL,
            i_block: extent_root_leaves(&[]),
            file_acl: 15,
            ..Default::default()
        },
    );

    // In-inode xattr region of inode 13: starts at record offset 160 with
    // the ibody magic; values are relative to region start + 4.
    let rec = img.inode_offset(table, 256, 13);
    img.w32(rec + 160, 0xEA02_0000);
    let selinux_value = b"unconfined_u:object_r:unlabeled_t:s0\0";
    img.w8(rec + 164, 7); // name_len
    img.w8(rec + 165, 6); // security
    img.w16(rec + 166, 52); // value offset; region base 4 puts it at +56
    img.w32(rec + 172, selinux_value.len() as u32);
    img.wbytes(rec + 180, b"selinux");
    img.wbytes(rec + 160 + 4 + 52, selinux_value);

    // Out-of-line xattr block 15.
    let cap_value: &[u8] = &[
        0x01, 0x00, 0x00, 0x02, 0x00, 0x04, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let blk = 15 * 1024;
    img.w32(blk, 0xEA02_0000);
    img.w32(blk + 4, 1); // refcount
    img.w32(blk + 8, 1); // blocks
    img.w8(blk + 32, 10); // name_len
    img.w8(blk + 33, 6); // security
    img.w16(blk + 34, 1004); // value offset, relative to block start
    img.w32(blk + 40, cap_value.len() as u32);
    img.wbytes(blk + 48, b"capability");
    img.wbytes(blk + 1004, cap_value);

    // Root directory entries.
    let mut off = 13 * 1024;
    img.dirent_v2(&mut off, 2, 2, b".", 12);
    img.dirent_v2(&mut off, 2, 2, b"..", 12);
    img.dirent_v2(&mut off, 11, 2, b"lost+found", 20);
    img.dirent_v2(&mut off, 12, 1, b"test_file", 20);
    img.dirent_v2(&mut off, 13, 1, b"xattr_cap", 960);

    // lost+found entries.
    let mut off = 24 * 1024;
    img.dirent_v2(&mut off, 11, 2, b".", 12);
    img.dirent_v2(&mut off, 2, 2, b"..", 1012);

    img.wbytes(14 * 1024, b"dissect test file in ext4\n");

    // Journal: superblock, then two transactions of one data block each.
    let jbase = 16 * 1024;
    img.write_journal_sb(jbase, 1024, 8, 1, 10, 0);
    img.write_journal_desc_v2(jbase + 1024, 10, &[(200, JBD2_LAST_TAG)]);
    img.wbytes(jbase + 2 * 1024, b"logged data for block 200");
    img.write_journal_commit(jbase + 3 * 1024, 10, 1_527_584_300, 500_000);
    img.write_journal_desc_v2(jbase + 4 * 1024, 11, &[(300, JBD2_LAST_TAG | JBD2_SAME_UUID)]);
    img.wbytes(jbase + 5 * 1024, b"logged data for block 300");
    img.write_journal_commit(jbase + 6 * 1024, 11, 1_527_584_305, 0);

    img.data
}
