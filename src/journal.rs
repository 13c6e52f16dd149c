//! JBD2 journal parsing.
//!
//! The journal is a circular log of blocks living inside the journal
//! inode's data stream (or on an external device). Metadata frames carry a
//! 12-byte header: descriptor blocks list the on-disk destinations of the
//! data blocks that follow them, commit blocks close a transaction, revoke
//! blocks are acknowledged and skipped. Everything between frames is data
//! payload, recognized by its header magic not matching.
//!
//! Unlike the ext structures, everything in JBD2 is big-endian; this module
//! keeps its own decoder and never shares field accessors with the rest of
//! the crate.

use core::cell::RefCell;

use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;
use log::debug;

use crate::err::{Error, Result};
use crate::vol::{self, Volume};

/// Magic number opening every journal metadata block.
pub const JBD2_MAGIC: u32 = 0xC03B_3998;

/// Descriptor block type.
pub const JBD2_DESCRIPTOR_BLOCK: u32 = 1;

/// Commit block type.
pub const JBD2_COMMIT_BLOCK: u32 = 2;

/// Version-1 journal superblock type.
pub const JBD2_SUPERBLOCK_V1: u32 = 3;

/// Version-2 journal superblock type.
pub const JBD2_SUPERBLOCK_V2: u32 = 4;

/// Revocation block type.
pub const JBD2_REVOKE_BLOCK: u32 = 5;

/// The logged data block was escaped (its leading magic was zeroed).
pub const JBD2_FLAG_ESCAPE: u32 = 1;

/// The tag shares the UUID of the previous tag; no 16-byte UUID follows.
pub const JBD2_FLAG_SAME_UUID: u32 = 2;

/// The block was deleted by this transaction.
pub const JBD2_FLAG_DELETED: u32 = 4;

/// Last tag of the descriptor block.
pub const JBD2_FLAG_LAST_TAG: u32 = 8;

/// Incompat feature selecting the 16-byte tag layout.
pub const JBD2_FEATURE_INCOMPAT_CSUM_V3: u32 = 0x10;

/// Common 12-byte header of every journal metadata block.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct JournalHeader {
    magic: u32,
    blocktype: u32,
    sequence: u32,
}

impl JournalHeader {
    fn magic(&self) -> u32 {
        u32::from_be(self.magic)
    }

    fn blocktype(&self) -> u32 {
        u32::from_be(self.blocktype)
    }

    fn sequence(&self) -> u32 {
        u32::from_be(self.sequence)
    }
}

const JOURNAL_HEADER_SIZE: usize = core::mem::size_of::<JournalHeader>();

/// On-disk journal superblock, 1024 bytes.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct JournalSuperblock {
    header: JournalHeader,

    /// Journal device block size
    blocksize: u32,

    /// Total blocks in the journal file
    maxlen: u32,

    /// First block of log information
    first: u32,

    /// First commit ID expected in the log
    sequence: u32,

    /// Block number of the start of the log
    start: u32,

    errno: u32,

    /// Compatible feature set
    feature_compat: u32,

    /// Incompatible feature set
    feature_incompat: u32,

    /// Read-only compatible feature set
    feature_ro_compat: u32,

    /// 128-bit UUID of the journal
    uuid: [u8; 16],

    /// Number of filesystems sharing the log
    nr_users: u32,

    /// Block number of the dynamic superblock copy
    dynsuper: u32,

    /// Limit of journal blocks per transaction
    max_transaction: u32,

    /// Limit of data blocks per transaction
    max_trans_data: u32,

    /// Checksum type; parsed, never verified
    checksum_type: u8,

    padding2: [u8; 3],

    padding: [u8; 168],

    /// `crc32c(superblock)`; parsed, never verified
    checksum: u32,

    /// IDs of all filesystems sharing the log
    users: [u8; 768],
}

/// Commit block header, 60 bytes.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct CommitHeader {
    header: JournalHeader,
    chksum_type: u8,
    chksum_size: u8,
    padding: [u8; 2],
    chksum: [u8; 32],

    /// Commit time, seconds since the epoch
    commit_sec: [u8; 8],

    /// Commit time, nanosecond remainder
    commit_nsec: u32,
}

/// 12-byte descriptor tag (default layout).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct BlockTagV2 {
    blocknr: u32,
    checksum: u16,
    flags: u16,
    blocknr_high: u32,
}

/// 16-byte descriptor tag, used when `CSUM_V3` is set.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct BlockTagV3 {
    blocknr: u32,
    flags: u32,
    blocknr_high: u32,
    checksum: u32,
}

/// A parsed JBD2 journal over any seekable stream.
///
/// Typically reached through [`crate::ExtFs::journal`], which hands it the
/// journal inode's data stream, but an external journal image works just
/// as well.
pub struct Jdb2<S: Volume> {
    stream: RefCell<S>,
    block_size: u64,
    first: u64,
    maxlen: u64,
    sequence: u32,
    tag_v3: bool,
    uuid: [u8; 16],
}

impl<S: Volume> Jdb2<S> {
    /// Reads and validates the journal superblock at offset zero of the
    /// stream.
    pub fn new(mut stream: S) -> Result<Self> {
        let sb: JournalSuperblock = vol::read_record_at(&mut stream, 0)?;

        if sb.header.magic() != JBD2_MAGIC {
            return Err(Error::InvalidFilesystem(
                "Not a valid JBD2 journal (magic mismatch)".into(),
            ));
        }

        let tag_v3 = u32::from_be(sb.feature_incompat) & JBD2_FEATURE_INCOMPAT_CSUM_V3 != 0;

        Ok(Self {
            stream: RefCell::new(stream),
            block_size: u64::from(u32::from_be(sb.blocksize)),
            first: u64::from(u32::from_be(sb.first)),
            maxlen: u64::from(u32::from_be(sb.maxlen)),
            sequence: u32::from_be(sb.sequence),
            tag_v3,
            uuid: sb.uuid,
        })
    }

    /// Journal block size, in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// First block of log information.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Total number of blocks in the journal.
    pub fn maxlen(&self) -> u64 {
        self.maxlen
    }

    /// First commit sequence the superblock expects in the log.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Journal UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Whether the log uses the 16-byte `CSUM_V3` tag layout.
    pub fn has_csum_v3(&self) -> bool {
        self.tag_v3
    }

    /// Reads one journal block.
    pub fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut stream = self.stream.borrow_mut();
        vol::read_vec_at(&mut *stream, block * self.block_size, self.block_size as usize)
    }

    /// Walks the log block by block, yielding every recognized descriptor
    /// and commit frame in ascending block order.
    ///
    /// Blocks whose header magic does not match are data payloads or
    /// garbage; the walk tolerates them and moves on one block. Revoke
    /// frames are acknowledged and skipped.
    pub fn walk(&self) -> Walk<'_, S> {
        Walk {
            jdb: self,
            block: self.first,
        }
    }

    /// Every commit in log order, each carrying the descriptor blocks that
    /// share its sequence number.
    pub fn commits_all(&self) -> CommitsAll<'_, S> {
        CommitsAll {
            walk: self.walk(),
            buffered: HashMap::new(),
        }
    }

    /// The strictly monotonic run of commits starting at the first observed
    /// sequence number. Once the sequence breaks, the remainder of the log
    /// is stale tail and is filtered out; [`Jdb2::commits_all`] still
    /// yields it.
    pub fn commits(&self) -> Commits<'_, S> {
        Commits {
            inner: self.commits_all(),
            expected: None,
        }
    }
}

/// A descriptor frame of the log.
///
/// Holds a copy of its whole journal block so its tags can be iterated
/// without touching the stream again.
#[derive(Clone, Debug)]
pub struct DescriptorBlock {
    /// Transaction sequence number.
    pub sequence: u32,

    /// Journal block the descriptor lives in.
    pub journal_block: u64,

    data: Vec<u8>,
    tag_v3: bool,
}

impl DescriptorBlock {
    /// Iterates the tags of this descriptor.
    ///
    /// The data block a tag describes is the journal block immediately
    /// following the descriptor for the first tag, the one after that for
    /// the second, and so on.
    pub fn tags(&self) -> Tags<'_> {
        Tags {
            data: &self.data,
            pos: JOURNAL_HEADER_SIZE,
            tag_v3: self.tag_v3,
            next_data_block: self.journal_block + 1,
            done: false,
        }
    }
}

/// One descriptor tag: where in the filesystem the associated journal data
/// block belongs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBlockTag {
    /// Journal block holding the logged data.
    pub journal_block: u64,

    /// On-disk destination block in the filesystem.
    pub target_block: u64,

    /// Tag flags (`JBD2_FLAG_*`).
    pub flags: u32,
}

/// Iterator over the tags of a [`DescriptorBlock`].
pub struct Tags<'d> {
    data: &'d [u8],
    pos: usize,
    tag_v3: bool,
    next_data_block: u64,
    done: bool,
}

impl Iterator for Tags<'_> {
    type Item = DescriptorBlockTag;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let tag_size = if self.tag_v3 {
            core::mem::size_of::<BlockTagV3>()
        } else {
            core::mem::size_of::<BlockTagV2>()
        };

        let bytes = self.data.get(self.pos..self.pos + tag_size)?;
        let (blocknr, blocknr_high, flags) = if self.tag_v3 {
            let tag: BlockTagV3 = bytemuck::pod_read_unaligned(bytes);
            (
                u32::from_be(tag.blocknr),
                u32::from_be(tag.blocknr_high),
                u32::from_be(tag.flags),
            )
        } else {
            let tag: BlockTagV2 = bytemuck::pod_read_unaligned(bytes);
            (
                u32::from_be(tag.blocknr),
                u32::from_be(tag.blocknr_high),
                u32::from(u16::from_be(tag.flags)),
            )
        };

        let item = DescriptorBlockTag {
            journal_block: self.next_data_block,
            target_block: u64::from(blocknr) | (u64::from(blocknr_high) << 32),
            flags,
        };

        self.pos += tag_size;
        if flags & JBD2_FLAG_LAST_TAG != 0 {
            self.done = true;
        } else if flags & JBD2_FLAG_SAME_UUID == 0 {
            // A per-tag UUID sits between this tag and the next.
            self.pos += 16;
        }
        self.next_data_block += 1;

        Some(item)
    }
}

/// A commit frame of the log, closing one transaction.
#[derive(Clone, Debug)]
pub struct CommitBlock {
    /// Transaction sequence number.
    pub sequence: u32,

    /// Journal block the commit lives in.
    pub journal_block: u64,

    /// Commit timestamp, seconds plus microsecond-truncated nanoseconds.
    pub ts: DateTime<Utc>,

    /// Descriptor blocks sharing this commit's sequence, in log order.
    pub descriptors: Vec<DescriptorBlock>,
}

/// A recognized metadata frame yielded by [`Jdb2::walk`].
#[derive(Clone, Debug)]
pub enum LogBlock {
    Descriptor(DescriptorBlock),
    Commit(CommitBlock),
}

/// Block-by-block iterator over the journal's metadata frames.
pub struct Walk<'j, S: Volume> {
    jdb: &'j Jdb2<S>,
    block: u64,
}

impl<S: Volume> Iterator for Walk<'_, S> {
    type Item = Result<LogBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.block + 1 < self.jdb.maxlen {
            let block = self.block;
            self.block += 1;

            let offset = block * self.jdb.block_size;
            let header: JournalHeader = {
                let mut stream = self.jdb.stream.borrow_mut();
                match vol::read_record_at(&mut *stream, offset) {
                    Ok(header) => header,
                    Err(err) => return Some(Err(err)),
                }
            };

            if header.magic() != JBD2_MAGIC {
                continue;
            }

            match header.blocktype() {
                JBD2_DESCRIPTOR_BLOCK => {
                    let data = match self.jdb.read_block(block) {
                        Ok(data) => data,
                        Err(err) => return Some(Err(err)),
                    };
                    return Some(Ok(LogBlock::Descriptor(DescriptorBlock {
                        sequence: header.sequence(),
                        journal_block: block,
                        data,
                        tag_v3: self.jdb.tag_v3,
                    })));
                }
                JBD2_COMMIT_BLOCK => {
                    let commit: CommitHeader = {
                        let mut stream = self.jdb.stream.borrow_mut();
                        match vol::read_record_at(&mut *stream, offset) {
                            Ok(commit) => commit,
                            Err(err) => return Some(Err(err)),
                        }
                    };

                    let sec = u64::from_be_bytes(commit.commit_sec);
                    let nsec = u32::from_be(commit.commit_nsec);
                    let Some(ts) = DateTime::from_timestamp(sec as i64, 0) else {
                        return Some(Err(Error::InvalidFilesystem(
                            "commit timestamp out of range".into(),
                        )));
                    };
                    let ts = ts + Duration::microseconds(i64::from(nsec / 1000));

                    return Some(Ok(LogBlock::Commit(CommitBlock {
                        sequence: header.sequence(),
                        journal_block: block,
                        ts,
                        descriptors: Vec::new(),
                    })));
                }
                JBD2_REVOKE_BLOCK => {
                    debug!(
                        target: "jbd2",
                        "skipping revoke block at journal block {block} (sequence {})",
                        header.sequence()
                    );
                }
                _ => {}
            }
        }

        None
    }
}

/// Iterator pairing each commit with the descriptors of its transaction.
pub struct CommitsAll<'j, S: Volume> {
    walk: Walk<'j, S>,
    buffered: HashMap<u32, Vec<DescriptorBlock>>,
}

impl<S: Volume> Iterator for CommitsAll<'_, S> {
    type Item = Result<CommitBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        for block in self.walk.by_ref() {
            match block {
                Ok(LogBlock::Descriptor(desc)) => {
                    self.buffered.entry(desc.sequence).or_default().push(desc);
                }
                Ok(LogBlock::Commit(mut commit)) => {
                    commit.descriptors = self
                        .buffered
                        .remove(&commit.sequence)
                        .unwrap_or_default();
                    return Some(Ok(commit));
                }
                Err(err) => return Some(Err(err)),
            }
        }

        None
    }
}

/// Iterator filtering [`CommitsAll`] down to the strictly monotonic run of
/// sequence numbers anchored at the first observed commit.
pub struct Commits<'j, S: Volume> {
    inner: CommitsAll<'j, S>,
    expected: Option<u32>,
}

impl<S: Volume> Iterator for Commits<'_, S> {
    type Item = Result<CommitBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        for commit in self.inner.by_ref() {
            let commit = match commit {
                Ok(commit) => commit,
                Err(err) => return Some(Err(err)),
            };

            let expected = *self.expected.get_or_insert(commit.sequence);
            if commit.sequence == expected {
                self.expected = Some(expected.wrapping_add(1));
                return Some(Ok(commit));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_record_sizes() {
        assert_eq!(core::mem::size_of::<JournalHeader>(), 12);
        assert_eq!(core::mem::size_of::<JournalSuperblock>(), 1024);
        assert_eq!(core::mem::size_of::<CommitHeader>(), 60);
        assert_eq!(core::mem::size_of::<BlockTagV2>(), 12);
        assert_eq!(core::mem::size_of::<BlockTagV3>(), 16);
    }

    fn descriptor(data: Vec<u8>, tag_v3: bool) -> DescriptorBlock {
        DescriptorBlock {
            sequence: 7,
            journal_block: 10,
            data,
            tag_v3,
        }
    }

    #[test]
    fn tags_v2_with_uuid_between_tags() {
        let mut data = vec![0u8; 1024];
        // First tag: block 0x1122, no SAME_UUID, so 16 UUID bytes follow.
        data[12..16].copy_from_slice(&0x1122u32.to_be_bytes());
        data[18..20].copy_from_slice(&0u16.to_be_bytes());
        // Second tag after the UUID: LAST_TAG | SAME_UUID.
        let second = 12 + 12 + 16;
        data[second..second + 4].copy_from_slice(&0x3344u32.to_be_bytes());
        data[second + 6..second + 8]
            .copy_from_slice(&((JBD2_FLAG_LAST_TAG | JBD2_FLAG_SAME_UUID) as u16).to_be_bytes());

        let tags: Vec<_> = descriptor(data, false).tags().collect();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].target_block, 0x1122);
        assert_eq!(tags[0].journal_block, 11);
        assert_eq!(tags[1].target_block, 0x3344);
        assert_eq!(tags[1].journal_block, 12);
    }

    #[test]
    fn tags_v3_layout_and_high_bits() {
        let mut data = vec![0u8; 1024];
        data[12..16].copy_from_slice(&0x55u32.to_be_bytes());
        data[16..20]
            .copy_from_slice(&(JBD2_FLAG_LAST_TAG | JBD2_FLAG_SAME_UUID).to_be_bytes());
        data[20..24].copy_from_slice(&1u32.to_be_bytes());

        let tags: Vec<_> = descriptor(data, true).tags().collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].target_block, (1 << 32) | 0x55);
    }
}
