//! Directory-entry stream decoding.
//!
//! A directory's content is a linear stream of variable-length records.
//! Two layouts exist: the classic entry with a 16-bit name length, and the
//! `FILETYPE` entry that splits that field into an 8-bit name length plus
//! an 8-bit file-type code. Which one a filesystem uses is decided once
//! from the superblock and carried on the filesystem object.
//!
//! Names are byte strings. They are not required to be UTF-8, so they are
//! kept as raw bytes and only decoded lossily for display, which lets any
//! name survive a round trip through the parser.

use log::error;

use crate::inode::{FileType, Inode};
use crate::vol::Volume;
use crate::ExtFs;

/// Which directory-entry layout the filesystem uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DirEntryKind {
    /// 16-bit name length, no file-type byte.
    Classic,

    /// 8-bit name length plus an 8-bit file-type code.
    Filetype,
}

/// A file name as stored on disk: raw bytes, possibly not UTF-8.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Filename(pub Vec<u8>);

impl Filename {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 rendering for display purposes; undecodable bytes become
    /// replacement characters, but the underlying bytes stay intact.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl core::fmt::Display for Filename {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Filename {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Filename {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Maps the 3-bit file-type code of a `FILETYPE` directory entry to the
/// type it stands for.
fn filetype_from_code(code: u8) -> Option<FileType> {
    match code {
        0x1 => Some(FileType::Regular),
        0x2 => Some(FileType::Directory),
        0x3 => Some(FileType::CharacterDevice),
        0x4 => Some(FileType::BlockDevice),
        0x5 => Some(FileType::Fifo),
        0x6 => Some(FileType::Socket),
        0x7 => Some(FileType::SymbolicLink),
        _ => None,
    }
}

/// Iterator over the entries of one directory.
///
/// The directory content is read up front into a buffer; iteration decodes
/// one record at a time and yields a lazy child [`Inode`] carrying the
/// entry's name, its file-type hint when the layout provides one, and a
/// back-reference to the parent for relative symlink resolution.
///
/// A record with `rec_len == 0` can never advance the cursor; it is logged
/// as corruption and fuses the iterator instead of looping forever.
pub struct DirectoryIterator<'fs, V: Volume> {
    fs: &'fs ExtFs<V>,
    parent: u32,
    buf: Vec<u8>,
    size: u64,
    pos: usize,
    kind: DirEntryKind,
    done: bool,
}

impl<'fs, V: Volume> DirectoryIterator<'fs, V> {
    pub(crate) fn new(
        fs: &'fs ExtFs<V>,
        parent: u32,
        buf: Vec<u8>,
        size: u64,
        kind: DirEntryKind,
    ) -> Self {
        Self {
            fs,
            parent,
            buf,
            size,
            pos: 0,
            kind,
            done: false,
        }
    }
}

impl<'fs, V: Volume> Iterator for DirectoryIterator<'fs, V> {
    type Item = Inode<'fs, V>;

    fn next(&mut self) -> Option<Self::Item> {
        // An entry header is 8 bytes, but the smallest record that can
        // name anything is 12.
        while !self.done && self.pos as u64 + 12 <= self.size {
            let header = self.buf.get(self.pos..self.pos + 8)?;
            let inum = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let rec_len = u16::from_le_bytes(header[4..6].try_into().unwrap());

            if rec_len == 0 {
                error!(
                    target: "extfs",
                    "Zero-length directory entry in <inode {}> (offset {:#x})",
                    self.parent, self.pos
                );
                self.done = true;
                return None;
            }

            let (name_len, filetype) = match self.kind {
                DirEntryKind::Classic => {
                    (usize::from(u16::from_le_bytes(header[6..8].try_into().unwrap())), None)
                }
                DirEntryKind::Filetype => {
                    (usize::from(header[6]), filetype_from_code(header[7]))
                }
            };

            let entry_pos = self.pos;
            self.pos += usize::from(rec_len);

            // Entries pointing at reserved or out-of-bounds inodes are
            // padding or leftovers; skip them.
            if inum < 2 || inum >= self.fs.inodes_count() {
                continue;
            }

            let name_start = entry_pos + 8;
            let Some(name) = self.buf.get(name_start..name_start + name_len) else {
                error!(
                    target: "extfs",
                    "Directory entry name overruns directory in <inode {}> (offset {:#x})",
                    self.parent, entry_pos
                );
                self.done = true;
                return None;
            };

            return Some(Inode::from_dir_entry(
                self.fs,
                inum,
                Filename(name.to_vec()),
                filetype,
                self.parent,
            ));
        }

        None
    }
}
