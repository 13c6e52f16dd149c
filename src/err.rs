//! Error types shared across the crate.
//!
//! Every failure mode is non-retryable: the backing image does not change
//! under the parser, so an error surfaced once will surface again.

use core::fmt;
use std::io;

/// Return type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// All errors that parsing an ext2/ext3/ext4 image or its journal can raise.
#[derive(Debug)]
pub enum Error {
    /// Magic mismatch or implausible on-disk fields (superblock geometry,
    /// extent or xattr headers).
    InvalidFilesystem(String),

    /// A valid on-disk layout that this implementation declines to handle,
    /// such as a cluster size different from the block size.
    UnsupportedFeature(String),

    /// Inode, group or block number outside the bounds recorded in the
    /// superblock.
    OutOfRange(String),

    /// A named path component is absent from the directory being searched.
    FileNotFound(String),

    /// Directory listing was requested on a non-directory inode.
    NotADirectory(String),

    /// Symlink target was requested on a non-symlink inode.
    NotASymlink(String),

    /// The filesystem has no usable journal (missing `HAS_JOURNAL` feature,
    /// or the journal lives on an external device).
    JournalUnavailable(String),

    /// Failure reported by the backing volume.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidFilesystem(msg) => write!(f, "invalid filesystem: {msg}"),
            Error::UnsupportedFeature(msg) => write!(f, "unsupported feature: {msg}"),
            Error::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            Error::FileNotFound(msg) => write!(f, "{msg}"),
            Error::NotADirectory(msg) => write!(f, "not a directory: {msg}"),
            Error::NotASymlink(msg) => write!(f, "not a symlink: {msg}"),
            Error::JournalUnavailable(msg) => write!(f, "journal unavailable: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
