//! Sparse-aware file streams.
//!
//! An inode's content is the ordered concatenation of its dataruns. The
//! [`RunlistStream`] presents that concatenation as a plain [`Read`] +
//! [`Seek`] object: physical runs are served from the backing volume,
//! holes read as zeroes, and the last byte returned sits at
//! `size - 1`. [`InodeStream`] adds the inline case, where the content
//! lives directly in the inode's 60-byte block region.

use std::io::{self, Cursor, Read, Seek, SeekFrom};

use crate::vol::Volume;
use crate::ExtFs;

/// One entry of an inode's datarun list: a contiguous range of blocks
/// either backed by physical storage or sparse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datarun {
    /// First physical block of the run, or `None` for a hole.
    pub physical: Option<u64>,

    /// Length of the run, in blocks.
    pub length: u64,
}

impl Datarun {
    pub fn new(physical: u64, length: u64) -> Self {
        Self {
            physical: Some(physical),
            length,
        }
    }

    pub fn hole(length: u64) -> Self {
        Self {
            physical: None,
            length,
        }
    }

    pub fn is_hole(&self) -> bool {
        self.physical.is_none()
    }
}

/// Read-only stream over `(dataruns, size, block_size)`.
///
/// Holds the datarun vector by value and borrows the filesystem for volume
/// access. Logical ranges not covered by any run read as zeroes, like
/// holes; reads past `size` return a short count.
pub struct RunlistStream<'fs, V: Volume> {
    fs: &'fs ExtFs<V>,
    runs: Vec<Datarun>,
    size: u64,
    block_size: u64,
    pos: u64,
}

impl<'fs, V: Volume> RunlistStream<'fs, V> {
    pub(crate) fn new(fs: &'fs ExtFs<V>, runs: Vec<Datarun>, size: u64, block_size: u64) -> Self {
        Self {
            fs,
            runs,
            size,
            block_size,
            pos: 0,
        }
    }

    /// Total size of the stream, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The dataruns backing this stream, in logical order.
    pub fn runs(&self) -> &[Datarun] {
        &self.runs
    }

    /// Locates the run covering the given logical block. Returns the run
    /// and the logical block at which it starts.
    fn run_at(&self, logical_block: u64) -> Option<(Datarun, u64)> {
        let mut start = 0u64;
        for run in &self.runs {
            if logical_block < start + run.length {
                return Some((*run, start));
            }
            start += run.length;
        }
        None
    }
}

impl<V: Volume> Read for RunlistStream<'_, V> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }

        let want = buf.len().min((self.size - self.pos) as usize);
        let mut done = 0usize;

        while done < want {
            let logical_block = self.pos / self.block_size;

            let chunk = match self.run_at(logical_block) {
                Some((run, run_start)) => {
                    let run_end = (run_start + run.length) * self.block_size;
                    let chunk = ((want - done) as u64).min(run_end - self.pos) as usize;

                    match run.physical {
                        Some(physical) => {
                            let offset_in_run = self.pos - run_start * self.block_size;
                            self.fs.read_exact_at(
                                physical * self.block_size + offset_in_run,
                                &mut buf[done..done + chunk],
                            )?;
                        }
                        None => buf[done..done + chunk].fill(0),
                    }
                    chunk
                }
                // Tail not covered by any run: sparse up to `size`.
                None => {
                    buf[done..want].fill(0);
                    want - done
                }
            };

            done += chunk;
            self.pos += chunk as u64;
        }

        Ok(done)
    }
}

impl<V: Volume> Seek for RunlistStream<'_, V> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };

        match target {
            Some(target) => {
                self.pos = target;
                Ok(self.pos)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            )),
        }
    }
}

/// Readable view over an inode's content.
///
/// Small symlink targets and `INLINE_DATA` files are served straight from
/// the inode record; everything else goes through a [`RunlistStream`].
pub enum InodeStream<'fs, V: Volume> {
    Inline(Cursor<Vec<u8>>),
    Runs(RunlistStream<'fs, V>),
}

impl<V: Volume> InodeStream<'_, V> {
    /// Total size of the stream, in bytes.
    pub fn size(&self) -> u64 {
        match self {
            InodeStream::Inline(cursor) => cursor.get_ref().len() as u64,
            InodeStream::Runs(stream) => stream.size(),
        }
    }
}

impl<V: Volume> Read for InodeStream<'_, V> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InodeStream::Inline(cursor) => cursor.read(buf),
            InodeStream::Runs(stream) => stream.read(buf),
        }
    }
}

impl<V: Volume> Seek for InodeStream<'_, V> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            InodeStream::Inline(cursor) => cursor.seek(pos),
            InodeStream::Runs(stream) => stream.seek(pos),
        }
    }
}
