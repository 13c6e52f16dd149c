//! Backing-volume abstraction.
//!
//! The parser consumes any seekable byte source: a raw disk, a partition
//! device, or a plain image file. A [`Volume`] is a shared mutable cursor,
//! so at most one logical read may be in flight against it at a time; the
//! filesystem object enforces this by keeping its volume behind a
//! [`core::cell::RefCell`].

use std::io::{Read, Seek, SeekFrom};

use bytemuck::AnyBitPattern;

use crate::err::Result;

/// A seekable byte source backing a filesystem image.
///
/// Blanket-implemented for everything that is [`Read`] + [`Seek`], which
/// covers [`std::fs::File`] as well as [`std::io::Cursor`] over in-memory
/// images.
pub trait Volume: Read + Seek {}

impl<T: Read + Seek + ?Sized> Volume for T {}

/// Fills `buf` from the volume starting at the given absolute offset.
pub(crate) fn read_exact_at<V: Volume + ?Sized>(
    vol: &mut V,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    vol.seek(SeekFrom::Start(offset))?;
    vol.read_exact(buf)?;
    Ok(())
}

/// Reads `len` bytes from the volume starting at the given absolute offset.
pub(crate) fn read_vec_at<V: Volume + ?Sized>(
    vol: &mut V,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact_at(vol, offset, &mut buf)?;
    Ok(buf)
}

/// Reads one fixed-layout on-disk record at the given absolute offset.
///
/// The record is decoded with an unaligned copy, so callers never have to
/// care about the alignment of the backing buffer.
pub(crate) fn read_record_at<T: AnyBitPattern, V: Volume + ?Sized>(
    vol: &mut V,
    offset: u64,
) -> Result<T> {
    let mut buf = vec![0u8; core::mem::size_of::<T>()];
    read_exact_at(vol, offset, &mut buf)?;
    Ok(bytemuck::pod_read_unaligned(&buf))
}
