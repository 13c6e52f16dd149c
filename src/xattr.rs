//! Extended-attribute decoding.
//!
//! Attributes live in two places: packed into the spare tail of a large
//! inode record, and in a single dedicated block addressed by the inode's
//! file-ACL field. Both regions open with the same magic and hold the same
//! packed entry records; only the header size and the base that value
//! offsets are relative to differ. An entry may also point at another
//! inode, in which case the value is that inode's data stream.

use std::io::Read;

use bytemuck::{Pod, Zeroable};

use crate::err::{Error, Result};
use crate::vol::Volume;
use crate::ExtFs;

/// Magic number opening both xattr regions.
pub const XATTR_MAGIC: u32 = 0xEA02_0000;

/// Header of the out-of-line xattr block, 32 bytes.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct XAttrBlockHeader {
    /// Magic number, `0xEA020000`
    pub(crate) magic: u32,

    /// Reference count of the block
    pub(crate) refcount: u32,

    /// Number of disk blocks used
    pub(crate) blocks: u32,

    /// Hash of all attributes
    pub(crate) hash: u32,

    /// Block checksum; parsed, never verified
    pub(crate) checksum: u32,

    reserved: [u32; 3],
}

/// Fixed prefix of one xattr entry, 16 bytes; the name bytes follow.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct XAttrEntryRaw {
    /// Length of the name
    pub(crate) name_len: u8,

    /// Attribute name index, mapped to a textual prefix
    pub(crate) name_index: u8,

    /// Offset of the value within the region
    pub(crate) value_offs: u16,

    /// Inode holding the value, or zero when the value is in-region
    pub(crate) value_inum: u32,

    /// Size of the value, in bytes
    pub(crate) value_size: u32,

    /// Hash of name and value
    pub(crate) hash: u32,
}

const ENTRY_HEADER_SIZE: usize = core::mem::size_of::<XAttrEntryRaw>();

/// One decoded extended attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XAttr {
    /// Full attribute name, prefix included, e.g. `security.selinux`.
    pub name: String,

    /// Raw attribute value.
    pub value: Vec<u8>,
}

/// Textual prefix implied by an entry's name index.
fn prefix(name_index: u8) -> &'static str {
    match name_index {
        1 => "user.",
        2 | 3 | 7 => "system.",
        4 => "trusted.",
        6 => "security.",
        _ => "unknown_prefix",
    }
}

/// Name indices 2 and 3 carry no name bytes; the full name is implied.
fn fixed_name(name_index: u8) -> Option<&'static str> {
    match name_index {
        2 => Some("posix_acl_access"),
        3 => Some("posix_acl_default"),
        _ => None,
    }
}

/// Decodes the packed entry list of one xattr region.
///
/// `start` is the offset of the first entry within the region and
/// `value_base` the base that in-region value offsets are relative to: 4
/// for the in-inode region, 0 for the out-of-line block. Entries advance by
/// their 4-byte-padded size; an all-zero sentinel ends the list.
pub(crate) fn decode_region<V: Volume>(
    fs: &ExtFs<V>,
    region: &[u8],
    start: usize,
    value_base: usize,
    out: &mut Vec<XAttr>,
) -> Result<()> {
    let mut offset = start;

    loop {
        if offset + ENTRY_HEADER_SIZE > region.len() {
            break;
        }

        let entry: XAttrEntryRaw =
            bytemuck::pod_read_unaligned(&region[offset..offset + ENTRY_HEADER_SIZE]);
        let value_offs = usize::from(u16::from_le(entry.value_offs));
        let value_inum = u32::from_le(entry.value_inum);
        let value_size = u32::from_le(entry.value_size) as usize;

        if entry.name_len == 0 && entry.name_index == 0 && value_offs == 0 {
            break;
        }

        let name_start = offset + ENTRY_HEADER_SIZE;
        let name_end = name_start + usize::from(entry.name_len);
        let Some(name_bytes) = region.get(name_start..name_end) else {
            break;
        };

        let name = match fixed_name(entry.name_index) {
            Some(fixed) => format!("{}{}", prefix(entry.name_index), fixed),
            None => format!(
                "{}{}",
                prefix(entry.name_index),
                String::from_utf8_lossy(name_bytes)
            ),
        };

        let value = if value_inum != 0 {
            let mut value = vec![0u8; value_size];
            fs.inode(value_inum)?.open()?.read_exact(&mut value)?;
            value
        } else {
            let value_start = value_base + value_offs;
            region
                .get(value_start..value_start + value_size)
                .ok_or_else(|| {
                    Error::InvalidFilesystem("xattr value overruns its region".into())
                })?
                .to_vec()
        };

        out.push(XAttr { name, value });

        offset += (ENTRY_HEADER_SIZE + usize::from(entry.name_len) + 3) & !3;
    }

    Ok(())
}
