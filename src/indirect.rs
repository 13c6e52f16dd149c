//! Legacy block-map decoding (ext2/ext3).
//!
//! Without the `EXTENTS` flag, the inode's block region is an array of 15
//! little-endian block numbers: 12 direct pointers followed by one single-,
//! one double- and one triple-indirect pointer. Only as many pointers as
//! the file size requires are ever read, and contiguous block numbers are
//! coalesced into runs afterwards. A block number of zero denotes a hole,
//! at any level of the tree.

use crate::err::Result;
use crate::file::Datarun;
use crate::inode::InodeRecord;
use crate::vol::Volume;
use crate::ExtFs;

/// Direct block pointers held in the inode.
const NDIR_BLOCKS: usize = 12;

/// Indirection levels after the direct pointers.
const NIND_BLOCKS: usize = 3;

/// Collects the block numbers reachable through `ptr` at the given
/// indirection level, stopping once `remaining` reaches zero. Level zero is
/// a data block; higher levels are blocks of pointers. A zero pointer
/// stands for an entirely sparse subtree.
fn walk_level<V: Volume>(
    fs: &ExtFs<V>,
    ptr: u64,
    level: u32,
    remaining: &mut u64,
    out: &mut Vec<u64>,
) -> Result<()> {
    if *remaining == 0 {
        return Ok(());
    }

    if level == 0 {
        out.push(ptr);
        *remaining -= 1;
        return Ok(());
    }

    let ptrs_per_block = fs.block_size() / 4;
    let child_span = ptrs_per_block.pow(level - 1);

    if ptr == 0 {
        let covered = (*remaining).min(child_span * ptrs_per_block);
        out.extend(core::iter::repeat(0).take(covered as usize));
        *remaining -= covered;
        return Ok(());
    }

    let needed = remaining.div_ceil(child_span).min(ptrs_per_block);
    let block = fs.read_block(ptr)?;

    for entry in 0..needed as usize {
        let child = u32::from_le_bytes(block[entry * 4..entry * 4 + 4].try_into().unwrap());
        walk_level(fs, u64::from(child), level - 1, remaining, out)?;
        if *remaining == 0 {
            break;
        }
    }

    Ok(())
}

/// Builds the datarun list of an indirect-mapped inode.
pub(crate) fn indirect_runs<V: Volume>(
    fs: &ExtFs<V>,
    record: &InodeRecord,
    size: u64,
) -> Result<Vec<Datarun>> {
    let block_size = fs.block_size();
    let mut remaining = size.div_ceil(block_size);

    let raw_ptrs: [u32; 15] = bytemuck::pod_read_unaligned(&record.raw.i_block);

    let mut blocks = Vec::with_capacity(remaining.min(4096) as usize);
    for ptr in raw_ptrs.iter().take(NDIR_BLOCKS) {
        if remaining == 0 {
            break;
        }
        blocks.push(u64::from(u32::from_le(*ptr)));
        remaining -= 1;
    }

    for level in 1..=NIND_BLOCKS as u32 {
        if remaining == 0 {
            break;
        }
        let ptr = u64::from(u32::from_le(raw_ptrs[NDIR_BLOCKS + level as usize - 1]));
        walk_level(fs, ptr, level, &mut remaining, &mut blocks)?;
    }

    Ok(coalesce(&blocks))
}

/// Coalesces a flat block list into runs: adjacent physical blocks extend
/// the current run, and stretches of zero blocks collapse into holes.
pub(crate) fn coalesce(blocks: &[u64]) -> Vec<Datarun> {
    let mut runs = Vec::new();
    let mut current: Option<(u64, u64)> = None;

    for &block in blocks {
        current = match current {
            None => Some((block, 1)),
            Some((start, len)) if block == 0 && start == 0 => Some((start, len + 1)),
            Some((start, len)) if start != 0 && block == start + len => Some((start, len + 1)),
            Some((start, len)) => {
                runs.push(close_run(start, len));
                Some((block, 1))
            }
        };
    }

    if let Some((start, len)) = current {
        runs.push(close_run(start, len));
    }

    runs
}

fn close_run(start: u64, len: u64) -> Datarun {
    if start == 0 {
        Datarun::hole(len)
    } else {
        Datarun::new(start, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_merges_contiguous_blocks() {
        let runs = coalesce(&[10, 11, 12, 20, 21]);
        assert_eq!(runs, vec![Datarun::new(10, 3), Datarun::new(20, 2)]);
    }

    #[test]
    fn coalesce_collapses_holes() {
        let runs = coalesce(&[10, 0, 0, 0, 14]);
        assert_eq!(
            runs,
            vec![Datarun::new(10, 1), Datarun::hole(3), Datarun::new(14, 1)]
        );
    }

    #[test]
    fn coalesce_trailing_hole_is_a_hole() {
        let runs = coalesce(&[7, 8, 0, 0]);
        assert_eq!(runs, vec![Datarun::new(7, 2), Datarun::hole(2)]);
    }

    #[test]
    fn coalesce_empty_input() {
        assert!(coalesce(&[]).is_empty());
    }
}
