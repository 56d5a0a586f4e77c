//! Block splitting
//!
//! Pure partitioning of `[0, file_size - 1]` into contiguous download
//! ranges. All other segmentation decisions (unknown size, resume) live in
//! the task layer.

use crate::config::MAX_BLOCKS_LIMIT;
use crate::error::{DownloadError, Result};
use crate::meta::BlockDescriptor;

/// Files smaller than this are never split; the per-connection overhead is
/// not worth it.
pub const MIN_SPLIT_SIZE: i64 = 2 * 1024 * 1024;

/// Split a file into contiguous download blocks.
///
/// - `!accept_ranges` or `file_size < 2 MiB` yields a single block covering
///   the whole file.
/// - Otherwise the file is divided evenly over `min(num_blocks, file_size)`
///   blocks and the last block absorbs the remainder.
///
/// Blocks come back sorted by id, contiguous
/// (`blocks[i].range_end + 1 == blocks[i + 1].range_start`) and covering
/// exactly `[0, file_size - 1]`.
pub fn split_blocks(
    file_size: i64,
    num_blocks: u32,
    accept_ranges: bool,
) -> Result<Vec<BlockDescriptor>> {
    if file_size <= 0 {
        return Err(DownloadError::invalid_input(
            "file_size",
            "must be greater than 0",
        ));
    }
    if num_blocks < 1 || num_blocks > MAX_BLOCKS_LIMIT {
        return Err(DownloadError::invalid_input(
            "num_blocks",
            format!("must be in [1, {MAX_BLOCKS_LIMIT}]"),
        ));
    }

    if !accept_ranges || file_size < MIN_SPLIT_SIZE {
        return Ok(vec![BlockDescriptor::new(0, 0, file_size - 1)]);
    }

    // Each block must hold at least one byte.
    let actual = (num_blocks as i64).min(file_size);
    let block_size = file_size / actual;

    let mut blocks = Vec::with_capacity(actual as usize);
    let mut offset = 0;
    for i in 0..actual {
        let this_size = if i == actual - 1 {
            file_size - offset
        } else {
            block_size
        };
        blocks.push(BlockDescriptor::new(i as usize, offset, offset + this_size - 1));
        offset += this_size;
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covering(blocks: &[BlockDescriptor], file_size: i64) {
        assert_eq!(blocks[0].range_start, 0);
        assert_eq!(blocks.last().unwrap().range_end, file_size - 1);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].range_end + 1, pair[1].range_start);
        }
        let total: i64 = blocks.iter().map(|b| b.size()).sum();
        assert_eq!(total, file_size);
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.id, i);
            assert_eq!(b.downloaded, 0);
            assert!(!b.completed);
        }
    }

    #[test]
    fn even_split() {
        let blocks = split_blocks(100 * MIN_SPLIT_SIZE, 4, true).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_covering(&blocks, 100 * MIN_SPLIT_SIZE);
        assert_eq!(blocks[0].size(), 25 * MIN_SPLIT_SIZE);
    }

    #[test]
    fn even_split_exact_ranges() {
        // 8 MiB over 4 blocks of 2 MiB each
        let size = 4 * MIN_SPLIT_SIZE;
        let blocks = split_blocks(size, 4, true).unwrap();
        assert_eq!(blocks.len(), 4);
        let quarter = size / 4;
        assert_eq!(blocks[0].range_start, 0);
        assert_eq!(blocks[0].range_end, quarter - 1);
        assert_eq!(blocks[1].range_start, quarter);
        assert_eq!(blocks[3].range_end, size - 1);
        assert_covering(&blocks, size);
    }

    #[test]
    fn last_block_absorbs_remainder() {
        let size = 4 * MIN_SPLIT_SIZE + 3;
        let blocks = split_blocks(size, 4, true).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_covering(&blocks, size);
        // First three blocks even, last one three bytes larger
        assert_eq!(blocks[0].size(), MIN_SPLIT_SIZE);
        assert_eq!(blocks[3].size(), MIN_SPLIT_SIZE + 3);
    }

    #[test]
    fn small_file_single_block() {
        let blocks = split_blocks(MIN_SPLIT_SIZE - 1, 8, true).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].range_start, 0);
        assert_eq!(blocks[0].range_end, MIN_SPLIT_SIZE - 2);
    }

    #[test]
    fn single_byte_file() {
        let blocks = split_blocks(1, 8, true).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].range_start, 0);
        assert_eq!(blocks[0].range_end, 0);
    }

    #[test]
    fn no_range_support_single_block() {
        let size = 64 * MIN_SPLIT_SIZE;
        let blocks = split_blocks(size, 16, false).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_covering(&blocks, size);
    }

    #[test]
    fn block_count_capped_by_file_size() {
        // The floor keeps real callers away from this branch, but the cap
        // must still hold for every size >= 2 MiB with a huge block count...
        let blocks = split_blocks(MIN_SPLIT_SIZE, 32, true).unwrap();
        assert_eq!(blocks.len(), 32);
        assert_covering(&blocks, MIN_SPLIT_SIZE);
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(split_blocks(0, 4, true).is_err());
        assert!(split_blocks(-5, 4, true).is_err());
        assert!(split_blocks(1024, 0, true).is_err());
        assert!(split_blocks(1024, 33, true).is_err());
    }

    #[test]
    fn full_invariants_across_sizes_and_counts() {
        for &size in &[
            MIN_SPLIT_SIZE,
            MIN_SPLIT_SIZE + 1,
            3 * MIN_SPLIT_SIZE + 7,
            100 * MIN_SPLIT_SIZE + 41,
        ] {
            for n in [1u32, 2, 3, 5, 8, 16, 32] {
                let blocks = split_blocks(size, n, true).unwrap();
                assert_covering(&blocks, size);
            }
        }
    }
}
