//! Heap walking and consistency checking.
//!
//! Everything the allocator promises can be verified from the outside by
//! walking the boundary tags: headers and footers must agree, no two free
//! blocks may touch, and the free list must name exactly the free blocks.
//! [`Heap::check`] performs that full walk and reports the first violation
//! it finds; tests run it after every mutation, and embedders can call it
//! whenever they suspect a caller has handed the heap a bad offset.

use alloc::collections::BTreeSet;

use boundary_tag::{ALIGNMENT, Tag, WORD_SIZE};
use snafu::{Location, Snafu, ensure};

use crate::{
    free_list::{self, FreeList},
    heap::{FIRST_BLOCK, Heap, MIN_BLOCK_SIZE},
};

/// A violation found by [`Heap::check`].
///
/// These only arise after the heap's bookkeeping has been damaged from the
/// outside, e.g. by releasing an offset that was never allocated.
#[derive(Debug, Snafu)]
pub enum CheckError {
    /// A sentinel tag no longer has its fixed size and allocated flag.
    #[snafu(display("sentinel tag damaged at offset {offset}: {found:?}"))]
    BadSentinel {
        offset: usize,
        found: Tag,
        #[snafu(implicit)]
        location: Location,
    },
    /// A block's header and footer disagree.
    #[snafu(display(
        "header and footer disagree for block at {payload}: header {header:?}, footer {footer:?}"
    ))]
    TagMismatch {
        payload: usize,
        header: Tag,
        footer: Tag,
        #[snafu(implicit)]
        location: Location,
    },
    /// A block offset or size is not a multiple of the alignment unit, or
    /// the size is below the minimum a block can have.
    #[snafu(display("block at {payload} has bad geometry: size {size}"))]
    MisalignedBlock {
        payload: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// A block's recorded size runs past the end of the arena.
    #[snafu(display("block at {payload} extends past the end of the arena"))]
    HeapOverrun {
        payload: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// Two neighboring blocks are both free, so a merge was missed.
    #[snafu(display("adjacent free blocks at {payload} and {next}"))]
    AdjacentFreeBlocks {
        payload: usize,
        next: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The free list names a block that is not a free block.
    #[snafu(display("free list refers to block at {payload} which is not free"))]
    ListedBlockNotFree {
        payload: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// A free block does not appear in the free list.
    #[snafu(display("free block at {payload} is missing from the free list"))]
    FreeBlockNotListed {
        payload: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The free list's links are inconsistent (broken back link, duplicate
    /// entry or cycle).
    #[snafu(display("free list links are inconsistent at {payload}"))]
    FreeListCorrupt {
        payload: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// One block as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload offset of the block.
    pub payload: usize,
    /// Total block size, header and footer included.
    pub size: usize,
    /// Whether the block is currently allocated.
    pub allocated: bool,
}

/// Iterator over all real blocks in arena order. See [`Heap::blocks`].
pub struct Blocks<'a> {
    heap: &'a Heap,
    cursor: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let tag = self.heap.header_tag(self.cursor);
        (tag.size() != 0).then(|| {
            let info = BlockInfo {
                payload: self.cursor,
                size: tag.size(),
                allocated: tag.is_allocated(),
            };
            self.cursor += tag.size();
            info
        })
    }
}

/// Block and byte totals for a heap. See [`Heap::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total arena length in bytes, sentinels included.
    pub arena_bytes: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Bytes held by allocated blocks, tag overhead included.
    pub allocated_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Bytes held by free blocks, tag overhead included.
    pub free_bytes: usize,
}

impl Heap {
    /// Walks every real block in arena order, from the first block after
    /// the prologue up to (not including) the epilogue.
    ///
    /// The walk trusts the boundary tags; run [`check`](Self::check) first
    /// if the heap may have been damaged.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            cursor: FIRST_BLOCK,
        }
    }

    /// Tallies block and byte counts with a single heap walk.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_bytes: self.arena.len(),
            ..HeapStats::default()
        };
        for block in self.blocks() {
            if block.allocated {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += block.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
            }
        }
        stats
    }

    /// Verifies the whole heap and reports the first violation found.
    ///
    /// The walk checks, in order: sentinel integrity, block geometry and
    /// header/footer agreement, maximal coalescing (no two adjacent free
    /// blocks), and finally that the free list and the free blocks agree
    /// exactly, with symmetric links and no duplicates.
    pub fn check(&self) -> Result<(), CheckError> {
        let len = self.arena.len();

        let sentinel_ok = |tag: Tag| tag.size() == ALIGNMENT && tag.is_allocated();
        let prologue_header = self.arena.read::<Tag>(WORD_SIZE);
        let prologue_footer = self.arena.read::<Tag>(2 * WORD_SIZE);
        ensure!(
            sentinel_ok(prologue_header),
            BadSentinelSnafu {
                offset: WORD_SIZE,
                found: prologue_header,
            }
        );
        ensure!(
            sentinel_ok(prologue_footer),
            BadSentinelSnafu {
                offset: 2 * WORD_SIZE,
                found: prologue_footer,
            }
        );

        let mut free_blocks = BTreeSet::new();
        // The padding word's offset never names a block, so it can stand in
        // for "no previous block".
        let mut prev_bp = 0;
        let mut bp = FIRST_BLOCK;
        loop {
            let header = self.header_tag(bp);
            if header.size() == 0 {
                // Only the epilogue may have size zero, and it must be the
                // arena's final word.
                ensure!(
                    header.is_allocated() && bp == len,
                    BadSentinelSnafu {
                        offset: bp - WORD_SIZE,
                        found: header,
                    }
                );
                break;
            }

            let size = header.size();
            ensure!(
                bp.is_multiple_of(ALIGNMENT)
                    && size.is_multiple_of(ALIGNMENT)
                    && size >= MIN_BLOCK_SIZE,
                MisalignedBlockSnafu { payload: bp, size }
            );
            ensure!(bp + size <= len, HeapOverrunSnafu { payload: bp });

            let footer = self.footer_tag(bp);
            ensure!(
                footer == header,
                TagMismatchSnafu {
                    payload: bp,
                    header,
                    footer,
                }
            );

            if header.is_free() {
                ensure!(
                    !free_blocks.contains(&prev_bp),
                    AdjacentFreeBlocksSnafu {
                        payload: prev_bp,
                        next: bp,
                    }
                );
                free_blocks.insert(bp);
            }

            prev_bp = bp;
            bp += size;
        }

        // The free list must name exactly the free blocks, once each, with
        // every node's back link pointing at its predecessor.
        let mut listed = BTreeSet::new();
        let mut prev = free_list::NIL;
        let mut cursor = self.free.root();
        while cursor != free_list::NIL {
            ensure!(
                free_blocks.contains(&cursor),
                ListedBlockNotFreeSnafu { payload: cursor }
            );
            ensure!(
                FreeList::prev_of(&self.arena, cursor) == prev,
                FreeListCorruptSnafu { payload: cursor }
            );
            ensure!(listed.insert(cursor), FreeListCorruptSnafu { payload: cursor });
            prev = cursor;
            cursor = FreeList::next_of(&self.arena, cursor);
        }
        if let Some(&missing) = free_blocks.difference(&listed).next() {
            return FreeBlockNotListedSnafu { payload: missing }.fail();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn sized(heap: &Heap, bp: usize) -> usize {
        heap.header_tag(bp).size()
    }

    #[test]
    fn test_fresh_heap_is_consistent_and_empty() {
        let heap = Heap::new().unwrap();
        heap.check().unwrap();
        assert_eq!(heap.blocks().count(), 0);
        assert_eq!(
            heap.stats(),
            HeapStats {
                arena_bytes: 4 * WORD_SIZE,
                ..HeapStats::default()
            }
        );
    }

    #[test]
    fn test_blocks_walk_in_address_order() {
        let mut heap = Heap::new().unwrap();
        let p1 = heap.allocate(32).unwrap();
        let p2 = heap.allocate(64).unwrap();
        let p3 = heap.allocate(128).unwrap();

        let blocks: Vec<_> = heap.blocks().collect();
        let payloads: Vec<_> = blocks.iter().map(|b| b.payload).collect();
        assert_eq!(&payloads[..3], &[p1, p2, p3]);
        assert!(payloads.windows(2).all(|w| w[0] < w[1]));
        // Walking by sizes must land exactly on each next payload.
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].payload + pair[0].size, pair[1].payload);
        }
    }

    #[test]
    fn test_stats_totals() {
        let mut heap = Heap::new().unwrap();
        let p1 = heap.allocate(32).unwrap();
        let p2 = heap.allocate(64).unwrap();
        heap.release(p1);

        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, sized(&heap, p2));
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(
            stats.free_bytes + stats.allocated_bytes + 4 * WORD_SIZE,
            stats.arena_bytes
        );
    }

    #[test]
    fn test_detects_tag_mismatch() {
        let mut heap = Heap::new().unwrap();
        let p = heap.allocate(64).unwrap();

        // Flip the footer's allocated flag so it no longer matches the
        // header.
        let size = sized(&heap, p);
        heap.arena.write(p + size - 2 * WORD_SIZE, &Tag::new(size, false));

        assert!(matches!(
            heap.check(),
            Err(CheckError::TagMismatch { payload, .. }) if payload == p
        ));
    }

    #[test]
    fn test_detects_adjacent_free_blocks() {
        let mut heap = Heap::new().unwrap();
        let p1 = heap.allocate(64).unwrap();
        let p2 = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();

        // Mark both blocks free behind the allocator's back, skipping the
        // merge a real release would perform.
        for bp in [p1, p2] {
            let tag = Tag::new(sized(&heap, bp), false);
            heap.arena.write(bp - WORD_SIZE, &tag);
            heap.arena.write(bp + tag.size() - 2 * WORD_SIZE, &tag);
        }

        assert!(matches!(
            heap.check(),
            Err(CheckError::AdjacentFreeBlocks { payload, next, .. })
                if payload == p1 && next == p2
        ));
    }

    #[test]
    fn test_detects_free_block_missing_from_list() {
        let mut heap = Heap::new().unwrap();
        let _p1 = heap.allocate(64).unwrap();
        let p2 = heap.allocate(64).unwrap();
        let _p3 = heap.allocate(64).unwrap();

        let tag = Tag::new(sized(&heap, p2), false);
        heap.arena.write(p2 - WORD_SIZE, &tag);
        heap.arena.write(p2 + tag.size() - 2 * WORD_SIZE, &tag);

        assert!(matches!(
            heap.check(),
            Err(CheckError::FreeBlockNotListed { payload, .. }) if payload == p2
        ));
    }

    #[test]
    fn test_detects_allocated_block_on_list() {
        let mut heap = Heap::new().unwrap();
        let p = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();

        heap.free.push_front(&mut heap.arena, p);

        assert!(matches!(
            heap.check(),
            Err(CheckError::ListedBlockNotFree { payload, .. }) if payload == p
        ));
    }

    #[test]
    fn test_detects_damaged_sentinel() {
        let mut heap = Heap::new().unwrap();
        let _p = heap.allocate(64).unwrap();

        heap.arena.write(2 * WORD_SIZE, &Tag::new(ALIGNMENT, false));

        assert!(matches!(
            heap.check(),
            Err(CheckError::BadSentinel { offset, .. }) if offset == 2 * WORD_SIZE
        ));
    }

    #[test]
    fn test_detects_broken_back_link() {
        let mut heap = Heap::new().unwrap();
        let p1 = heap.allocate(64).unwrap();
        let _p2 = heap.allocate(64).unwrap();
        let p3 = heap.allocate(64).unwrap();
        heap.release(p1);
        heap.release(p3);

        // Damage the second node's back link.
        let second = FreeList::next_of(&heap.arena, heap.free.root());
        heap.arena.write(second + WORD_SIZE, &(heap.arena.len() * 2));

        assert!(matches!(
            heap.check(),
            Err(CheckError::FreeListCorrupt { payload, .. }) if payload == second
        ));
    }
}
