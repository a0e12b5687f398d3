//! An explicit free list heap allocator with boundary tags.
//!
//! This crate manages a single linear, growable arena and hands out
//! variable-sized blocks from it. All bookkeeping lives inside the arena
//! itself: every block is delimited by a pair of boundary tags (a header
//! and a footer word each packing the block's size and an allocated flag),
//! and free blocks lend the first two words of their payload to an
//! intrusive doubly linked free list. No allocation metadata exists outside
//! the arena.
//!
//! # Algorithm
//!
//! - **Allocation**: first-fit over the free list. Requests are rounded up
//!   to the double-word alignment unit plus tag overhead; the chosen block
//!   is split when the remainder can stand alone as a free block.
//! - **Release**: the block is marked free and immediately merged with
//!   whichever of its two arena neighbors are free, so no two free blocks
//!   are ever adjacent.
//! - **Growth**: when the free list has no fitting block, the arena grows
//!   by at least one configurable chunk, and the fresh space is merged with
//!   a free block at the old top of the heap.
//!
//! Footers make the previous neighbor reachable in O(1), and a pair of
//! permanently allocated sentinel blocks (prologue and epilogue) bound the
//! arena so neighbor traversal never needs a bounds check.
//!
//! # Memory layout
//!
//! ```text
//! Allocated block:                   Free block:
//! +--------+----------------+       +--------+------+------+----------+
//! | header | client payload |       | header | next | prev | (unused) |
//! | (s, A) |                |       | (s, F) | link | link |          |
//! +--------+-------+--------+       +--------+------+------+---+------+
//!                  | footer |                           | footer |
//!                  | (s, A) |                           | (s, F) |
//!                  +--------+                           +--------+
//! ```
//!
//! # Block handles
//!
//! Blocks are identified by the byte offset of their payload into the
//! arena, not by pointers. The arena only ever grows, so offsets stay valid
//! for the lifetime of the allocation. Client data is read and written
//! through [`Heap::payload`] and [`Heap::payload_mut`].
//!
//! # Examples
//!
//! ```
//! use tagheap::Heap;
//!
//! let mut heap = Heap::new().unwrap();
//!
//! let p = heap.allocate(64).unwrap();
//! heap.payload_mut(p)[..13].copy_from_slice(b"hello, arena!");
//! assert_eq!(&heap.payload(p)[..13], b"hello, arena!");
//!
//! // Growing may move the block; the contents follow it.
//! let q = heap.reallocate(Some(p), 8192).unwrap();
//! assert_eq!(&heap.payload(q)[..13], b"hello, arena!");
//!
//! heap.release(q);
//! heap.check().unwrap();
//! ```
//!
//! # Consistency checking
//!
//! [`Heap::check`] walks the whole arena and verifies every structural
//! invariant (tag agreement, maximal coalescing, free list membership);
//! [`Heap::blocks`] and [`Heap::stats`] expose the same walk for
//! inspection.
//!
//! # Thread safety
//!
//! A [`Heap`] is plain single-threaded state: `Send` but not usable
//! concurrently. Wrap it in a mutex to share it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arena;
mod check;
mod free_list;
mod heap;

pub use boundary_tag::{ALIGNMENT, Tag, WORD_SIZE};

pub use self::{
    arena::OutOfMemory,
    check::{BlockInfo, Blocks, CheckError, HeapStats},
    heap::{DEFAULT_CHUNK_SIZE, Heap, HeapConfig, MIN_BLOCK_SIZE},
};
