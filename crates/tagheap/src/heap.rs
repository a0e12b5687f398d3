//! The heap proper: block formatting, placement, coalescing and growth.
//!
//! # Arena layout
//!
//! The arena opens with one padding word and a pair of permanent sentinel
//! blocks, and ends with a zero-size epilogue header. Every real block
//! lives between them:
//!
//! ```text
//! offset (words): 0         1          2          3
//! +---------+----------+----------+-----------------------+----------+
//! | padding | prologue | prologue | real blocks ...       | epilogue |
//! |         | header   | footer   |                       | header   |
//! +---------+----------+----------+-----------------------+----------+
//!             (DSIZE,A)  (DSIZE,A)                          (0,A)
//! ```
//!
//! The sentinels are allocated forever, so stepping to a neighbor never
//! needs a bounds check: a walk that reaches the prologue or the epilogue
//! stops at an allocated block and goes no further.
//!
//! A block's header sits one word before its payload offset, its footer one
//! word before its end. Sizes count everything, header and footer included.
//!
//! # Allocation flow
//!
//! `allocate` rounds the request up to the alignment unit (plus tag
//! overhead), scans the free list first-fit, and falls back to growing the
//! arena by at least one chunk. The chosen block is split when the
//! remainder is big enough to stand alone as a free block; otherwise the
//! whole block is handed out and the slack becomes internal fragmentation.
//!
//! `release` marks the block free and merges it with whichever of its two
//! neighbors are free (four cases), so no two free blocks are ever
//! adjacent. Arena growth funnels through the same merge step, which keeps
//! repeated extensions from stranding a trail of small fragments at the top
//! of the heap.

use boundary_tag::{ALIGNMENT, Tag, WORD_SIZE};

use crate::{
    arena::{Arena, OutOfMemory},
    free_list::FreeList,
};

/// Smallest block the heap will format: header + footer + the two
/// free-list link words the block must be able to hold once freed.
pub const MIN_BLOCK_SIZE: usize = 2 * ALIGNMENT;

/// Default growth step when the free list cannot satisfy a request.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Payload offset of the prologue sentinel.
const PROLOGUE: usize = 2 * WORD_SIZE;

/// Payload offset of the first real block.
pub(crate) const FIRST_BLOCK: usize = PROLOGUE + ALIGNMENT;

/// Tuning knobs for a [`Heap`].
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Minimum number of bytes requested per arena growth, amortizing the
    /// cost of repeated extensions. The actual growth is the larger of this
    /// and the outstanding request.
    pub chunk_size: usize,
    /// Upper bound on total arena bytes; `None` leaves growth unbounded.
    pub limit: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            limit: None,
        }
    }
}

/// A heap allocator over a single growable arena.
///
/// All bookkeeping lives inside the arena itself: boundary tags delimit
/// blocks, and free blocks lend their payload to an intrusive free list.
/// Block handles are byte offsets of the payload into the arena, so they
/// stay valid as the arena grows.
///
/// A `Heap` is single-threaded state; wrap it in a lock for shared use.
///
/// # Examples
///
/// ```
/// use tagheap::Heap;
///
/// let mut heap = Heap::new().unwrap();
/// let p = heap.allocate(48).unwrap();
/// heap.payload_mut(p)[..5].copy_from_slice(b"hello");
/// assert_eq!(&heap.payload(p)[..5], b"hello");
/// heap.release(p);
/// ```
pub struct Heap {
    pub(crate) arena: Arena,
    pub(crate) free: FreeList,
    chunk_size: usize,
}

impl Heap {
    /// Creates a heap with the default configuration.
    pub fn new() -> Result<Self, OutOfMemory> {
        Self::with_config(HeapConfig::default())
    }

    /// Creates a heap, writing the padding word and both sentinels.
    ///
    /// Fails when `config.limit` cannot even hold the four opening words.
    pub fn with_config(config: HeapConfig) -> Result<Self, OutOfMemory> {
        let mut arena = Arena::new(config.limit);
        arena.grow(4 * WORD_SIZE)?;

        arena.write(0, &0_usize); // alignment padding
        arena.write(WORD_SIZE, &Tag::new(ALIGNMENT, true)); // prologue header
        arena.write(2 * WORD_SIZE, &Tag::new(ALIGNMENT, true)); // prologue footer
        arena.write(3 * WORD_SIZE, &Tag::new(0, true)); // epilogue header

        Ok(Self {
            arena,
            free: FreeList::new(),
            chunk_size: config.chunk_size,
        })
    }

    /// Allocates at least `size` usable bytes and returns the payload
    /// offset, aligned to [`ALIGNMENT`](boundary_tag::ALIGNMENT).
    ///
    /// Returns `None` for a zero-size request, or when the arena limit is
    /// exhausted. Growth is attempted exactly once per call.
    #[must_use = "dropping the offset leaks the block"]
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size);
        let bp = match self.find_fit(asize) {
            Some(bp) => bp,
            None => self.extend(asize.max(self.chunk_size)).ok()?,
        };
        self.place(bp, asize);
        Some(bp)
    }

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// `bp` must be a live allocation from this heap. Releasing anything
    /// else — a stale offset, a double release — is not detected and
    /// silently corrupts the heap's bookkeeping.
    pub fn release(&mut self, bp: usize) {
        let size = self.header_tag(bp).size();
        self.set_tags(bp, Tag::new(size, false));
        self.coalesce(bp);
    }

    /// Resizes the block at `bp` to at least `size` usable bytes.
    ///
    /// `None` for `bp` behaves like [`allocate`](Self::allocate); a zero
    /// `size` behaves like [`release`](Self::release) and returns `None`.
    /// Otherwise the block is shrunk in place, extended in place into an
    /// immediately following free block, or moved — in that order of
    /// preference. The first `min(old usable size, size)` payload bytes are
    /// preserved.
    #[must_use = "the block may have moved; the old offset is dead"]
    pub fn reallocate(&mut self, bp: Option<usize>, size: usize) -> Option<usize> {
        let Some(bp) = bp else {
            return self.allocate(size);
        };
        if size == 0 {
            self.release(bp);
            return None;
        }

        let asize = adjusted_size(size);
        let current = self.header_tag(bp).size();

        if asize <= current {
            self.shrink(bp, current, asize);
            return Some(bp);
        }

        let next = self.next_payload(bp);
        let next_tag = self.header_tag(next);
        if next_tag.is_free() && current + next_tag.size() >= asize {
            self.free.unlink(&mut self.arena, next);
            let combined = current + next_tag.size();
            self.set_tags(bp, Tag::new(combined, true));
            self.shrink(bp, combined, asize);
            return Some(bp);
        }

        let new_bp = self.allocate(size)?;
        let preserved = size.min(current - 2 * WORD_SIZE);
        self.arena.copy_within(bp..bp + preserved, new_bp);
        self.release(bp);
        Some(new_bp)
    }

    /// Client bytes of the allocated block at `bp`.
    ///
    /// # Panics
    ///
    /// Panics if the block is not allocated.
    #[must_use]
    pub fn payload(&self, bp: usize) -> &[u8] {
        let tag = self.header_tag(bp);
        assert!(tag.is_allocated(), "payload access to a free block");
        self.arena.bytes(bp..bp + tag.size() - 2 * WORD_SIZE)
    }

    /// Mutable client bytes of the allocated block at `bp`.
    ///
    /// # Panics
    ///
    /// Panics if the block is not allocated.
    #[must_use]
    pub fn payload_mut(&mut self, bp: usize) -> &mut [u8] {
        let tag = self.header_tag(bp);
        assert!(tag.is_allocated(), "payload access to a free block");
        self.arena.bytes_mut(bp..bp + tag.size() - 2 * WORD_SIZE)
    }

    /// First-fit scan of the free list.
    fn find_fit(&self, asize: usize) -> Option<usize> {
        self.free
            .iter(&self.arena)
            .find(|&bp| self.header_tag(bp).size() >= asize)
    }

    /// Carves `asize` bytes out of the free block at `bp`.
    ///
    /// The block leaves the free set either way; the tail is split off as a
    /// new free block only when it can stand alone.
    fn place(&mut self, bp: usize, asize: usize) {
        let current = self.header_tag(bp).size();
        self.free.unlink(&mut self.arena, bp);

        if current - asize < MIN_BLOCK_SIZE {
            self.set_tags(bp, Tag::new(current, true));
        } else {
            self.set_tags(bp, Tag::new(asize, true));
            let rest = self.next_payload(bp);
            self.set_tags(rest, Tag::new(current - asize, false));
            self.free.push_front(&mut self.arena, rest);
        }
    }

    /// Trims an allocated block at `bp` from `current` down to `asize`
    /// bytes, recycling the tail through the coalescer when it is big
    /// enough to stand alone.
    fn shrink(&mut self, bp: usize, current: usize, asize: usize) {
        if current - asize < MIN_BLOCK_SIZE {
            return;
        }
        self.set_tags(bp, Tag::new(asize, true));
        let rest = self.next_payload(bp);
        self.set_tags(rest, Tag::new(current - asize, false));
        self.coalesce(rest);
    }

    /// Merges the free block at `bp` with its free neighbors and inserts
    /// the result at the head of the free list. Returns the payload offset
    /// of the merged block.
    fn coalesce(&mut self, bp: usize) -> usize {
        let prev = self.prev_payload(bp);
        let next = self.next_payload(bp);
        let prev_free = self.arena.read::<Tag>(bp - 2 * WORD_SIZE).is_free();
        let next_free = self.header_tag(next).is_free();

        let mut size = self.header_tag(bp).size();
        let merged = match (prev_free, next_free) {
            (false, false) => bp,
            (false, true) => {
                self.free.unlink(&mut self.arena, next);
                size += self.header_tag(next).size();
                bp
            }
            (true, false) => {
                self.free.unlink(&mut self.arena, prev);
                size += self.header_tag(prev).size();
                prev
            }
            (true, true) => {
                self.free.unlink(&mut self.arena, prev);
                self.free.unlink(&mut self.arena, next);
                size += self.header_tag(prev).size() + self.header_tag(next).size();
                prev
            }
        };

        self.set_tags(merged, Tag::new(size, false));
        self.free.push_front(&mut self.arena, merged);
        merged
    }

    /// Grows the arena by at least `bytes`, formats the new space as one
    /// free block where the old epilogue stood, writes a fresh epilogue,
    /// and merges the new block with a free block at the old top of the
    /// heap if there is one.
    fn extend(&mut self, bytes: usize) -> Result<usize, OutOfMemory> {
        let size = bytes.next_multiple_of(ALIGNMENT);
        let bp = self.arena.grow(size)?;

        // The new block's header lands on the old epilogue header.
        self.set_tags(bp, Tag::new(size, false));
        self.arena.write(bp + size - WORD_SIZE, &Tag::new(0, true));

        Ok(self.coalesce(bp))
    }

    pub(crate) fn header_tag(&self, bp: usize) -> Tag {
        self.arena.read(bp - WORD_SIZE)
    }

    pub(crate) fn footer_tag(&self, bp: usize) -> Tag {
        self.arena.read(bp + self.header_tag(bp).size() - 2 * WORD_SIZE)
    }

    /// Writes `tag` as both the header and the footer of the block at `bp`.
    fn set_tags(&mut self, bp: usize, tag: Tag) {
        self.arena.write(bp - WORD_SIZE, &tag);
        self.arena.write(bp + tag.size() - 2 * WORD_SIZE, &tag);
    }

    pub(crate) fn next_payload(&self, bp: usize) -> usize {
        bp + self.header_tag(bp).size()
    }

    fn prev_payload(&self, bp: usize) -> usize {
        bp - self.arena.read::<Tag>(bp - 2 * WORD_SIZE).size()
    }
}

/// Rounds a requested payload size up so the whole block — header and
/// footer included — is an alignment-unit multiple no smaller than
/// [`MIN_BLOCK_SIZE`].
fn adjusted_size(size: usize) -> usize {
    if size <= ALIGNMENT {
        MIN_BLOCK_SIZE
    } else {
        (size + ALIGNMENT).next_multiple_of(ALIGNMENT)
    }
}
