//! Boundary tag encoding for heap block metadata.
//!
//! A boundary tag packs a block's total size and its allocated flag into a
//! single machine word, stored once at the start of the block (header) and
//! once at its end (footer). Block sizes are always multiples of
//! [`ALIGNMENT`], so the low bits of a stored size are zero and the least
//! significant bit is free to carry the allocated flag. Keeping the same
//! word at both ends of a block lets a traversal step backwards to the
//! previous block as cheaply as forwards to the next one.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::Pod;

/// Size in bytes of one metadata word (header, footer or free-list link).
pub const WORD_SIZE: usize = size_of::<usize>();

/// Alignment unit for block sizes and payload offsets: one double word.
pub const ALIGNMENT: usize = 2 * WORD_SIZE;

/// Bits of a tag word that do not belong to the size.
const FLAG_BITS: usize = ALIGNMENT - 1;

/// The least significant bit carries the allocated flag.
const ALLOCATED: usize = 0x1;

/// A packed `(size, allocated)` pair.
///
/// `Tag` is a transparent wrapper around the stored word and implements
/// [`Pod`], so it can be read from and written to a raw byte buffer at any
/// offset without a separate decoding step.
///
/// # Examples
///
/// ```
/// use boundary_tag::{ALIGNMENT, Tag};
///
/// let tag = Tag::new(4 * ALIGNMENT, true);
/// assert_eq!(tag.size(), 4 * ALIGNMENT);
/// assert!(tag.is_allocated());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag(usize);

unsafe impl Pod for Tag {}

impl Tag {
    /// Packs a block size and an allocated flag into a tag word.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`ALIGNMENT`].
    #[must_use]
    pub const fn new(size: usize, allocated: bool) -> Self {
        assert!(
            size & FLAG_BITS == 0,
            "block size must be a multiple of the alignment unit"
        );
        Self(size | if allocated { ALLOCATED } else { 0 })
    }

    /// Total block size in bytes, including header and footer words.
    #[must_use]
    pub const fn size(self) -> usize {
        self.0 & !FLAG_BITS
    }

    /// Whether the tagged block is allocated.
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    /// Whether the tagged block is free.
    #[must_use]
    pub const fn is_free(self) -> bool {
        !self.is_allocated()
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}
