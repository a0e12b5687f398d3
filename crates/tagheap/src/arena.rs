//! The owned arena buffer and its growth primitive.
//!
//! The arena is a single contiguous byte buffer that only ever grows. All
//! heap metadata (boundary tags, free-list links) lives inside it as plain
//! machine words, read and written through [`Pod`] views at byte offsets.
//! Offsets into the buffer take the role raw pointers play in a C
//! allocator: they stay valid across growth because the buffer is only
//! appended to, never reshuffled.
//!
//! Growth is the one operation that can fail. An [`Arena`] carries an
//! optional byte limit standing in for the machine running out of memory;
//! exceeding it returns [`OutOfMemory`] and leaves the buffer untouched.

use alloc::vec::Vec;
use core::ops::Range;

use dataview::{DataView, Pod};
use snafu::{Location, Snafu, ensure};

/// The arena cannot be extended any further.
#[derive(Debug, Snafu)]
#[snafu(display(
    "arena exhausted: growing {len} bytes by {requested} would exceed the {limit} byte limit"
))]
pub struct OutOfMemory {
    /// Additional bytes that were requested.
    requested: usize,
    /// Arena length at the time of the request.
    len: usize,
    /// Configured arena limit.
    limit: usize,
    #[snafu(implicit)]
    location: Location,
}

/// A growable, byte-addressable memory region.
pub(crate) struct Arena {
    buf: Vec<u8>,
    limit: usize,
}

impl Arena {
    /// Creates an empty arena. `limit` bounds the total number of bytes the
    /// arena may ever hold; `None` leaves growth unbounded.
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            buf: Vec::new(),
            limit: limit.unwrap_or(usize::MAX),
        }
    }

    /// Current arena length in bytes.
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Extends the arena by `bytes` zeroed bytes and returns the offset at
    /// which the new space begins (the old length). The arena is unchanged
    /// when the configured limit would be exceeded.
    pub(crate) fn grow(&mut self, bytes: usize) -> Result<usize, OutOfMemory> {
        let len = self.buf.len();
        let fits = len.checked_add(bytes).is_some_and(|new_len| new_len <= self.limit);
        ensure!(
            fits,
            OutOfMemorySnafu {
                requested: bytes,
                len,
                limit: self.limit,
            }
        );
        self.buf.resize(len + bytes, 0);
        Ok(len)
    }

    /// Reads a [`Pod`] value at a byte offset.
    ///
    /// # Panics
    ///
    /// Panics if the value would extend past the end of the arena.
    pub(crate) fn read<T: Pod>(&self, offset: usize) -> T {
        DataView::from(self.buf.as_slice()).read(offset)
    }

    /// Writes a [`Pod`] value at a byte offset.
    ///
    /// # Panics
    ///
    /// Panics if the value would extend past the end of the arena.
    pub(crate) fn write<T: Pod>(&mut self, offset: usize, value: &T) {
        DataView::from_mut(self.buf.as_mut_slice()).write(offset, value);
    }

    /// Borrows a range of arena bytes.
    pub(crate) fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Mutably borrows a range of arena bytes.
    pub(crate) fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.buf[range]
    }

    /// Copies `src` to `dest` within the arena. The ranges may overlap.
    pub(crate) fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        self.buf.copy_within(src, dest);
    }
}
