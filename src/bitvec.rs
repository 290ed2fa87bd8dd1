//! Dense bit vectors.
//!
//! A [`BitVector`] stores one bit per page in an array of machine words,
//! lowest bit first. Single-bit mutators are atomic read-modify-write
//! operations on the containing word, so they may race with other single-bit
//! mutators touching different bits of the same word. Everything that reads
//! before it writes across more than one bit, such as
//! [`scan_and_flip`](BitVector::scan_and_flip), is not atomic as a whole and
//! must be serialized by the caller.

use core::{
    alloc::Layout,
    cmp, fmt, mem,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{BackingAllocator, Raw};

#[cfg(any(feature = "alloc", test))]
use crate::{AllocInitError, Global};

/// The storage word type.
type Word = usize;

/// The number of bits in a storage word.
const WORD_BITS: usize = Word::BITS as usize;

/// The number of bytes in a storage word.
const WORD_BYTES: usize = mem::size_of::<Word>();

/// Returns a mask selecting bits `lo..hi` of a word.
#[inline]
const fn mask_between(lo: usize, hi: usize) -> Word {
    debug_assert!(lo < hi && hi <= WORD_BITS);

    let upper = if hi == WORD_BITS {
        !0
    } else {
        (1 << hi) - 1
    };

    upper & (!0 << lo)
}

/// Iterates over the words overlapped by the bit range `start..start +
/// count`, yielding each word index with a mask of the bits in range.
fn word_masks(start: usize, count: usize) -> impl Iterator<Item = (usize, Word)> {
    let end = start + count;
    let mut bit = start;

    core::iter::from_fn(move || {
        if bit >= end {
            return None;
        }

        let word = bit / WORD_BITS;
        let lo = bit % WORD_BITS;
        let hi = cmp::min(end - word * WORD_BITS, WORD_BITS);
        bit = word * WORD_BITS + hi;

        Some((word, mask_between(lo, hi)))
    })
}

/// A fixed-length array of bits.
///
/// The vector also carries a scan cursor, which the next-fit placement
/// strategy uses to remember where the previous allocation ended.
pub struct BitVector<A: BackingAllocator> {
    num_bits: usize,
    map: NonNull<AtomicUsize>,
    cursor: usize,
    backing_allocator: A,
}

// SAFETY: The storage is only ever accessed through atomic operations, and the
// vector has exclusive ownership of it.
unsafe impl<A: BackingAllocator + Send> Send for BitVector<A> {}
unsafe impl<A: BackingAllocator + Sync> Sync for BitVector<A> {}

impl BitVector<Raw> {
    /// Constructs a new bit vector of `num_bits` bits in caller-owned storage.
    ///
    /// All bits are cleared.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `buf` must be valid for reads and writes for `buf_size` bytes for the
    ///   lifetime of the returned `BitVector`.
    /// - No other reference to the memory at `buf` may be used while the
    ///   returned `BitVector` exists.
    ///
    /// # Panics
    ///
    /// Panics if `buf_size` is smaller than
    /// [`required_bytes(num_bits)`](Self::required_bytes) or `buf` is not
    /// aligned for the storage word type.
    pub unsafe fn new_in_buffer(num_bits: usize, buf: NonNull<u8>, buf_size: usize) -> BitVector<Raw> {
        assert!(
            buf_size >= Self::required_bytes(num_bits),
            "buffer of {buf_size} bytes is too small for {num_bits} bits"
        );
        assert_eq!(
            buf.as_ptr().align_offset(mem::align_of::<AtomicUsize>()),
            0,
            "bit vector buffer is misaligned"
        );

        let map = buf.cast::<AtomicUsize>();

        for i in 0..Self::num_words(num_bits) {
            unsafe { map.as_ptr().add(i).write(AtomicUsize::new(0)) };
        }

        BitVector {
            num_bits,
            map,
            cursor: 0,
            backing_allocator: Raw,
        }
    }

    /// Decomposes the bit vector into its storage pointer and length in bits.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.map.cast(), self.num_bits)
    }
}

#[cfg(any(feature = "alloc", test))]
impl BitVector<Global> {
    /// Constructs a new bit vector of `num_bits` bits on the global heap.
    ///
    /// All bits are cleared.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::AllocFailed)` if the storage cannot be
    /// allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(num_bits: usize) -> Result<BitVector<Global>, AllocInitError> {
        let layout = Self::storage_layout(num_bits);

        let map = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            // All-zero bytes are valid `AtomicUsize` values.
            Global.allocate_zeroed(layout)?.cast()
        };

        Ok(BitVector {
            num_bits,
            map,
            cursor: 0,
            backing_allocator: Global,
        })
    }
}

impl<A: BackingAllocator> Drop for BitVector<A> {
    fn drop(&mut self) {
        let layout = Self::storage_layout(self.num_bits);

        if layout.size() != 0 {
            unsafe { self.backing_allocator.deallocate(self.map.cast(), layout) };
        }
    }
}

impl<A: BackingAllocator> BitVector<A> {
    /// Returns the number of storage words needed for `num_bits` bits.
    #[inline]
    pub const fn num_words(num_bits: usize) -> usize {
        num_bits.div_ceil(WORD_BITS)
    }

    /// Returns the number of bytes of storage needed for `num_bits` bits.
    ///
    /// This is also the size of the persisted form of the vector.
    #[inline]
    pub const fn required_bytes(num_bits: usize) -> usize {
        Self::num_words(num_bits) * WORD_BYTES
    }

    /// Returns the layout of the storage needed for `num_bits` bits.
    pub fn storage_layout(num_bits: usize) -> Layout {
        Layout::array::<AtomicUsize>(Self::num_words(num_bits)).expect("bit vector layout error")
    }

    /// Returns a tuple of the index of the word containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, Word) {
        (bit / WORD_BITS, 1 << (bit % WORD_BITS))
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < Self::num_words(self.num_bits));

        // SAFETY: `index` is within the storage, which lives as long as `self`.
        unsafe { &*self.map.as_ptr().add(index) }
    }

    #[inline]
    fn words(&self) -> impl Iterator<Item = &AtomicUsize> + '_ {
        (0..Self::num_words(self.num_bits)).map(move |i| self.word(i))
    }

    /// Returns a mask of the bits of the last word that are within bounds.
    #[inline]
    fn last_mask(&self) -> Word {
        match self.num_bits % WORD_BITS {
            0 => !0,
            bits => (1 << bits) - 1,
        }
    }

    #[inline]
    fn assert_range(&self, start: usize, count: usize) {
        assert!(
            start <= self.num_bits && count <= self.num_bits - start,
            "bit range {start}+{count} out of bounds for {} bits",
            self.num_bits
        );
    }

    /// Returns the number of bits in the vector.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns `true` if the vector holds no bits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Returns the value of the indexed bit.
    #[inline]
    pub fn test(&self, index: usize) -> bool {
        assert!(index < self.num_bits, "bit {index} out of bounds");

        let (word, mask) = Self::index_and_mask(index);
        self.word(word).load(Ordering::Acquire) & mask != 0
    }

    /// Atomically sets the value of the indexed bit.
    #[inline]
    pub fn set(&self, index: usize, value: bool) {
        match value {
            true => self.mark(index),
            false => self.reset(index),
        }
    }

    /// Atomically sets the indexed bit.
    #[inline]
    pub fn mark(&self, index: usize) {
        assert!(index < self.num_bits, "bit {index} out of bounds");

        let (word, mask) = Self::index_and_mask(index);
        self.word(word).fetch_or(mask, Ordering::AcqRel);
    }

    /// Atomically clears the indexed bit.
    #[inline]
    pub fn reset(&self, index: usize) {
        assert!(index < self.num_bits, "bit {index} out of bounds");

        let (word, mask) = Self::index_and_mask(index);
        self.word(word).fetch_and(!mask, Ordering::AcqRel);
    }

    /// Atomically toggles the indexed bit.
    #[inline]
    pub fn flip(&self, index: usize) {
        assert!(index < self.num_bits, "bit {index} out of bounds");

        let (word, mask) = Self::index_and_mask(index);
        self.word(word).fetch_xor(mask, Ordering::AcqRel);
    }

    /// Sets the `count` bits starting at `start` to `value`.
    ///
    /// Each word is updated atomically, but the range as a whole is not.
    pub fn set_range(&self, start: usize, count: usize, value: bool) {
        self.assert_range(start, count);

        for (word, mask) in word_masks(start, count) {
            match value {
                true => self.word(word).fetch_or(mask, Ordering::AcqRel),
                false => self.word(word).fetch_and(!mask, Ordering::AcqRel),
            };
        }
    }

    /// Sets every bit to `value`.
    pub fn set_all(&self, value: bool) {
        self.set_range(0, self.num_bits, value);
    }

    /// Returns the bits of word `index` that equal `value`, restricted to
    /// `mask`.
    #[inline]
    fn matching_bits(&self, index: usize, mask: Word, value: bool) -> Word {
        let word = self.word(index).load(Ordering::Acquire);

        match value {
            true => word & mask,
            false => !word & mask,
        }
    }

    /// Returns the number of bits in `start..start + count` equal to `value`.
    pub fn count_matching(&self, start: usize, count: usize, value: bool) -> usize {
        self.assert_range(start, count);

        word_masks(start, count)
            .map(|(word, mask)| self.matching_bits(word, mask, value).count_ones() as usize)
            .sum()
    }

    /// Returns `true` if any bit in `start..start + count` equals `value`.
    pub fn contains(&self, start: usize, count: usize, value: bool) -> bool {
        self.assert_range(start, count);

        word_masks(start, count).any(|(word, mask)| self.matching_bits(word, mask, value) != 0)
    }

    /// Returns `true` if every bit in `start..start + count` is set.
    #[inline]
    pub fn all(&self, start: usize, count: usize) -> bool {
        !self.contains(start, count, false)
    }

    /// Returns `true` if any bit in `start..start + count` is set.
    #[inline]
    pub fn any(&self, start: usize, count: usize) -> bool {
        self.contains(start, count, true)
    }

    /// Returns `true` if no bit in `start..start + count` is set.
    #[inline]
    pub fn none(&self, start: usize, count: usize) -> bool {
        !self.contains(start, count, true)
    }

    /// Returns the index of the first bit at or after `from` equal to
    /// `value`.
    pub fn next_matching(&self, from: usize, value: bool) -> Option<usize> {
        assert!(from <= self.num_bits, "bit {from} out of bounds");

        let mut bit = from;
        while bit < self.num_bits {
            let word = bit / WORD_BITS;
            let found = self.matching_bits(word, !0 << (bit % WORD_BITS), value);

            if found != 0 {
                let index = word * WORD_BITS + found.trailing_zeros() as usize;

                // Out-of-range bits in the last word always read as clear, so
                // a search for clear bits can land past the end.
                return (index < self.num_bits).then_some(index);
            }

            bit = (word + 1) * WORD_BITS;
        }

        None
    }

    /// Returns the length of the run of bits equal to `value` that starts at
    /// `start`.
    pub fn run_length(&self, start: usize, value: bool) -> usize {
        let end = self.next_matching(start, !value).unwrap_or(self.num_bits);
        end - start
    }

    /// Returns the smallest index `i >= start` such that the `count` bits
    /// starting at `i` all equal `value`, or `None` if there is no such run.
    ///
    /// A `count` of zero matches at `start`.
    pub fn scan(&self, start: usize, count: usize, value: bool) -> Option<usize> {
        assert!(start <= self.num_bits, "bit {start} out of bounds");

        if count > self.num_bits - start {
            return None;
        }

        if count == 0 {
            return Some(start);
        }

        let mut from = start;
        loop {
            let run = self.next_matching(from, value)?;
            if count > self.num_bits - run {
                return None;
            }

            let len = self.run_length(run, value);
            if len >= count {
                return Some(run);
            }

            from = run + len;
        }
    }

    /// Finds the first run as [`scan`](Self::scan) does and sets the whole
    /// run to `!value`.
    ///
    /// Testing the run is not atomic with flipping it; callers that race with
    /// other mutators must hold a lock.
    pub fn scan_and_flip(&self, start: usize, count: usize, value: bool) -> Option<usize> {
        let index = self.scan(start, count, value)?;
        self.set_range(index, count, !value);
        Some(index)
    }

    /// Returns the scan cursor.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the scan cursor to `index`.
    ///
    /// `index` may equal the length of the vector.
    #[inline]
    pub fn set_cursor(&mut self, index: usize) {
        assert!(index <= self.num_bits, "cursor {index} out of bounds");
        self.cursor = index;
    }

    /// Returns the number of bytes needed to persist the vector.
    #[inline]
    pub fn file_size(&self) -> usize {
        Self::required_bytes(self.num_bits)
    }

    /// Reads the vector's contents from `store`, starting `offset` bytes in.
    ///
    /// Bits past the end of the vector are cleared regardless of the stored
    /// contents.
    ///
    /// # Errors
    ///
    /// Returns `Err(PersistError::ShortRead)` if the store holds fewer than
    /// [`file_size()`](Self::file_size) bytes at `offset`. Whatever was read
    /// is kept.
    pub fn read_from<S>(&mut self, store: &S, offset: usize) -> Result<(), PersistError>
    where
        S: ByteStore + ?Sized,
    {
        let expected = self.file_size();
        let mut actual = 0;

        for (i, word) in self.words().enumerate() {
            let mut bytes = [0; WORD_BYTES];
            actual += store.read_at(&mut bytes, offset + i * WORD_BYTES);
            word.store(Word::from_le_bytes(bytes), Ordering::Release);
        }

        if let Some(last) = Self::num_words(self.num_bits).checked_sub(1) {
            self.word(last).fetch_and(self.last_mask(), Ordering::AcqRel);
        }

        match actual == expected {
            true => Ok(()),
            false => Err(PersistError::ShortRead { expected, actual }),
        }
    }

    /// Writes the vector's contents to `store`, starting `offset` bytes in.
    ///
    /// Bit `k` lands in byte `offset + k / 8`, at bit `k % 8`.
    ///
    /// # Errors
    ///
    /// Returns `Err(PersistError::ShortWrite)` if the store accepts fewer
    /// than [`file_size()`](Self::file_size) bytes.
    pub fn write_to<S>(&self, store: &mut S, offset: usize) -> Result<(), PersistError>
    where
        S: ByteStore + ?Sized,
    {
        let expected = self.file_size();
        let mut actual = 0;

        for (i, word) in self.words().enumerate() {
            let bytes = word.load(Ordering::Acquire).to_le_bytes();
            actual += store.write_at(&bytes, offset + i * WORD_BYTES);
        }

        match actual == expected {
            true => Ok(()),
            false => Err(PersistError::ShortWrite { expected, actual }),
        }
    }

    /// Returns a rendering of the vector as rows of binary digits, one row
    /// per storage word.
    pub fn binary_dump(&self) -> BinaryDump<'_, A> {
        BinaryDump(self)
    }

    /// Returns a rendering of the vector's storage as hexadecimal bytes.
    pub fn hex_dump(&self) -> HexDump<'_, A> {
        HexDump(self)
    }
}

impl<A: BackingAllocator> fmt::Debug for BitVector<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitVector")
            .field("num_bits", &self.num_bits)
            .field("set", &self.count_matching(0, self.num_bits, true))
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// A binary rendering of a [`BitVector`].
pub struct BinaryDump<'a, A: BackingAllocator>(&'a BitVector<A>);

impl<A: BackingAllocator> fmt::Display for BinaryDump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.0;

        writeln!(f, "========== bitmap dump start ==========")?;
        for row in 0..BitVector::<A>::num_words(bits.len()) {
            let start = row * WORD_BITS;
            let end = cmp::min(start + WORD_BITS, bits.len());

            for index in start..end {
                f.write_str(if bits.test(index) { "1" } else { "0" })?;
            }
            writeln!(f)?;
        }
        writeln!(f, "========== bitmap dump end ==========")
    }
}

impl<A: BackingAllocator> fmt::Debug for BinaryDump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A hexadecimal rendering of a [`BitVector`]'s storage bytes.
pub struct HexDump<'a, A: BackingAllocator>(&'a BitVector<A>);

impl<A: BackingAllocator> fmt::Display for HexDump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PER_ROW: usize = 16;

        let bytes = self
            .0
            .words()
            .flat_map(|word| word.load(Ordering::Acquire).to_le_bytes());

        let mut column = 0;
        for (offset, byte) in bytes.enumerate() {
            if column == 0 {
                write!(f, "{offset:08x} ")?;
            }

            write!(f, " {byte:02x}")?;

            column += 1;
            if column == PER_ROW {
                writeln!(f)?;
                column = 0;
            }
        }

        if column != 0 {
            writeln!(f)?;
        }

        Ok(())
    }
}

impl<A: BackingAllocator> fmt::Debug for HexDump<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A byte-addressable store that bit vectors can be persisted to.
pub trait ByteStore {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes written.
    fn write_at(&mut self, buf: &[u8], offset: usize) -> usize;
}

impl ByteStore for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let src = self.get(offset..).unwrap_or(&[]);
        let len = cmp::min(src.len(), buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        len
    }

    fn write_at(&mut self, buf: &[u8], offset: usize) -> usize {
        let dst = self.get_mut(offset..).unwrap_or(&mut []);
        let len = cmp::min(dst.len(), buf.len());
        dst[..len].copy_from_slice(&buf[..len]);
        len
    }
}

/// The error type for bit vector persistence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistError {
    /// The store ended before the whole vector was read.
    ShortRead {
        /// The number of bytes requested.
        expected: usize,
        /// The number of bytes read.
        actual: usize,
    },

    /// The store ended before the whole vector was written.
    ShortWrite {
        /// The number of bytes offered.
        expected: usize,
        /// The number of bytes written.
        actual: usize,
    },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::ShortRead { expected, actual } => {
                write!(f, "short read: {actual} of {expected} bytes")
            }
            PersistError::ShortWrite { expected, actual } => {
                write!(f, "short write: {actual} of {expected} bytes")
            }
        }
    }
}
