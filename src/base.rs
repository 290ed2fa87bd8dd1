use core::{num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use crate::{page_number, page_offset, PAGE_SIZE};

/// A pointer to the first page of a region of memory managed by a pool.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Checked against overflow in `new`.
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> usize {
        addr.get().checked_sub(self.ptr.addr().get()).unwrap()
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The offset may equal the extent, producing a one-past-the-end pointer.
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> Option<NonNull<u8>> {
        if offset > self.extent {
            return None;
        }

        let raw = self.ptr.addr().get().checked_add(offset)?;
        let addr = NonZeroUsize::new(raw)?;

        Some(self.ptr.with_addr(addr))
    }

    /// Returns the index of the page that starts at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the region or not page-aligned.
    #[inline]
    pub fn page_index_of(self, addr: NonZeroUsize) -> usize {
        assert!(self.contains_addr(addr), "address outside of region");
        assert_eq!(page_offset(addr.get()), 0, "address is not page-aligned");

        page_number(self.offset_to(addr))
    }

    /// Returns a pointer to the page at `index`.
    #[inline]
    pub fn page_at(self, index: usize) -> NonNull<u8> {
        let offset = index.checked_mul(PAGE_SIZE).expect("page offset overflows usize");
        let page = self.with_offset(offset).expect("page index out of region");

        debug_assert!(self.contains_addr(page.addr()));

        page
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::alloc::Layout;

    use super::*;

    #[test]
    fn page_index_round_trips() {
        let layout = Layout::from_size_align(4 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).unwrap();

        let base = BasePtr::new(ptr, 4 * PAGE_SIZE);
        for index in 0..4 {
            let page = base.page_at(index);
            assert!(base.contains_addr(page.addr()));
            assert_eq!(base.page_index_of(page.addr()), index);
        }

        assert!(!base.contains_addr(base.limit()));
        assert_eq!(base.with_offset(4 * PAGE_SIZE).map(|p| p.addr()), Some(base.limit()));
        assert!(base.with_offset(4 * PAGE_SIZE + 1).is_none());

        unsafe { std::alloc::dealloc(raw, layout) };
    }

    #[test]
    #[should_panic]
    fn unaligned_page_index_panics() {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).unwrap();

        let base = BasePtr::new(ptr, PAGE_SIZE);
        let inside = NonZeroUsize::new(base.addr().get() + 8).unwrap();
        base.page_index_of(inside);
    }
}
