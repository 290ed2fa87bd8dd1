//! The free-block index behind buddy placement.
//!
//! A [`BuddyOrderTable`] records which power-of-two blocks of a pool are free.
//! A block of order `k` spans `2^k` pages and is identified by the index of
//! its first page, which is always a multiple of `2^k`. Each order's free set
//! is a run of bits inside a single [`BitVector`], one bit per aligned slot.
//!
//! The table only decides *where* buddy allocations go. The pool's own bit
//! vector remains the record of which pages are in use.

use core::{fmt, ptr::NonNull};

use log::trace;

use crate::{bitvec::BitVector, Raw};

/// The largest number of orders a table can have.
const ORDER_LIMIT: usize = usize::BITS as usize;

/// Returns the number of order-`order` slots in a pool of `num_pages` pages.
#[inline]
fn slots_at(num_pages: usize, order: usize) -> usize {
    num_pages.div_ceil(1 << order)
}

/// Returns the size in pages of a block of order `order`.
#[inline]
pub const fn block_pages(order: usize) -> usize {
    1 << order
}

/// Returns the smallest order whose blocks hold at least `count` pages.
///
/// # Panics
///
/// Panics if `count` is zero or too large to round up to a power of two.
#[inline]
pub fn order_for(count: usize) -> usize {
    assert!(count > 0, "zero-page blocks have no order");

    count
        .checked_next_power_of_two()
        .expect("page count overflows usize")
        .trailing_zeros() as usize
}

/// Free lists of power-of-two blocks, indexed by order.
pub struct BuddyOrderTable {
    num_pages: usize,
    /// The number of orders; blocks of order `max_order - 1` are the largest.
    max_order: usize,
    /// The bit offset of each order's free set within `free`.
    offsets: [usize; ORDER_LIMIT + 1],
    free: BitVector<Raw>,
}

impl BuddyOrderTable {
    /// Returns the number of orders needed for a pool of `num_pages` pages.
    ///
    /// This is one more than the base-2 logarithm of the largest block that
    /// fits in the pool, or zero for an empty pool.
    pub fn max_order_for(num_pages: usize) -> usize {
        match num_pages {
            0 => 0,
            n => n.ilog2() as usize + 1,
        }
    }

    /// Returns the number of free-set bits needed for a pool of `num_pages`
    /// pages.
    pub fn num_bits(num_pages: usize) -> usize {
        (0..Self::max_order_for(num_pages))
            .map(|order| slots_at(num_pages, order))
            .sum()
    }

    /// Returns the number of bytes of storage needed for a pool of
    /// `num_pages` pages.
    pub fn required_bytes(num_pages: usize) -> usize {
        BitVector::<Raw>::required_bytes(Self::num_bits(num_pages))
    }

    /// Constructs a table for a pool of `num_pages` pages in caller-owned
    /// storage, with every page free.
    ///
    /// The pool is carved into the largest aligned blocks that fit, lowest
    /// index first. If `num_pages` is a power of two, this is a single block
    /// of the largest order.
    ///
    /// # Safety
    ///
    /// The caller must uphold the same invariants as
    /// [`BitVector::new_in_buffer`].
    ///
    /// # Panics
    ///
    /// Panics if `buf_size` is smaller than
    /// [`required_bytes(num_pages)`](Self::required_bytes).
    pub unsafe fn new_in_buffer(num_pages: usize, buf: NonNull<u8>, buf_size: usize) -> BuddyOrderTable {
        let max_order = Self::max_order_for(num_pages);

        let mut offsets = [0; ORDER_LIMIT + 1];
        for order in 0..max_order {
            offsets[order + 1] = offsets[order] + slots_at(num_pages, order);
        }

        let free = unsafe { BitVector::new_in_buffer(offsets[max_order], buf, buf_size) };

        let mut table = BuddyOrderTable {
            num_pages,
            max_order,
            offsets,
            free,
        };

        let mut page = 0;
        while page < num_pages {
            let order = (0..max_order)
                .rev()
                .find(|&order| {
                    page % block_pages(order) == 0 && block_pages(order) <= num_pages - page
                })
                .unwrap_or(0);

            table.insert(page, order);
            page += block_pages(order);
        }

        table
    }

    /// Returns the number of orders in the table.
    #[inline]
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Returns the number of pages the table covers.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    #[inline]
    fn slot(&self, page: usize, order: usize) -> usize {
        self.offsets[order] + (page >> order)
    }

    /// Returns `true` if the order-`order` block starting at `page` is free.
    ///
    /// Blocks that would extend past the end of the pool are never free.
    pub fn is_free(&self, page: usize, order: usize) -> bool {
        order < self.max_order
            && page % block_pages(order) == 0
            && page < self.num_pages
            && self.free.test(self.slot(page, order))
    }

    fn insert(&mut self, page: usize, order: usize) {
        let slot = self.slot(page, order);
        assert!(!self.free.test(slot), "block {page} already free at order {order}");
        self.free.mark(slot);
    }

    fn remove(&mut self, page: usize, order: usize) {
        let slot = self.slot(page, order);
        assert!(self.free.test(slot), "block {page} not free at order {order}");
        self.free.reset(slot);
    }

    /// Removes and returns the lowest free block of order `order`.
    fn pop_lowest(&mut self, order: usize) -> Option<usize> {
        let start = self.offsets[order];
        let slot = self.free.next_matching(start, true)?;

        if slot >= self.offsets[order + 1] {
            return None;
        }

        self.free.reset(slot);
        Some((slot - start) << order)
    }

    /// Allocates a block of order `order`, splitting larger blocks as needed.
    ///
    /// Returns the index of the block's first page, or `None` if no block of
    /// order `order` or larger is free. Requests for orders the pool is too
    /// small to hold also return `None`.
    pub fn allocate_order(&mut self, order: usize) -> Option<usize> {
        if order >= self.max_order {
            return None;
        }

        if let Some(page) = self.pop_lowest(order) {
            return Some(page);
        }

        if order + 1 == self.max_order {
            return None;
        }

        // Split a larger block. The lower half is handed out and the upper
        // half stays free at this order.
        let page = self.allocate_order(order + 1)?;
        let upper = page + block_pages(order);
        trace!("buddy: split block {page} of order {} into {page} and {upper}", order + 1);

        self.insert(upper, order);

        Some(page)
    }

    /// Returns the order-`order` block starting at `page` to the table,
    /// merging it with its buddy for as long as the buddy is free.
    ///
    /// # Panics
    ///
    /// Panics if the block is misaligned, out of range, or already free.
    pub fn free_order(&mut self, page: usize, order: usize) {
        assert!(order < self.max_order, "order {order} out of range");
        assert_eq!(page % block_pages(order), 0, "block {page} misaligned for order {order}");
        assert!(
            block_pages(order) <= self.num_pages && page <= self.num_pages - block_pages(order),
            "block {page} of order {order} out of range"
        );

        assert!(
            !(order..self.max_order).any(|k| self.is_free(page & !(block_pages(k) - 1), k)),
            "block {page} of order {order} is already free"
        );

        let mut page = page;
        let mut order = order;

        while order + 1 < self.max_order {
            let buddy = page ^ block_pages(order);
            if !self.is_free(buddy, order) {
                break;
            }

            self.remove(buddy, order);
            trace!("buddy: merge block {page} with {buddy} at order {order}");

            page &= !block_pages(order);
            order += 1;
        }

        self.insert(page, order);
    }

    /// Returns an iterator over the free blocks of order `order`, lowest
    /// first.
    pub fn free_blocks(&self, order: usize) -> impl Iterator<Item = usize> + '_ {
        assert!(order < self.max_order, "order {order} out of range");

        let start = self.offsets[order];
        let end = self.offsets[order + 1];

        (start..end)
            .filter(move |&slot| self.free.test(slot))
            .map(move |slot| (slot - start) << order)
    }

    /// Returns the number of free blocks of order `order`.
    pub fn free_block_count(&self, order: usize) -> usize {
        assert!(order < self.max_order, "order {order} out of range");

        let start = self.offsets[order];
        self.free.count_matching(start, self.offsets[order + 1] - start, true)
    }

    /// Returns the total number of pages in free blocks.
    pub fn free_page_count(&self) -> usize {
        (0..self.max_order)
            .map(|order| self.free_block_count(order) * block_pages(order))
            .sum()
    }

    /// Returns `true` if a block of order `order` could be allocated without
    /// exhausting the table.
    pub fn can_allocate(&self, order: usize) -> bool {
        (order..self.max_order).any(|order| self.free_block_count(order) != 0)
    }
}

impl fmt::Debug for BuddyOrderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Counts<'a>(&'a BuddyOrderTable);

        impl fmt::Debug for Counts<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_list()
                    .entries((0..self.0.max_order).map(|order| self.0.free_block_count(order)))
                    .finish()
            }
        }

        f.debug_struct("BuddyOrderTable")
            .field("num_pages", &self.num_pages)
            .field("max_order", &self.max_order)
            .field("free_blocks", &Counts(self))
            .finish()
    }
}
