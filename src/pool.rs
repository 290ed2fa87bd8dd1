//! Page pools.
//!
//! An [`AllocationPool`] manages a contiguous, page-aligned region. The first
//! few pages of the region hold the pool's metadata: its occupancy bit vector
//! and, under the buddy strategy, the order table. The remaining pages are
//! handed out.
//!
//! ```text
//! region
//! |
//! v
//! +-----------+-----------+--------+--------+-----+------------+
//! | bit vec   | order tbl | page 0 | page 1 | ... | page n - 1 |
//! +-----------+-----------+--------+--------+-----+------------+
//! |<-- metadata pages --->|
//! ```
//!
//! All placement and bookkeeping for a pool happens under its lock.

use core::{fmt, ptr::NonNull};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use log::{debug, info, warn};
use spin::Mutex;

use crate::{
    base::BasePtr,
    bitvec::BitVector,
    page_offset, pages_for,
    placement::{Strategy, StrategyKind},
    AllocInitError, Raw, PAGE_SIZE,
};

struct PoolState {
    used_map: BitVector<Raw>,
    strategy: Strategy,
}

/// A pool of pages with its own occupancy map and placement strategy.
pub struct AllocationPool {
    name: &'static str,
    base: BasePtr,
    num_pages: usize,
    metadata_pages: usize,
    state: Mutex<PoolState>,
}

// SAFETY: The pages behind `base` are owned by the pool and only handed out
// under the lock.
unsafe impl Send for AllocationPool {}
unsafe impl Sync for AllocationPool {}

impl AllocationPool {
    /// Returns the number of metadata bytes a pool spanning `total_pages`
    /// pages needs under strategy `kind`.
    pub fn metadata_bytes(total_pages: usize, kind: StrategyKind) -> usize {
        BitVector::<Raw>::required_bytes(total_pages) + Strategy::required_bytes(kind, total_pages)
    }

    /// Returns the number of leading pages a pool spanning `total_pages`
    /// pages reserves for metadata under strategy `kind`.
    pub fn metadata_pages(total_pages: usize, kind: StrategyKind) -> usize {
        pages_for(Self::metadata_bytes(total_pages, kind))
    }

    /// Constructs a pool over the `total_pages` pages starting at `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `region` is not page-aligned, or the region's end overflows the
    ///   address space (`InvalidConfig`).
    /// - The region cannot hold the pool's metadata (`MetadataTooLarge`).
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `total_pages *
    /// PAGE_SIZE` bytes for as long as the pool exists, and no other
    /// reference to that memory may be used in that time except through
    /// pages allocated from the pool.
    pub unsafe fn new(
        name: &'static str,
        region: NonNull<u8>,
        total_pages: usize,
        kind: StrategyKind,
    ) -> Result<AllocationPool, AllocInitError> {
        if page_offset(region.addr().get()) != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let extent = total_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(AllocInitError::InvalidConfig)?;
        region
            .addr()
            .get()
            .checked_add(extent)
            .ok_or(AllocInitError::InvalidConfig)?;

        let metadata_pages = Self::metadata_pages(total_pages, kind);
        if metadata_pages > total_pages {
            return Err(AllocInitError::MetadataTooLarge);
        }

        let num_pages = total_pages - metadata_pages;
        let region = BasePtr::new(region, extent);

        let map_bytes = BitVector::<Raw>::required_bytes(num_pages);
        let strategy_bytes = Strategy::required_bytes(kind, num_pages);

        // The metadata was sized for the whole region, so both pieces fit.
        let used_map = unsafe { BitVector::new_in_buffer(num_pages, region.ptr(), map_bytes) };
        let strategy_buf = region.with_offset(map_bytes).ok_or(AllocInitError::InvalidConfig)?;
        let strategy = unsafe { Strategy::new_in_buffer(kind, num_pages, strategy_buf, strategy_bytes) };

        let base = region
            .with_offset(metadata_pages * PAGE_SIZE)
            .map(|ptr| BasePtr::new(ptr, num_pages * PAGE_SIZE))
            .ok_or(AllocInitError::InvalidConfig)?;

        info!("{num_pages} pages available in {name} pool");

        Ok(AllocationPool {
            name,
            base,
            num_pages,
            metadata_pages,
            state: Mutex::new(PoolState { used_map, strategy }),
        })
    }

    /// Returns the name of the pool.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the number of allocatable pages in the pool.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.num_pages
    }

    /// Returns the number of pages reserved for the pool's metadata.
    #[inline]
    pub fn reserved_pages(&self) -> usize {
        self.metadata_pages
    }

    /// Returns the kind of placement strategy the pool uses.
    pub fn strategy(&self) -> StrategyKind {
        self.state.lock().strategy.kind()
    }

    /// Returns a pointer to the first allocatable page.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Returns `true` if `ptr` points into the pool's allocatable pages.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }

    /// Returns the number of free pages in the pool.
    pub fn free_pages(&self) -> usize {
        self.state.lock().used_map.count_matching(0, self.num_pages, false)
    }

    /// Returns `true` if an allocation of `count` pages would currently
    /// succeed.
    pub fn can_allocate(&self, count: usize) -> bool {
        if count == 0 || count > self.num_pages {
            return false;
        }

        let state = self.state.lock();
        state.strategy.can_place(&state.used_map, count)
    }

    /// Allocates `count` contiguous pages, returning a pointer to the first.
    ///
    /// Returns `None` if `count` is zero or no suitable run of free pages
    /// exists.
    ///
    /// # Panics
    ///
    /// Under the buddy strategy, panics if the order table has no block left
    /// to split.
    pub fn allocate(&self, count: usize) -> Option<NonNull<u8>> {
        if count == 0 {
            return None;
        }

        if count > self.num_pages {
            warn!("{}: request for {count} pages exceeds pool size", self.name);
            return None;
        }

        let mut state = self.state.lock();
        let PoolState { used_map, strategy } = &mut *state;

        let Some(range) = strategy.locate(used_map, count) else {
            drop(state);
            warn!("{}: no run of {count} free pages", self.name);
            return None;
        };

        used_map.set_range(range.start, range.len(), true);
        drop(state);

        debug!("{}: allocated pages {}..{}", self.name, range.start, range.end);

        Some(self.base.page_at(range.start))
    }

    /// Frees the `count` pages starting at `pages`.
    ///
    /// In debug builds every released page is filled with `0xcc`, including
    /// the padding of a buddy block.
    ///
    /// # Panics
    ///
    /// Panics if `pages` is not the page-aligned address of a page in this
    /// pool, if the range extends past the end of the pool, or if any page in
    /// the range is not allocated.
    ///
    /// # Safety
    ///
    /// `pages` must have been returned by [`allocate`](Self::allocate) on this
    /// pool, and no reference to the pages may be used after this call.
    pub unsafe fn free(&self, pages: NonNull<u8>, count: usize) {
        if count == 0 {
            return;
        }

        let index = self.base.page_index_of(pages.addr());
        assert!(
            count <= self.num_pages - index,
            "{}: pages {index}+{count} extend past the end of the pool",
            self.name
        );

        let mut state = self.state.lock();
        let PoolState { used_map, strategy } = &mut *state;

        assert!(
            used_map.all(index, count),
            "{}: pages {index}..{} are not all allocated",
            self.name,
            index + count
        );

        let released = strategy.release(used_map, index, count);

        // Still locked, so nobody can have reallocated the released pages.
        #[cfg(debug_assertions)]
        unsafe {
            core::ptr::write_bytes(pages.as_ptr(), 0xcc, released.len() * PAGE_SIZE);
        }

        drop(state);

        debug!("{}: freed pages {}..{}", self.name, released.start, released.end);
    }

    /// Writes a binary dump of the pool's occupancy map to `out`.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let state = self.state.lock();
        write!(out, "{}", state.used_map.binary_dump())
    }

    /// Returns the number of pages in free buddy blocks, if the pool uses the
    /// buddy strategy.
    #[cfg(test)]
    fn buddy_free_pages(&self) -> Option<usize> {
        let state = self.state.lock();
        state.strategy.order_table().map(|table| table.free_page_count())
    }
}

impl fmt::Debug for AllocationPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("AllocationPool")
            .field("name", &self.name)
            .field("num_pages", &self.num_pages)
            .field("metadata_pages", &self.metadata_pages)
            .field("used_map", &state.used_map)
            .field("strategy", &state.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::alloc::Layout;
    use std::prelude::rust_2021::*;

    use super::*;

    /// Page-aligned heap memory for a pool.
    struct Region {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Region {
        fn new(pages: usize) -> Region {
            let layout = Layout::from_size_align(pages.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap();
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
            Region { ptr, layout }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    /// Builds a pool with exactly `usable` allocatable pages, assuming its
    /// metadata fits in one page.
    fn pool(region: &Region, usable: usize, kind: StrategyKind) -> AllocationPool {
        let pool = unsafe { AllocationPool::new("test", region.ptr, usable + 1, kind).unwrap() };
        assert_eq!(pool.page_count(), usable);
        assert_eq!(pool.reserved_pages(), 1);
        pool
    }

    fn index_of(pool: &AllocationPool, ptr: NonNull<u8>) -> usize {
        (ptr.addr().get() - pool.base().addr().get()) / PAGE_SIZE
    }

    #[test]
    fn metadata_is_reserved_up_front() {
        assert_eq!(AllocationPool::metadata_pages(0, StrategyKind::FirstFit), 0);
        assert_eq!(AllocationPool::metadata_pages(1, StrategyKind::FirstFit), 1);
        assert_eq!(AllocationPool::metadata_pages(PAGE_SIZE * 8, StrategyKind::FirstFit), 1);
        assert_eq!(AllocationPool::metadata_pages(PAGE_SIZE * 8 + 1, StrategyKind::FirstFit), 2);
        assert!(
            AllocationPool::metadata_bytes(1000, StrategyKind::Buddy)
                > AllocationPool::metadata_bytes(1000, StrategyKind::BestFit)
        );

        let region = Region::new(10);
        let pool = unsafe { AllocationPool::new("test", region.ptr, 10, StrategyKind::Buddy).unwrap() };
        assert_eq!(pool.page_count(), 9);
        assert_eq!(pool.base().addr().get(), region.ptr.addr().get() + PAGE_SIZE);
        assert_eq!(pool.free_pages(), 9);
        assert_eq!(pool.buddy_free_pages(), Some(9));
    }

    #[test]
    fn misaligned_region_is_rejected() {
        let region = Region::new(4);
        let inside = NonNull::new(unsafe { region.ptr.as_ptr().add(8) }).unwrap();

        let err = unsafe { AllocationPool::new("test", inside, 2, StrategyKind::FirstFit) };
        assert_eq!(err.unwrap_err(), AllocInitError::InvalidConfig);
    }

    #[test]
    fn empty_pools() {
        let region = Region::new(1);

        for total in [0, 1] {
            let pool =
                unsafe { AllocationPool::new("empty", region.ptr, total, StrategyKind::Buddy).unwrap() };
            assert_eq!(pool.page_count(), 0);
            assert_eq!(pool.allocate(1), None);
            assert!(!pool.can_allocate(1));
            assert_eq!(pool.free_pages(), 0);
        }
    }

    #[test]
    fn zero_page_requests() {
        let region = Region::new(5);
        let pool = pool(&region, 4, StrategyKind::FirstFit);

        assert_eq!(pool.allocate(0), None);
        unsafe { pool.free(pool.base(), 0) };
        assert_eq!(pool.free_pages(), 4);
    }

    #[test]
    fn buddy_reuses_coalesced_space() {
        let region = Region::new(513);
        let pool = pool(&region, 512, StrategyKind::Buddy);

        let pages: Vec<NonNull<u8>> = (0..7).map(|_| pool.allocate(1).unwrap()).collect();
        let indices: Vec<usize> = pages.iter().map(|&p| index_of(&pool, p)).collect();
        assert_eq!(indices, [0, 1, 2, 3, 4, 5, 6]);

        for i in [1, 2, 4, 5] {
            unsafe { pool.free(pages[i], 1) };
        }
        assert_eq!(pool.free_pages(), 512 - 3);
        assert_eq!(pool.buddy_free_pages(), Some(512 - 3));

        let again = pool.allocate(1).unwrap();
        assert_eq!(index_of(&pool, again), 1);

        // 4 and 5 merged into one block of two.
        let pair = pool.allocate(2).unwrap();
        assert_eq!(index_of(&pool, pair), 4);
    }

    #[test]
    fn buddy_marks_whole_blocks() {
        let region = Region::new(17);
        let pool = pool(&region, 16, StrategyKind::Buddy);

        let a = pool.allocate(3).unwrap();
        assert_eq!(pool.free_pages(), 12);

        let b = pool.allocate(1).unwrap();
        assert_eq!(index_of(&pool, b), 4);

        unsafe { pool.free(a, 3) };
        unsafe { pool.free(b, 1) };
        assert_eq!(pool.free_pages(), 16);
        assert_eq!(pool.buddy_free_pages(), Some(16));

        assert_eq!(pool.allocate(32), None);
        assert!(pool.allocate(16).is_some());
        assert!(!pool.can_allocate(1));
    }

    #[test]
    fn best_fit_fails_cleanly_when_full() {
        let region = Region::new(41);
        let pool = pool(&region, 40, StrategyKind::BestFit);

        let results: Vec<Option<usize>> = [10, 10, 10, 14, 6, 10]
            .into_iter()
            .map(|count| pool.allocate(count).map(|p| index_of(&pool, p)))
            .collect();

        assert_eq!(results, [Some(0), Some(10), Some(20), None, Some(30), None]);
        assert_eq!(pool.free_pages(), 4);
    }

    #[test]
    fn next_fit_returns_to_freed_run() {
        let region = Region::new(31);
        let pool = pool(&region, 30, StrategyKind::NextFit);

        let blocks: Vec<NonNull<u8>> = (0..5).map(|_| pool.allocate(6).unwrap()).collect();
        let indices: Vec<usize> = blocks.iter().map(|&p| index_of(&pool, p)).collect();
        assert_eq!(indices, [0, 6, 12, 18, 24]);
        assert_eq!(pool.allocate(6), None);

        unsafe { pool.free(blocks[1], 6) };
        let again = pool.allocate(6).unwrap();
        assert_eq!(index_of(&pool, again), 6);
    }

    #[test]
    fn first_fit_fills_lowest_hole() {
        let region = Region::new(9);
        let pool = pool(&region, 8, StrategyKind::FirstFit);

        let a = pool.allocate(2).unwrap();
        let b = pool.allocate(2).unwrap();
        let _c = pool.allocate(2).unwrap();

        unsafe { pool.free(b, 2) };
        unsafe { pool.free(a, 2) };

        let d = pool.allocate(3).unwrap();
        assert_eq!(index_of(&pool, d), 0);
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let region = Region::new(9);
        let pool = pool(&region, 8, StrategyKind::FirstFit);

        let a = pool.allocate(2).unwrap();
        unsafe {
            pool.free(a, 2);
            pool.free(a, 2);
        }
    }

    #[test]
    #[should_panic]
    fn foreign_pointer_panics() {
        let region = Region::new(9);
        let pool = pool(&region, 8, StrategyKind::FirstFit);

        // The metadata page is not part of the allocatable range.
        unsafe { pool.free(region.ptr, 1) };
    }

    #[test]
    #[should_panic]
    fn overlong_free_panics() {
        let region = Region::new(9);
        let pool = pool(&region, 8, StrategyKind::FirstFit);

        let a = pool.allocate(8).unwrap();
        unsafe { pool.free(a, 9) };
    }

    #[cfg(debug_assertions)]
    #[test]
    fn freed_pages_are_poisoned() {
        let region = Region::new(3);
        let pool = pool(&region, 2, StrategyKind::FirstFit);

        let page = pool.allocate(1).unwrap();
        unsafe {
            page.as_ptr().write_bytes(0, PAGE_SIZE);
            pool.free(page, 1);
            assert_eq!(*page.as_ptr(), 0xcc);
            assert_eq!(*page.as_ptr().add(PAGE_SIZE - 1), 0xcc);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn buddy_padding_is_poisoned() {
        let region = Region::new(9);
        let pool = pool(&region, 8, StrategyKind::Buddy);

        let page = pool.allocate(3).unwrap();
        unsafe {
            // The page after the block stays untouched.
            page.as_ptr().write_bytes(0, 5 * PAGE_SIZE);
            pool.free(page, 3);

            let block = core::slice::from_raw_parts(page.as_ptr(), 4 * PAGE_SIZE);
            assert!(block.iter().all(|&b| b == 0xcc));
            assert_eq!(*page.as_ptr().add(4 * PAGE_SIZE), 0);
        }
    }

    #[test]
    fn dump_shows_occupancy() {
        let region = Region::new(5);
        let pool = pool(&region, 4, StrategyKind::FirstFit);
        pool.allocate(2).unwrap();

        let mut out = String::new();
        pool.dump(&mut out).unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "1100");
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        let region = Region::new(65);
        let pool = pool(&region, 64, StrategyKind::FirstFit);

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let pool = &pool;
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        let count = 1 + (t + round) % 3;
                        let Some(pages) = pool.allocate(count) else {
                            continue;
                        };

                        let tag = t as u8 + 1;
                        unsafe {
                            pages.as_ptr().write_bytes(tag, count * PAGE_SIZE);
                            std::thread::yield_now();

                            let bytes = core::slice::from_raw_parts(pages.as_ptr(), count * PAGE_SIZE);
                            assert!(bytes.iter().all(|&b| b == tag));

                            pool.free(pages, count);
                        }
                    }
                });
            }
        });

        assert_eq!(pool.free_pages(), 64);
    }
}
