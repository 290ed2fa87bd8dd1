use core::{alloc::Layout, fmt, ptr::NonNull};

use bitflags::bitflags;
use log::info;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    config::Config, placement::StrategyKind, pool::AllocationPool, AllocInitError,
    BackingAllocator, Raw, PAGE_SIZE,
};

bitflags! {
    /// Options for page allocation.
    pub struct PallocFlags: u32 {
        /// Panic if the allocation cannot be satisfied.
        const ASSERT = 0b001;
        /// Fill the allocated pages with zeroes.
        const ZERO = 0b010;
        /// Allocate from the user pool instead of the kernel pool.
        const USER = 0b100;
    }
}

struct PageAllocatorParts {
    kernel: AllocationPool,
    user: AllocationPool,
    region: NonNull<u8>,
    num_pages: usize,
}

impl PageAllocatorParts {
    /// Splits the `num_pages` pages at `region` between a kernel pool and a
    /// user pool.
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::new_raw`].
    unsafe fn new(
        region: NonNull<u8>,
        num_pages: usize,
        config: Config,
    ) -> Result<PageAllocatorParts, AllocInitError> {
        let user_pages = config.user_pages(num_pages);
        let kernel_pages = num_pages - user_pages;

        let kernel = unsafe { AllocationPool::new("kernel", region, kernel_pages, config.strategy)? };

        let user_region = kernel_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|offset| NonNull::new(region.as_ptr().wrapping_add(offset)))
            .ok_or(AllocInitError::InvalidConfig)?;
        let user = unsafe { AllocationPool::new("user", user_region, user_pages, config.strategy)? };

        info!(
            "{num_pages} pages split {kernel_pages}/{user_pages} between kernel and user, {} placement",
            config.strategy
        );

        Ok(PageAllocatorParts {
            kernel,
            user,
            region,
            num_pages,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> PageAllocator<A> {
        let PageAllocatorParts {
            kernel,
            user,
            region,
            num_pages,
        } = self;

        PageAllocator {
            kernel,
            user,
            region,
            num_pages,
            backing_allocator,
        }
    }
}

/// A page allocator with a kernel pool and a user pool.
pub struct PageAllocator<A: BackingAllocator> {
    kernel: AllocationPool,
    user: AllocationPool,
    region: NonNull<u8>,
    num_pages: usize,
    backing_allocator: A,
}

// SAFETY: All access to the pools' pages goes through their locks.
unsafe impl<A: BackingAllocator + Send> Send for PageAllocator<A> {}
unsafe impl<A: BackingAllocator + Sync> Sync for PageAllocator<A> {}

impl PageAllocator<Raw> {
    /// Constructs a new `PageAllocator` over the `num_pages` pages starting at
    /// `region`.
    ///
    /// The kernel pool keeps `config.kernel_reserve` pages, or half of the
    /// pages if there are too few, and the user pool takes the rest up to
    /// `config.user_page_limit`. Anything over the limit goes back to the
    /// kernel pool. Each pool reserves its leading pages for its own
    /// metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if `region` is not page-aligned, the region does not
    /// fit in the address space, or a pool cannot hold its metadata.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `num_pages *
    /// PAGE_SIZE` bytes for as long as the allocator exists, and no other
    /// reference to that memory may be used in that time except through
    /// pages allocated from the allocator.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        num_pages: usize,
        config: Config,
    ) -> Result<PageAllocator<Raw>, AllocInitError> {
        unsafe { PageAllocatorParts::new(region, num_pages, config).map(|p| p.with_backing_allocator(Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl PageAllocator<Global> {
    /// Attempts to construct a new `PageAllocator` over `num_pages` pages
    /// allocated from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig)` if `num_pages` is zero or
    /// too large, and `Err(AllocInitError::AllocFailed)` if the pages cannot
    /// be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(num_pages: usize, config: Config) -> Result<PageAllocator<Global>, AllocInitError> {
        let layout = Self::region_layout(num_pages)?;
        if layout.size() == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let region = Global.allocate_zeroed(layout)?;

        match unsafe { PageAllocatorParts::new(region, num_pages, config) } {
            Ok(parts) => Ok(parts.with_backing_allocator(Global)),
            Err(e) => {
                unsafe { Global.deallocate(region, layout) };
                Err(e)
            }
        }
    }
}

impl<A: BackingAllocator> PageAllocator<A> {
    fn region_layout(num_pages: usize) -> Result<Layout, AllocInitError> {
        num_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|size| Layout::from_size_align(size, PAGE_SIZE).ok())
            .ok_or(AllocInitError::InvalidConfig)
    }

    fn pool(&self, flags: PallocFlags) -> &AllocationPool {
        match flags.contains(PallocFlags::USER) {
            true => &self.user,
            false => &self.kernel,
        }
    }

    /// Returns the kernel pool.
    pub fn kernel_pool(&self) -> &AllocationPool {
        &self.kernel
    }

    /// Returns the user pool.
    pub fn user_pool(&self) -> &AllocationPool {
        &self.user
    }

    /// Returns the total number of pages under management, including pages
    /// reserved for metadata.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Returns the placement strategy shared by both pools.
    pub fn strategy(&self) -> StrategyKind {
        self.kernel.strategy()
    }

    /// Returns `true` if an allocation of `count` pages from the pool chosen
    /// by `flags` would currently succeed.
    pub fn can_allocate(&self, flags: PallocFlags, count: usize) -> bool {
        self.pool(flags).can_allocate(count)
    }

    /// Allocates a single page. See [`allocate_pages`](Self::allocate_pages).
    pub fn allocate_page(&self, flags: PallocFlags) -> Option<NonNull<u8>> {
        self.allocate_pages(flags, 1)
    }

    /// Allocates `count` contiguous pages from the pool chosen by `flags`.
    ///
    /// If `flags` contains [`PallocFlags::ZERO`], the pages are zeroed. A
    /// `count` of zero returns `None`.
    ///
    /// # Panics
    ///
    /// Panics if no suitable run is free and `flags` contains
    /// [`PallocFlags::ASSERT`].
    pub fn allocate_pages(&self, flags: PallocFlags, count: usize) -> Option<NonNull<u8>> {
        if count == 0 {
            return None;
        }

        let Some(pages) = self.pool(flags).allocate(count) else {
            if flags.contains(PallocFlags::ASSERT) {
                panic!("page allocator: out of pages");
            }

            return None;
        };

        if flags.contains(PallocFlags::ZERO) {
            // SAFETY: the pages were just handed out and are not yet shared.
            unsafe { pages.as_ptr().write_bytes(0, count * PAGE_SIZE) };
        }

        Some(pages)
    }

    /// Frees the page at `page`.
    ///
    /// # Safety
    ///
    /// See [`free_pages`](Self::free_pages).
    pub unsafe fn free_page(&self, page: NonNull<u8>) {
        unsafe { self.free_pages(page, 1) };
    }

    /// Frees the `count` pages starting at `pages`. A `count` of zero does
    /// nothing.
    ///
    /// # Panics
    ///
    /// Panics if `pages` lies in neither pool, or if the pages are not all
    /// allocated.
    ///
    /// # Safety
    ///
    /// `pages` must have been returned by this allocator for an allocation of
    /// `count` pages, and no reference to the pages may be used after this
    /// call.
    pub unsafe fn free_pages(&self, pages: NonNull<u8>, count: usize) {
        if count == 0 {
            return;
        }

        let pool = if self.kernel.contains(pages) {
            &self.kernel
        } else if self.user.contains(pages) {
            &self.user
        } else {
            panic!("freed pages belong to neither pool");
        };

        unsafe { pool.free(pages, count) };
    }

    /// Writes a binary dump of the occupancy of the pool chosen by `flags`.
    pub fn status<W: fmt::Write>(&self, flags: PallocFlags, out: &mut W) -> fmt::Result {
        self.pool(flags).dump(out)
    }
}

impl<A: BackingAllocator> Drop for PageAllocator<A> {
    fn drop(&mut self) {
        if let Ok(layout) = Self::region_layout(self.num_pages) {
            if layout.size() != 0 {
                unsafe { self.backing_allocator.deallocate(self.region, layout) };
            }
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for PageAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("num_pages", &self.num_pages)
            .field("kernel", &self.kernel)
            .field("user", &self.user)
            .finish()
    }
}
