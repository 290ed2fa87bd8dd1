//! A bitmap-backed physical page allocator.
//!
//! Memory is handed out in [`PAGE_SIZE`]-byte pages from two pools, one for
//! the kernel and one for user pages. Each pool tracks occupancy with a
//! [`BitVector`] holding one bit per page, and places requests according to a
//! [`StrategyKind`] chosen when the pool is created:
//!
//! - first fit: the lowest-addressed run of free pages,
//! - next fit: the first run at or after the end of the previous allocation,
//! - best fit: the smallest free extent that can hold the request,
//! - buddy: power-of-two blocks split and coalesced through a
//!   [`BuddyOrderTable`].
//!
//! ```
//! # #[cfg(feature = "alloc")]
//! # fn main() {
//! use palloc::{Config, PageAllocator, PallocFlags, StrategyKind};
//!
//! let palloc = PageAllocator::try_new(64, Config::new(StrategyKind::Buddy)).unwrap();
//!
//! let page = palloc.allocate_page(PallocFlags::ZERO).unwrap();
//! unsafe { palloc.free_page(page) };
//! # }
//! # #[cfg(not(feature = "alloc"))]
//! # fn main() {}
//! ```

#![doc(html_root_url = "https://docs.rs/palloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(
    all(feature = "unstable", not(feature = "sptr")),
    feature(strict_provenance)
)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

macro_rules! requires_sptr_or_unstable {
    ($($it:item)*) => {
        $(
            #[cfg(any(feature = "sptr", feature = "unstable"))]
            $it
        )*
    };
}

#[cfg(not(any(feature = "sptr", feature = "unstable")))]
compile_error!("At least one of these crate features must be enabled: [\"sptr\", \"unstable\"].");

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

requires_sptr_or_unstable! {
    mod base;
    pub mod bitvec;
    pub mod buddy;
    pub mod config;
    mod page_allocator;
    pub mod placement;
    pub mod pool;

    #[cfg(feature = "sptr")]
    mod polyfill;


    use core::{alloc::Layout, fmt, ptr::NonNull};

    pub use crate::{
        bitvec::BitVector,
        buddy::BuddyOrderTable,
        config::{Config, DEFAULT_KERNEL_RESERVE},
        page_allocator::{PageAllocator, PallocFlags},
        placement::{Strategy, StrategyKind},
        pool::AllocationPool,
    };

    /// The size of a page in bytes.
    pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

    /// The base-2 logarithm of [`PAGE_SIZE`].
    pub const PAGE_SHIFT: u32 = 12;

    /// Returns the offset of `addr` within its page.
    #[inline]
    pub const fn page_offset(addr: usize) -> usize {
        addr & (PAGE_SIZE - 1)
    }

    /// Returns the number of the page containing `addr`.
    #[inline]
    pub const fn page_number(addr: usize) -> usize {
        addr >> PAGE_SHIFT
    }

    /// Returns the number of pages needed to hold `bytes` bytes.
    #[inline]
    pub const fn pages_for(bytes: usize) -> usize {
        bytes.div_ceil(PAGE_SIZE)
    }

    /// The error type for allocator constructors.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum AllocInitError {
        /// A necessary allocation failed.
        ///
        /// This variant is returned when a constructor attempts to allocate
        /// memory, either for metadata or the managed region, but the
        /// underlying allocator fails.
        ///
        /// The variant contains the [`Layout`] that could not be allocated.
        AllocFailed(Layout),

        /// The configuration of the allocator is invalid.
        ///
        /// This variant is returned when an allocator's configuration
        /// parameters are impossible to satisfy, such as a region that is
        /// not page-aligned or whose size overflows a `usize`.
        InvalidConfig,

        /// A pool is too small to hold its own occupancy metadata.
        MetadataTooLarge,
    }

    impl fmt::Display for AllocInitError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                AllocInitError::AllocFailed(layout) => write!(
                    f,
                    "failed to allocate {} bytes aligned to {}",
                    layout.size(),
                    layout.align()
                ),
                AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
                AllocInitError::MetadataTooLarge => {
                    f.write_str("not enough memory in pool for its bitmap")
                }
            }
        }
    }

    /// Indicates an allocation failure due to resource exhaustion or an
    /// unsupported set of arguments.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct AllocError;

    impl fmt::Display for AllocError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("out of pages")
        }
    }

    /// Types which provide memory which backs an allocator.
    ///
    /// This is implemented by the following types:
    /// - The `Raw` marker type indicates that a structure is not backed by
    ///   another allocator. This is the case when constructing it from raw
    ///   pointers, such as the memory range discovered at boot.
    /// - The `Global` marker type indicates that a structure is backed by the
    ///   global allocator. The structure will free its memory on drop.
    pub trait BackingAllocator: Sealed {
        /// Deallocates the memory referenced by `ptr`.
        ///
        /// # Safety
        ///
        /// * `ptr` must denote a block of memory currently allocated via this
        ///   allocator, and
        /// * `layout` must fit that block of memory.
        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
    }

    /// A marker type indicating that a structure is backed by raw pointers.
    #[derive(Clone, Debug)]
    pub struct Raw;
    impl Sealed for Raw {}
    impl BackingAllocator for Raw {
        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
    }

    #[cfg(any(feature = "alloc", test))]
    /// The global memory allocator.
    #[derive(Clone, Debug)]
    pub struct Global;

    #[cfg(any(feature = "alloc", test))]
    impl Sealed for Global {}

    #[cfg(any(feature = "alloc", test))]
    impl BackingAllocator for Global {
        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[cfg(any(feature = "alloc", test))]
    impl Global {
        /// Allocates zeroed memory for `layout`, which must have a nonzero size.
        fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, AllocInitError> {
            debug_assert!(layout.size() > 0);

            let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
            NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))
        }
    }

    #[doc(hidden)]
    mod private {
        pub trait Sealed {}
    }
    use private::Sealed;
}
