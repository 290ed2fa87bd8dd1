//! Polyfills for strict-provenance pointer methods.
//!
//! The implementations in this module follow the standard library source.

// #![feature(strict_provenance)]

use core::{num::NonZeroUsize, ptr::NonNull};

pub use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `ptr::with_addr` is non-null because `addr` is
        // guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_addr_round_trips() {
        let mut value = 0u64;
        let ptr = NonNull::from(&mut value);

        let addr = NonNullStrict::addr(ptr);
        let same = NonNullStrict::with_addr(ptr, addr);

        assert_eq!(same, ptr);
        assert_eq!(unsafe { same.as_ptr().read() }, 0);
    }
}
