//! Placement strategies.
//!
//! A strategy decides where in a pool's bit vector a run of pages should go.
//! The three scanning strategies are stateless apart from the next-fit cursor,
//! which lives in the bit vector itself. The buddy strategy carries a
//! [`BuddyOrderTable`] and always places whole power-of-two blocks.

use core::{fmt, ops::Range, ptr::NonNull, str::FromStr};

use crate::{
    bitvec::BitVector,
    buddy::{self, BuddyOrderTable},
    BackingAllocator,
};

/// Selects one of the four placement strategies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Place each run at the lowest index where it fits.
    #[default]
    FirstFit,
    /// Resume scanning where the previous allocation ended, wrapping to the
    /// start of the pool once.
    NextFit,
    /// Place each run in the smallest free extent that can hold it.
    BestFit,
    /// Place each run in a power-of-two block of a buddy system.
    Buddy,
}

impl StrategyKind {
    /// Every strategy, in selector order.
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::FirstFit,
        StrategyKind::NextFit,
        StrategyKind::BestFit,
        StrategyKind::Buddy,
    ];

    /// Returns the short name of the strategy.
    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::FirstFit => "first-fit",
            StrategyKind::NextFit => "next-fit",
            StrategyKind::BestFit => "best-fit",
            StrategyKind::Buddy => "buddy",
        }
    }

    /// Parses a strategy from a boot command line value.
    ///
    /// This accepts everything [`FromStr`] does, except that a numeric
    /// selector outside `0..=3` selects first fit instead of failing.
    pub fn from_cmdline(value: &str) -> Result<StrategyKind, ParseStrategyError> {
        match value.parse::<u8>() {
            Ok(selector) => Ok(StrategyKind::try_from(selector).unwrap_or_default()),
            Err(_) => value.parse(),
        }
    }
}

impl TryFrom<u8> for StrategyKind {
    type Error = ParseStrategyError;

    fn try_from(selector: u8) -> Result<Self, Self::Error> {
        match selector {
            0 => Ok(StrategyKind::FirstFit),
            1 => Ok(StrategyKind::NextFit),
            2 => Ok(StrategyKind::BestFit),
            3 => Ok(StrategyKind::Buddy),
            _ => Err(ParseStrategyError),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "ff" | "first-fit" => Ok(StrategyKind::FirstFit),
            "1" | "nf" | "next-fit" => Ok(StrategyKind::NextFit),
            "2" | "bf" | "best-fit" => Ok(StrategyKind::BestFit),
            "3" | "buddy" => Ok(StrategyKind::Buddy),
            _ => Err(ParseStrategyError),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The error returned when a strategy name or selector is not recognized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParseStrategyError;

impl fmt::Display for ParseStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unrecognized allocation strategy")
    }
}

/// Returns the lowest index at which `count` free bits start.
pub fn first_fit<A: BackingAllocator>(map: &BitVector<A>, count: usize) -> Option<usize> {
    map.scan(0, count, false)
}

/// Returns the first index at or after the cursor at which `count` free bits
/// start, retrying once from the start of the vector.
///
/// On success the cursor is moved to the end of the returned run.
pub fn next_fit<A: BackingAllocator>(map: &mut BitVector<A>, count: usize) -> Option<usize> {
    let index = map
        .scan(map.cursor(), count, false)
        .or_else(|| map.scan(0, count, false))?;

    map.set_cursor(index + count);

    Some(index)
}

/// Returns the start of the smallest free extent at or after `start` that
/// holds `count` bits.
///
/// Extents are measured in full, so a run of exactly `count` free bits is
/// preferred over any longer one. Ties go to the lowest index.
pub fn best_fit<A: BackingAllocator>(
    map: &BitVector<A>,
    start: usize,
    count: usize,
) -> Option<usize> {
    if count == 0 {
        return map.scan(start, 0, false);
    }

    let mut best: Option<(usize, usize)> = None;
    let mut from = start;

    while let Some(run) = map.scan(from, count, false) {
        let len = map.run_length(run, false);

        if best.map_or(true, |(_, best_len)| len < best_len) {
            best = Some((run, len));

            if len == count {
                break;
            }
        }

        from = run + len;
    }

    best.map(|(index, _)| index)
}

/// A placement strategy together with any state it needs.
pub enum Strategy {
    /// See [`first_fit`].
    FirstFit,
    /// See [`next_fit`].
    NextFit,
    /// See [`best_fit`].
    BestFit,
    /// Buddy placement over an order table.
    Buddy(BuddyOrderTable),
}

impl Strategy {
    /// Returns the number of bytes of metadata `kind` needs for a pool of
    /// `num_pages` pages, beyond the pool's own bit vector.
    pub fn required_bytes(kind: StrategyKind, num_pages: usize) -> usize {
        match kind {
            StrategyKind::Buddy => BuddyOrderTable::required_bytes(num_pages),
            _ => 0,
        }
    }

    /// Constructs a strategy of kind `kind` for a pool of `num_pages` pages,
    /// placing any metadata in caller-owned storage.
    ///
    /// # Safety
    ///
    /// If `kind` is [`StrategyKind::Buddy`], the caller must uphold the
    /// invariants of [`BuddyOrderTable::new_in_buffer`]. Otherwise `buf` is
    /// not used.
    pub unsafe fn new_in_buffer(
        kind: StrategyKind,
        num_pages: usize,
        buf: NonNull<u8>,
        buf_size: usize,
    ) -> Strategy {
        match kind {
            StrategyKind::FirstFit => Strategy::FirstFit,
            StrategyKind::NextFit => Strategy::NextFit,
            StrategyKind::BestFit => Strategy::BestFit,
            StrategyKind::Buddy => {
                Strategy::Buddy(unsafe { BuddyOrderTable::new_in_buffer(num_pages, buf, buf_size) })
            }
        }
    }

    /// Returns the kind of this strategy.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::FirstFit => StrategyKind::FirstFit,
            Strategy::NextFit => StrategyKind::NextFit,
            Strategy::BestFit => StrategyKind::BestFit,
            Strategy::Buddy(_) => StrategyKind::Buddy,
        }
    }

    /// Returns the order table if this is the buddy strategy.
    pub fn order_table(&self) -> Option<&BuddyOrderTable> {
        match self {
            Strategy::Buddy(table) => Some(table),
            _ => None,
        }
    }

    /// Finds room for `count` pages in `map`.
    ///
    /// Returns the range of pages to mark used, which under the buddy
    /// strategy is the whole block and may be longer than `count`. Nothing in
    /// `map` is marked; that is left to the caller.
    ///
    /// # Panics
    ///
    /// Under the buddy strategy, panics if the table has no block large
    /// enough to split.
    pub fn locate<A: BackingAllocator>(
        &mut self,
        map: &mut BitVector<A>,
        count: usize,
    ) -> Option<Range<usize>> {
        let index = match self {
            Strategy::FirstFit => first_fit(map, count)?,
            Strategy::NextFit => next_fit(map, count)?,
            Strategy::BestFit => best_fit(map, 0, count)?,
            Strategy::Buddy(table) => {
                let order = buddy::order_for(count);
                if order >= table.max_order() {
                    return None;
                }

                let page = table
                    .allocate_order(order)
                    .unwrap_or_else(|| panic!("buddy allocator exhausted at top order"));

                let block = buddy::block_pages(order);
                debug_assert!(map.none(page, block), "free buddy block {page} is marked used");

                return Some(page..page + block);
            }
        };

        Some(index..index + count)
    }

    /// Clears the `count` pages starting at `index` in `map` and returns them
    /// to the strategy, returning the range of pages actually released. Under
    /// the buddy strategy this is the whole block holding the request.
    ///
    /// # Panics
    ///
    /// Panics if any of the pages is not marked used. Under the buddy
    /// strategy, also panics if `index` does not start a block of the order
    /// `count` rounds up to, or any page of that block is not marked used.
    pub fn release<A: BackingAllocator>(
        &mut self,
        map: &mut BitVector<A>,
        index: usize,
        count: usize,
    ) -> Range<usize> {
        assert!(
            map.all(index, count),
            "pages {index}..{} are not all allocated",
            index + count
        );

        match self {
            Strategy::Buddy(table) => {
                let order = buddy::order_for(count);
                assert!(order < table.max_order(), "no buddy block holds {count} pages");

                let block = buddy::block_pages(order);
                assert_eq!(index % block, 0, "page {index} does not start a block of order {order}");
                assert!(
                    map.all(index, block),
                    "block {index}..{} is not all allocated",
                    index + block
                );

                map.set_range(index, block, false);
                table.free_order(index, order);

                index..index + block
            }

            _ => {
                map.set_range(index, count, false);
                index..index + count
            }
        }
    }

    /// Returns `true` if a request for `count` pages would currently succeed.
    pub fn can_place<A: BackingAllocator>(&self, map: &BitVector<A>, count: usize) -> bool {
        match self {
            Strategy::Buddy(table) => {
                let order = buddy::order_for(count);
                order < table.max_order() && table.can_allocate(order)
            }
            _ => map.scan(0, count, false).is_some(),
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::FirstFit => f.write_str("FirstFit"),
            Strategy::NextFit => f.write_str("NextFit"),
            Strategy::BestFit => f.write_str("BestFit"),
            Strategy::Buddy(table) => f.debug_tuple("Buddy").field(table).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::{Global, Raw};

    /// Builds a strategy whose metadata lives in `storage`.
    fn strategy_in(kind: StrategyKind, num_pages: usize, storage: &mut Vec<usize>) -> Strategy {
        let size = Strategy::required_bytes(kind, num_pages);
        storage.resize(size.div_ceil(core::mem::size_of::<usize>()).max(1), 0);
        let buf = NonNull::new(storage.as_mut_ptr()).unwrap().cast();

        unsafe { Strategy::new_in_buffer(kind, num_pages, buf, size) }
    }

    fn map_with(num_bits: usize, used: &[Range<usize>]) -> BitVector<Global> {
        let map = BitVector::try_new(num_bits).unwrap();
        for r in used {
            map.set_range(r.start, r.len(), true);
        }
        map
    }

    #[test]
    fn parse_kinds() {
        assert_eq!("ff".parse(), Ok(StrategyKind::FirstFit));
        assert_eq!("next-fit".parse(), Ok(StrategyKind::NextFit));
        assert_eq!("2".parse(), Ok(StrategyKind::BestFit));
        assert_eq!("buddy".parse(), Ok(StrategyKind::Buddy));
        assert_eq!("4".parse::<StrategyKind>(), Err(ParseStrategyError));
        assert_eq!("worst-fit".parse::<StrategyKind>(), Err(ParseStrategyError));

        assert_eq!(StrategyKind::try_from(3), Ok(StrategyKind::Buddy));
        assert_eq!(StrategyKind::try_from(9), Err(ParseStrategyError));

        assert_eq!(StrategyKind::from_cmdline("1"), Ok(StrategyKind::NextFit));
        assert_eq!(StrategyKind::from_cmdline("7"), Ok(StrategyKind::FirstFit));
        assert_eq!(StrategyKind::from_cmdline("bf"), Ok(StrategyKind::BestFit));
        assert!(StrategyKind::from_cmdline("fast").is_err());

        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
    }

    #[test]
    fn first_fit_takes_lowest_run() {
        let map = map_with(32, &[0..4, 6..10]);

        assert_eq!(first_fit(&map, 2), Some(4));
        assert_eq!(first_fit(&map, 3), Some(10));
        assert_eq!(first_fit(&map, 23), None);
    }

    #[test]
    fn next_fit_resumes_at_cursor() {
        let mut map = map_with(30, &[]);

        for expected in [0, 6, 12, 18, 24] {
            let index = next_fit(&mut map, 6).unwrap();
            assert_eq!(index, expected);
            map.set_range(index, 6, true);
        }
        assert_eq!(map.cursor(), 30);

        // Full pool: no degenerate index comes back, and the cursor stays.
        assert_eq!(next_fit(&mut map, 6), None);
        assert_eq!(map.cursor(), 30);

        map.set_range(6, 6, false);
        assert_eq!(next_fit(&mut map, 6), Some(6));
        assert_eq!(map.cursor(), 12);
    }

    #[test]
    fn next_fit_prefers_space_past_cursor() {
        let mut map = map_with(16, &[4..8]);
        map.set_cursor(8);

        assert_eq!(next_fit(&mut map, 2), Some(8));
        assert_eq!(map.cursor(), 10);

        map.set_range(8, 8, true);
        assert_eq!(next_fit(&mut map, 4), Some(0));
        assert_eq!(map.cursor(), 4);
    }

    #[test]
    fn best_fit_takes_smallest_extent() {
        // Free extents: 4..10 (6), 12..15 (3), 20..32 (12).
        let map = map_with(32, &[0..4, 10..12, 15..20]);

        assert_eq!(best_fit(&map, 0, 3), Some(12));
        assert_eq!(best_fit(&map, 0, 4), Some(4));
        assert_eq!(best_fit(&map, 0, 7), Some(20));
        assert_eq!(best_fit(&map, 0, 13), None);
        assert_eq!(best_fit(&map, 13, 2), Some(13));
        assert_eq!(best_fit(&map, 16, 3), Some(20));
    }

    #[test]
    fn best_fit_ties_go_lowest() {
        let map = map_with(20, &[3..5, 8..10, 13..20]);

        assert_eq!(best_fit(&map, 0, 2), Some(0));
        assert_eq!(best_fit(&map, 4, 2), Some(5));
    }

    #[test]
    fn scanning_strategies_locate_exact_ranges() {
        for kind in [StrategyKind::FirstFit, StrategyKind::NextFit, StrategyKind::BestFit] {
            let mut storage = Vec::new();
            let mut strategy = strategy_in(kind, 16, &mut storage);
            let mut map = map_with(16, &[]);

            assert_eq!(strategy.kind(), kind);
            assert!(strategy.order_table().is_none());

            let range = strategy.locate(&mut map, 5).unwrap();
            assert_eq!(range, 0..5);
            map.set_range(range.start, range.len(), true);

            assert!(strategy.can_place(&map, 11));
            assert!(!strategy.can_place(&map, 12));
            assert_eq!(strategy.locate(&mut map, 12), None);

            assert_eq!(strategy.release(&mut map, 0, 5), 0..5);
            assert!(map.none(0, 16));
        }
    }

    #[test]
    fn buddy_locates_whole_blocks() {
        let mut storage = Vec::new();
        let mut strategy = strategy_in(StrategyKind::Buddy, 16, &mut storage);
        let mut map = map_with(16, &[]);

        let range = strategy.locate(&mut map, 3).unwrap();
        assert_eq!(range, 0..4);
        map.set_range(range.start, range.len(), true);

        let range = strategy.locate(&mut map, 1).unwrap();
        assert_eq!(range, 4..5);
        map.set_range(range.start, range.len(), true);

        assert_eq!(strategy.locate(&mut map, 17), None);
        assert!(strategy.can_place(&map, 8));
        assert!(!strategy.can_place(&map, 9));

        assert_eq!(strategy.release(&mut map, 4, 1), 4..5);
        assert_eq!(strategy.release(&mut map, 0, 3), 0..4);
        assert!(map.none(0, 16));

        let table = strategy.order_table().unwrap();
        assert_eq!(table.free_blocks(4).collect::<Vec<_>>(), [0]);
    }

    #[test]
    #[should_panic]
    fn buddy_exhaustion_is_fatal() {
        let mut storage = Vec::new();
        let mut strategy = strategy_in(StrategyKind::Buddy, 4, &mut storage);
        let mut map = map_with(4, &[]);

        strategy.locate(&mut map, 4).unwrap();
        strategy.locate(&mut map, 1);
    }

    #[test]
    #[should_panic]
    fn release_of_free_pages_panics() {
        let mut storage = Vec::new();
        let mut strategy = strategy_in(StrategyKind::FirstFit, 8, &mut storage);
        let mut map = map_with(8, &[0..2]);

        strategy.release(&mut map, 1, 2);
    }

    #[test]
    fn works_over_raw_vectors() {
        let mut words = [0usize; 1];
        let buf = NonNull::from(&mut words).cast();
        let mut map: BitVector<Raw> =
            unsafe { BitVector::new_in_buffer(8, buf, core::mem::size_of_val(&words)) };

        let mut strategy = Strategy::FirstFit;
        assert_eq!(strategy.locate(&mut map, 8), Some(0..8));
    }
}
