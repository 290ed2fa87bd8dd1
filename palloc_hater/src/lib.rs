//! A small library for ~~hating on~~ evaluating the correctness of page
//! allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

use palloc::{AllocError, AllocInitError, Config, Global, PageAllocator, PallocFlags, StrategyKind, PAGE_SIZE};

/// The largest run of pages a generated operation asks for.
pub const MAX_RUN: usize = 16;

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate `count` pages, from the user pool if `user` is set.
    Alloc { count: usize, user: bool },
    /// Free an outstanding allocation, chosen modulo the number outstanding.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc {
                count: 1 + usize::arbitrary(u)? % MAX_RUN,
                user: bool::arbitrary(u)?,
            },
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates `count` contiguous pages.
    fn allocate(&mut self, flags: PallocFlags, count: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Frees the `count` pages starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a run of pages currently allocated by this
    /// allocator, and it must have been allocated with `count`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, count: usize);
}

/// A [`PageAllocator`] on the global heap under test.
pub struct PallocSubject(PageAllocator<Global>);

impl PallocSubject {
    pub fn new(strategy: StrategyKind, num_pages: usize, user_page_limit: usize) -> Result<Self, AllocInitError> {
        let config = Config::new(strategy).with_user_page_limit(user_page_limit);
        let palloc = PageAllocator::try_new(num_pages, config)?;
        Ok(PallocSubject(palloc))
    }
}

impl Subject for PallocSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, flags: PallocFlags, count: usize) -> Result<NonNull<[u8]>, AllocError> {
        // An empty buddy table is fatal rather than a failed allocation.
        if !self.0.can_allocate(flags, count) {
            return Err(AllocError);
        }

        let pages = self.0.allocate_pages(flags, count).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(pages, count * PAGE_SIZE))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, count: usize) {
        unsafe { self.0.free_pages(ptr, count) };
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated run of pages.
pub struct Block {
    // A pointer to the allocated pages.
    ptr: NonNull<[u8]>,
    // The number of pages requested.
    count: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - `ptr` must have been allocated as a run of `count` pages.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, count: usize, id: u64) -> Block {
        let mut b = Block { ptr, count, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, usize) {
        (self.ptr, self.count)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match op {
                AllocatorOp::Alloc { count, user } => {
                    let flags = match user {
                        true => PallocFlags::USER,
                        false => PallocFlags::empty(),
                    };

                    let ptr = match self.subject.allocate(flags, count) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let block = unsafe { Block::init(ptr, count, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    block.paint(op_id);
                    let (ptr, count) = block.into_raw_parts();
                    unsafe { self.subject.deallocate(ptr.cast(), count) };
                }
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }

            let (ptr, count) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr.cast(), count) };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_strategy_survives_a_fixed_workload() {
        let ops: Vec<AllocatorOp> = (0..200)
            .map(|i| match i % 3 {
                2 => AllocatorOp::Dealloc(i * 7),
                _ => AllocatorOp::Alloc {
                    count: 1 + i % MAX_RUN,
                    user: i % 2 == 0,
                },
            })
            .collect();

        for strategy in StrategyKind::ALL {
            let subject = PallocSubject::new(strategy, 256, 96).unwrap();
            Evaluator::new(subject).evaluate(ops.clone()).unwrap();
        }
    }
}
