//! Allocator
//!
//! Two disciplines share the linear memory:
//!
//! - Durable allocations (`alloc`/`free`): first-fit over a free list with
//!   coalescing, backed by a bump pointer that grows memory on demand.
//! - Stack allocations (`stack_alloc`/`stack_save`/`stack_restore`): a bump
//!   pointer inside the reserved stack region, released only by restoring a
//!   mark. Marks must be restored innermost first; anything else is rejected
//!   before any state changes.

use super::{LinearMemory, align_up};
use crate::error::{RuntimeError, RuntimeResult};
use std::collections::{BTreeMap, HashMap};

/// Start of the stack region; everything below is the null guard
pub const STACK_BASE: u32 = 1024;

/// Offset of the 4-byte errno cell inside the null guard
pub const ERRNO_CELL: u32 = 16;

/// Alignment of every allocation, stack or heap
pub const ALIGN: u32 = 16;

/// A saved stack position, returned by [`Allocator::stack_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMark {
    top: u32,
    /// Marks outstanding when this one was taken
    depth: usize,
}

impl StackMark {
    pub fn offset(self) -> u32 {
        self.top
    }
}

/// A live durable allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub offset: u32,
    /// Usable size, at least the requested size
    pub size: u32,
}

impl Allocation {
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

pub struct Allocator {
    stack_limit: u32,
    stack_top: u32,
    /// Outstanding marks, innermost last
    marks: Vec<u32>,

    heap_base: u32,
    heap_top: u32,
    /// Free blocks below `heap_top`, by offset
    free: BTreeMap<u32, u32>,
    /// Live blocks, offset -> size
    live: HashMap<u32, u32>,
}

impl Allocator {
    /// Lay out a stack of `stack_size` bytes with the heap directly after it
    pub fn new(stack_size: u32) -> Self {
        let stack_limit = STACK_BASE + stack_size;
        let heap_base = align_up(stack_limit as u64, ALIGN as u64) as u32;
        Self {
            stack_limit,
            stack_top: STACK_BASE,
            marks: Vec::new(),
            heap_base,
            heap_top: heap_base,
            free: BTreeMap::new(),
            live: HashMap::new(),
        }
    }

    /// First byte of the heap; memory must be at least this large
    pub fn heap_base(&self) -> u32 {
        self.heap_base
    }

    pub fn heap_top(&self) -> u32 {
        self.heap_top
    }

    // ========================================================================
    // Durable allocations
    // ========================================================================

    /// Allocate `size` bytes, growing memory if the free list can't serve it
    ///
    /// Zero-sized requests still get a unique block.
    pub fn alloc(&mut self, memory: &mut LinearMemory, size: u32) -> RuntimeResult<Allocation> {
        let rounded = align_up(size.max(1) as u64, ALIGN as u64);
        if rounded > u32::MAX as u64 {
            return Err(RuntimeError::OutOfMemory {
                requested: rounded,
            });
        }
        let rounded = rounded as u32;

        let fit = self
            .free
            .iter()
            .find(|&(_, &block)| block >= rounded)
            .map(|(&offset, &block)| (offset, block));

        let allocation = match fit {
            Some((offset, block)) => {
                self.free.remove(&offset);
                let size = if block - rounded >= ALIGN {
                    self.free.insert(offset + rounded, block - rounded);
                    rounded
                } else {
                    block
                };
                Allocation { offset, size }
            }
            None => {
                let end = self.heap_top as u64 + rounded as u64;
                if end > memory.len() as u64 {
                    memory.grow(end)?;
                }
                let offset = self.heap_top;
                self.heap_top = end as u32;
                Allocation {
                    offset,
                    size: rounded,
                }
            }
        };

        self.live.insert(allocation.offset, allocation.size);
        Ok(allocation)
    }

    /// Release a durable allocation
    ///
    /// Freeing offset 0 is a no-op, like `free(NULL)`. Any other offset that
    /// is not the start of a live allocation is rejected.
    pub fn free(&mut self, offset: u32) -> RuntimeResult<()> {
        if offset == 0 {
            return Ok(());
        }
        let size = match self.live.remove(&offset) {
            Some(size) => size,
            None => {
                log::warn!("rejected free of unallocated offset {:#x}", offset);
                return Err(RuntimeError::InvalidFree { offset });
            }
        };

        let mut start = offset;
        let mut end = offset + size;

        if let Some((&prev, &prev_size)) = self.free.range(..start).next_back() {
            if prev + prev_size == start {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_size) = self.free.remove(&end) {
            end += next_size;
        }

        if end == self.heap_top {
            self.heap_top = start;
        } else {
            self.free.insert(start, end - start);
        }
        Ok(())
    }

    pub fn is_live(&self, offset: u32) -> bool {
        self.live.contains_key(&offset)
    }

    /// Live allocations in offset order
    pub fn live_allocations(&self) -> Vec<Allocation> {
        let mut all: Vec<Allocation> = self
            .live
            .iter()
            .map(|(&offset, &size)| Allocation { offset, size })
            .collect();
        all.sort_by_key(|a| a.offset);
        all
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.live.values().map(|&s| s as u64).sum()
    }

    // ========================================================================
    // Stack allocations
    // ========================================================================

    pub fn stack_top(&self) -> u32 {
        self.stack_top
    }

    /// Number of marks not yet restored
    pub fn stack_depth(&self) -> usize {
        self.marks.len()
    }

    /// Save the current stack top
    pub fn stack_save(&mut self) -> StackMark {
        let mark = StackMark {
            top: self.stack_top,
            depth: self.marks.len(),
        };
        self.marks.push(self.stack_top);
        mark
    }

    /// Reserve `size` bytes on the stack, 16-byte aligned
    pub fn stack_alloc(&mut self, size: u32) -> RuntimeResult<u32> {
        let rounded = align_up(size as u64, ALIGN as u64);
        let available = self.stack_limit - self.stack_top;
        if rounded > available as u64 {
            return Err(RuntimeError::StackOverflow {
                requested: size,
                available,
            });
        }
        let offset = self.stack_top;
        self.stack_top += rounded as u32;
        Ok(offset)
    }

    /// Reset the stack top to `mark`, which must be the innermost outstanding mark
    pub fn stack_restore(&mut self, mark: StackMark) -> RuntimeResult<()> {
        let expected = self.marks.last().copied();
        if self.marks.len() != mark.depth + 1 || expected != Some(mark.top) {
            log::warn!(
                "stack restore to {:#x} out of order (innermost {:?})",
                mark.top,
                expected
            );
            return Err(RuntimeError::StackImbalance {
                mark: mark.top,
                expected,
            });
        }
        self.marks.pop();
        self.stack_top = mark.top;
        Ok(())
    }

    /// Restore `mark` even if inner marks are still outstanding
    ///
    /// Inner marks are discarded. Returns how many there were; `mark` itself
    /// must still be outstanding.
    pub fn unwind_to(&mut self, mark: StackMark) -> RuntimeResult<usize> {
        if self.marks.get(mark.depth) != Some(&mark.top) {
            return Err(RuntimeError::StackImbalance {
                mark: mark.top,
                expected: self.marks.last().copied(),
            });
        }
        let dropped = self.marks.len() - mark.depth - 1;
        self.marks.truncate(mark.depth);
        self.stack_top = mark.top;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MAX_MEMORY, PAGE_SIZE};

    fn setup() -> (LinearMemory, Allocator) {
        let alloc = Allocator::new(4096);
        let mem = LinearMemory::new(alloc.heap_base(), MAX_MEMORY).unwrap();
        (mem, alloc)
    }

    fn disjoint(allocs: &[Allocation]) -> bool {
        allocs.windows(2).all(|w| w[0].end() <= w[1].offset)
    }

    #[test]
    fn test_alloc_is_aligned_and_disjoint() {
        let (mut mem, mut alloc) = setup();
        let a = alloc.alloc(&mut mem, 3).unwrap();
        let b = alloc.alloc(&mut mem, 40).unwrap();
        let c = alloc.alloc(&mut mem, 0).unwrap();

        for x in [a, b, c] {
            assert_eq!(x.offset % ALIGN, 0);
            assert!(x.offset >= alloc.heap_base());
        }
        assert!(disjoint(&alloc.live_allocations()));
        assert_ne!(a.offset, c.offset);
    }

    #[test]
    fn test_alloc_grows_memory() {
        let (mut mem, mut alloc) = setup();
        let before = mem.len();
        let big = alloc.alloc(&mut mem, 3 * PAGE_SIZE).unwrap();
        assert!(mem.len() > before);
        assert!(big.end() <= mem.len());
    }

    #[test]
    fn test_free_reuses_and_coalesces() {
        let (mut mem, mut alloc) = setup();
        let a = alloc.alloc(&mut mem, 32).unwrap();
        let b = alloc.alloc(&mut mem, 32).unwrap();
        let _c = alloc.alloc(&mut mem, 32).unwrap();

        alloc.free(a.offset).unwrap();
        alloc.free(b.offset).unwrap();

        // a and b merged into one 64-byte hole
        let d = alloc.alloc(&mut mem, 64).unwrap();
        assert_eq!(d.offset, a.offset);
    }

    #[test]
    fn test_free_at_top_lowers_bump_pointer() {
        let (mut mem, mut alloc) = setup();
        let top = alloc.heap_top();
        let a = alloc.alloc(&mut mem, 100).unwrap();
        alloc.free(a.offset).unwrap();
        assert_eq!(alloc.heap_top(), top);
    }

    #[test]
    fn test_invalid_free_rejected() {
        let (mut mem, mut alloc) = setup();
        let a = alloc.alloc(&mut mem, 8).unwrap();

        assert!(alloc.free(0).is_ok());
        assert_eq!(
            alloc.free(a.offset + 4),
            Err(RuntimeError::InvalidFree {
                offset: a.offset + 4
            })
        );
        alloc.free(a.offset).unwrap();
        assert!(matches!(
            alloc.free(a.offset),
            Err(RuntimeError::InvalidFree { .. })
        ));
    }

    #[test]
    fn test_alloc_free_sequence_stays_disjoint() {
        let (mut mem, mut alloc) = setup();
        let mut held = Vec::new();
        for i in 0..200u32 {
            let size = (i * 37) % 300;
            held.push(alloc.alloc(&mut mem, size).unwrap().offset);
            if i % 3 == 0 {
                let victim = held.remove((i as usize * 7) % held.len());
                alloc.free(victim).unwrap();
            }
            assert!(disjoint(&alloc.live_allocations()));
        }
    }

    #[test]
    fn test_stack_lifo() {
        let mut alloc = Allocator::new(4096);
        let start = alloc.stack_top();

        let outer = alloc.stack_save();
        let p = alloc.stack_alloc(10).unwrap();
        assert_eq!(p % ALIGN, 0);
        let inner = alloc.stack_save();
        alloc.stack_alloc(100).unwrap();

        // Out of order restore is rejected and changes nothing
        let top = alloc.stack_top();
        assert!(matches!(
            alloc.stack_restore(outer),
            Err(RuntimeError::StackImbalance { .. })
        ));
        assert_eq!(alloc.stack_top(), top);

        alloc.stack_restore(inner).unwrap();
        alloc.stack_restore(outer).unwrap();
        assert_eq!(alloc.stack_top(), start);
        assert_eq!(alloc.stack_depth(), 0);

        // A mark can only be restored once
        assert!(alloc.stack_restore(outer).is_err());
    }

    #[test]
    fn test_unwind_discards_inner_marks() {
        let mut alloc = Allocator::new(4096);
        let start = alloc.stack_top();
        let base = alloc.stack_save();

        let outer = alloc.stack_save();
        alloc.stack_alloc(32).unwrap();
        alloc.stack_save();
        alloc.stack_alloc(64).unwrap();
        alloc.stack_save();

        assert_eq!(alloc.unwind_to(outer).unwrap(), 2);
        assert_eq!(alloc.stack_top(), start);
        assert_eq!(alloc.stack_depth(), 1);
        assert!(alloc.unwind_to(outer).is_err());

        // Equal offsets at different depths stay distinct
        let a = alloc.stack_save();
        alloc.stack_save();
        assert_eq!(alloc.unwind_to(a).unwrap(), 1);
        assert_eq!(alloc.stack_depth(), 1);
        alloc.stack_restore(base).unwrap();
        assert_eq!(alloc.stack_depth(), 0);
    }

    #[test]
    fn test_stack_overflow() {
        let mut alloc = Allocator::new(64);
        alloc.stack_alloc(48).unwrap();
        assert!(matches!(
            alloc.stack_alloc(32),
            Err(RuntimeError::StackOverflow { available: 16, .. })
        ));
    }
}
