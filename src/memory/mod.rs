//! Linear Memory
//!
//! The module sees one contiguous byte array addressed by `u32` offsets.
//! Host code never hands out native pointers into it; every access goes
//! through an offset and is bounds checked.
//!
//! The backing store is a `Vec<u64>` so that typed views of any primitive
//! width (`u8` up to `f64`) can be produced with `bytemuck` without copying.
//! Views borrow the memory, so none can outlive a [`LinearMemory::grow`].
//!
//! ```text
//! 0          1024                1024 + stack_size          len
//! +----------+-------------------+--------------------------+
//! | guard    | call stack        | heap (alloc/free)  ...   |
//! | + errno  | grows upward      | grows upward             |
//! +----------+-------------------+--------------------------+
//! ```

pub mod allocator;

// Typed views reinterpret module bytes in host order
#[cfg(target_endian = "big")]
compile_error!("linear memory views require a little-endian host");

pub use allocator::{Allocation, Allocator, StackMark};

use crate::error::{RuntimeError, RuntimeResult};
use bytemuck::Pod;

/// Linear memory page size (64 KiB)
pub const PAGE_SIZE: u32 = 65536;

/// Hard ceiling on linear memory size (2 GiB)
pub const MAX_MEMORY: u32 = 1 << 31;

/// Below this size memory doubles on growth, above it grows by 20%
const DOUBLING_LIMIT: u64 = 16 * 1024 * 1024;

/// Maximum overgrowth beyond the requested size
const MAX_OVERGROWTH: u64 = 96 * 1024 * 1024;

const WORD: usize = std::mem::size_of::<u64>();

/// Round `value` up to a multiple of `align` (a power of two)
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// The module's linear memory
pub struct LinearMemory {
    words: Vec<u64>,
    limit: u32,
    generation: u64,
}

impl LinearMemory {
    /// Create memory of `initial` bytes (rounded to a page) that may grow to `limit`
    pub fn new(initial: u32, limit: u32) -> RuntimeResult<Self> {
        let limit = limit.min(MAX_MEMORY);
        let size = align_up(initial as u64, PAGE_SIZE as u64);
        if size > limit as u64 {
            return Err(RuntimeError::OutOfMemory { requested: size });
        }

        let mut words = Vec::new();
        words
            .try_reserve_exact(size as usize / WORD)
            .map_err(|_| RuntimeError::OutOfMemory { requested: size })?;
        words.resize(size as usize / WORD, 0);

        Ok(Self {
            words,
            limit,
            generation: 0,
        })
    }

    /// Current size in bytes
    pub fn len(&self) -> u32 {
        (self.words.len() * WORD) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Incremented on every successful growth
    ///
    /// Host code caching offsets-derived data (not views, which the borrow
    /// checker already invalidates) can compare generations to detect growth.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Grow to at least `target` bytes
    ///
    /// Memory overgrows geometrically: 100% while small, 20% once past
    /// 16 MiB, never more than 96 MiB beyond the request. If the host cannot
    /// reserve the overgrown size the attempt is retried with half and then a
    /// quarter of the overgrowth. On failure nothing changes. Returns the new
    /// size.
    pub fn grow(&mut self, target: u64) -> RuntimeResult<u32> {
        let old = self.len() as u64;
        if target <= old {
            return Ok(self.len());
        }

        let page = PAGE_SIZE as u64;
        if align_up(target, page) > self.limit as u64 {
            log::warn!(
                "memory growth to {} bytes refused (limit {})",
                target,
                self.limit
            );
            return Err(RuntimeError::OutOfMemory { requested: target });
        }

        let divisor = if old < DOUBLING_LIMIT { 1 } else { 5 };
        for cut_down in [1, 2, 4] {
            let overgrown = (old + old / (divisor * cut_down)).min(target + MAX_OVERGROWTH);
            let new_size = align_up(target.max(overgrown), page).min(self.limit as u64);

            let additional = (new_size - old) as usize / WORD;
            if self.words.try_reserve_exact(additional).is_ok() {
                self.words.resize(new_size as usize / WORD, 0);
                self.generation += 1;
                log::debug!("linear memory grown {} -> {} bytes", old, new_size);
                return Ok(self.len());
            }
        }

        Err(RuntimeError::OutOfMemory { requested: target })
    }

    /// The whole memory as bytes
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// The whole memory as a slice of `T`
    pub fn view<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn view_mut<T: Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// `count` elements of `T` starting at byte `offset`
    ///
    /// Fails if the range is out of bounds or `offset` is not aligned for `T`.
    pub fn slice<T: Pod>(&self, offset: u32, count: u32) -> RuntimeResult<&[T]> {
        let width = std::mem::size_of::<T>();
        let range = self.range(offset, count as u64 * width as u64)?;
        bytemuck::try_cast_slice(&self.bytes()[range])
            .map_err(|_| RuntimeError::Misaligned { offset, width })
    }

    pub fn slice_mut<T: Pod>(&mut self, offset: u32, count: u32) -> RuntimeResult<&mut [T]> {
        let width = std::mem::size_of::<T>();
        let range = self.range(offset, count as u64 * width as u64)?;
        bytemuck::try_cast_slice_mut(&mut self.bytes_mut()[range])
            .map_err(|_| RuntimeError::Misaligned { offset, width })
    }

    fn range(&self, offset: u32, len: u64) -> RuntimeResult<std::ops::Range<usize>> {
        let end = offset as u64 + len;
        if end > self.len() as u64 {
            return Err(RuntimeError::OutOfBounds {
                address: offset as u64,
                size: len,
                memory_size: self.len(),
            });
        }
        Ok(offset as usize..end as usize)
    }

    /// Copy `buf.len()` bytes out of memory
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> RuntimeResult<()> {
        let range = self.range(offset, buf.len() as u64)?;
        buf.copy_from_slice(&self.bytes()[range]);
        Ok(())
    }

    pub fn read_bytes(&self, offset: u32, len: u32) -> RuntimeResult<Vec<u8>> {
        let range = self.range(offset, len as u64)?;
        Ok(self.bytes()[range].to_vec())
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> RuntimeResult<()> {
        let range = self.range(offset, data.len() as u64)?;
        self.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, offset: u32, len: u32, value: u8) -> RuntimeResult<()> {
        let range = self.range(offset, len as u64)?;
        self.bytes_mut()[range].fill(value);
        Ok(())
    }

    /// Overlap-safe copy inside memory
    pub fn copy_within(&mut self, dest: u32, src: u32, len: u32) -> RuntimeResult<()> {
        let from = self.range(src, len as u64)?;
        self.range(dest, len as u64)?;
        self.bytes_mut().copy_within(from, dest as usize);
        Ok(())
    }

    fn read_array<const N: usize>(&self, offset: u32) -> RuntimeResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u16(&self, offset: u32) -> RuntimeResult<u16> {
        self.read_array(offset).map(u16::from_le_bytes)
    }

    pub fn read_i32(&self, offset: u32) -> RuntimeResult<i32> {
        self.read_array(offset).map(i32::from_le_bytes)
    }

    pub fn read_u32(&self, offset: u32) -> RuntimeResult<u32> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    pub fn read_i64(&self, offset: u32) -> RuntimeResult<i64> {
        self.read_array(offset).map(i64::from_le_bytes)
    }

    pub fn read_f64(&self, offset: u32) -> RuntimeResult<f64> {
        self.read_array(offset).map(f64::from_le_bytes)
    }

    pub fn write_i16(&mut self, offset: u32, value: i16) -> RuntimeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_i32(&mut self, offset: u32, value: i32) -> RuntimeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> RuntimeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_i64(&mut self, offset: u32, value: i64) -> RuntimeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, offset: u32, value: u64) -> RuntimeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_f64(&mut self, offset: u32, value: f64) -> RuntimeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Read a plain-data value at any alignment
    pub fn read_pod<T: Pod>(&self, offset: u32) -> RuntimeResult<T> {
        let range = self.range(offset, std::mem::size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes()[range]))
    }

    pub fn write_pod<T: Pod>(&mut self, offset: u32, value: &T) -> RuntimeResult<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }

    /// Read a NUL-terminated string
    ///
    /// Stops at the end of memory if no terminator is found. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn read_cstring(&self, offset: u32) -> RuntimeResult<String> {
        let bytes = self.bytes();
        if offset as usize >= bytes.len() {
            return Err(RuntimeError::OutOfBounds {
                address: offset as u64,
                size: 1,
                memory_size: self.len(),
            });
        }

        let tail = &bytes[offset as usize..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Write `text` followed by a NUL byte, returning the bytes written
    pub fn write_cstring(&mut self, offset: u32, text: &str) -> RuntimeResult<u32> {
        let len = text.len() as u32;
        self.write(offset, text.as_bytes())?;
        self.write(offset + len, &[0])?;
        Ok(len + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rounds_to_page() {
        let mem = LinearMemory::new(1, MAX_MEMORY).unwrap();
        assert_eq!(mem.len(), PAGE_SIZE);
        assert!(LinearMemory::new(3 * PAGE_SIZE, 2 * PAGE_SIZE).is_err());
    }

    #[test]
    fn test_grow_doubles_small_memory() {
        let mut mem = LinearMemory::new(PAGE_SIZE, MAX_MEMORY).unwrap();
        let size = mem.grow(PAGE_SIZE as u64 + 1).unwrap();
        assert_eq!(size, 2 * PAGE_SIZE);
        assert_eq!(mem.generation(), 1);

        // Request beyond doubling wins
        let size = mem.grow(10 * PAGE_SIZE as u64).unwrap();
        assert_eq!(size, 10 * PAGE_SIZE);
    }

    #[test]
    fn test_grow_tapers_past_threshold() {
        let mut mem = LinearMemory::new(32 * 1024 * 1024, MAX_MEMORY).unwrap();
        let size = mem.grow(32 * 1024 * 1024 + 1).unwrap();
        let expected = align_up(32 * 1024 * 1024 * 6 / 5, PAGE_SIZE as u64);
        assert_eq!(size as u64, expected);
    }

    #[test]
    fn test_grow_within_current_size_is_noop() {
        let mut mem = LinearMemory::new(2 * PAGE_SIZE, MAX_MEMORY).unwrap();
        assert_eq!(mem.grow(100).unwrap(), 2 * PAGE_SIZE);
        assert_eq!(mem.generation(), 0);
    }

    #[test]
    fn test_grow_past_limit_leaves_memory_untouched() {
        let mut mem = LinearMemory::new(PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        mem.write(10, b"keep").unwrap();

        let err = mem.grow(4 * PAGE_SIZE as u64 + 1).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
        assert_eq!(mem.len(), PAGE_SIZE);
        assert_eq!(mem.generation(), 0);
        assert_eq!(mem.read_bytes(10, 4).unwrap(), b"keep");

        // Growth clamps to the limit rather than overshooting it
        assert_eq!(mem.grow(3 * PAGE_SIZE as u64 + 1).unwrap(), 4 * PAGE_SIZE);
    }

    #[test]
    fn test_views_alias_bytes() {
        let mut mem = LinearMemory::new(PAGE_SIZE, MAX_MEMORY).unwrap();
        mem.write_f64(16, 2.5).unwrap();
        mem.write_i32(32, -7).unwrap();

        assert_eq!(mem.view::<f64>()[2], 2.5);
        assert_eq!(mem.view::<i32>()[8], -7);
        assert_eq!(mem.slice::<f64>(16, 1).unwrap(), &[2.5]);

        mem.view_mut::<u16>()[20] = 0xBEEF;
        assert_eq!(mem.read_u16(40).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_slice_checks_alignment_and_bounds() {
        let mem = LinearMemory::new(PAGE_SIZE, MAX_MEMORY).unwrap();
        assert!(matches!(
            mem.slice::<f64>(4, 1),
            Err(RuntimeError::Misaligned { offset: 4, width: 8 })
        ));
        assert!(matches!(
            mem.slice::<u8>(PAGE_SIZE - 1, 2),
            Err(RuntimeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_cstrings() {
        let mut mem = LinearMemory::new(PAGE_SIZE, MAX_MEMORY).unwrap();
        assert_eq!(mem.write_cstring(100, "maximize").unwrap(), 9);
        assert_eq!(mem.read_cstring(100).unwrap(), "maximize");
        assert_eq!(mem.read_bytes(108, 1).unwrap(), vec![0]);
        assert!(mem.read_cstring(PAGE_SIZE).is_err());
    }

    #[test]
    fn test_copy_within_overlapping() {
        let mut mem = LinearMemory::new(PAGE_SIZE, MAX_MEMORY).unwrap();
        mem.write(0, b"abcdef").unwrap();
        mem.copy_within(2, 0, 4).unwrap();
        assert_eq!(mem.read_bytes(0, 6).unwrap(), b"ababcd");
        assert!(mem.copy_within(PAGE_SIZE - 2, 0, 4).is_err());
    }
}
