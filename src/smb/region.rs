/*!
 * Shared-Memory Region
 * Bounds-checked, offset-addressed byte arena with typed accessors
 */

use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::Offset;
use parking_lot::RwLock;
use std::ops::Range;
use zerocopy::{AsBytes, FromBytes};

/// Contiguous byte range owned by one SMB
///
/// Every participant addresses shared structures by offset; the region turns an
/// offset plus a `#[repr(C)]` type into a checked read or write.
pub struct Region {
    bytes: RwLock<Box<[u8]>>,
    size: u64,
}

impl Region {
    pub fn new(size: u64) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; size as usize].into_boxed_slice()),
            size,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    fn range(&self, offset: Offset, len: u64) -> DataplaneResult<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset as usize..end as usize),
            _ => Err(DataplaneError::OutOfBounds {
                offset,
                len,
                region_size: self.size,
            }),
        }
    }

    pub fn read_bytes(&self, offset: Offset, len: u64) -> DataplaneResult<Vec<u8>> {
        let range = self.range(offset, len)?;
        Ok(self.bytes.read()[range].to_vec())
    }

    pub fn write_bytes(&self, offset: Offset, data: &[u8]) -> DataplaneResult<()> {
        let range = self.range(offset, data.len() as u64)?;
        self.bytes.write()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: Offset, len: u64, value: u8) -> DataplaneResult<()> {
        let range = self.range(offset, len)?;
        self.bytes.write()[range].fill(value);
        Ok(())
    }

    /// Typed read of a shared structure at `offset`
    pub fn read<T: FromBytes>(&self, offset: Offset) -> DataplaneResult<T> {
        let len = std::mem::size_of::<T>() as u64;
        let range = self.range(offset, len)?;
        let guard = self.bytes.read();
        T::read_from(&guard[range]).ok_or(DataplaneError::OutOfBounds {
            offset,
            len,
            region_size: self.size,
        })
    }

    /// Typed write of a shared structure at `offset`
    pub fn write<T: AsBytes>(&self, offset: Offset, value: &T) -> DataplaneResult<()> {
        self.write_bytes(offset, value.as_bytes())
    }

    /// Read-modify-write of a shared structure under one lock acquisition
    pub fn update<T, F>(&self, offset: Offset, f: F) -> DataplaneResult<T>
    where
        T: FromBytes + AsBytes,
        F: FnOnce(&mut T),
    {
        let len = std::mem::size_of::<T>() as u64;
        let range = self.range(offset, len)?;
        let mut guard = self.bytes.write();
        let mut value = T::read_from(&guard[range.clone()]).ok_or(DataplaneError::OutOfBounds {
            offset,
            len,
            region_size: self.size,
        })?;
        f(&mut value);
        guard[range].copy_from_slice(value.as_bytes());
        Ok(value)
    }

    #[inline]
    pub fn read_u64(&self, offset: Offset) -> DataplaneResult<u64> {
        self.read::<u64>(offset)
    }

    #[inline]
    pub fn write_u64(&self, offset: Offset, value: u64) -> DataplaneResult<()> {
        self.write(offset, &value)
    }

    /// Copy `len` bytes from `src_offset` in `src` to `dst_offset` in `dst`
    ///
    /// Handles `src` and `dst` being the same region. Never holds both locks at
    /// once, so concurrent copies in opposite directions cannot deadlock.
    pub fn copy_between(
        src: &Region,
        src_offset: Offset,
        dst: &Region,
        dst_offset: Offset,
        len: u64,
    ) -> DataplaneResult<()> {
        if std::ptr::eq(src, dst) {
            let from = src.range(src_offset, len)?;
            let to = src.range(dst_offset, len)?;
            src.bytes.write().copy_within(from, to.start);
            return Ok(());
        }
        let staged = src.read_bytes(src_offset, len)?;
        dst.write_bytes(dst_offset, &staged)
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::{AsBytes, FromBytes, FromZeroes};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
    #[repr(C)]
    struct Pair {
        a: u64,
        b: u32,
        c: u32,
    }

    #[test]
    fn test_typed_round_trip() {
        let region = Region::new(256);
        let value = Pair { a: 7, b: 8, c: 9 };
        region.write(64, &value).unwrap();
        assert_eq!(region.read::<Pair>(64).unwrap(), value);
    }

    #[test]
    fn test_bounds_are_checked() {
        let region = Region::new(32);
        assert!(matches!(
            region.write(24, &Pair { a: 1, b: 2, c: 3 }),
            Err(DataplaneError::OutOfBounds { offset: 24, len: 16, region_size: 32 })
        ));
        assert!(region.read_bytes(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_update_in_place() {
        let region = Region::new(64);
        region.write_u64(8, 41).unwrap();
        let after = region.update::<u64, _>(8, |v| *v += 1).unwrap();
        assert_eq!(after, 42);
        assert_eq!(region.read_u64(8).unwrap(), 42);
    }

    #[test]
    fn test_copy_between_same_region_overlapping() {
        let region = Region::new(16);
        region.write_bytes(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        Region::copy_between(&region, 0, &region, 2, 6).unwrap();
        assert_eq!(region.read_bytes(0, 8).unwrap(), vec![1, 2, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_copy_between_regions() {
        let a = Region::new(16);
        let b = Region::new(16);
        a.write_bytes(4, b"abcd").unwrap();
        Region::copy_between(&a, 4, &b, 12, 4).unwrap();
        assert_eq!(b.read_bytes(12, 4).unwrap(), b"abcd".to_vec());
    }
}
