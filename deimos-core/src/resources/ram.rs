use crate::bus::{AccessWidth, Bus};
use std::cell::RefCell;

/// Byte-based RAM implementation with support for misaligned memory access.
///
/// This can be categorized as *main memory* according to the types of memory resources defined by
/// the RISC-V spec: all access widths are supported, reads have no side effects, and instruction
/// fetches are allowed.
#[derive(Debug)]
pub struct Ram {
    data: RefCell<Box<[u8]>>,
}

impl Ram {
    /// Create a new zero-initialized RAM resource that can hold `size` bytes.
    ///
    /// `size` must be at least one, otherwise `None` is returned and nothing is allocated.
    pub fn new(size: usize) -> Option<Self> {
        (size > 0).then(|| Self {
            data: RefCell::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    /// Returns the size expressed in bytes. Guaranteed to be at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Force RAM back to its reset state, which is all-zeros.
    pub fn reset(&self) {
        self.data.borrow_mut().fill(0);
    }

    /// Reads a range of bytes from RAM into `buf`. Does not have side effects.
    ///
    /// Bytes corresponding to addresses beyond the end of RAM are left untouched.
    pub fn read_range(&self, buf: &mut [u8], offset: u64) {
        let data = self.data.borrow();
        let Ok(offset) = usize::try_from(offset) else {
            return;
        };
        if offset >= data.len() || buf.is_empty() {
            return;
        }
        let size = buf.len().min(data.len() - offset);
        buf[..size].copy_from_slice(&data[offset..offset + size]);
    }

    /// Writes a range of bytes from `buf` into RAM.
    ///
    /// Bytes corresponding to addresses beyond the end of RAM are ignored.
    pub fn write_range(&self, offset: u64, buf: &[u8]) {
        let mut data = self.data.borrow_mut();
        let Ok(offset) = usize::try_from(offset) else {
            return;
        };
        if offset >= data.len() || buf.is_empty() {
            return;
        }
        let size = buf.len().min(data.len() - offset);
        data[offset..offset + size].copy_from_slice(&buf[..size]);
    }
}

impl Bus for Ram {
    fn supports(&self, _width: AccessWidth) -> bool {
        true
    }

    fn is_fetchable(&self) -> bool {
        true
    }

    fn read(&self, offset: u64, width: AccessWidth) -> u64 {
        let mut buf = [0u8; 8];
        self.read_range(&mut buf[..width.size() as usize], offset);
        u64::from_le_bytes(buf)
    }

    fn read_debug(&self, offset: u64, width: AccessWidth) -> u64 {
        self.read(offset, width)
    }

    fn write(&self, offset: u64, width: AccessWidth, value: u64) {
        let buf = value.to_le_bytes();
        self.write_range(offset, &buf[..width.size() as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let ram = Ram::new(16).unwrap();
        ram.write(0, AccessWidth::Doubleword, 0x0102_0304_0506_0708);
        assert_eq!(0x08, ram.read(0, AccessWidth::Byte));
        assert_eq!(0x0708, ram.read(0, AccessWidth::Halfword));
        assert_eq!(0x0506_0708, ram.read(0, AccessWidth::Word));
        // Misaligned within the resource.
        assert_eq!(0x0607, ram.read(1, AccessWidth::Halfword));
    }

    #[test]
    fn test_out_of_bounds_clipped() {
        let ram = Ram::new(4).unwrap();
        ram.write(2, AccessWidth::Word, 0xAABB_CCDD);
        // Only the two in-bounds bytes are written.
        assert_eq!(0xCCDD, ram.read(2, AccessWidth::Halfword));
        assert_eq!(0, ram.read(8, AccessWidth::Word));
    }

    #[test]
    fn test_reset() {
        let ram = Ram::new(8).unwrap();
        ram.write(0, AccessWidth::Doubleword, u64::MAX);
        ram.reset();
        assert_eq!(0, ram.read(0, AccessWidth::Doubleword));
    }
}
