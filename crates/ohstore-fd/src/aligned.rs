//! Heap buffers with a guaranteed start alignment.
//!
//! Direct I/O transfers need the user buffer aligned to the memory boundary;
//! `Vec<u8>` gives no such guarantee, so staging goes through this type.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::{FdError, Result};

/// Zero-initialised byte buffer whose start address is a multiple of `alignment`
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `alignment` (a power of two).
    pub fn zeroed(len: usize, alignment: usize) -> Result<Self> {
        if len == 0 {
            return Err(FdError::Argument("aligned buffer length must be non-zero".into()));
        }
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            FdError::Argument(format!(
                "invalid buffer layout: len={} alignment={}",
                len, alignment
            ))
        })?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(FdError::Allocation { size: len })?;

        Ok(Self { ptr, len, layout })
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("alignment", &self.alignment())
            .finish()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_honoured() {
        for alignment in [512usize, 4096, 65536] {
            let buf = AlignedBuf::zeroed(alignment * 2, alignment).unwrap();
            assert_eq!(buf.as_slice().as_ptr() as usize % alignment, 0);
            assert_eq!(buf.alignment(), alignment);
        }
    }

    #[test]
    fn test_zero_filled_and_writable() {
        let mut buf = AlignedBuf::zeroed(4096, 4096).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[17] = 0x5A;
        assert_eq!(buf.as_slice()[17], 0x5A);
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn test_invalid_layout_rejected() {
        assert!(matches!(
            AlignedBuf::zeroed(4096, 3000),
            Err(FdError::Argument(_))
        ));
        assert!(AlignedBuf::zeroed(0, 4096).is_err());
    }
}
