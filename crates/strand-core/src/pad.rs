//! Cache-line alignment helper

/// Cache line size used for padding throughout the runtime.
pub const CACHE_LINE_SIZE: usize = 64;

/// Wrapper that aligns its contents to a cache line.
///
/// Used for the head/tail words of lock-free queues and ring buffers so
/// that producers and consumers do not false-share.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
    pub const fn new(value: T) -> Self {
        CacheAligned(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(core::mem::align_of::<CacheAligned<u8>>(), CACHE_LINE_SIZE);
        assert_eq!(core::mem::align_of::<CacheAligned<u64>>(), CACHE_LINE_SIZE);
    }
}
