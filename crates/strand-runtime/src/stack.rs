//! Guarded fiber stacks
//!
//! Each fiber stack is an anonymous mapping of `page_round(stack_size)`
//! plus one extra page. The lowest page is remapped `PROT_NONE` so a
//! stack overflow faults instead of corrupting the neighboring mapping.
//! Stacks grow down from `top()`.

use strand_core::{FiberError, FiberResult};

/// An owned, guard-paged stack region.
pub struct Stack {
    base: *mut u8,
    total: usize,
    page: usize,
}

// Safety: the mapping is owned and only ever touched by the thread
// currently running the fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a new stack with `stack_size` usable bytes (page-rounded).
    pub fn new(stack_size: usize) -> FiberResult<Stack> {
        let page = page_size();
        let usable = round_up(stack_size, page);
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(FiberError::StackAllocation(crate::io::errno()));
        }

        // Guard page below the usable region
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            let err = crate::io::errno();
            unsafe { libc::munmap(base, total) };
            return Err(FiberError::StackAllocation(err));
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            page,
        })
    }

    /// Highest address of the stack; execution starts here and grows down.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Lowest usable address (just above the guard page).
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.add(self.page) }
    }

    /// Usable bytes between `limit()` and `top()`.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, page: usize) -> usize {
    (value + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let page = page_size();
        let stack = Stack::new(256 * 1024).unwrap();
        assert_eq!(stack.usable_size(), 256 * 1024);
        assert_eq!(stack.top() as usize % page, 0);
        assert_eq!(stack.limit() as usize % page, 0);
        assert_eq!(stack.top() as usize - stack.limit() as usize, 256 * 1024);
    }

    #[test]
    fn test_odd_size_rounds_to_page() {
        let page = page_size();
        let stack = Stack::new(100_000).unwrap();
        assert_eq!(stack.usable_size() % page, 0);
        assert!(stack.usable_size() >= 100_000);
    }

    #[test]
    fn test_usable_region_is_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        unsafe {
            // Touch the first and last usable bytes
            *stack.limit() = 0xAA;
            *stack.top().sub(1) = 0xBB;
            assert_eq!(*stack.limit(), 0xAA);
            assert_eq!(*stack.top().sub(1), 0xBB);
        }
    }
}
