//! Execution context: a guarded stack plus a register save area
//!
//! Two flavors exist. A fiber context owns a stack and is armed with the
//! trampoline entry; a main context is a bare save area for a worker
//! thread's scheduling loop, which runs on the thread's own stack.
//!
//! Two backends implement the switch. The default is the hand-written
//! per-arch register save/restore in [`crate::arch`]. The
//! `portable-context` feature swaps in the platform's ucontext facility
//! (getcontext/makecontext/swapcontext), which is slower but needs no
//! assembly; useful when bringing up a new target.

use crate::stack::Stack;
use strand_core::FiberResult;

cfg_if::cfg_if! {
    if #[cfg(feature = "portable-context")] {
        use portable::Inner;
    } else {
        use fast::Inner;
    }
}

pub struct Context {
    inner: Inner,
    stack: Option<Stack>,
}

impl Context {
    /// Save area for a worker's scheduling loop. The first switch out of
    /// it fills in the registers.
    pub fn main() -> Context {
        Context {
            inner: Inner::empty(),
            stack: None,
        }
    }

    /// A context whose first switch-into runs `entry` on a fresh guarded
    /// stack.
    pub fn fiber(stack_size: usize, entry: unsafe extern "C" fn() -> !) -> FiberResult<Context> {
        let stack = Stack::new(stack_size)?;
        let inner = Inner::armed(&stack, entry)?;
        Ok(Context {
            inner,
            stack: Some(stack),
        })
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    /// Save the current execution into `save` and continue from `load`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid, distinct, and `load` must hold either
    /// an armed entry or a previously saved execution. The caller must
    /// guarantee no other thread touches either context during the
    /// switch; the runtime's one-queue-per-fiber invariant provides this.
    pub unsafe fn switch(save: *mut Context, load: *const Context) {
        Inner::switch(&mut (*save).inner, &(*load).inner);
    }
}

#[cfg(not(feature = "portable-context"))]
mod fast {
    use crate::arch::{self, SavedRegs};
    use crate::stack::Stack;
    use strand_core::FiberResult;

    pub(super) struct Inner {
        regs: SavedRegs,
    }

    impl Inner {
        pub(super) fn empty() -> Inner {
            Inner {
                regs: SavedRegs::zeroed(),
            }
        }

        pub(super) fn armed(
            stack: &Stack,
            entry: unsafe extern "C" fn() -> !,
        ) -> FiberResult<Inner> {
            let mut regs = SavedRegs::zeroed();
            unsafe {
                arch::init_context(&mut regs, stack.top(), entry as usize);
            }
            Ok(Inner { regs })
        }

        pub(super) unsafe fn switch(save: &mut Inner, load: &Inner) {
            arch::context_switch(&mut save.regs, &load.regs);
        }
    }
}

#[cfg(feature = "portable-context")]
mod portable {
    use crate::stack::Stack;
    use strand_core::{FiberError, FiberResult};

    /// Boxed because ucontext_t is large and must keep a stable address
    /// once a switch has saved into it.
    pub(super) struct Inner {
        ucp: Box<libc::ucontext_t>,
    }

    impl Inner {
        pub(super) fn empty() -> Inner {
            Inner {
                ucp: Box::new(unsafe { std::mem::zeroed() }),
            }
        }

        pub(super) fn armed(
            stack: &Stack,
            entry: unsafe extern "C" fn() -> !,
        ) -> FiberResult<Inner> {
            let mut ucp: Box<libc::ucontext_t> = Box::new(unsafe { std::mem::zeroed() });
            let ret = unsafe { libc::getcontext(&mut *ucp) };
            if ret != 0 {
                return Err(FiberError::StackAllocation(crate::io::errno()));
            }
            ucp.uc_stack.ss_sp = stack.limit() as *mut libc::c_void;
            ucp.uc_stack.ss_size = stack.usable_size();
            ucp.uc_link = std::ptr::null_mut();
            unsafe {
                let entry: extern "C" fn() = std::mem::transmute(entry);
                libc::makecontext(&mut *ucp, entry, 0);
            }
            Ok(Inner { ucp })
        }

        pub(super) unsafe fn switch(save: &mut Inner, load: &Inner) {
            let _ = libc::swapcontext(&mut *save.ucp, &*load.ucp);
        }
    }
}
