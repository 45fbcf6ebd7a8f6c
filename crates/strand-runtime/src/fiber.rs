//! Fiber lifecycle, trampoline, and the thread-local current fiber
//!
//! A fiber is a stackful coroutine with shared ownership: the scheduler,
//! wait queues, and the I/O facade may each hold a reference
//! concurrently. The runtime maintains one invariant above all others:
//! a fiber is present in at most one queue (run queue or exactly one
//! wait queue) at any instant, and RUNNING is held on exactly one worker.
//!
//! Every worker thread lazily builds a main fiber, the context its
//! scheduling loop runs in and the target of all yields on that thread.

use crate::context::Context;
use crate::scheduler::Scheduler;
use std::cell::{OnceCell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use strand_core::{FiberError, FiberResult, SpinLock};

/// Sentinel for "no sticky consumer assigned yet".
pub(crate) const NO_CONSUMER: usize = usize::MAX;

/// State of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created, never run
    Ready = 0,
    /// Executing on a worker right now
    Running = 1,
    /// Voluntarily yielded; schedulable
    Suspended = 2,
    /// Parked on a wait queue; NOT schedulable until a wake path submits it
    Blocked = 3,
    /// Entry function returned; final
    Done = 4,
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Suspended,
            3 => FiberState::Blocked,
            _ => FiberState::Done,
        }
    }
}

impl FiberState {
    /// Whether a consumer may switch into this fiber.
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Done)
    }
}

pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Sticky consumer id; `NO_CONSUMER` until first scheduled
    consumer: AtomicUsize,
    /// Set while the fiber is between enqueue-for-wake and the completion
    /// of its register save. A resumer spins on this so it never switches
    /// into a half-saved context.
    switch_pending: AtomicBool,
    /// Debug instrumentation for the one-queue invariant
    enqueued: AtomicBool,
    /// Entry function; taken once by the trampoline
    entry: SpinLock<Option<FiberFn>>,
    /// Back-reference to the resumer; set iff RUNNING, cleared by yield
    parent: SpinLock<Option<Arc<Fiber>>>,
    ctx: std::cell::UnsafeCell<Context>,
}

// Safety: `ctx` is only touched by the thread that is resuming or
// yielding this fiber; the one-queue invariant plus the switch_pending
// handshake serialize those accesses. Everything else is atomic or
// behind a SpinLock.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    /// The unique RUNNING fiber on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// This thread's scheduling-loop fiber.
    static MAIN: OnceCell<Arc<Fiber>> = const { OnceCell::new() };
}

impl Fiber {
    /// Construct a fiber in READY with its own guarded stack.
    pub fn new(entry: FiberFn, stack_size: usize) -> FiberResult<Arc<Fiber>> {
        let ctx = Context::fiber(stack_size, fiber_entry)?;
        Ok(Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Ready as u8),
            consumer: AtomicUsize::new(NO_CONSUMER),
            switch_pending: AtomicBool::new(false),
            enqueued: AtomicBool::new(false),
            entry: SpinLock::new(Some(entry)),
            parent: SpinLock::new(None),
            ctx: std::cell::UnsafeCell::new(ctx),
        }))
    }

    /// A worker thread's main fiber: no entry function, born RUNNING,
    /// runs on the thread's own stack.
    fn new_main() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Running as u8),
            consumer: AtomicUsize::new(NO_CONSUMER),
            switch_pending: AtomicBool::new(false),
            enqueued: AtomicBool::new(false),
            entry: SpinLock::new(None),
            parent: SpinLock::new(None),
            ctx: std::cell::UnsafeCell::new(Context::main()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.load(Ordering::Acquire).into()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Sticky consumer id, if this fiber has ever been picked up.
    pub fn consumer_id(&self) -> Option<usize> {
        match self.consumer.load(Ordering::Relaxed) {
            NO_CONSUMER => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_consumer(&self, id: usize) {
        self.consumer.store(id, Ordering::Relaxed);
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.parent.lock().is_some()
    }

    /// Announce an imminent park: from here until the register save
    /// completes, resumers must wait. Call before making this fiber
    /// visible to any wake path.
    pub(crate) fn begin_park(&self) {
        self.switch_pending.store(true, Ordering::Release);
    }

    /// Abort an announced park (the wake path was never armed).
    pub(crate) fn end_park(&self) {
        self.switch_pending.store(false, Ordering::Release);
    }

    /// One-queue invariant instrumentation; active in debug builds.
    pub(crate) fn mark_enqueued(&self) {
        let was = self.enqueued.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "fiber {} enqueued twice", self.id);
    }

    pub(crate) fn mark_dequeued(&self) {
        self.enqueued.store(false, Ordering::Release);
    }

    /// Switch into the fiber `this`. The caller (any fiber, main fibers
    /// included) becomes the parent and regains control when `this`
    /// yields, blocks, or finishes.
    ///
    /// Resuming a DONE fiber is a recoverable error.
    pub fn resume(this: &Arc<Fiber>) -> FiberResult<()> {
        if this.state() == FiberState::Done {
            log::warn!("resume called on finished fiber {}", this.id);
            return Err(FiberError::ResumeDone);
        }

        let caller = current_or_main();

        // A wake may have submitted this fiber before its yield finished
        // saving registers; wait out the race window.
        while this.switch_pending.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        // The parent link is live only while a fiber runs; once the
        // switch above settled, the previous yield must have cleared it.
        debug_assert!(!this.has_parent(), "resuming a fiber that still has a parent");

        *this.parent.lock() = Some(caller.clone());
        this.set_state(FiberState::Running);

        let save = caller.ctx.get();
        let load = this.ctx.get();
        set_current(Some(this.clone()));
        unsafe { Context::switch(save, load) };

        // The fiber switched back; its register save is complete.
        this.switch_pending.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // Main fibers die RUNNING with their thread; that is expected.
        let state = self.state();
        if state != FiberState::Done && self.entry.get_mut().is_some() {
            log::warn!("fiber {} dropped before completion ({:?})", self.id, state);
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("consumer", &self.consumer_id())
            .finish()
    }
}

/// The fiber currently running on this thread, if any.
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn set_current(fiber: Option<Arc<Fiber>>) {
    CURRENT.with(|c| *c.borrow_mut() = fiber);
}

/// This thread's main fiber, created on first use.
pub fn main_fiber() -> Arc<Fiber> {
    MAIN.with(|m| m.get_or_init(Fiber::new_main).clone())
}

/// Current fiber, or this thread's main fiber installed as current.
pub(crate) fn current_or_main() -> Arc<Fiber> {
    if let Some(fiber) = current_fiber() {
        return fiber;
    }
    let main = main_fiber();
    set_current(Some(main.clone()));
    main
}

/// Shared yield path. Sets the target state (unless the trampoline
/// already marked DONE), clears the parent link, restores the parent as
/// current, and switches.
fn yield_common(target: FiberState) {
    let current = match current_fiber() {
        Some(fiber) => fiber,
        None => {
            // Not in a fiber; the best we can do is yield the OS thread
            std::thread::yield_now();
            return;
        }
    };

    let parent = match current.parent.lock().take() {
        Some(parent) => parent,
        None => {
            // A main fiber has nowhere to yield; give up the OS thread
            std::thread::yield_now();
            return;
        }
    };

    if current.state() != FiberState::Done {
        current.set_state(target);
    }
    parent.set_state(FiberState::Running);

    let save = current.ctx.get();
    let load = parent.ctx.get();
    // Drop strong refs held by this frame before switching so a DONE
    // fiber can be freed by whoever holds the last reference.
    set_current(Some(parent));
    drop(current);
    unsafe { Context::switch(save, load) };
    // Back: somebody resumed us and set CURRENT/state already.
}

/// Voluntarily give up the worker; the fiber stays schedulable and the
/// consumer reinserts it. Outside a fiber this yields the OS thread.
pub fn yield_now() {
    yield_common(FiberState::Suspended);
}

/// Park: give up the worker without being rescheduled. Only a wake path
/// (wait queue, timer callback, reactor) may submit the fiber again.
pub fn block_yield() {
    yield_common(FiberState::Blocked);
}

/// Suspend the current fiber for at least `ms` milliseconds.
///
/// Outside a fiber this falls back to a thread sleep.
pub fn sleep(ms: u64) {
    let current = match current_fiber() {
        Some(fiber) => fiber,
        None => {
            std::thread::sleep(std::time::Duration::from_millis(ms));
            return;
        }
    };

    let scheduler = Scheduler::get();
    let target = current.clone();
    current.begin_park();
    let armed = scheduler.timer().add_timer(
        ms,
        move || {
            Scheduler::get().schedule_immediate(target.clone());
        },
        false,
    );
    if armed.is_none() {
        // Wheel is stopped; do not park with nobody to wake us
        current.end_park();
        return;
    }
    block_yield();
}

/// Trampoline: every fiber stack starts here. Runs the entry function,
/// contains any panic to this fiber, marks DONE, and yields to the
/// parent. Never returns.
unsafe extern "C" fn fiber_entry() -> ! {
    let current = current_fiber().expect("fiber entry with no current fiber");

    let entry = current.entry.lock().take();
    if let Some(f) = entry {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            log::error!("fiber {} panicked; tearing down this fiber only", current.id());
        }
    }

    current.set_state(FiberState::Done);
    drop(current);

    // DONE is sticky; yield_common will not overwrite it
    yield_common(FiberState::Suspended);
    unreachable!("finished fiber was resumed");
}
