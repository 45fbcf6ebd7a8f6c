//! Scheduler: consumer pool, placement, and runtime lifecycle
//!
//! One scheduler per process. It owns the consumers, the reactor, and
//! the timer wheel. The thread that calls [`Scheduler::run`] becomes the
//! controlling thread: it alone drives `process_events` and `tick`,
//! which is what lets the fd table and wheel slots stay single-threaded.

use crate::config::RuntimeConfig;
use crate::consumer::Consumer;
use crate::fiber::{current_fiber, Fiber, FiberFn};
use crate::io::manager::IoManager;
use crate::timer::TimerWheel;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use strand_core::{FiberError, FiberResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl From<u8> for SchedulerState {
    fn from(v: u8) -> Self {
        match v {
            1 => SchedulerState::Running,
            2 => SchedulerState::Stopping,
            _ => SchedulerState::Stopped,
        }
    }
}

static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

pub struct Scheduler {
    config: RuntimeConfig,
    consumers: Vec<Consumer>,
    state: AtomicU8,
    /// Guards against two threads driving the event loop
    driving: AtomicBool,
    io: IoManager,
    wheel: TimerWheel,
}

impl Scheduler {
    /// Initialize the process-wide scheduler with an explicit
    /// configuration. Fails if one already exists.
    pub fn init(config: RuntimeConfig) -> FiberResult<&'static Scheduler> {
        config.validate()?;
        if SCHEDULER.get().is_some() {
            return Err(FiberError::AlreadyInitialized);
        }
        Ok(SCHEDULER.get_or_init(|| Scheduler::build(config)))
    }

    /// The process-wide scheduler, created from `RuntimeConfig::from_env`
    /// on first use.
    pub fn get() -> &'static Scheduler {
        SCHEDULER.get_or_init(|| Scheduler::build(RuntimeConfig::from_env()))
    }

    /// The scheduler, if one has been created.
    pub fn try_get() -> Option<&'static Scheduler> {
        SCHEDULER.get()
    }

    fn build(config: RuntimeConfig) -> Scheduler {
        // Construction failures here are resource exhaustion (no epoll,
        // no threads); there is no sensible retry.
        config
            .validate()
            .unwrap_or_else(|e| panic!("fiber runtime config rejected: {}", e));

        let io = IoManager::new()
            .unwrap_or_else(|e| panic!("fiber runtime reactor init failed: {}", e));
        let wheel = TimerWheel::new(config.timer_slots, config.timer_tick_ms);

        let consumers = (0..config.num_consumers)
            .map(Consumer::start)
            .collect::<FiberResult<Vec<_>>>()
            .unwrap_or_else(|e| panic!("fiber runtime worker spawn failed: {}", e));

        log::debug!(
            "scheduler initialized: {} consumers, {} KiB stacks, wheel {}x{}ms",
            config.num_consumers,
            config.stack_size / 1024,
            config.timer_slots,
            config.timer_tick_ms
        );

        Scheduler {
            config,
            consumers,
            state: AtomicU8::new(SchedulerState::Running as u8),
            driving: AtomicBool::new(false),
            io,
            wheel,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    pub fn worker_count(&self) -> usize {
        self.consumers.len()
    }

    pub(crate) fn io(&self) -> &IoManager {
        &self.io
    }

    pub fn timer(&self) -> &TimerWheel {
        &self.wheel
    }

    /// Place a fiber on a consumer for immediate execution.
    ///
    /// Placement order: the fiber's sticky consumer, else the spawning
    /// fiber's consumer, else the shortest queue.
    pub fn schedule_immediate(&self, fiber: Arc<Fiber>) {
        let index = match fiber.consumer_id() {
            Some(id) if id < self.consumers.len() => id,
            _ => match current_fiber().and_then(|f| f.consumer_id()) {
                Some(id) if id < self.consumers.len() => id,
                _ => self.shortest_queue(),
            },
        };
        self.consumers[index].submit(fiber);
    }

    fn shortest_queue(&self) -> usize {
        let mut best = 0;
        let mut best_len = usize::MAX;
        for (index, consumer) in self.consumers.iter().enumerate() {
            let len = consumer.queue_len();
            if len < best_len {
                best = index;
                best_len = len;
            }
        }
        best
    }

    /// Construct a fiber in READY and schedule it.
    pub fn go(&self, entry: FiberFn) -> FiberResult<Arc<Fiber>> {
        let fiber = self.create(entry)?;
        self.schedule_immediate(fiber.clone());
        Ok(fiber)
    }

    /// Construct a fiber without scheduling it; the caller owns resume.
    pub fn create(&self, entry: FiberFn) -> FiberResult<Arc<Fiber>> {
        self.create_with_stack(entry, self.config.stack_size)
    }

    pub fn create_with_stack(&self, entry: FiberFn, stack_size: usize) -> FiberResult<Arc<Fiber>> {
        if self.state() != SchedulerState::Running {
            return Err(FiberError::NotRunning);
        }
        Fiber::new(entry, stack_size)
    }

    /// Drive the reactor and timer wheel on the calling thread until
    /// [`stop`](Scheduler::stop), then tear the runtime down: wake every
    /// I/O waiter, join the consumers, and drain residual fibers.
    pub fn run(&self) {
        if self.driving.swap(true, Ordering::AcqRel) {
            log::warn!("Scheduler::run called while another thread is driving");
            return;
        }
        log::debug!("scheduler event loop running");

        while self.state() == SchedulerState::Running {
            let timeout = self.wheel.next_timeout_ms().min(self.wheel.tick_interval_ms());
            self.io.process_events(timeout as i32);
            self.wheel.tick();
        }

        self.shutdown();
        self.driving.store(false, Ordering::Release);
    }

    /// Request shutdown. Returns immediately; `run` observes the state
    /// change and performs the teardown.
    pub fn stop(&self) {
        let previous: SchedulerState = self
            .state
            .swap(SchedulerState::Stopping as u8, Ordering::AcqRel)
            .into();
        if previous == SchedulerState::Running {
            log::debug!("scheduler stopping");
            // Kick the reactor out of epoll_wait
            self.io.notify();
        }
    }

    fn shutdown(&self) {
        // Order matters: stop the wheel so no new timers arm, wake every
        // parked I/O fiber so it can observe cancellation, then retire
        // the workers and finish whatever they left queued.
        self.wheel.stop();
        self.io.shutdown();
        for consumer in &self.consumers {
            consumer.stop();
        }
        for consumer in &self.consumers {
            consumer.drain();
        }
        self.state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
        log::debug!("scheduler stopped");
    }
}

/// Schedule a new fiber on the process-wide scheduler.
pub fn go<F>(f: F) -> FiberResult<Arc<Fiber>>
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::get().go(Box::new(f))
}

/// Construct a fiber without scheduling it. The caller is responsible
/// for resuming it.
pub fn create<F>(f: F) -> FiberResult<Arc<Fiber>>
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::get().create(Box::new(f))
}
