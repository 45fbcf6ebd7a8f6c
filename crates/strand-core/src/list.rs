//! Lock-free FIFO linked queue
//!
//! Michael-Scott queue over [`TaggedPtr`] words. This is the one queue
//! shape in the runtime: every consumer run queue and every wait queue is
//! a `LinkedQueue`.
//!
//! Nodes are recycled through a tagged free list owned by the queue, so
//! node memory stays alive (and mapped) for the lifetime of the queue.
//! That lifetime guarantee is what makes the 16-bit tag sufficient ABA
//! protection: a recycled node re-enters circulation with a fresh tag on
//! every free-list push, and every CAS bumps the tag again.
//!
//! The dequeue reads the value out of the successor node *before* the
//! head CAS. A loser forgets its bitwise copy without dropping it; only
//! the CAS winner materializes the value. Reading after the CAS would
//! race a concurrent push that reuses the retired node.

use crate::pad::CacheAligned;
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Node<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    next: AtomicTaggedPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicTaggedPtr::null(),
        }))
    }
}

/// Tagged Treiber stack of retired nodes.
///
/// Nodes link through their `next` field while pooled. The pool never
/// returns memory to the allocator until the owning queue drops.
struct FreeList<T> {
    head: CacheAligned<AtomicTaggedPtr<Node<T>>>,
}

impl<T> FreeList<T> {
    const fn new() -> Self {
        FreeList {
            head: CacheAligned::new(AtomicTaggedPtr::null()),
        }
    }

    /// Pop a pooled node, or allocate a fresh one.
    fn acquire(&self) -> *mut Node<T> {
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            if head.is_null() {
                return Node::boxed();
            }
            // The node may be concurrently acquired and relinked; `next`
            // is atomic and a stale read just fails the CAS below.
            let next = unsafe { (*head.ptr()).next.load(Ordering::Relaxed) };
            let new_head = TaggedPtr::new(next.ptr(), head.next_tag());
            if self
                .head
                .0
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return head.ptr();
            }
        }
    }

    /// Return a node whose value slot is already vacated.
    fn release(&self, node: *mut Node<T>) {
        // Keep the node's own next-tag advancing across recycles
        let node_tag = unsafe { (*node).next.load(Ordering::Relaxed) }.next_tag();
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            unsafe {
                (*node)
                    .next
                    .store(TaggedPtr::new(head.ptr(), node_tag), Ordering::Relaxed);
            }
            let new_head = TaggedPtr::new(node, head.next_tag());
            if self
                .head
                .0
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<T> Drop for FreeList<T> {
    fn drop(&mut self) {
        let mut current = self.head.0.load(Ordering::Relaxed).ptr();
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed).ptr() };
            // Pooled value slots are uninit; only the node itself drops.
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

/// Multi-producer multi-consumer FIFO.
///
/// `push` and `pop` are lock-free; `len` is a relaxed approximation and
/// never a correctness source.
pub struct LinkedQueue<T> {
    head: CacheAligned<AtomicTaggedPtr<Node<T>>>,
    tail: CacheAligned<AtomicTaggedPtr<Node<T>>>,
    pool: FreeList<T>,
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send> Sync for LinkedQueue<T> {}

impl<T> LinkedQueue<T> {
    pub fn new() -> Self {
        let queue = LinkedQueue {
            head: CacheAligned::new(AtomicTaggedPtr::null()),
            tail: CacheAligned::new(AtomicTaggedPtr::null()),
            pool: FreeList::new(),
            len: AtomicUsize::new(0),
        };
        // Sentinel dummy node; the queue is empty iff head == tail and
        // head->next is null.
        let dummy = queue.pool.acquire();
        unsafe {
            (*dummy).next.store(TaggedPtr::null(), Ordering::Relaxed);
        }
        let word = TaggedPtr::new(dummy, 0);
        queue.head.0.store(word, Ordering::Release);
        queue.tail.0.store(word, Ordering::Release);
        queue
    }

    pub fn push(&self, value: T) {
        let node = self.pool.acquire();
        unsafe {
            (*node).value.get().write(MaybeUninit::new(value));
            // Reset to null but keep the field's tag advancing so a
            // recycled node never re-presents an old (ptr, tag) pair
            let old_next = (*node).next.load(Ordering::Relaxed);
            (*node)
                .next
                .store(TaggedPtr::new(std::ptr::null_mut(), old_next.next_tag()), Ordering::Release);
        }

        loop {
            let tail = self.tail.0.load(Ordering::Acquire);
            let next = unsafe { (*tail.ptr()).next.load(Ordering::Acquire) };

            // Re-validate the snapshot
            if tail != self.tail.0.load(Ordering::Acquire) {
                continue;
            }

            if !next.is_null() {
                // Tail lags; help advance it and retry
                let new_tail = TaggedPtr::new(next.ptr(), tail.next_tag());
                let _ = self.tail.0.compare_exchange_weak(
                    tail,
                    new_tail,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }

            let new_next = TaggedPtr::new(node, next.next_tag());
            if unsafe {
                (*tail.ptr())
                    .next
                    .compare_exchange_weak(next, new_next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            } {
                self.len.fetch_add(1, Ordering::Relaxed);
                // Swing the tail; a failure means another thread helped
                let new_tail = TaggedPtr::new(node, tail.next_tag());
                let _ = self.tail.0.compare_exchange_weak(
                    tail,
                    new_tail,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            let tail = self.tail.0.load(Ordering::Acquire);
            let next = unsafe { (*head.ptr()).next.load(Ordering::Acquire) };

            if head != self.head.0.load(Ordering::Acquire) {
                continue;
            }

            if head.ptr() == tail.ptr() {
                if next.is_null() {
                    return None;
                }
                // Tail lags behind the real last node
                let new_tail = TaggedPtr::new(next.ptr(), tail.next_tag());
                let _ = self.tail.0.compare_exchange_weak(
                    tail,
                    new_tail,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }

            if next.is_null() {
                // Transient snapshot between a head swing and a tail swing
                continue;
            }

            // Bitwise read before the CAS; see module docs.
            let value = unsafe { std::ptr::read((*next.ptr()).value.get()) };
            let new_head = TaggedPtr::new(next.ptr(), head.next_tag());
            if self
                .head
                .0
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.pool.release(head.ptr());
                return Some(unsafe { value.assume_init() });
            }
            // Lost the race; the copy is a MaybeUninit and drops nothing.
        }
    }

    /// Approximate number of enqueued items.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        let next = unsafe { (*head.ptr()).next.load(Ordering::Acquire) };
        head.ptr() == tail.ptr() && next.is_null()
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        LinkedQueue::new()
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // Only the dummy remains; its value slot is vacant
        let dummy = self.head.0.load(Ordering::Relaxed).ptr();
        self.pool.release(dummy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = LinkedQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);

        for i in 0..16 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 16);
        for i in 0..16 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_interleaved() {
        let queue = LinkedQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        queue.push(3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_node_reuse_preserves_values() {
        let queue = LinkedQueue::new();
        // Cycle the same handful of nodes many times
        for round in 0..1000 {
            queue.push(round);
            queue.push(round + 1);
            assert_eq!(queue.pop(), Some(round));
            assert_eq!(queue.pop(), Some(round + 1));
        }
    }

    #[test]
    fn test_drop_releases_values() {
        let queue = LinkedQueue::new();
        for i in 0..8 {
            queue.push(Arc::new(i));
        }
        let probe = Arc::new(99);
        queue.push(Arc::clone(&probe));
        drop(queue);
        assert_eq!(Arc::strong_count(&probe), 1);
    }

    /// Property: concurrent enqueue/dequeue loses nothing, duplicates
    /// nothing, and preserves per-producer ordering.
    #[test]
    fn test_concurrent_stress() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;

        const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

        let queue = Arc::new(LinkedQueue::new());
        let consumed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = vec![];

        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.push((p, seq));
                }
            }));
        }

        let mut consumers = vec![];
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while consumed.load(Ordering::Relaxed) < TOTAL {
                    match queue.pop() {
                        Some(item) => {
                            seen.push(item);
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<(u64, u64)> = Vec::new();
        let mut per_consumer: Vec<Vec<(u64, u64)>> = Vec::new();
        for c in consumers {
            let seen = c.join().unwrap();
            all.extend(seen.iter().copied());
            per_consumer.push(seen);
        }

        assert_eq!(all.len(), TOTAL);

        // No duplicates, nothing lost
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        let mut per_producer: HashMap<u64, Vec<u64>> = HashMap::new();
        for (p, seq) in &all {
            per_producer.entry(*p).or_default().push(*seq);
        }
        for (_, mut seqs) in per_producer {
            seqs.sort_unstable();
            assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
        }

        // Per-producer order as observed by any single consumer is
        // monotonic
        for seen in per_consumer {
            let mut last: HashMap<u64, u64> = HashMap::new();
            for (p, seq) in seen {
                if let Some(prev) = last.insert(p, seq) {
                    assert!(prev < seq, "producer {} reordered: {} after {}", p, seq, prev);
                }
            }
        }
    }

    #[test]
    fn test_len_is_approximate_but_settles() {
        let queue = Arc::new(LinkedQueue::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    queue.push(i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.len(), 4000);
    }
}
