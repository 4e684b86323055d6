//! Lock-free intrusive multi-producer single-consumer queue.
//!
//! Producers hand in pre-allocated nodes, so pushing never allocates. The
//! queue keeps a permanent stub node; a push is a single atomic exchange of
//! the head followed by linking the previous head to the new node. Between
//! those two steps the queue is transiently "broken" and the consumer spins
//! until the link appears.

use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;
use std::thread;

use crossbeam::utils::CachePadded;

/// Node of an [`IntrusiveMpscQueue`]
pub struct MpscNode<T> {
    next: AtomicPtr<MpscNode<T>>,
    value: Option<T>,
}

impl<T> MpscNode<T> {
    /// Allocate a node carrying `value`
    pub fn new(value: T) -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(value),
        })
    }

    /// Borrow the carried value
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Consume the node
    pub fn into_value(self: Box<Self>) -> Option<T> {
        self.value
    }

    fn stub() -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        })
    }
}

/// Spins before falling back to yielding the thread
const SPINS_BEFORE_YIELD: u32 = 64;

/// Multi-producer single-consumer queue over caller-owned nodes
pub struct IntrusiveMpscQueue<T> {
    /// Most recently pushed node; producers exchange it
    head: CachePadded<AtomicPtr<MpscNode<T>>>,
    /// Oldest node; touched by the consumer only
    tail: CachePadded<UnsafeCell<*mut MpscNode<T>>>,
    /// Permanent sentinel
    stub: *mut MpscNode<T>,
    /// Detects concurrent consumers
    #[cfg(debug_assertions)]
    is_consuming: AtomicBool,
}

// SAFETY: nodes are transferred between threads by value; the consumer side
// is only reachable through `unsafe fn`s whose callers guarantee a single
// consumer
unsafe impl<T: Send> Send for IntrusiveMpscQueue<T> {}
unsafe impl<T: Send> Sync for IntrusiveMpscQueue<T> {}

impl<T> IntrusiveMpscQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let stub = Box::into_raw(MpscNode::stub());
        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(UnsafeCell::new(stub)),
            stub,
            #[cfg(debug_assertions)]
            is_consuming: AtomicBool::new(false),
        }
    }

    /// Push a node. Safe to call from any number of threads.
    pub fn push(&self, node: Box<MpscNode<T>>) {
        self.push_with_window(node, || {});
    }

    /// Push with `window` executed between the head exchange and the link,
    /// where the queue is observably broken.
    fn push_with_window(&self, node: Box<MpscNode<T>>, window: impl FnOnce()) {
        let node = Box::into_raw(node);
        // SAFETY: `node` is exclusively owned until published below
        unsafe { (*node).next.store(ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.head.swap(node, Ordering::AcqRel);
        window();
        // SAFETY: `prev` stays alive until the consumer observes this link
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Pop the oldest node.
    ///
    /// # Safety
    ///
    /// The caller must be the only consumer: no other call to `try_pop`,
    /// `try_pop_value` or `is_empty` may run concurrently on this queue.
    /// Debug builds abort when the contract is broken.
    pub unsafe fn try_pop(&self) -> Option<Box<MpscNode<T>>> {
        #[cfg(debug_assertions)]
        let _consumer = ConsumerGuard::enter(&self.is_consuming);

        // SAFETY: the tail is owned by the single consumer and every node
        // reachable from it is alive until popped
        unsafe {
            let tail_slot = &mut *self.tail.get();
            let mut tail = *tail_slot;
            let mut next = (*tail).next.load(Ordering::Acquire);

            if tail == self.stub {
                if next.is_null() {
                    if self.head.load(Ordering::Acquire) == self.stub {
                        return None;
                    }
                    next = wait_for_link(tail);
                }
                *tail_slot = next;
                tail = next;
                next = (*tail).next.load(Ordering::Acquire);
            }

            if !next.is_null() {
                *tail_slot = next;
                return Some(Box::from_raw(tail));
            }

            if self.head.load(Ordering::Acquire) != tail {
                // a producer has exchanged the head but not linked yet
                next = wait_for_link(tail);
                *tail_slot = next;
                return Some(Box::from_raw(tail));
            }

            // `tail` is the only node: put the stub back behind it
            (*self.stub).next.store(ptr::null_mut(), Ordering::Relaxed);
            match self.head.compare_exchange(
                tail,
                self.stub,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    *tail_slot = self.stub;
                    Some(Box::from_raw(tail))
                }
                Err(_) => {
                    next = wait_for_link(tail);
                    *tail_slot = next;
                    Some(Box::from_raw(tail))
                }
            }
        }
    }

    /// Pop and unwrap the oldest value
    ///
    /// # Safety
    ///
    /// Same contract as [`try_pop`](Self::try_pop).
    pub unsafe fn try_pop_value(&self) -> Option<T> {
        self.try_pop().and_then(MpscNode::into_value)
    }

    /// Whether the queue is empty
    ///
    /// # Safety
    ///
    /// Reads the consumer-owned tail; same contract as
    /// [`try_pop`](Self::try_pop).
    pub unsafe fn is_empty(&self) -> bool {
        let tail = *self.tail.get();
        tail == self.stub
            && (*self.stub).next.load(Ordering::Acquire).is_null()
            && self.head.load(Ordering::Acquire) == self.stub
    }
}

/// Spin until the producer that exchanged the head links `node` forward
unsafe fn wait_for_link<T>(node: *mut MpscNode<T>) -> *mut MpscNode<T> {
    let mut spins = 0u32;
    loop {
        let next = (*node).next.load(Ordering::Acquire);
        if !next.is_null() {
            return next;
        }
        if spins < SPINS_BEFORE_YIELD {
            hint::spin_loop();
            spins += 1;
        } else {
            thread::yield_now();
        }
    }
}

impl<T> Default for IntrusiveMpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for IntrusiveMpscQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out any other consumer
        while unsafe { self.try_pop() }.is_some() {}
        // SAFETY: the stub was allocated in `new` and is unlinked now
        drop(unsafe { Box::from_raw(self.stub) });
    }
}

impl<T> fmt::Debug for IntrusiveMpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrusiveMpscQueue").finish_non_exhaustive()
    }
}

#[cfg(debug_assertions)]
struct ConsumerGuard<'a> {
    flag: &'a AtomicBool,
}

#[cfg(debug_assertions)]
impl<'a> ConsumerGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let was_consuming = flag.swap(true, Ordering::Acquire);
        uassert!(!was_consuming, "IntrusiveMpscQueue has more than one consumer");
        Self { flag }
    }
}

#[cfg(debug_assertions)]
impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
