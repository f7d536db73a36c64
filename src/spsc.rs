//! Bounded lock-free single-producer single-consumer queue.
//!
//! Shared contexts use one of these to hand registration commands from
//! client threads to the process thread without taking a lock on the hot
//! path. Capacity is fixed at creation; `push` fails instead of blocking
//! when the ring is full.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to write; only the producer advances this.
    head: AtomicUsize,
    /// Next slot to read; only the consumer advances this.
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Ring<T> {
        // One slot stays empty to distinguish full from empty.
        let slots = (0..capacity + 1)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ring { slots, head: AtomicUsize::new(0), tail: AtomicUsize::new(0) }
    }
}

/// Producer half. Not cloneable: exactly one writer exists.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// Consumer half. Not cloneable: exactly one reader exists.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

/// Creates a queue holding at most `capacity` elements.
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let ring = Arc::new(Ring::with_capacity(capacity.max(1)));
    (Producer { ring: ring.clone() }, Consumer { ring })
}

impl<T: Send> Producer<T> {
    /// Enqueues `value`, or returns it when the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let next = (head + 1) % ring.slots.len();
        if next == ring.tail.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe { (*ring.slots[head].get()).write(value) };
        ring.head.store(next, Ordering::Release);
        Ok(())
    }
}

impl<T: Send> Consumer<T> {
    /// Dequeues the oldest element, if any.
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        if tail == ring.head.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*ring.slots[tail].get()).assume_init_read() };
        ring.tail.store((tail + 1) % ring.slots.len(), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Runs once both halves are gone; queued elements are dropped
        // exactly once here.
        let mut tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        while tail != head {
            unsafe { (*self.slots[tail].get()).assume_init_drop() };
            tail = (tail + 1) % self.slots.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = channel(8);
        for i in 0..5 {
            tx.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let (mut tx, mut rx) = channel(2);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert_eq!(tx.push(3), Err(3));
        assert_eq!(rx.pop(), Some(1));
        tx.push(3).unwrap();
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
    }

    #[test]
    fn cross_thread_transfer() {
        let (mut tx, mut rx) = channel(64);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    match tx.push(i) {
                        Ok(()) => break,
                        Err(_) => std::thread::yield_now(),
                    }
                }
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn queued_elements_are_dropped_with_the_queue() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (mut tx, rx) = channel(4);
        tx.push(Counted).ok().unwrap();
        tx.push(Counted).ok().unwrap();
        drop(rx);
        drop(tx);
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }
}
