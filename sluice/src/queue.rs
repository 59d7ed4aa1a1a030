use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bounded multi-producer/multi-consumer queue over a power-of-two ring
/// of cells. Each cell carries its own sequence counter: producers publish
/// the element with a release store and consumers observe it with an
/// acquire load, so a concurrent dequeue can never read a cell whose
/// element copy has not completed.
pub struct SlotQueue<T> {
    cells: Box<[Cell<T>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    count: AtomicUsize,
}

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SlotQueue<T> {}

unsafe impl<T: Send> Sync for SlotQueue<T> {}

impl<T: Copy + Default> SlotQueue<T> {
    /// Construct a queue with the supplied capacity. The capacity must be
    /// a nonzero power of two.
    pub fn with_capacity(capacity: usize) -> Result<SlotQueue<T>> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidParam);
        }

        let cells: Vec<Cell<T>> = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(T::default()),
            })
            .collect();

        Ok(SlotQueue {
            cells: cells.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        })
    }

    /// Append an element at the head of the queue.
    pub fn push(&self, value: T) -> Result<()> {
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos {
                // The cell is free. Claim it by advancing the head.
                match self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        unsafe { *cell.value.get() = value };
                        // Publish the element only after the copy completed.
                        cell.sequence.store(pos + 1, Ordering::Release);
                        self.count.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if seq < pos {
                // The cell still holds an element a full lap behind.
                return Err(Error::QueueFull);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Remove the element at the tail of the queue.
    pub fn pop(&self) -> Result<T> {
        let mut pos = self.tail.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos + 1 {
                match self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let value = unsafe { *cell.value.get() };
                        // Free the cell for the producer one lap ahead.
                        cell.sequence.store(pos + self.mask + 1, Ordering::Release);
                        self.count.fetch_sub(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(current) => pos = current,
                }
            } else if seq <= pos {
                return Err(Error::QueueEmpty);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Copy out the element at the tail without removing it. The result is
    /// a snapshot; a concurrent consumer may dequeue the element at any
    /// point after the copy.
    pub fn peek(&self) -> Result<T> {
        let pos = self.tail.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];

        match cell.sequence.load(Ordering::Acquire) == pos + 1 {
            true => Ok(unsafe { *cell.value.get() }),
            _ => Err(Error::QueueEmpty),
        }
    }

    /// Reset the queue to the empty state. Requires exclusive access, which
    /// statically guarantees no concurrent producer or consumer exists.
    pub fn clear(&mut self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);

        for (i, cell) in self.cells.iter_mut().enumerate() {
            cell.sequence.store(i, Ordering::Relaxed);
            unsafe { *cell.value.get() = T::default() };
        }
    }

    /// The number of elements currently held. Approximate under concurrent
    /// mutation, exact when quiescent.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert_eq!(SlotQueue::<u64>::with_capacity(0).err(), Some(Error::InvalidParam));
        assert_eq!(SlotQueue::<u64>::with_capacity(3).err(), Some(Error::InvalidParam));
        assert_eq!(SlotQueue::<u64>::with_capacity(100).err(), Some(Error::InvalidParam));
        assert!(SlotQueue::<u64>::with_capacity(64).is_ok());
    }

    #[test]
    fn test_push_pop_fifo() {
        let queue = SlotQueue::with_capacity(8).unwrap();

        for i in 0..8u64 {
            queue.push(i).unwrap();
        }

        assert_eq!(queue.len(), 8);
        assert_eq!(queue.push(99).err(), Some(Error::QueueFull));

        for i in 0..8u64 {
            assert_eq!(queue.pop().unwrap(), i);
        }

        assert!(queue.is_empty());
        assert_eq!(queue.pop().err(), Some(Error::QueueEmpty));
    }

    #[test]
    fn test_wraparound() {
        let queue = SlotQueue::with_capacity(4).unwrap();

        for lap in 0..10u64 {
            for i in 0..4 {
                queue.push(lap * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(queue.pop().unwrap(), lap * 4 + i);
            }
        }
    }

    #[test]
    fn test_peek_does_not_consume() {
        let queue = SlotQueue::with_capacity(4).unwrap();

        assert_eq!(queue.peek().err(), Some(Error::QueueEmpty));

        queue.push(7u64).unwrap();

        assert_eq!(queue.peek().unwrap(), 7);
        assert_eq!(queue.peek().unwrap(), 7);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap(), 7);
    }

    #[test]
    fn test_clear() {
        let mut queue = SlotQueue::with_capacity(4).unwrap();

        queue.push(1u64).unwrap();
        queue.push(2u64).unwrap();
        queue.clear();

        assert!(queue.is_empty());

        // The ring is fully usable again after a clear.
        for i in 0..4u64 {
            queue.push(i).unwrap();
        }
        for i in 0..4u64 {
            assert_eq!(queue.pop().unwrap(), i);
        }
    }

    #[test]
    fn test_mpmc_every_element_exactly_once() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 2500;

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        let queue = Arc::new(SlotQueue::with_capacity(64).unwrap());
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = p * PER_PRODUCER + i;
                        loop {
                            match queue.push(value) {
                                Ok(()) => break,
                                Err(Error::QueueFull) => thread::yield_now(),
                                Err(err) => panic!("Unexpected error {:?}", err),
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while consumed.load(Ordering::Relaxed) < total {
                        match queue.pop() {
                            Ok(value) => {
                                seen.push(value);
                                consumed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(Error::QueueEmpty) => thread::yield_now(),
                            Err(err) => panic!("Unexpected error {:?}", err),
                        }
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut all: Vec<u64> = Vec::new();
        for consumer in consumers {
            let seen = consumer.join().unwrap();

            // Per producer FIFO: within a single consumer, the elements
            // originating from one producer arrive in increasing order.
            for p in 0..PRODUCERS {
                let range = (p * PER_PRODUCER)..((p + 1) * PER_PRODUCER);
                let from_p: Vec<u64> = seen.iter().cloned().filter(|v| range.contains(v)).collect();
                for window in from_p.windows(2) {
                    assert!(window[0] < window[1]);
                }
            }

            all.extend(seen);
        }

        assert_eq!(all.len(), total);

        // Every produced element was consumed exactly once.
        all.sort();
        for (i, value) in all.iter().enumerate() {
            assert_eq!(*value, i as u64);
        }
    }

    #[test]
    fn test_size_stays_within_bounds() {
        let queue = Arc::new(SlotQueue::with_capacity(16).unwrap());

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..5000u64 {
                    while queue.push(i).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut received = 0;
                while received < 5000 {
                    if queue.pop().is_ok() {
                        received += 1;
                    }
                }
            })
        };

        for _ in 0..1000 {
            let size = queue.len();
            assert!(size <= queue.capacity());
        }

        producer.join().unwrap();
        consumer.join().unwrap();

        assert!(queue.is_empty());
    }
}
