use crate::limits::WaitStrategy;
use crossbeam::{queue::ArrayQueue, utils::Backoff};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

/// Fixed-capacity FIFO handing accepted connections to the workers.
///
/// Producers block while the queue is full; consumers never block. Any number
/// of producers and consumers may share one queue: every item is delivered to
/// exactly one consumer.
pub(crate) struct BoundedQueue<T> {
    items: ArrayQueue<T>,
    closed: AtomicBool,
    wait_strategy: WaitStrategy,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    /// Panics if `capacity` is zero.
    #[inline]
    pub(crate) fn new(capacity: usize, wait_strategy: WaitStrategy) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            closed: AtomicBool::new(false),
            wait_strategy,
        }
    }

    /// Inserts `item`, waiting for room while the queue is full.
    ///
    /// Hands the item back if the queue is closed before it could be inserted;
    /// the caller then owns its cleanup.
    pub(crate) fn enqueue(&self, mut item: T) -> Result<(), T> {
        let backoff = Backoff::new();

        loop {
            if self.is_closed() {
                return Err(item);
            }

            match self.items.push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected,
            }

            match &self.wait_strategy {
                WaitStrategy::Yield => thread::yield_now(),
                WaitStrategy::Sleep(time) => thread::sleep(*time),
                WaitStrategy::Backoff => backoff.snooze(),
            }
        }
    }

    /// Removes the oldest item, or returns `None` at once if there is none.
    #[inline(always)]
    pub(crate) fn try_dequeue(&self) -> Option<T> {
        self.items.pop()
    }

    /// Refuses further inserts. Items already queued stay available to
    /// [`try_dequeue`](Self::try_dequeue).
    #[inline]
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    fn queue<T>(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue::new(capacity, WaitStrategy::Sleep(Duration::from_micros(50)))
    }

    #[test]
    fn fifo() {
        let q = queue(4);
        for i in 0..4 {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.len(), 4);
        assert_eq!(q.capacity(), 4);

        for i in 0..4 {
            assert_eq!(q.try_dequeue(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn empty_dequeue_does_not_block() {
        let q = queue::<u32>(1);
        let started = Instant::now();

        for _ in 0..1000 {
            assert_eq!(q.try_dequeue(), None);
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn closed_queue_returns_item() {
        let q = queue(2);
        q.enqueue("kept").unwrap();
        q.close();

        assert_eq!(q.enqueue("rejected"), Err("rejected"));
        assert_eq!(q.try_dequeue(), Some("kept"));
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn full_queue_blocks_until_room() {
        let q = Arc::new(queue(1));
        q.enqueue(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.enqueue(2))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(q.len(), 1);

        assert_eq!(q.try_dequeue(), Some(1));
        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(q.try_dequeue(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_producer() {
        let q = Arc::new(queue(1));
        q.enqueue(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.enqueue(2))
        };

        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(producer.join().unwrap(), Err(2));
    }

    #[test]
    fn many_producers_many_consumers() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        for strategy in [
            WaitStrategy::Yield,
            WaitStrategy::Backoff,
            WaitStrategy::Sleep(Duration::from_micros(10)),
        ] {
            let q = Arc::new(BoundedQueue::new(8, strategy));
            let done = Arc::new(AtomicUsize::new(0));

            let producers: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let (q, done) = (q.clone(), done.clone());
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            q.enqueue(p * PER_PRODUCER + i).unwrap();
                            assert!(q.len() <= q.capacity());
                        }
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let (q, done) = (q.clone(), done.clone());
                    thread::spawn(move || {
                        let mut seen = Vec::new();
                        loop {
                            match q.try_dequeue() {
                                Some(item) => seen.push(item),
                                None if done.load(Ordering::SeqCst) == PRODUCERS
                                    && q.is_empty() =>
                                {
                                    break seen
                                }
                                None => thread::yield_now(),
                            }
                        }
                    })
                })
                .collect();

            for producer in producers {
                producer.join().unwrap();
            }

            let mut all = HashSet::new();
            let mut total = 0;
            for consumer in consumers {
                for item in consumer.join().unwrap() {
                    total += 1;
                    assert!(all.insert(item), "item {item} delivered twice");
                }
            }

            assert_eq!(total, PRODUCERS * PER_PRODUCER);
            assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        }
    }
}
