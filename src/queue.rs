use std::{collections::VecDeque, num::NonZeroUsize, time::Duration};

use parking_lot::{Condvar, Mutex};

/// A bounded multi-producer FIFO.
///
/// `push` blocks while the queue is full, which is how backpressure reaches the
/// training loop. Each successful pop wakes at most one blocked producer.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    capacity: NonZeroUsize,
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    /// Creates a new `BlockingQueue`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of items held at once.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.get())),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `item`, blocking the caller until there's a free slot.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();

        while items.len() >= self.capacity.get() {
            self.not_full.wait(&mut items);
        }

        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Removes the oldest item, blocking the caller until there is one.
    pub fn pop(&self) -> T {
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return item;
            }

            self.not_empty.wait(&mut items);
        }
    }

    /// Removes the oldest item, waiting at most `timeout` for one to arrive.
    ///
    /// # Returns
    /// `None` if the queue stayed empty for the whole wait.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();

        if items.is_empty() {
            // A spurious wake up just shortens this wait, callers already poll.
            self.not_empty.wait_for(&mut items, timeout);
        }

        let item = items.pop_front()?;
        self.not_full.notify_one();
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    const SETTLE: Duration = Duration::from_millis(100);

    fn queue<T>(capacity: usize) -> Arc<BlockingQueue<T>> {
        Arc::new(BlockingQueue::new(NonZeroUsize::new(capacity).unwrap()))
    }

    #[test]
    fn keeps_fifo_order() {
        let q = queue(3);
        q.push(1);
        q.push(2);
        q.push(3);

        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_timeout_gives_up_on_empty_queue() {
        let q = queue::<u8>(1);
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let q = queue(1);
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(42);
            })
        };

        assert_eq!(q.pop_timeout(Duration::from_secs(5)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn draining_one_slot_unblocks_exactly_one_producer() {
        const CAPACITY: usize = 2;
        const BLOCKED: usize = 2;

        let q = queue(CAPACITY);
        for i in 0..CAPACITY {
            q.push(i);
        }

        let done = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..BLOCKED)
            .map(|i| {
                let q = Arc::clone(&q);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    q.push(CAPACITY + i);
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(SETTLE);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(q.len(), CAPACITY);

        q.pop();
        thread::sleep(SETTLE);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), CAPACITY);

        q.pop();
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), BLOCKED);
    }
}
