use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Dequeue order of a [`BoundedWorkQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    /// First in, first out; priorities are ignored
    #[default]
    Fifo,
    /// Highest priority first, ties in submission order
    Priority,
}

struct Prioritized<T> {
    priority: i32,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.priority.cmp(&other.priority) {
            // lower sequence was submitted earlier and must win the tie
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

enum Buffer<T> {
    Fifo(VecDeque<T>),
    Priority(BinaryHeap<Prioritized<T>>),
}

impl<T> Buffer<T> {
    fn push(&mut self, item: T, priority: i32, sequence: u64) {
        match self {
            Buffer::Fifo(q) => q.push_back(item),
            Buffer::Priority(heap) => heap.push(Prioritized {
                priority,
                sequence,
                item,
            }),
        }
    }

    fn pop(&mut self) -> Option<T> {
        match self {
            Buffer::Fifo(q) => q.pop_front(),
            Buffer::Priority(heap) => heap.pop().map(|p| p.item),
        }
    }

    fn len(&self) -> usize {
        match self {
            Buffer::Fifo(q) => q.len(),
            Buffer::Priority(heap) => heap.len(),
        }
    }
}

struct QueueState<T> {
    buffer: Buffer<T>,
    next_sequence: u64,
}

/// Fixed-capacity async channel between producers and consumers.
///
/// `submit` suspends while the queue is full and `take` suspends while it is
/// empty. A single mutex guards the buffer; it is never held across an
/// `.await`, so both operations are cancel-safe: a cancelled `submit` hands
/// nothing to the queue, a cancelled `take` removes nothing from it.
pub struct BoundedWorkQueue<T> {
    capacity: usize,
    order: QueueOrder,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    submitted: AtomicU64,
    blocked_submits: AtomicU64,
}

impl<T> BoundedWorkQueue<T> {
    pub fn new(capacity: usize, order: QueueOrder) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("queue capacity must be positive"));
        }
        let buffer = match order {
            QueueOrder::Fifo => Buffer::Fifo(VecDeque::with_capacity(capacity)),
            QueueOrder::Priority => Buffer::Priority(BinaryHeap::with_capacity(capacity)),
        };
        Ok(Self {
            capacity,
            order,
            state: Mutex::new(QueueState {
                buffer,
                next_sequence: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            submitted: AtomicU64::new(0),
            blocked_submits: AtomicU64::new(0),
        })
    }

    /// Push without waiting. Hands the item back if the queue is full.
    pub fn try_submit(&self, item: T, priority: i32) -> std::result::Result<(), T> {
        self.try_submit_with(item, priority, &|_: &mut T| {})
    }

    /// [`try_submit`](Self::try_submit), calling `on_enqueue` on the item
    /// under the queue lock right before it becomes visible to takers.
    pub fn try_submit_with<F>(
        &self,
        mut item: T,
        priority: i32,
        on_enqueue: &F,
    ) -> std::result::Result<(), T>
    where
        F: Fn(&mut T),
    {
        let mut state = self.state.lock();
        if state.buffer.len() >= self.capacity {
            return Err(item);
        }
        on_enqueue(&mut item);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.buffer.push(item, priority, sequence);
        let has_room = state.buffer.len() < self.capacity;
        drop(state);

        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        if has_room {
            self.not_full.notify_one();
        }
        Ok(())
    }

    /// Push, suspending while the queue is full. Never drops the item.
    pub async fn submit(&self, item: T, priority: i32) {
        self.submit_with(item, priority, &|_: &mut T| {}).await
    }

    /// [`submit`](Self::submit) with an `on_enqueue` hook that runs once, when
    /// the item actually enters the queue.
    pub async fn submit_with<F>(&self, item: T, priority: i32, on_enqueue: &F)
    where
        F: Fn(&mut T),
    {
        let mut item = item;
        let mut counted = false;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_submit_with(item, priority, on_enqueue) {
                Ok(()) => return,
                Err(rejected) => {
                    item = rejected;
                    if !counted {
                        counted = true;
                        self.blocked_submits.fetch_add(1, Ordering::Relaxed);
                    }
                    notified.await;
                }
            }
        }
    }

    /// Pop without waiting.
    pub fn try_take(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.buffer.pop()?;
        let remaining = state.buffer.len();
        drop(state);

        self.not_full.notify_one();
        if remaining > 0 {
            self.not_empty.notify_one();
        }
        Some(item)
    }

    /// Pop, suspending while the queue is empty.
    pub async fn take(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_take() {
                return item;
            }
            notified.await;
        }
    }

    /// Remove everything currently queued, in dequeue order.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut items = Vec::with_capacity(state.buffer.len());
        while let Some(item) = state.buffer.pop() {
            items.push(item);
        }
        drop(state);

        if !items.is_empty() {
            self.not_full.notify_waiters();
        }
        items
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn order(&self) -> QueueOrder {
        self.order
    }

    /// Fill level as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity).min(100) as u32
    }

    /// Total items accepted so far
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Number of `submit` calls that had to wait for space
    pub fn blocked_count(&self) -> u64 {
        self.blocked_submits.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for BoundedWorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedWorkQueue")
            .field("capacity", &self.capacity)
            .field("order", &self.order)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(BoundedWorkQueue::<u32>::new(0, QueueOrder::Fifo).is_err());
    }

    #[test]
    fn test_fifo_ignores_priority() {
        let queue = BoundedWorkQueue::new(10, QueueOrder::Fifo).unwrap();
        queue.try_submit("a", 0).unwrap();
        queue.try_submit("b", 9).unwrap();
        queue.try_submit("c", -3).unwrap();
        assert_eq!(queue.drain(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_priority_order_with_stable_ties() {
        let queue = BoundedWorkQueue::new(10, QueueOrder::Priority).unwrap();
        queue.try_submit("low-1", 0).unwrap();
        queue.try_submit("high-1", 5).unwrap();
        queue.try_submit("low-2", 0).unwrap();
        queue.try_submit("high-2", 5).unwrap();
        queue.try_submit("lowest", -1).unwrap();
        assert_eq!(
            queue.drain(),
            vec!["high-1", "high-2", "low-1", "low-2", "lowest"]
        );
    }

    #[test]
    fn test_try_submit_full_hands_item_back() {
        let queue = BoundedWorkQueue::new(2, QueueOrder::Fifo).unwrap();
        assert!(queue.try_submit(1, 0).is_ok());
        assert!(queue.try_submit(2, 0).is_ok());
        assert_eq!(queue.try_submit(3, 0), Err(3));
        assert!(queue.is_full());
        assert_eq!(queue.try_take(), Some(1));
        assert!(queue.try_submit(3, 0).is_ok());
    }

    #[test]
    fn test_utilization() {
        let queue = BoundedWorkQueue::new(10, QueueOrder::Fifo).unwrap();
        for i in 0..5 {
            queue.try_submit(i, 0).unwrap();
        }
        assert_eq!(queue.utilization(), 50);
        assert_eq!(queue.submitted_count(), 5);
    }

    #[tokio::test]
    async fn test_submit_blocks_until_space() {
        let queue = Arc::new(BoundedWorkQueue::new(1, QueueOrder::Fifo).unwrap());
        queue.submit(1, 0).await;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.submit(2, 0).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.take().await, 1);

        producer.await.unwrap();
        assert_eq!(queue.take().await, 2);
        assert_eq!(queue.blocked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_hook_runs_when_item_enters() {
        let queue = Arc::new(BoundedWorkQueue::new(1, QueueOrder::Fifo).unwrap());
        let start = tokio::time::Instant::now();
        queue.submit((1, None), 0).await;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let stamp = |item: &mut (u32, Option<tokio::time::Instant>)| {
                    item.1 = Some(tokio::time::Instant::now());
                };
                queue.submit_with((2, None), 0, &stamp).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.take().await, (1, None));
        producer.await.unwrap();

        let (id, stamped) = queue.take().await;
        assert_eq!(id, 2);
        let entered = stamped.unwrap().duration_since(start);
        assert!(entered >= Duration::from_millis(50), "stamped at {entered:?}");
    }

    #[tokio::test]
    async fn test_take_waits_for_item() {
        let queue = Arc::new(BoundedWorkQueue::new(4, QueueOrder::Fifo).unwrap());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.submit(42, 0).await;
        assert_eq!(consumer.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_many_takers_all_served() {
        let queue = Arc::new(BoundedWorkQueue::new(2, QueueOrder::Fifo).unwrap());
        let mut takers = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            takers.push(tokio::spawn(async move { queue.take().await }));
        }
        for i in 0..8 {
            queue.submit(i, 0).await;
        }
        let mut seen = Vec::new();
        for t in takers {
            seen.push(t.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancelled_take_loses_nothing() {
        let queue = BoundedWorkQueue::new(2, QueueOrder::Fifo).unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), queue.take()).await;
        assert!(timed_out.is_err());
        queue.submit(7, 0).await;
        assert_eq!(queue.take().await, 7);
    }
}
