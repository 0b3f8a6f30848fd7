//! Bounded in-order buffers used inside pipeline stages.

use crate::Error;
use std::collections::VecDeque;

/// Fixed-length shift register of optional slots.
///
/// Slot 0 is the head. [`CompactQueue::advance`] shifts every slot towards the
/// head in one step, which models a latency pipeline, while
/// [`CompactQueue::push`] squeezes out interior bubbles so a stalled pipeline
/// keeps filling up behind its head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactQueue<T> {
    name: String,
    slots: Vec<Option<T>>,
}

impl<T> CompactQueue<T> {
    #[must_use]
    pub fn new(name: impl Into<String>, length: usize) -> Self {
        assert!(length > 0, "compact queue needs at least one slot");
        Self {
            name: name.into(),
            slots: (0..length).map(|_| None).collect(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.len()
    }

    /// The head slot, which leaves the queue on the next advance.
    #[must_use]
    pub fn snoop(&self) -> Option<&T> {
        self.slots[0].as_ref()
    }

    /// The most recently entered slot.
    #[must_use]
    pub fn tail(&self) -> Option<&T> {
        self.slots[self.slots.len() - 1].as_ref()
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<T>] {
        &self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().flatten()
    }

    /// Removes bubbles by moving real entries towards the head, keeping their order.
    pub fn compact(&mut self) {
        let mut next = 0;
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_some() {
                self.slots.swap(next, idx);
                next += 1;
            }
        }
    }

    /// Appends `data` behind the youngest entry.
    pub fn push(&mut self, data: T) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::Overflow {
                buffer: self.name.clone(),
                capacity: self.capacity(),
            });
        }
        self.compact();
        let free = self.len();
        self.slots[free] = Some(data);
        Ok(())
    }

    /// Shifts every slot one step towards the head.
    ///
    /// Returns the evicted head and places `data` (or a bubble) in the tail slot.
    pub fn advance(&mut self, data: Option<T>) -> Option<T> {
        let head = self.slots.remove(0);
        self.slots.push(data);
        head
    }

    /// Shifts while the head is blocked.
    ///
    /// The head stays in place and every other entry moves one slot forward
    /// only if that slot is free, so no entry overtakes its latency. `data`
    /// enters the tail slot, which must have been freed.
    pub fn advance_stalled(&mut self, data: Option<T>) -> Result<(), Error> {
        for idx in 1..self.slots.len() {
            if self.slots[idx - 1].is_none() {
                self.slots[idx - 1] = self.slots[idx].take();
            }
        }
        let Some(data) = data else {
            return Ok(());
        };
        let tail = self.slots.len() - 1;
        if self.slots[tail].is_some() {
            return Err(Error::Overflow {
                buffer: self.name.clone(),
                capacity: self.capacity(),
            });
        }
        self.slots[tail] = Some(data);
        Ok(())
    }

    /// Equivalent to advancing with a bubble.
    pub fn pop(&mut self) -> Option<T> {
        self.advance(None)
    }
}

impl<T> std::fmt::Display for CompactQueue<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.name)?;
        for (idx, slot) in self.slots.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            match slot {
                Some(entry) => write!(f, "{entry}")?,
                None => write!(f, "-")?,
            }
        }
        write!(f, ")")
    }
}

/// Bounded first-in first-out queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fifo<T> {
    inner: VecDeque<T>,
    max_size: Option<usize>,
}

impl<T> Fifo<T> {
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: VecDeque::new(),
            max_size,
        }
    }

    /// Enqueues `value`, handing it back when the queue is full.
    pub fn enqueue(&mut self, value: T) -> Result<(), T> {
        if self.full() {
            return Err(value);
        }
        self.inner.push_back(value);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.inner.front()
    }

    #[must_use]
    pub fn full(&self) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() >= max,
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    #[must_use]
    pub fn can_fit(&self, n: usize) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() + n <= max,
            None => true,
        }
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<T> {
        self.inner.iter()
    }
}

/// Ring buffer that overwrites its oldest entry when full.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircularBuffer<T> {
    inner: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "circular buffer needs at least one slot");
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Pushes `value`, returning the overwritten oldest entry if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.is_full() {
            self.inner.pop_front()
        } else {
            None
        };
        self.inner.push_back(value);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    #[must_use]
    pub fn snoop(&self) -> Option<&T> {
        self.inner.front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<T> {
        self.inner.iter()
    }
}

/// Bounded last-in first-out stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stack<T> {
    name: String,
    inner: Vec<T>,
    capacity: usize,
}

impl<T> Stack<T> {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::Overflow {
                buffer: self.name.clone(),
                capacity: self.capacity,
            });
        }
        self.inner.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop()
    }

    /// The top of the stack.
    #[must_use]
    pub fn snoop(&self) -> Option<&T> {
        self.inner.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    pub fn iter(&self) -> std::slice::Iter<T> {
        self.inner.iter()
    }
}
