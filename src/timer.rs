use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use slab::Slab;

/// The object an armed timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerOwner {
    Socket(usize),
    Server(usize),
}

/// Handle to an armed timer. Stale after the timer fires or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerId {
    index: usize,
    generation: u64,
}

struct TimerSlot {
    generation: u64,
    owner: TimerOwner,
    deadline: Instant,
}

struct HeapEntry {
    deadline: Instant,
    index: usize,
    generation: u64,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline
// sits on top.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for HeapEntry {}

/// One-shot timers with lazy cancellation.
///
/// Cancelled or superseded timers leave stale heap entries behind; they are
/// discarded when popped by comparing the entry's generation against the
/// live slot. Slots are vacated when a timer fires or is cancelled.
pub(crate) struct TimerTable {
    slots: Slab<TimerSlot>,
    heap: BinaryHeap<HeapEntry>,
    next_generation: u64,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        TimerTable {
            slots: Slab::new(),
            heap: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    /// Arm a one-shot timer firing `delay` from now.
    pub(crate) fn arm(&mut self, owner: TimerOwner, delay: Duration) -> TimerId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let deadline = Instant::now() + delay;
        let index = self.slots.insert(TimerSlot {
            generation,
            owner,
            deadline,
        });
        self.heap.push(HeapEntry {
            deadline,
            index,
            generation,
        });
        TimerId { index, generation }
    }

    /// Cancel an armed timer. A stale id is a no-op.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get(id.index) {
            if slot.generation == id.generation {
                self.slots.remove(id.index);
            }
        }
    }

    /// The earliest live deadline, discarding stale heap entries.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            match self.slots.get(top.index) {
                Some(slot) if slot.generation == top.generation => return Some(top.deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop one due timer, vacating its slot. Returns its owner.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerOwner> {
        loop {
            let top = self.heap.peek()?;
            let live = self
                .slots
                .get(top.index)
                .is_some_and(|slot| slot.generation == top.generation);
            if !live {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry vanished");
            let slot = self.slots.remove(entry.index);
            return Some(slot.owner);
        }
    }
}
