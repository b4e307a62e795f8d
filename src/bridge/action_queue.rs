use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};

use crate::protocol::ActionKind;

/// One delivered discrete action.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionEvent {
    pub kind: ActionKind,
    pub value: bool,
    pub timestamp: DateTime<Local>,
}

impl ActionEvent {
    pub fn new(kind: ActionKind, value: bool) -> Self {
        Self {
            kind,
            value,
            timestamp: Local::now(),
        }
    }
}

/// FIFO guarded by its own lock. Drained items are gone for good.
#[derive(Debug)]
pub struct ActionQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for ActionQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> ActionQueue<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    /// Take every queued item in enqueue order.
    pub fn drain(&self) -> VecDeque<T> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// One [`ActionQueue`] per [`ActionKind`].
#[derive(Debug, Default)]
pub struct ActionQueues {
    queues: [ActionQueue<ActionEvent>; 7],
}

fn slot(kind: ActionKind) -> usize {
    match kind {
        ActionKind::ReturnToLaunch => 0,
        ActionKind::Automation => 1,
        ActionKind::Capture => 2,
        ActionKind::Indicator => 3,
        ActionKind::Thermal => 4,
        ActionKind::Spray => 5,
        ActionKind::Draw => 6,
    }
}

impl ActionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, kind: ActionKind) -> &ActionQueue<ActionEvent> {
        &self.queues[slot(kind)]
    }

    pub fn push(&self, event: ActionEvent) {
        self.queue(event.kind).push(event);
    }

    /// Empty every queue, returning how many events were discarded.
    pub fn clear_all(&self) -> usize {
        self.queues.iter().map(ActionQueue::clear).sum()
    }

    pub fn total_len(&self) -> usize {
        self.queues.iter().map(ActionQueue::len).sum()
    }
}
