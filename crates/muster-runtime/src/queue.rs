//! Bounded priority queue of pending events, one per agent.
//!
//! Pop order: highest priority first, first-enqueued-first-served among
//! equals (a monotonic sequence number breaks ties). On overflow the
//! lowest-priority, oldest entry is evicted — but never one that outranks
//! the newcomer; in that case the newcomer is rejected instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use muster_scheduler::TriggerKind;

/// Event priority. Lower rank = served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// What woke the agent up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Periodic wake-up, independent of any task.
    Heartbeat,
    /// A scheduled task came due.
    TaskDue { task_id: String },
    /// Manual or external trigger for a task.
    ExternalTrigger {
        task_id: String,
        trigger: TriggerKind,
    },
}

impl EventKind {
    /// Task id this event is about, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            EventKind::Heartbeat => None,
            EventKind::TaskDue { task_id } | EventKind::ExternalTrigger { task_id, .. } => {
                Some(task_id)
            }
        }
    }
}

/// One queued wake-up for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub event_id: String,
    pub priority: Priority,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic per-queue enqueue order; ties within a priority.
    pub seq: u64,
}

impl PendingEvent {
    pub fn new(priority: Priority, kind: EventKind) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            priority,
            kind,
            payload: Value::Null,
            enqueued_at: Utc::now(),
            seq: 0,
        }
    }
}

/// What happened to a pushed event.
#[derive(Debug, PartialEq)]
pub enum EnqueueResult {
    Queued,
    /// Queued, at the cost of evicting a lower-priority entry.
    Evicted(PendingEvent),
    /// Queue full of entries that rank at or above the newcomer.
    Rejected(PendingEvent),
}

/// Bounded, priority-ordered event queue.
#[derive(Debug)]
pub struct PriorityEventQueue {
    entries: Vec<PendingEvent>,
    capacity: usize,
    next_seq: u64,
}

impl PriorityEventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a task already has a queued event (due-event dedup).
    pub fn contains_task(&self, task_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind.task_id() == Some(task_id))
    }

    /// Enqueue, applying the overflow policy at capacity.
    pub fn push(&mut self, mut event: PendingEvent) -> EnqueueResult {
        event.seq = self.next_seq;
        self.next_seq += 1;

        if self.entries.len() < self.capacity {
            self.entries.push(event);
            return EnqueueResult::Queued;
        }

        // Full: find the lowest-priority, oldest entry.
        let victim = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.priority.rank(), std::cmp::Reverse(e.seq)))
            .map(|(i, _)| i);
        match victim {
            Some(i) if self.entries[i].priority.rank() > event.priority.rank() => {
                let evicted = self.entries.swap_remove(i);
                self.entries.push(event);
                EnqueueResult::Evicted(evicted)
            }
            _ => EnqueueResult::Rejected(event),
        }
    }

    /// Pop the highest-priority, oldest-among-equals event.
    pub fn pop(&mut self) -> Option<PendingEvent> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority.rank(), e.seq))
            .map(|(i, _)| i)?;
        Some(self.entries.remove(best))
    }

    /// Put a popped event back untouched (dispatcher pool was saturated).
    /// Keeps its original seq, so ordering is unchanged next tick.
    pub fn restore(&mut self, event: PendingEvent) {
        self.entries.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(priority: Priority, task: &str) -> PendingEvent {
        PendingEvent::new(
            priority,
            EventKind::TaskDue {
                task_id: task.into(),
            },
        )
    }

    #[test]
    fn priority_then_fifo() {
        let mut q = PriorityEventQueue::new(20);
        q.push(event(Priority::Low, "l1"));
        q.push(event(Priority::Normal, "n1"));
        q.push(event(Priority::Normal, "n2"));
        q.push(event(Priority::High, "h1"));

        let order: Vec<_> = std::iter::from_fn(|| q.pop())
            .map(|e| e.kind.task_id().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn overflow_evicts_lowest_priority_oldest() {
        let mut q = PriorityEventQueue::new(2);
        q.push(PendingEvent::new(Priority::Low, EventKind::Heartbeat));
        q.push(event(Priority::Low, "l2"));

        // High newcomer evicts the oldest Low entry (the heartbeat).
        let result = q.push(event(Priority::High, "h1"));
        match result {
            EnqueueResult::Evicted(victim) => assert_eq!(victim.kind, EventKind::Heartbeat),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().kind.task_id(), Some("h1"));
    }

    #[test]
    fn overflow_rejects_newcomer_that_does_not_outrank() {
        let mut q = PriorityEventQueue::new(2);
        q.push(event(Priority::Normal, "n1"));
        q.push(event(Priority::Normal, "n2"));

        let result = q.push(event(Priority::Normal, "n3"));
        assert!(matches!(result, EnqueueResult::Rejected(_)));
        let result = q.push(PendingEvent::new(Priority::Low, EventKind::Heartbeat));
        assert!(matches!(result, EnqueueResult::Rejected(_)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn restore_keeps_original_order() {
        let mut q = PriorityEventQueue::new(20);
        q.push(event(Priority::Normal, "n1"));
        q.push(event(Priority::Normal, "n2"));

        let popped = q.pop().unwrap();
        assert_eq!(popped.kind.task_id(), Some("n1"));
        q.restore(popped);
        // n1 is still first in line.
        assert_eq!(q.pop().unwrap().kind.task_id(), Some("n1"));
    }

    #[test]
    fn task_dedup_lookup() {
        let mut q = PriorityEventQueue::new(20);
        q.push(event(Priority::Normal, "t1"));
        assert!(q.contains_task("t1"));
        assert!(!q.contains_task("t2"));
    }
}
