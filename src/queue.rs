//! The priority send queue.
//!
//! A four-level FIFO with a reserved slice of capacity for CRITICAL
//! traffic, TTL-based expiry applied lazily on dequeue, and an eviction
//! strategy that sacrifices the oldest LOW item first (never CRITICAL) when
//! a higher-priority message needs the room.

use std::collections::VecDeque;

use crate::clock::Clock;
use crate::config::QueueCapacity;
use crate::envelope::Priority;
use crate::error::{MeshError, MeshResult};

/// One queued item: the priority it was admitted at, a monotonically
/// increasing sequence number (insertion order, used for FIFO dequeue
/// within a priority level), its time-to-live, and the caller's payload.
pub struct QueuedItem<T> {
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    pub ttl_ms: u64,
    pub payload: T,
}

/// Running health counters, exposed for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueHealth {
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub expired_total: u64,
    pub evicted_total: u64,
    pub rejected_total: u64,
}

/// Four-level priority queue over an arbitrary payload type.
pub struct PriorityQueue<T, C: Clock> {
    clock: C,
    capacity: QueueCapacity,
    lanes: [VecDeque<QueuedItem<T>>; 4],
    health: QueueHealth,
}

fn lane_index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

fn lane_capacity(capacity: &QueueCapacity, priority: Priority) -> usize {
    match priority {
        Priority::Critical => capacity.critical,
        Priority::High => capacity.high,
        Priority::Normal => capacity.normal,
        Priority::Low => capacity.low,
    }
}

impl<T, C: Clock> PriorityQueue<T, C> {
    pub fn new(clock: C, capacity: QueueCapacity) -> Self {
        PriorityQueue {
            clock,
            capacity,
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new()],
            health: QueueHealth::default(),
        }
    }

    pub fn health(&self) -> QueueHealth {
        self.health
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn total_non_reserved_capacity(&self) -> usize {
        self.capacity.total.saturating_sub(self.capacity.emergency_reserve)
    }

    /// Evict the single oldest LOW item, then NORMAL, then HIGH, never
    /// touching CRITICAL. Returns `true` if something was evicted.
    fn evict_one_victim(&mut self) -> bool {
        for priority in [Priority::Low, Priority::Normal, Priority::High] {
            if self.lanes[lane_index(priority)].pop_front().is_some() {
                self.health.evicted_total += 1;
                return true;
            }
        }
        false
    }

    /// Enqueue `payload` at `priority` with the given TTL. CRITICAL
    /// messages draw on the emergency reserve once the general pool is
    /// full; everything else is rejected (after trying to evict room from
    /// LOW/NORMAL lanes) once its own lane or the general pool is full.
    pub fn enqueue(&mut self, payload: T, priority: Priority, ttl_ms: u64) -> MeshResult<()> {
        let lane_cap = lane_capacity(&self.capacity, priority);
        if self.lanes[lane_index(priority)].len() >= lane_cap {
            if priority == Priority::Critical || !self.evict_one_victim() {
                self.health.rejected_total += 1;
                return Err(MeshError::QueueFull { priority, capacity: lane_cap });
            }
        }

        let budget = if priority == Priority::Critical {
            self.capacity.total
        } else {
            self.total_non_reserved_capacity()
        };
        if self.len() >= budget && !self.evict_one_victim() {
            self.health.rejected_total += 1;
            return Err(MeshError::QueueFull { priority, capacity: budget });
        }

        self.lanes[lane_index(priority)].push_back(QueuedItem {
            priority,
            enqueued_at_ms: self.clock.now_ms(),
            ttl_ms,
            payload,
        });
        self.health.enqueued_total += 1;
        Ok(())
    }

    /// Dequeue the next item in CRITICAL > HIGH > NORMAL > LOW order,
    /// skipping (and counting as expired) any item whose TTL has elapsed.
    pub fn dequeue(&mut self) -> Option<T> {
        let now = self.clock.now_ms();
        for priority in Priority::ALL {
            let lane = &mut self.lanes[lane_index(priority)];
            while let Some(item) = lane.pop_front() {
                if now.saturating_sub(item.enqueued_at_ms) > item.ttl_ms {
                    self.health.expired_total += 1;
                    continue;
                }
                self.health.dequeued_total += 1;
                return Some(item.payload);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn small_capacity() -> QueueCapacity {
        QueueCapacity { total: 10, critical: 4, high: 3, normal: 3, low: 3, emergency_reserve: 2 }
    }

    #[test]
    fn dequeues_in_priority_order() {
        let mut queue = PriorityQueue::new(VirtualClock::new(0), small_capacity());
        queue.enqueue("low", Priority::Low, 10_000).unwrap();
        queue.enqueue("normal", Priority::Normal, 10_000).unwrap();
        queue.enqueue("critical", Priority::Critical, 10_000).unwrap();
        queue.enqueue("high", Priority::High, 10_000).unwrap();

        assert_eq!(queue.dequeue(), Some("critical"));
        assert_eq!(queue.dequeue(), Some("high"));
        assert_eq!(queue.dequeue(), Some("normal"));
        assert_eq!(queue.dequeue(), Some("low"));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut queue = PriorityQueue::new(VirtualClock::new(0), small_capacity());
        queue.enqueue("first", Priority::Normal, 10_000).unwrap();
        queue.enqueue("second", Priority::Normal, 10_000).unwrap();
        assert_eq!(queue.dequeue(), Some("first"));
        assert_eq!(queue.dequeue(), Some("second"));
    }

    #[test]
    fn expired_items_are_skipped_on_dequeue() {
        let mut queue = PriorityQueue::new(VirtualClock::new(0), small_capacity());
        queue.enqueue("stale", Priority::Normal, 100).unwrap();
        queue.clock().advance(500);
        queue.enqueue("fresh", Priority::Normal, 100_000).unwrap();

        assert_eq!(queue.dequeue(), Some("fresh"));
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.health().expired_total, 1);
    }

    #[test]
    fn low_priority_is_evicted_to_make_room_for_critical() {
        let mut queue = PriorityQueue::new(VirtualClock::new(0), small_capacity());
        for i in 0..3 {
            queue.enqueue(format!("low-{i}"), Priority::Low, 10_000).unwrap();
        }
        for i in 0..3 {
            queue.enqueue(format!("normal-{i}"), Priority::Normal, 10_000).unwrap();
        }
        queue.enqueue("high-0".to_string(), Priority::High, 10_000).unwrap();
        queue.enqueue("critical-0".to_string(), Priority::Critical, 10_000).unwrap();
        queue.enqueue("critical-1".to_string(), Priority::Critical, 10_000).unwrap();
        assert_eq!(queue.len(), 10);

        // The queue is now at its total capacity of 10. A further CRITICAL
        // enqueue must evict a LOW item to make room rather than reject.
        queue.enqueue("critical-2".to_string(), Priority::Critical, 10_000).unwrap();
        assert!(queue.health().evicted_total >= 1);
        assert_eq!(queue.dequeue(), Some("critical-0".to_string()));
    }

    #[test]
    fn high_priority_is_evicted_when_low_and_normal_are_empty() {
        let capacity = QueueCapacity { total: 5, critical: 3, high: 3, normal: 0, low: 0, emergency_reserve: 0 };
        let mut queue = PriorityQueue::new(VirtualClock::new(0), capacity);
        for i in 0..3 {
            queue.enqueue(format!("high-{i}"), Priority::High, 10_000).unwrap();
        }
        queue.enqueue("critical-0".to_string(), Priority::Critical, 10_000).unwrap();
        queue.enqueue("critical-1".to_string(), Priority::Critical, 10_000).unwrap();
        assert_eq!(queue.len(), 5);

        // The queue is at its total budget; LOW and NORMAL are both empty,
        // so a further CRITICAL enqueue must fall back to evicting the
        // oldest HIGH item rather than reject.
        queue.enqueue("critical-2".to_string(), Priority::Critical, 10_000).unwrap();
        assert_eq!(queue.health().evicted_total, 1);
        assert_eq!(queue.dequeue(), Some("critical-0".to_string()));
        assert_eq!(queue.dequeue(), Some("critical-1".to_string()));
        assert_eq!(queue.dequeue(), Some("critical-2".to_string()));
        assert_eq!(queue.dequeue(), Some("high-1".to_string()));
        assert_eq!(queue.dequeue(), Some("high-2".to_string()));
    }

    #[test]
    fn full_lane_rejects_when_no_eviction_possible() {
        let mut queue = PriorityQueue::new(VirtualClock::new(0), small_capacity());
        for i in 0..4 {
            queue.enqueue(format!("critical-{i}"), Priority::Critical, 10_000).unwrap();
        }
        let result = queue.enqueue("critical-overflow".to_string(), Priority::Critical, 10_000);
        assert!(matches!(result, Err(MeshError::QueueFull { .. })));
    }
}
