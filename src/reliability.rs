//! Reliable delivery.
//!
//! Tracks each outbound message needing confirmation through
//! pending → in_flight → acknowledged | failed, retrying with jittered
//! exponential backoff per [`RetryPolicy`](crate::config::RetryPolicy) and
//! raising back-pressure once too many confirmations are outstanding at
//! once, following the send-window / RTT-driven retransmit model used by
//! reliable UDP-style transports.

use std::collections::HashMap;

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::envelope::Priority;
use crate::error::{MeshError, MeshResult};
use crate::fragmentation::Fragment;

/// Identifies one outbound message across its retry lifetime. Matches the
/// `message_id` field carried in ACK/NACK payloads.
pub type MessageId = [u8; 16];

/// Per-message reliability class. `ForwardOnly` is marked experimental:
/// routing nodes may relay it without tracking delivery state, an open
/// question left unresolved beyond "don't block the retry scheduler on it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityClass {
    BestEffort,
    Confirmed,
    ForwardOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
    Expired,
}

struct PendingMessage {
    priority: Priority,
    class: ReliabilityClass,
    state: DeliveryState,
    attempts: u32,
    max_attempts: u32,
    next_retry_at_ms: u64,
    retry_policy: RetryPolicy,
    frequency_mhz: f64,
    /// The fragments as originally sent, kept so a due retry can
    /// re-enqueue them (or a selective subset of them) without needing to
    /// re-compress or re-fragment the message.
    fragments: Vec<Fragment>,
    total_fragments: u16,
    /// Bitmap of fragments confirmed by the most recent ACK; `None` until
    /// the first ACK arrives.
    acked_fragments: Option<Vec<u8>>,
    created_at_ms: u64,
    last_attempt_at_ms: u64,
}

/// Delivery metrics, exposed for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeliveryMetrics {
    pub sent_total: u64,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub dead_letter_total: u64,
    pub total_delivery_time_ms: u64,
}

impl DeliveryMetrics {
    pub fn success_rate(&self) -> f64 {
        let attempted = self.delivered_total + self.failed_total;
        if attempted == 0 {
            0.0
        } else {
            self.delivered_total as f64 / attempted as f64
        }
    }

    pub fn average_delivery_time_ms(&self) -> f64 {
        if self.delivered_total == 0 {
            0.0
        } else {
            self.total_delivery_time_ms as f64 / self.delivered_total as f64
        }
    }
}

/// An action the caller should take as a result of the retry scheduler
/// sweeping pending messages.
pub enum RetryAction {
    Retransmit {
        message_id: MessageId,
        priority: Priority,
        frequency_mhz: f64,
        /// Fragments to re-enqueue: the full original set, or (after a
        /// selective ACK) just the ones still missing.
        fragments: Vec<Fragment>,
        fragment_indices: Option<Vec<u16>>,
    },
    DeadLetter {
        message_id: MessageId,
    },
}

/// Deterministic jitter source so retry delay tests don't depend on `rand`
/// at the boundary; production callers can still wire real randomness in by
/// providing a non-constant `jitter_fn`.
pub type JitterFn = fn(u64) -> u64;

fn no_jitter(_max: u64) -> u64 {
    0
}

/// Uniform random jitter in `0..=max`, the default production jitter source.
fn random_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::Rng::gen_range(&mut rand::thread_rng(), 0..=max)
}

pub struct ReliabilityTracker<C: Clock> {
    clock: C,
    max_pending_messages: usize,
    pending: HashMap<MessageId, PendingMessage>,
    metrics: DeliveryMetrics,
    jitter_fn: JitterFn,
    retry_overrides: HashMap<String, RetryPolicy>,
}

impl<C: Clock> ReliabilityTracker<C> {
    pub fn new(clock: C, max_pending_messages: usize) -> Self {
        Self::with_retry_overrides(clock, max_pending_messages, HashMap::new())
    }

    /// Like [`Self::new`], but resolving each message's retry policy
    /// through [`RetryPolicy::resolve`] against `retry_overrides` first,
    /// falling back to the built-in per-priority defaults.
    pub fn with_retry_overrides(
        clock: C,
        max_pending_messages: usize,
        retry_overrides: HashMap<String, RetryPolicy>,
    ) -> Self {
        ReliabilityTracker {
            clock,
            max_pending_messages,
            pending: HashMap::new(),
            metrics: DeliveryMetrics::default(),
            jitter_fn: random_jitter,
            retry_overrides,
        }
    }

    /// Override the jitter source, primarily for deterministic tests of the
    /// backoff schedule.
    pub fn with_jitter_fn(mut self, jitter_fn: JitterFn) -> Self {
        self.jitter_fn = jitter_fn;
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn metrics(&self) -> DeliveryMetrics {
        self.metrics
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .values()
            .filter(|m| matches!(m.state, DeliveryState::Pending | DeliveryState::InFlight))
            .count()
    }

    /// Register a newly sent message for delivery tracking. Only
    /// [`ReliabilityClass::Confirmed`] messages count against
    /// `max_pending_messages`; `BestEffort` and `ForwardOnly` are tracked
    /// for metrics only and never retried. `fragments` and `frequency_mhz`
    /// are retained so a later due retry can actually retransmit them.
    pub fn track(
        &mut self,
        message_id: MessageId,
        priority: Priority,
        class: ReliabilityClass,
        fragments: Vec<Fragment>,
        frequency_mhz: f64,
    ) -> MeshResult<()> {
        if class == ReliabilityClass::Confirmed && self.pending_count() >= self.max_pending_messages {
            return Err(MeshError::BackPressure {
                pending: self.pending_count(),
                max_pending: self.max_pending_messages,
            });
        }

        let retry_policy = RetryPolicy::resolve(priority, &self.retry_overrides);
        let now = self.clock.now_ms();
        let total_fragments = fragments.len() as u16;
        self.pending.insert(
            message_id,
            PendingMessage {
                priority,
                class,
                state: DeliveryState::InFlight,
                attempts: 1,
                max_attempts: retry_policy.max_attempts,
                next_retry_at_ms: now + retry_policy.initial_delay_ms,
                retry_policy,
                frequency_mhz,
                fragments,
                total_fragments,
                acked_fragments: None,
                created_at_ms: now,
                last_attempt_at_ms: now,
            },
        );
        self.metrics.sent_total += 1;
        Ok(())
    }

    /// Record an ACK. A full ACK (no fragment bitmap, or a bitmap covering
    /// every fragment) completes the message and returns its
    /// `(attempts, delivery_time_ms)`; a partial bitmap narrows the set of
    /// fragments the next retry needs to resend and returns `None`.
    pub fn acknowledge(&mut self, message_id: MessageId, received_fragments: Option<Vec<u8>>) -> Option<(u32, u64)> {
        let message = self.pending.get_mut(&message_id)?;

        let fully_acked = match &received_fragments {
            None => true,
            Some(bitmap) => all_fragments_set(bitmap, message.total_fragments),
        };

        if fully_acked {
            let attempts = message.attempts;
            let delivery_time = self.clock.now_ms().saturating_sub(message.created_at_ms);
            self.metrics.delivered_total += 1;
            self.metrics.total_delivery_time_ms += delivery_time;
            self.pending.remove(&message_id);
            Some((attempts, delivery_time))
        } else {
            message.acked_fragments = received_fragments;
            message.state = DeliveryState::InFlight;
            None
        }
    }

    /// Record a NACK: forces an immediate retry regardless of backoff
    /// schedule, since the peer has explicitly signaled it needs the data
    /// resent now.
    pub fn nack(&mut self, message_id: MessageId) {
        if let Some(message) = self.pending.get_mut(&message_id) {
            message.next_retry_at_ms = self.clock.now_ms();
        }
    }

    /// Missing fragment indices for a partially-acknowledged message,
    /// used to build a selective retransmission.
    fn missing_fragments(message: &PendingMessage) -> Option<Vec<u16>> {
        let bitmap = message.acked_fragments.as_ref()?;
        let missing: Vec<u16> = (0..message.total_fragments)
            .filter(|&index| !bit_is_set(bitmap, index))
            .collect();
        Some(missing)
    }

    /// The fragments a retry should actually resend: every stored fragment,
    /// or (after a selective ACK) only the ones at a missing index.
    fn fragments_to_resend(message: &PendingMessage, fragment_indices: &Option<Vec<u16>>) -> Vec<Fragment> {
        match fragment_indices {
            None => message.fragments.clone(),
            Some(indices) => message
                .fragments
                .iter()
                .filter(|f| indices.contains(&f.fragment_index))
                .cloned()
                .collect(),
        }
    }

    /// Sweep all pending messages: anything past its `next_retry_at_ms`
    /// either gets rescheduled with backoff (if attempts remain) or is
    /// dead-lettered (if attempts are exhausted).
    pub fn sweep(&mut self) -> Vec<RetryAction> {
        let now = self.clock.now_ms();
        let mut actions = Vec::new();
        let mut dead_letters = Vec::new();

        for (message_id, message) in self.pending.iter_mut() {
            if message.state == DeliveryState::Acknowledged {
                continue;
            }
            if now < message.next_retry_at_ms {
                continue;
            }

            if message.attempts >= message.max_attempts {
                message.state = DeliveryState::Failed;
                dead_letters.push(*message_id);
                continue;
            }

            message.attempts += 1;
            message.last_attempt_at_ms = now;
            let backoff = (message.retry_policy.initial_delay_ms as f64
                * message.retry_policy.backoff_multiplier.powi((message.attempts - 1) as i32))
                .min(message.retry_policy.max_delay_ms as f64) as u64;
            let jitter = (self.jitter_fn)(message.retry_policy.jitter_max_ms);
            message.next_retry_at_ms = now + backoff + jitter;

            let fragment_indices = Self::missing_fragments(message);
            let fragments = Self::fragments_to_resend(message, &fragment_indices);
            actions.push(RetryAction::Retransmit {
                message_id: *message_id,
                priority: message.priority,
                frequency_mhz: message.frequency_mhz,
                fragments,
                fragment_indices,
            });
        }

        for message_id in dead_letters {
            self.metrics.failed_total += 1;
            self.metrics.dead_letter_total += 1;
            self.pending.remove(&message_id);
            actions.push(RetryAction::DeadLetter { message_id });
        }

        actions
    }
}

fn bit_is_set(bitmap: &[u8], index: u16) -> bool {
    let byte = index as usize / 8;
    let bit = index as usize % 8;
    bitmap.get(byte).map(|b| b & (1 << bit) != 0).unwrap_or(false)
}

fn all_fragments_set(bitmap: &[u8], total_fragments: u16) -> bool {
    (0..total_fragments).all(|index| bit_is_set(bitmap, index))
}
