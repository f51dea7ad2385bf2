//! Observability.
//!
//! An [`Observer`] is injected into the facade rather than reached for as a
//! global logger, so a host application can route events to its own metrics
//! system without the mesh core knowing anything about it (design note:
//! "no singleton logger"). [`LoggingObserver`] forwards every event to the
//! `log` facade as a sensible default for anyone who doesn't need more.

use crate::discovery::Route;
use crate::envelope::Priority;
use crate::reliability::MessageId;

/// Events raised by the mesh core as it runs. Each variant carries enough
/// context to build a metric or a log line without the observer needing to
/// reach back into the core's internals.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    DutyCycleDenied { frequency_mhz: f64, wait_ms: u64 },
    DutyCycleDeferred { frequency_mhz: f64, wait_ms: u64 },
    MessageQueued { priority: Priority, queue_depth: usize },
    MessageSent { message_id: MessageId, priority: Priority, compressed_size: usize },
    MessageDelivered { message_id: MessageId, attempts: u32, delivery_time_ms: u64 },
    MessageDeadLettered { message_id: MessageId, attempts: u32 },
    ReassemblyFailed { session_id: u64, reason: String },
    CompressionFallback { reason: String },
    NeighborDiscovered { node_id: u64 },
    NeighborLost { node_id: u64 },
    RouteSelected { destination: u64, route: Route },
}

/// Injected observer for mesh events. Implementations must not block: the
/// facade calls this synchronously from hot paths.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: MeshEvent);
}

/// Forwards every event to the `log` crate at a level appropriate to its
/// severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_event(&self, event: MeshEvent) {
        match &event {
            MeshEvent::DutyCycleDenied { .. } | MeshEvent::ReassemblyFailed { .. } => {
                log::warn!("{event:?}");
            }
            MeshEvent::MessageDeadLettered { .. } | MeshEvent::NeighborLost { .. } => {
                log::warn!("{event:?}");
            }
            MeshEvent::CompressionFallback { .. } | MeshEvent::DutyCycleDeferred { .. } => {
                log::debug!("{event:?}");
            }
            _ => log::trace!("{event:?}"),
        }
    }
}

/// Discards every event. Useful in tests where telemetry noise isn't
/// interesting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: MeshEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_observer_accepts_every_event_variant() {
        let observer = NullObserver;
        observer.on_event(MeshEvent::NeighborDiscovered { node_id: 1 });
        observer.on_event(MeshEvent::CompressionFallback { reason: "test".into() });
    }

    #[test]
    fn logging_observer_forwards_without_panicking() {
        let _ = env_logger::builder().is_test(true).try_init();
        let observer = LoggingObserver;
        observer.on_event(MeshEvent::DutyCycleDenied { frequency_mhz: 868.1, wait_ms: 500 });
        observer.on_event(MeshEvent::MessageDeadLettered { message_id: [0u8; 16], attempts: 3 });
        observer.on_event(MeshEvent::NeighborDiscovered { node_id: 7 });
    }
}
