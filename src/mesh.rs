//! The mesh protocol facade.
//!
//! [`MeshNode`] wires every other component together behind one API:
//! `send` builds an outgoing message, the worker loops move fragments
//! across the radio, retry and beacon cadence, and inbound reassembly all
//! run as plain async functions a host application spawns onto its own
//! executor rather than tasks this crate spawns itself, so it stays usable
//! from both an `embassy-executor` single-thread reactor and a conventional
//! multi-threaded async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};

use crate::airtime::{self, RadioParameters};
use crate::clock::SharedClock;
use crate::compression::{Codec, CompressionConstraints, CompressionPipeline};
use crate::config::{Configuration, FrequencyPlan};
use crate::discovery::{Beacon, Capabilities, NeighborTable, NodeType};
use crate::duty_cycle::{Admission, DutyCycleGovernor, TransmissionRecord};
use crate::envelope::{ApplicationMessage, MessageClass, Priority, SignedPayload};
use crate::error::{MeshError, MeshResult};
use crate::fragmentation::{Fragment, Fragmenter, Reassembler, ReassemblyOutcome};
use crate::queue::PriorityQueue;
use crate::radio::{BlockchainClient, CryptoProvider, RadioDriver, ReceivedFrame};
use crate::reliability::{MessageId, ReliabilityClass, ReliabilityTracker, RetryAction};
use crate::telemetry::{MeshEvent, NullObserver, Observer};

/// One outstanding fragment queued for transmission.
struct QueuedFragment {
    message_id: MessageId,
    frequency_mhz: f64,
    fragment: Fragment,
}

fn message_class_to_reliability(class: &MessageClass) -> ReliabilityClass {
    match class {
        MessageClass::Beacon => ReliabilityClass::BestEffort,
        MessageClass::RouteRequest | MessageClass::RouteReply | MessageClass::RouteError => {
            ReliabilityClass::BestEffort
        }
        MessageClass::Ack | MessageClass::Nack => ReliabilityClass::BestEffort,
        _ => ReliabilityClass::Confirmed,
    }
}

/// Construction-time dependencies for a [`MeshNode`].
pub struct MeshNodeDeps {
    pub node_id: u64,
    pub node_type: NodeType,
    pub capabilities: Capabilities,
    pub configuration: Configuration,
    pub frequency_plan: FrequencyPlan,
    pub radio_params: RadioParameters,
    pub clock: SharedClock,
    pub radio: Arc<dyn RadioDriver>,
    pub blockchain: Arc<dyn BlockchainClient>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub observer: Arc<dyn Observer>,
}

impl MeshNodeDeps {
    /// Convenience constructor with a [`NullObserver`], for callers that
    /// don't need telemetry wired up yet.
    #[allow(clippy::too_many_arguments)]
    pub fn without_observer(
        node_id: u64,
        node_type: NodeType,
        capabilities: Capabilities,
        configuration: Configuration,
        frequency_plan: FrequencyPlan,
        radio_params: RadioParameters,
        clock: SharedClock,
        radio: Arc<dyn RadioDriver>,
        blockchain: Arc<dyn BlockchainClient>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        MeshNodeDeps {
            node_id,
            node_type,
            capabilities,
            configuration,
            frequency_plan,
            radio_params,
            clock,
            radio,
            blockchain,
            crypto,
            observer: Arc::new(NullObserver),
        }
    }
}

type NodeMutex<T> = Mutex<CriticalSectionRawMutex, T>;

/// The mesh transport core for one node.
///
/// Holds every stateful component behind its own lock so the worker loops
/// below can run concurrently without any one of them blocking the others
/// for longer than a single operation.
pub struct MeshNode {
    node_id: u64,
    node_type: NodeType,
    capabilities: Capabilities,
    configuration: Configuration,
    radio_params: RadioParameters,
    clock: SharedClock,
    duty_cycle: NodeMutex<DutyCycleGovernor<SharedClock>>,
    compression: NodeMutex<CompressionPipeline>,
    fragmenter: NodeMutex<Fragmenter>,
    reassembler: NodeMutex<Reassembler<SharedClock>>,
    send_queue: NodeMutex<PriorityQueue<QueuedFragment, SharedClock>>,
    reliability: NodeMutex<ReliabilityTracker<SharedClock>>,
    neighbors: NodeMutex<NeighborTable<SharedClock>>,
    sequence_counter: NodeMutex<u64>,
    radio: Arc<dyn RadioDriver>,
    blockchain: Arc<dyn BlockchainClient>,
    crypto: Arc<dyn CryptoProvider>,
    observer: Arc<dyn Observer>,
    /// Set to request the worker loops below stop after their current
    /// sleep interval elapses.
    pub shutdown: AtomicBool,
}

impl MeshNode {
    pub fn new(deps: MeshNodeDeps) -> Self {
        let window_ms = 3_600_000;
        let duty_cycle = DutyCycleGovernor::new(deps.clock.clone(), deps.frequency_plan.clone(), window_ms);
        let compression =
            CompressionPipeline::new(deps.configuration.compression_threshold, deps.configuration.max_expansion_ratio);
        let fragmenter = Fragmenter::new(1);
        let reassembler = Reassembler::new(
            deps.clock.clone(),
            deps.configuration.session_timeout_ms,
            deps.configuration.max_concurrent_sessions,
        );
        let send_queue = PriorityQueue::new(deps.clock.clone(), deps.configuration.queue_capacity);
        let reliability = ReliabilityTracker::with_retry_overrides(
            deps.clock.clone(),
            deps.configuration.reliable_max_pending_messages,
            deps.configuration.retry_policies_by_class.clone(),
        );
        let neighbors = NeighborTable::new(
            deps.clock.clone(),
            deps.configuration.neighbor_timeout_ms,
            deps.configuration.max_neighbors,
        );

        MeshNode {
            node_id: deps.node_id,
            node_type: deps.node_type,
            capabilities: deps.capabilities,
            configuration: deps.configuration,
            radio_params: deps.radio_params,
            clock: deps.clock,
            duty_cycle: Mutex::new(duty_cycle),
            compression: Mutex::new(compression),
            fragmenter: Mutex::new(fragmenter),
            reassembler: Mutex::new(reassembler),
            send_queue: Mutex::new(send_queue),
            reliability: Mutex::new(reliability),
            neighbors: Mutex::new(neighbors),
            sequence_counter: Mutex::new(0),
            radio: deps.radio,
            blockchain: deps.blockchain,
            crypto: deps.crypto,
            observer: deps.observer,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    async fn next_sequence(&self) -> u64 {
        let mut counter = self.sequence_counter.lock().await;
        *counter = counter.wrapping_add(1);
        *counter
    }

    fn default_frequency_mhz(&self) -> f64 {
        self.configuration
            .region
            .eq_ignore_ascii_case("US")
            .then_some(915.0)
            .unwrap_or(868.1)
    }

    fn new_message_id(&self, sequence: u64) -> MessageId {
        let mut seed = Vec::with_capacity(16);
        seed.extend_from_slice(&self.node_id.to_be_bytes());
        seed.extend_from_slice(&sequence.to_be_bytes());
        let hash = self.crypto.hash(&seed);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        id
    }

    /// Sign and wrap `body` for `class`, then compress, fragment, and
    /// enqueue it for transmission. Returns the message id the caller can
    /// use to correlate a later [`MeshEvent::MessageDelivered`] or
    /// [`MeshEvent::MessageDeadLettered`].
    pub async fn send(&self, class: MessageClass, body: Vec<u8>) -> MeshResult<MessageId> {
        let priority = class.default_priority();
        let sequence = self.next_sequence().await;
        let timestamp_ms = self.clock.now_ms();

        let mut payload = SignedPayload {
            originator: self.node_id,
            sequence,
            timestamp_ms,
            body,
            signature: Vec::new(),
        };
        payload.signature = self.crypto.sign(&payload.signing_bytes());

        let message = wrap_payload(&class, payload);
        let encoded = serde_json::to_vec(&message)
            .map_err(|e| MeshError::MalformedEnvelope { reason: format!("encode failed: {e}") })?;

        let remaining_airtime = {
            let mut duty_cycle = self.duty_cycle.lock().await;
            Some(duty_cycle.remaining_airtime_ms(self.default_frequency_mhz()))
        };

        let blob = {
            let mut compression = self.compression.lock().await;
            compression.compress(
                &encoded,
                class,
                &self.configuration.region,
                CompressionConstraints::default(),
                remaining_airtime,
            )?
        };
        let compressed_bytes = blob.encode();

        let message_id = self.new_message_id(sequence);
        let max_payload = self.configuration.max_fragment_payload();
        let fragments = {
            let mut fragmenter = self.fragmenter.lock().await;
            fragmenter.fragment(&compressed_bytes, max_payload)
        };

        let frequency_mhz = self.default_frequency_mhz();
        let reliability_class = message_class_to_reliability(&class);
        {
            let mut reliability = self.reliability.lock().await;
            reliability.track(message_id, priority, reliability_class, fragments.clone(), frequency_mhz)?;
        }

        {
            let mut queue = self.send_queue.lock().await;
            for fragment in fragments {
                queue.enqueue(
                    QueuedFragment { message_id, frequency_mhz, fragment },
                    priority,
                    self.configuration.session_timeout_ms,
                )?;
            }
        }

        self.observer.on_event(MeshEvent::MessageSent {
            message_id,
            priority,
            compressed_size: compressed_bytes.len(),
        });
        Ok(message_id)
    }

    /// Dequeue and transmit one fragment, honoring the duty-cycle
    /// governor's admission decision. Returns `true` if a fragment was
    /// handled (transmitted, deferred, or denied) so the caller's loop can
    /// decide how long to wait before calling again.
    async fn send_one(&self) -> bool {
        let item = {
            let mut queue = self.send_queue.lock().await;
            queue.dequeue()
        };
        let Some(item) = item else { return false };

        let wire_bytes = item.fragment.encode();
        let estimated_ms = airtime::estimate_airtime_ms(wire_bytes.len(), &self.radio_params).ceil() as u64;

        let admission = {
            let mut duty_cycle = self.duty_cycle.lock().await;
            duty_cycle.can_transmit(estimated_ms, Priority::Normal, item.frequency_mhz)
        };

        match admission {
            Admission::Allow => {
                let _ = self.radio.transmit(item.frequency_mhz, &wire_bytes);
                let mut duty_cycle = self.duty_cycle.lock().await;
                duty_cycle.record_transmission(TransmissionRecord {
                    start_ms: self.clock.now_ms(),
                    duration_ms: estimated_ms,
                    frequency_mhz: item.frequency_mhz,
                    power_dbm: self.radio_params_power_dbm(),
                    priority: Priority::Normal,
                });
            }
            Admission::Defer { wait_ms } => {
                self.observer.on_event(MeshEvent::DutyCycleDeferred { frequency_mhz: item.frequency_mhz, wait_ms });
                let mut queue = self.send_queue.lock().await;
                let _ = queue.enqueue(item, Priority::Normal, self.configuration.session_timeout_ms);
            }
            Admission::Deny { .. } => {
                self.observer
                    .on_event(MeshEvent::DutyCycleDenied { frequency_mhz: item.frequency_mhz, wait_ms: 0 });
            }
        }
        true
    }

    fn radio_params_power_dbm(&self) -> f32 {
        14.0
    }

    /// Feed one inbound radio frame through CRC verification, reassembly,
    /// decompression, signature verification, and dispatch.
    async fn handle_frame(&self, frame: &ReceivedFrame) -> MeshResult<()> {
        let fragment = Fragment::decode(&frame.bytes)?;
        let outcome = {
            let mut reassembler = self.reassembler.lock().await;
            reassembler.accept(fragment)?
        };

        let ReassemblyOutcome::Complete(joined) = outcome else {
            return Ok(());
        };

        let blob = crate::compression::CompressedBlob::decode(&joined)?;
        let decoded = {
            let compression = self.compression.lock().await;
            compression.decompress(&blob)?
        };

        let message: ApplicationMessage = serde_json::from_slice(&decoded)
            .map_err(|e| MeshError::MalformedEnvelope { reason: format!("decode failed: {e}") })?;

        self.dispatch(message, frame.rssi_dbm).await
    }

    async fn dispatch(&self, message: ApplicationMessage, rssi_dbm: Option<f32>) -> MeshResult<()> {
        match message {
            ApplicationMessage::Ack(ack) => {
                let acked = {
                    let mut reliability = self.reliability.lock().await;
                    reliability.acknowledge(ack.message_id, ack.received_fragments)
                };
                if let Some((attempts, delivery_time_ms)) = acked {
                    self.observer.on_event(MeshEvent::MessageDelivered {
                        message_id: ack.message_id,
                        attempts,
                        delivery_time_ms,
                    });
                }
                Ok(())
            }
            ApplicationMessage::Nack(nack) => {
                let mut reliability = self.reliability.lock().await;
                reliability.nack(nack.message_id);
                Ok(())
            }
            ApplicationMessage::Beacon(payload) => self.handle_beacon(payload, rssi_dbm).await,
            ApplicationMessage::Block(payload) => {
                if self.crypto.verify(&payload.signing_bytes(), &payload.signature, payload.originator) {
                    self.blockchain.apply_block(&payload.body)
                } else {
                    Err(MeshError::SignatureInvalid { originator: payload.originator })
                }
            }
            ApplicationMessage::UtxoTransaction(payload) => {
                if self.crypto.verify(&payload.signing_bytes(), &payload.signature, payload.originator) {
                    self.blockchain.verify_transaction(&payload.body).map(|_| ())
                } else {
                    Err(MeshError::SignatureInvalid { originator: payload.originator })
                }
            }
            ApplicationMessage::MerkleProof(_)
            | ApplicationMessage::RouteRequest(_)
            | ApplicationMessage::RouteReply(_)
            | ApplicationMessage::RouteError(_) => Ok(()),
        }
    }

    async fn handle_beacon(&self, payload: SignedPayload, rssi_dbm: Option<f32>) -> MeshResult<()> {
        if self.configuration.enable_beacon_signing
            && !self.crypto.verify(&payload.signing_bytes(), &payload.signature, payload.originator)
        {
            return Err(MeshError::SignatureInvalid { originator: payload.originator });
        }

        let beacon: Beacon = serde_json::from_slice(&payload.body)
            .map_err(|e| MeshError::MalformedEnvelope { reason: format!("bad beacon body: {e}") })?;
        if beacon.node_id != payload.originator {
            return Err(MeshError::SignatureInvalid { originator: payload.originator });
        }
        let mut neighbors = self.neighbors.lock().await;
        let is_new = neighbors.get(beacon.node_id).is_none();
        neighbors.ingest_beacon(&beacon, rssi_dbm)?;
        drop(neighbors);
        if is_new {
            self.observer.on_event(MeshEvent::NeighborDiscovered { node_id: beacon.node_id });
        }
        Ok(())
    }

    /// Build and send this node's own beacon.
    pub async fn send_beacon(&self) -> MeshResult<MessageId> {
        let (advertised_routes, peer_count) = {
            let neighbors = self.neighbors.lock().await;
            (neighbors.advertisable_routes(), neighbors.len() as u32)
        };
        let beacon = Beacon {
            node_id: self.node_id,
            node_type: self.node_type,
            capabilities: self.capabilities,
            supported_codecs: vec![Codec::Lz4, Codec::Gzip],
            max_queue_size: self.configuration.queue_capacity.total as u32,
            duty_cycle_region: self.configuration.region.clone(),
            sequence: self.next_sequence().await,
            timestamp_ms: self.clock.now_ms(),
            block_height: Some(self.blockchain.current_height()),
            peer_count,
            signal_strength: None,
            utxo_set_size: Some(self.blockchain.utxo_set_size()),
            advertised_routes,
        };
        let body = serde_json::to_vec(&beacon)
            .map_err(|e| MeshError::MalformedEnvelope { reason: format!("encode beacon failed: {e}") })?;
        self.send(MessageClass::Beacon, body).await
    }

    /// Pull and process one pending retry-scheduler sweep, re-queuing any
    /// fragments that need retransmission and reporting dead letters.
    async fn retry_sweep(&self) {
        let actions = {
            let mut reliability = self.reliability.lock().await;
            reliability.sweep()
        };
        for action in actions {
            match action {
                RetryAction::Retransmit { message_id, priority, frequency_mhz, fragments, .. } => {
                    let compressed_size: usize = fragments.iter().map(|f| f.payload.len()).sum();
                    {
                        let mut queue = self.send_queue.lock().await;
                        for fragment in fragments {
                            let _ = queue.enqueue(
                                QueuedFragment { message_id, frequency_mhz, fragment },
                                priority,
                                self.configuration.session_timeout_ms,
                            );
                        }
                    }
                    self.observer.on_event(MeshEvent::MessageSent { message_id, priority, compressed_size });
                }
                RetryAction::DeadLetter { message_id } => {
                    self.observer.on_event(MeshEvent::MessageDeadLettered { message_id, attempts: 0 });
                }
            }
        }
    }

    /// Evict expired reassembly sessions and stale neighbors.
    async fn cleanup_sweep(&self) {
        let evicted = {
            let mut reassembler = self.reassembler.lock().await;
            reassembler.evict_expired()
        };
        for session_id in evicted {
            self.observer.on_event(MeshEvent::ReassemblyFailed {
                session_id,
                reason: "session timed out before completion".into(),
            });
        }

        let lost = {
            let mut neighbors = self.neighbors.lock().await;
            neighbors.sweep_expired()
        };
        for node_id in lost {
            self.observer.on_event(MeshEvent::NeighborLost { node_id });
        }
    }
}

fn wrap_payload(class: &MessageClass, payload: SignedPayload) -> ApplicationMessage {
    match class {
        MessageClass::Block => ApplicationMessage::Block(payload),
        MessageClass::UtxoTransaction { .. } => ApplicationMessage::UtxoTransaction(payload),
        MessageClass::MerkleProof => ApplicationMessage::MerkleProof(payload),
        MessageClass::Beacon => ApplicationMessage::Beacon(payload),
        MessageClass::Ack => ApplicationMessage::Ack(crate::envelope::AckPayload {
            message_id: [0u8; 16],
            from_node_id: payload.originator,
            timestamp_ms: payload.timestamp_ms,
            received_fragments: None,
            signature: payload.signature,
        }),
        MessageClass::Nack => ApplicationMessage::Nack(crate::envelope::NackPayload {
            message_id: [0u8; 16],
            from_node_id: payload.originator,
            timestamp_ms: payload.timestamp_ms,
            reason: crate::envelope::NackReason::ValidationFailed,
            signature: payload.signature,
        }),
        MessageClass::RouteRequest => ApplicationMessage::RouteRequest(payload),
        MessageClass::RouteReply => ApplicationMessage::RouteReply(payload),
        MessageClass::RouteError => ApplicationMessage::RouteError(payload),
    }
}

/// Drains queued outgoing fragments through the duty-cycle governor.
/// Spawn this as a task (or `await` it directly in a single-task
/// executor) alongside [`receive_loop`], [`beacon_loop`], [`retry_loop`],
/// and [`cleanup_loop`].
pub async fn send_loop(node: Arc<MeshNode>) {
    while !node.shutdown.load(Ordering::Relaxed) {
        let handled = node.send_one().await;
        let sleep = if handled { Duration::from_millis(20) } else { Duration::from_millis(100) };
        Timer::after(sleep).await;
    }
}

/// Polls the radio for inbound frames and feeds them through reassembly
/// and dispatch.
pub async fn receive_loop(node: Arc<MeshNode>) {
    while !node.shutdown.load(Ordering::Relaxed) {
        if let Some(frame) = node.radio.try_receive() {
            if let Err(error) = node.handle_frame(&frame).await {
                node.observer.on_event(MeshEvent::ReassemblyFailed { session_id: 0, reason: error.to_string() });
            }
            continue;
        }
        Timer::after(Duration::from_millis(20)).await;
    }
}

/// Emits this node's beacon on the configured interval.
pub async fn beacon_loop(node: Arc<MeshNode>) {
    let interval = Duration::from_millis(node.configuration.beacon_interval_ms);
    while !node.shutdown.load(Ordering::Relaxed) {
        let _ = node.send_beacon().await;
        Timer::after(interval).await;
    }
}

/// Sweeps the reliability tracker for due retries and dead letters.
pub async fn retry_loop(node: Arc<MeshNode>) {
    while !node.shutdown.load(Ordering::Relaxed) {
        node.retry_sweep().await;
        Timer::after(Duration::from_millis(250)).await;
    }
}

/// Periodically evicts expired reassembly sessions and stale neighbors.
pub async fn cleanup_loop(node: Arc<MeshNode>) {
    while !node.shutdown.load(Ordering::Relaxed) {
        node.cleanup_sweep().await;
        Timer::after(Duration::from_secs(5)).await;
    }
}
