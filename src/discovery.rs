//! Neighbor discovery and routing.
//!
//! Periodic signed beacons build a neighbor table with a liveness window;
//! routes are chosen direct-first, falling back to the best-scoring
//! combination of neighbor quality and the neighbor's own advertised route
//! quality. Beacon sequence numbers give replay and out-of-order rejection
//! the same way the envelope signing contract does for application messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::compression::Codec;
use crate::error::{MeshError, MeshResult};

/// Whether a node keeps a full UTXO set or just enough to relay and verify
/// merkle proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Light,
    Full,
}

/// What a node is willing to do for the mesh beyond carrying its own
/// traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub mining: bool,
    pub relay: bool,
    pub supports_utxo_routing: bool,
}

/// One destination a neighbor claims it can reach, at what quality and hop
/// count — the unit of route propagation carried in a [`Beacon`]. Without
/// this, a neighbor's own routing knowledge has nowhere to ride along on
/// the beacon it already sends, and `route_to`'s `combined = q_n · r.quality`
/// computation would have no `r` to read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteAdvertisement {
    pub destination: u64,
    pub quality: f64,
    pub hop_count: u32,
}

/// A periodic liveness/capability broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub node_id: u64,
    pub node_type: NodeType,
    pub capabilities: Capabilities,
    pub supported_codecs: Vec<Codec>,
    pub max_queue_size: u32,
    pub duty_cycle_region: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub block_height: Option<u64>,
    pub peer_count: u32,
    /// Self-reported observed link quality, `0..=100`. The neighbor table
    /// prefers an actually-observed RSSI when the radio supplies one and
    /// falls back to this.
    pub signal_strength: Option<u8>,
    pub utxo_set_size: Option<u64>,
    pub advertised_routes: Vec<RouteAdvertisement>,
}

/// What we know about one neighbor, refreshed on every beacon received
/// from it.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborEntry {
    pub node_id: u64,
    /// Modeled as the same identity `CryptoProvider::verify` treats as the
    /// signer, since this crate's key material is an opaque node id rather
    /// than raw public-key bytes.
    pub public_key: u64,
    pub node_type: NodeType,
    pub capabilities: Capabilities,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub beacon_sequence: u64,
    /// Observed (or, absent that, self-reported) link quality, `0..=100`.
    pub signal_strength: u8,
    pub hop_distance: u32,
    pub supported_codecs: Vec<Codec>,
    pub queue_capacity: u32,
    pub duty_cycle_region: String,
    pub advertised_routes: Vec<RouteAdvertisement>,
    pub is_stale: bool,
}

/// Codecs this node supports, in preference order, used to intersect
/// against a neighbor's advertised set.
const OUR_CODECS: [Codec; 2] = [Codec::Lz4, Codec::Gzip];

impl NeighborEntry {
    /// Quality score in `0.0..=1.0`, weighting signal strength, node type,
    /// recency, and routing-relevant capabilities.
    pub fn quality_score(&self, now_ms: u64, neighbor_timeout_ms: u64) -> f64 {
        let signal = self.signal_strength as f64 / 100.0;
        let full_node = if self.node_type == NodeType::Full { 1.0 } else { 0.0 };
        let age_ms = now_ms.saturating_sub(self.last_seen_ms);
        let recency = if neighbor_timeout_ms == 0 {
            0.0
        } else {
            (1.0 - age_ms as f64 / neighbor_timeout_ms as f64).max(0.0)
        };
        let supports_utxo = if self.capabilities.supports_utxo_routing { 1.0 } else { 0.0 };
        let can_mine = if self.capabilities.mining { 1.0 } else { 0.0 };

        let quality =
            0.5 + 0.3 * signal + 0.2 * full_node + 0.2 * recency + 0.1 * supports_utxo + 0.1 * can_mine;
        quality.clamp(0.0, 1.0)
    }

    /// Codecs both this node and the neighbor support, in our preference
    /// order.
    pub fn codec_intersection_with(&self) -> Vec<Codec> {
        OUR_CODECS.into_iter().filter(|codec| self.supported_codecs.contains(codec)).collect()
    }
}

/// How a destination can currently be reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub destination: u64,
    pub next_hop: u64,
    pub hop_count: u32,
    pub quality: f64,
    pub last_updated_ms: u64,
    pub codec_intersection: Vec<Codec>,
    pub estimated_delay_ms: u64,
}

/// Heuristic one-way delay estimate: a fixed per-hop cost, inflated for
/// lower-quality links. Not given an exact formula upstream, so this is a
/// deliberately simple monotonic function of both inputs.
fn estimated_delay_ms(hop_count: u32, quality: f64) -> u64 {
    let base_per_hop_ms = 500u64;
    let quality_penalty_ms = ((1.0 - quality.clamp(0.0, 1.0)) * 1000.0) as u64;
    hop_count as u64 * base_per_hop_ms + quality_penalty_ms
}

pub struct NeighborTable<C: Clock> {
    clock: C,
    neighbor_timeout_ms: u64,
    max_neighbors: usize,
    neighbors: HashMap<u64, NeighborEntry>,
}

impl<C: Clock> NeighborTable<C> {
    pub fn new(clock: C, neighbor_timeout_ms: u64, max_neighbors: usize) -> Self {
        NeighborTable { clock, neighbor_timeout_ms, max_neighbors, neighbors: HashMap::new() }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn get(&self, node_id: u64) -> Option<&NeighborEntry> {
        self.neighbors.get(&node_id)
    }

    /// Ingest a beacon, rejecting out-of-order/duplicate sequence numbers
    /// (beacon sequence supersedence). `observed_rssi_dbm` is the radio's
    /// measurement for this frame, if the driver supplies one; it takes
    /// priority over the beacon's own self-reported `signal_strength`.
    pub fn ingest_beacon(&mut self, beacon: &Beacon, observed_rssi_dbm: Option<f32>) -> MeshResult<()> {
        let now = self.clock.now_ms();

        if let Some(existing) = self.neighbors.get(&beacon.node_id) {
            if beacon.sequence <= existing.beacon_sequence {
                return Err(MeshError::SequenceStale {
                    originator: beacon.node_id,
                    sequence: beacon.sequence,
                    last_seen: existing.beacon_sequence,
                });
            }
        } else if self.neighbors.len() >= self.max_neighbors {
            self.evict_stale(now);
            if self.neighbors.len() >= self.max_neighbors {
                return Err(MeshError::NeighborCapacityReached { max_neighbors: self.max_neighbors });
            }
        }

        let signal_strength = signal_strength_from(observed_rssi_dbm, beacon.signal_strength);
        let first_seen_ms = self.neighbors.get(&beacon.node_id).map(|n| n.first_seen_ms).unwrap_or(now);

        self.neighbors.insert(
            beacon.node_id,
            NeighborEntry {
                node_id: beacon.node_id,
                public_key: beacon.node_id,
                node_type: beacon.node_type,
                capabilities: beacon.capabilities,
                first_seen_ms,
                last_seen_ms: now,
                beacon_sequence: beacon.sequence,
                signal_strength,
                hop_distance: 1,
                supported_codecs: beacon.supported_codecs.clone(),
                queue_capacity: beacon.max_queue_size,
                duty_cycle_region: beacon.duty_cycle_region.clone(),
                advertised_routes: beacon.advertised_routes.clone(),
                is_stale: false,
            },
        );
        Ok(())
    }

    /// Drop neighbors not heard from within `neighbor_timeout_ms`, and mark
    /// survivors approaching that timeout as stale so a caller can prefer a
    /// fresher route before the entry actually disappears.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<u64> {
        let timeout = self.neighbor_timeout_ms;
        let expired: Vec<u64> = self
            .neighbors
            .values()
            .filter(|n| now_ms.saturating_sub(n.last_seen_ms) > timeout)
            .map(|n| n.node_id)
            .collect();
        for node_id in &expired {
            self.neighbors.remove(node_id);
        }
        for entry in self.neighbors.values_mut() {
            entry.is_stale = now_ms.saturating_sub(entry.last_seen_ms) > timeout / 2;
        }
        expired
    }

    pub fn sweep_expired(&mut self) -> Vec<u64> {
        let now = self.clock.now_ms();
        self.evict_stale(now)
    }

    /// Best route to `destination`: a direct neighbor wins outright with
    /// `hop_count = 1`; otherwise the indirect route maximizing
    /// `combined = q_n · r.quality` over every neighbor's advertised
    /// routes to `destination`.
    pub fn route_to(&self, destination: u64) -> Option<Route> {
        let now = self.clock.now_ms();
        let timeout = self.neighbor_timeout_ms;

        if let Some(neighbor) = self.neighbors.get(&destination) {
            let quality = neighbor.quality_score(now, timeout);
            return Some(Route {
                destination,
                next_hop: destination,
                hop_count: 1,
                quality,
                last_updated_ms: now,
                codec_intersection: neighbor.codec_intersection_with(),
                estimated_delay_ms: estimated_delay_ms(1, quality),
            });
        }

        self.neighbors
            .values()
            .flat_map(|n| {
                let q_n = n.quality_score(now, timeout);
                n.advertised_routes
                    .iter()
                    .filter(|r| r.destination == destination)
                    .map(move |r| (n, q_n * r.quality, r.hop_count.saturating_add(1)))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(neighbor, combined, hop_count)| Route {
                destination,
                next_hop: neighbor.node_id,
                hop_count,
                quality: combined,
                last_updated_ms: now,
                codec_intersection: neighbor.codec_intersection_with(),
                estimated_delay_ms: estimated_delay_ms(hop_count, combined),
            })
    }

    /// Every node id reachable from here, directly or via a neighbor's
    /// advertised routes.
    pub fn reachable_set(&self) -> Vec<u64> {
        let mut set: Vec<u64> = self.neighbors.keys().copied().collect();
        for neighbor in self.neighbors.values() {
            for route in &neighbor.advertised_routes {
                if !set.contains(&route.destination) {
                    set.push(route.destination);
                }
            }
        }
        set
    }

    /// The routes this node currently knows, suitable for advertising in
    /// its own outgoing beacon: each known neighbor as a direct hop, plus
    /// whatever it learned transitively via [`Self::route_to`].
    pub fn advertisable_routes(&self) -> Vec<RouteAdvertisement> {
        self.reachable_set()
            .into_iter()
            .filter_map(|destination| {
                self.route_to(destination).map(|route| RouteAdvertisement {
                    destination,
                    quality: route.quality,
                    hop_count: route.hop_count,
                })
            })
            .collect()
    }

    /// Codecs every currently-known neighbor supports, in preference order
    /// (LZ4, GZIP) — used to pick a compression algorithm the whole
    /// neighborhood can decode.
    pub fn codec_intersection(&self) -> Vec<Codec> {
        if self.neighbors.is_empty() {
            return OUR_CODECS.to_vec();
        }
        OUR_CODECS.into_iter().filter(|codec| self.neighbors.values().all(|n| n.supported_codecs.contains(codec))).collect()
    }
}

fn signal_strength_from(observed_rssi_dbm: Option<f32>, self_reported: Option<u8>) -> u8 {
    if let Some(rssi) = observed_rssi_dbm {
        return (((rssi as f64 + 130.0) / 100.0).clamp(0.0, 1.0) * 100.0) as u8;
    }
    self_reported.unwrap_or(50)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn capabilities() -> Capabilities {
        Capabilities { mining: false, relay: true, supports_utxo_routing: true }
    }

    fn beacon(node_id: u64, sequence: u64, advertised: Vec<RouteAdvertisement>) -> Beacon {
        Beacon {
            node_id,
            node_type: NodeType::Full,
            capabilities: capabilities(),
            supported_codecs: vec![Codec::Lz4, Codec::Gzip],
            max_queue_size: 256,
            duty_cycle_region: "EU".to_string(),
            sequence,
            timestamp_ms: 0,
            block_height: Some(100),
            peer_count: 1,
            signal_strength: Some(80),
            utxo_set_size: Some(1000),
            advertised_routes: advertised,
        }
    }

    #[test]
    fn beacon_creates_and_refreshes_neighbor() {
        let mut table = NeighborTable::new(VirtualClock::new(1000), 300_000, 64);
        table.ingest_beacon(&beacon(7, 1, vec![]), Some(-70.0)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(7).unwrap().beacon_sequence, 1);

        table.clock().advance(1000);
        table.ingest_beacon(&beacon(7, 2, vec![]), Some(-60.0)).unwrap();
        assert_eq!(table.get(7).unwrap().beacon_sequence, 2);
        assert!(table.get(7).unwrap().signal_strength > 0);
    }

    #[test]
    fn stale_sequence_is_rejected() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        table.ingest_beacon(&beacon(7, 5, vec![]), None).unwrap();
        let result = table.ingest_beacon(&beacon(7, 3, vec![]), None);
        assert!(matches!(result, Err(MeshError::SequenceStale { .. })));
        let result = table.ingest_beacon(&beacon(7, 5, vec![]), None);
        assert!(matches!(result, Err(MeshError::SequenceStale { .. })));
    }

    #[test]
    fn direct_neighbor_beats_indirect_route() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        table
            .ingest_beacon(&beacon(2, 1, vec![RouteAdvertisement { destination: 3, quality: 0.9, hop_count: 1 }]), None)
            .unwrap();
        table.ingest_beacon(&beacon(3, 1, vec![]), None).unwrap();
        let route = table.route_to(3).unwrap();
        assert_eq!(route.next_hop, 3);
        assert_eq!(route.hop_count, 1);
    }

    #[test]
    fn indirect_route_via_best_neighbor() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        table
            .ingest_beacon(&beacon(2, 1, vec![RouteAdvertisement { destination: 99, quality: 0.9, hop_count: 1 }]), Some(-40.0))
            .unwrap();
        table
            .ingest_beacon(&beacon(5, 1, vec![RouteAdvertisement { destination: 99, quality: 0.9, hop_count: 1 }]), Some(-90.0))
            .unwrap();
        let route = table.route_to(99).unwrap();
        assert_eq!(route.next_hop, 2);
        assert_eq!(route.hop_count, 2);
    }

    #[test]
    fn no_route_when_unreachable() {
        let table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        assert_eq!(table.route_to(123), None);
    }

    #[test]
    fn stale_neighbors_are_evicted() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 1000, 64);
        table.ingest_beacon(&beacon(7, 1, vec![]), None).unwrap();
        table.clock().advance(2000);
        let evicted = table.sweep_expired();
        assert_eq!(evicted, vec![7]);
        assert!(table.is_empty());
    }

    #[test]
    fn neighbor_capacity_enforced() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 2);
        table.ingest_beacon(&beacon(1, 1, vec![]), None).unwrap();
        table.ingest_beacon(&beacon(2, 1, vec![]), None).unwrap();
        let result = table.ingest_beacon(&beacon(3, 1, vec![]), None);
        assert!(matches!(result, Err(MeshError::NeighborCapacityReached { .. })));
    }

    #[test]
    fn reachable_set_unions_direct_and_advertised() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        table
            .ingest_beacon(
                &beacon(
                    2,
                    1,
                    vec![
                        RouteAdvertisement { destination: 10, quality: 0.8, hop_count: 1 },
                        RouteAdvertisement { destination: 11, quality: 0.7, hop_count: 1 },
                    ],
                ),
                None,
            )
            .unwrap();
        let reachable = table.reachable_set();
        assert!(reachable.contains(&2));
        assert!(reachable.contains(&10));
        assert!(reachable.contains(&11));
    }

    #[test]
    fn codec_intersection_excludes_unsupported() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        let mut b = beacon(2, 1, vec![]);
        b.supported_codecs = vec![Codec::Lz4];
        table.ingest_beacon(&b, None).unwrap();
        let intersection = table.codec_intersection();
        assert_eq!(intersection, vec![Codec::Lz4]);
    }

    #[test]
    fn quality_score_rewards_full_node_and_recency() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 300_000, 64);
        table.ingest_beacon(&beacon(2, 1, vec![]), Some(-30.0)).unwrap();
        let fresh_score = table.get(2).unwrap().quality_score(0, 300_000);

        table.clock().advance(290_000);
        let now = table.clock().now_ms();
        let stale_score = table.get(2).unwrap().quality_score(now, 300_000);
        assert!(fresh_score > stale_score);
        assert!(fresh_score <= 1.0);
    }

    #[test]
    fn neighbors_nearing_timeout_are_flagged_stale_without_being_evicted() {
        let mut table = NeighborTable::new(VirtualClock::new(0), 1000, 64);
        table.ingest_beacon(&beacon(7, 1, vec![]), None).unwrap();
        table.clock().advance(600);
        let evicted = table.sweep_expired();
        assert!(evicted.is_empty());
        assert!(table.get(7).unwrap().is_stale);
    }
}
