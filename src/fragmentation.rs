//! Fragmentation and reassembly.
//!
//! Splits an outgoing compressed blob into radio-sized fragments and
//! reassembles incoming fragments back into a blob, tracking partial
//! sessions with an expiry so a peer that never finishes doesn't leak
//! memory forever.

use std::collections::HashMap;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::clock::Clock;
use crate::error::{MeshError, MeshResult};

/// Wire size of the fixed fragment header: `session_id(8) + index(2) +
/// total(2) + crc32(4) + len(2) + reserved(2)`, 20 bytes total. The
/// trailing two bytes are reserved and always zero on the wire today.
pub const FRAGMENT_HEADER_SIZE: usize = 20;

/// A single fragment, ready to transmit or just received off the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub session_id: u64,
    pub fragment_index: u16,
    pub total_fragments: u16,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        out.write_u64::<BigEndian>(self.session_id).unwrap();
        out.write_u16::<BigEndian>(self.fragment_index).unwrap();
        out.write_u16::<BigEndian>(self.total_fragments).unwrap();
        out.write_u32::<BigEndian>(self.checksum).unwrap();
        out.write_u16::<BigEndian>(self.payload.len() as u16).unwrap();
        out.write_u16::<BigEndian>(0).unwrap(); // reserved
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(MeshError::MalformedFragment { reason: "fragment shorter than fixed header".into() });
        }
        let mut header = &bytes[..FRAGMENT_HEADER_SIZE];
        let session_id = header.read_u64::<BigEndian>().unwrap();
        let fragment_index = header.read_u16::<BigEndian>().unwrap();
        let total_fragments = header.read_u16::<BigEndian>().unwrap();
        let checksum = header.read_u32::<BigEndian>().unwrap();
        let len = header.read_u16::<BigEndian>().unwrap() as usize;
        let payload_start = FRAGMENT_HEADER_SIZE;
        let payload = bytes
            .get(payload_start..payload_start + len)
            .ok_or_else(|| MeshError::MalformedFragment { reason: "declared length exceeds buffer".into() })?
            .to_vec();
        Ok(Fragment { session_id, fragment_index, total_fragments, checksum, payload })
    }

    fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.payload) == self.checksum
    }
}

/// Splits an outgoing payload into a sequence of [`Fragment`]s, each no
/// larger than `max_fragment_payload` bytes.
pub struct Fragmenter {
    session_counter: u64,
}

impl Fragmenter {
    pub fn new(initial_session_id: u64) -> Self {
        Fragmenter { session_counter: initial_session_id }
    }

    fn next_session_id(&mut self) -> u64 {
        self.session_counter = self.session_counter.wrapping_add(1);
        self.session_counter
    }

    /// Split `payload` into fragments of at most `max_fragment_payload`
    /// bytes each, assigning a fresh session id.
    pub fn fragment(&mut self, payload: &[u8], max_fragment_payload: usize) -> Vec<Fragment> {
        if max_fragment_payload == 0 {
            return Vec::new();
        }
        let session_id = self.next_session_id();
        if payload.is_empty() {
            return vec![Fragment {
                session_id,
                fragment_index: 0,
                total_fragments: 1,
                checksum: crc32fast::hash(&[]),
                payload: Vec::new(),
            }];
        }

        let chunks: Vec<&[u8]> = payload.chunks(max_fragment_payload).collect();
        let total = chunks.len() as u16;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Fragment {
                session_id,
                fragment_index: index as u16,
                total_fragments: total,
                checksum: crc32fast::hash(chunk),
                payload: chunk.to_vec(),
            })
            .collect()
    }
}

/// A partially assembled incoming session.
struct PendingSession {
    total_fragments: u16,
    received: HashMap<u16, Vec<u8>>,
    created_at_ms: u64,
}

/// Reassembles fragments arriving out of order (or with duplicates),
/// tracking per-session expiry so abandoned sessions are evicted instead of
/// accumulating forever.
pub struct Reassembler<C: Clock> {
    clock: C,
    session_timeout_ms: u64,
    max_concurrent_sessions: usize,
    sessions: HashMap<u64, PendingSession>,
}

/// Outcome of feeding one fragment into the reassembler.
#[derive(Debug, PartialEq)]
pub enum ReassemblyOutcome {
    /// Session still waiting on more fragments.
    Incomplete,
    /// All fragments received and verified; the joined payload follows.
    Complete(Vec<u8>),
}

impl<C: Clock> Reassembler<C> {
    pub fn new(clock: C, session_timeout_ms: u64, max_concurrent_sessions: usize) -> Self {
        Reassembler { clock, session_timeout_ms, max_concurrent_sessions, sessions: HashMap::new() }
    }

    /// Evict sessions that have not completed within `session_timeout_ms`.
    /// Returns the session ids evicted, so callers can raise
    /// [`MeshError::ReassemblyTimeout`] per originator if they track one.
    pub fn evict_expired(&mut self) -> Vec<u64> {
        let now = self.clock.now_ms();
        let timeout = self.session_timeout_ms;
        let expired: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.saturating_sub(session.created_at_ms) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Feed one fragment into the reassembler. Verifies the per-fragment
    /// CRC before admitting it; a mismatch is reported rather than silently
    /// dropped so callers can NACK it.
    pub fn accept(&mut self, fragment: Fragment) -> MeshResult<ReassemblyOutcome> {
        if !fragment.verify_checksum() {
            return Err(MeshError::ReassemblyChecksumMismatch {
                session_id: fragment.session_id,
                index: fragment.fragment_index,
            });
        }

        if !self.sessions.contains_key(&fragment.session_id)
            && self.sessions.len() >= self.max_concurrent_sessions
        {
            self.evict_expired();
        }

        let now = self.clock.now_ms();
        let session = self.sessions.entry(fragment.session_id).or_insert_with(|| PendingSession {
            total_fragments: fragment.total_fragments,
            received: HashMap::new(),
            created_at_ms: now,
        });

        match session.received.get(&fragment.fragment_index) {
            Some(existing) if existing != &fragment.payload => {
                return Err(MeshError::ReassemblyChecksumMismatch {
                    session_id: fragment.session_id,
                    index: fragment.fragment_index,
                });
            }
            Some(_) => {}
            None => {
                session.received.insert(fragment.fragment_index, fragment.payload);
            }
        }

        if session.received.len() as u16 >= session.total_fragments {
            let total = session.total_fragments;
            let mut joined = Vec::new();
            for index in 0..total {
                match session.received.get(&index) {
                    Some(chunk) => joined.extend_from_slice(chunk),
                    None => return Ok(ReassemblyOutcome::Incomplete),
                }
            }
            self.sessions.remove(&fragment.session_id);
            Ok(ReassemblyOutcome::Complete(joined))
        } else {
            Ok(ReassemblyOutcome::Incomplete)
        }
    }

    /// Bitmap of fragment indices received so far for `session_id`, used to
    /// build a selective-retransmit NACK.
    pub fn received_bitmap(&self, session_id: u64) -> Option<Vec<u8>> {
        let session = self.sessions.get(&session_id)?;
        let bytes = (session.total_fragments as usize).div_ceil(8);
        let mut bitmap = vec![0u8; bytes];
        for &index in session.received.keys() {
            let byte = index as usize / 8;
            let bit = index as usize % 8;
            bitmap[byte] |= 1 << bit;
        }
        Some(bitmap)
    }

    pub fn pending_session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    #[test]
    fn fragment_wire_round_trip() {
        let fragment = Fragment {
            session_id: 42,
            fragment_index: 3,
            total_fragments: 6,
            checksum: crc32fast::hash(b"hello"),
            payload: b"hello".to_vec(),
        };
        let bytes = fragment.encode();
        let decoded = Fragment::decode(&bytes).unwrap();
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn fragment_count_matches_payload_split() {
        let mut fragmenter = Fragmenter::new(0);
        let payload = vec![7u8; 1200];
        let fragments = fragmenter.fragment(&payload, 200);
        assert_eq!(fragments.len(), 6);
        assert_eq!(fragments[0].payload.len(), 200);
        assert_eq!(fragments[5].payload.len(), 200);
    }

    #[test]
    fn uneven_split_last_fragment_is_shorter() {
        let mut fragmenter = Fragmenter::new(0);
        let payload = vec![7u8; 1000];
        let fragments = fragmenter.fragment(&payload, 180);
        assert_eq!(fragments.len(), 6);
        for f in &fragments[..5] {
            assert_eq!(f.payload.len(), 180);
        }
        assert_eq!(fragments.last().unwrap().payload.len(), 100);
    }

    #[test]
    fn reassembly_out_of_order_completes() {
        let clock = VirtualClock::new(0);
        let mut fragmenter = Fragmenter::new(0);
        let payload = vec![5u8; 1200];
        let fragments = fragmenter.fragment(&payload, 200);

        let mut reassembler = Reassembler::new(clock, 30_000, 64);
        let mut shuffled = fragments.clone();
        shuffled.swap(0, 5);
        shuffled.swap(1, 3);

        let mut result = None;
        for fragment in shuffled {
            result = Some(reassembler.accept(fragment).unwrap());
        }
        match result.unwrap() {
            ReassemblyOutcome::Complete(joined) => assert_eq!(joined, payload),
            ReassemblyOutcome::Incomplete => panic!("expected completion after all fragments delivered"),
        }
    }

    #[test]
    fn reassembly_reports_incomplete_until_last_fragment() {
        let clock = VirtualClock::new(0);
        let mut fragmenter = Fragmenter::new(0);
        let payload = vec![5u8; 600];
        let fragments = fragmenter.fragment(&payload, 200);
        assert_eq!(fragments.len(), 3);

        let mut reassembler = Reassembler::new(clock, 30_000, 64);
        let outcome = reassembler.accept(fragments[0].clone()).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::Incomplete);
        let outcome = reassembler.accept(fragments[1].clone()).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::Incomplete);
        let outcome = reassembler.accept(fragments[2].clone()).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::Complete(payload));
    }

    #[test]
    fn corrupted_fragment_is_rejected() {
        let clock = VirtualClock::new(0);
        let mut reassembler = Reassembler::new(clock, 30_000, 64);
        let mut fragment = Fragment {
            session_id: 1,
            fragment_index: 0,
            total_fragments: 1,
            checksum: crc32fast::hash(b"hello"),
            payload: b"hello".to_vec(),
        };
        fragment.payload[0] = b'X'; // corrupt after computing checksum
        let result = reassembler.accept(fragment);
        assert!(matches!(result, Err(MeshError::ReassemblyChecksumMismatch { .. })));
    }

    #[test]
    fn duplicate_fragment_is_idempotent_but_conflicting_one_is_rejected() {
        let clock = VirtualClock::new(0);
        let mut reassembler = Reassembler::new(clock, 30_000, 64);
        let fragment = Fragment {
            session_id: 1,
            fragment_index: 0,
            total_fragments: 2,
            checksum: crc32fast::hash(b"hello"),
            payload: b"hello".to_vec(),
        };
        reassembler.accept(fragment.clone()).unwrap();

        // The identical fragment arriving again is a no-op.
        let outcome = reassembler.accept(fragment.clone()).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::Incomplete);

        // A different, internally-consistent fragment claiming the same
        // index is a protocol error, not a silent overwrite.
        let conflicting = Fragment {
            session_id: 1,
            fragment_index: 0,
            total_fragments: 2,
            checksum: crc32fast::hash(b"other"),
            payload: b"other".to_vec(),
        };
        let result = reassembler.accept(conflicting);
        assert!(matches!(result, Err(MeshError::ReassemblyChecksumMismatch { .. })));
    }

    #[test]
    fn expired_session_is_evicted() {
        let mut fragmenter = Fragmenter::new(0);
        let payload = vec![1u8; 400];
        let fragments = fragmenter.fragment(&payload, 200);

        let mut reassembler = Reassembler::new(VirtualClock::new(0), 1000, 64);
        reassembler.accept(fragments[0].clone()).unwrap();
        assert_eq!(reassembler.pending_session_count(), 1);

        // Advance the reassembler's own clock past the timeout.
        reassembler.clock.advance(2000);
        let evicted = reassembler.evict_expired();
        assert_eq!(evicted, vec![fragments[0].session_id]);
        assert_eq!(reassembler.pending_session_count(), 0);
    }

    #[test]
    fn received_bitmap_reflects_partial_delivery() {
        let clock = VirtualClock::new(0);
        let mut fragmenter = Fragmenter::new(0);
        let payload = vec![1u8; 1000];
        let fragments = fragmenter.fragment(&payload, 200);
        let session_id = fragments[0].session_id;

        let mut reassembler = Reassembler::new(clock, 30_000, 64);
        reassembler.accept(fragments[0].clone()).unwrap();
        reassembler.accept(fragments[2].clone()).unwrap();

        let bitmap = reassembler.received_bitmap(session_id).unwrap();
        assert_eq!(bitmap[0] & 0b0000_0001, 0b0000_0001);
        assert_eq!(bitmap[0] & 0b0000_0100, 0b0000_0100);
        assert_eq!(bitmap[0] & 0b0000_0010, 0);
    }
}
