//! External collaborator contracts.
//!
//! The mesh core never talks to a physical radio, a blockchain node, or a
//! signing key directly; it depends on these traits so the facade can be
//! driven by an in-memory double in tests and by real hardware/node
//! bindings in production, without the core crate pulling in either.

use bytes::Bytes;

use crate::error::MeshResult;

/// A single received-over-the-air frame, with the link metrics the
/// neighbor table needs. `bytes::Bytes` lets a driver hand over a
/// reference-counted slice of its own receive buffer instead of copying
/// every inbound frame into a fresh `Vec`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub bytes: Bytes,
    pub rssi_dbm: Option<f32>,
    pub snr_db: Option<f32>,
}

/// The physical (or simulated) radio link.
pub trait RadioDriver: Send + Sync {
    fn transmit(&self, frequency_mhz: f64, bytes: &[u8]) -> MeshResult<()>;
    fn try_receive(&self) -> Option<ReceivedFrame>;
}

/// The node's view of chain state, consulted when deciding what to
/// broadcast and when validating an inbound block or transaction.
pub trait BlockchainClient: Send + Sync {
    fn current_height(&self) -> u64;
    fn utxo_set_size(&self) -> u64;
    fn verify_transaction(&self, raw_tx: &[u8]) -> MeshResult<bool>;
    fn apply_block(&self, raw_block: &[u8]) -> MeshResult<()>;
}

/// Signing and verification, kept behind a trait so the core never touches
/// key material directly.
pub trait CryptoProvider: Send + Sync {
    fn sign(&self, message: &[u8]) -> Vec<u8>;
    fn verify(&self, message: &[u8], signature: &[u8], signer: u64) -> bool;
    fn hash(&self, data: &[u8]) -> [u8; 32];
}

/// In-memory doubles for the three collaborator traits, used by the
/// facade's own tests and available to downstream integration tests.
pub mod doubles {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRadio {
        outbox: Mutex<Vec<(f64, Vec<u8>)>>,
        inbox: Mutex<std::collections::VecDeque<ReceivedFrame>>,
    }

    impl InMemoryRadio {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_incoming(&self, frame: ReceivedFrame) {
            self.inbox.lock().unwrap().push_back(frame);
        }

        pub fn sent_frames(&self) -> Vec<(f64, Vec<u8>)> {
            self.outbox.lock().unwrap().clone()
        }
    }

    impl RadioDriver for InMemoryRadio {
        fn transmit(&self, frequency_mhz: f64, bytes: &[u8]) -> MeshResult<()> {
            self.outbox.lock().unwrap().push((frequency_mhz, bytes.to_vec()));
            Ok(())
        }

        fn try_receive(&self) -> Option<ReceivedFrame> {
            self.inbox.lock().unwrap().pop_front()
        }
    }

    #[derive(Default)]
    pub struct StubBlockchainClient {
        pub height: u64,
        pub utxo_count: u64,
    }

    impl BlockchainClient for StubBlockchainClient {
        fn current_height(&self) -> u64 {
            self.height
        }

        fn utxo_set_size(&self) -> u64 {
            self.utxo_count
        }

        fn verify_transaction(&self, _raw_tx: &[u8]) -> MeshResult<bool> {
            Ok(true)
        }

        fn apply_block(&self, _raw_block: &[u8]) -> MeshResult<()> {
            Ok(())
        }
    }

    /// Trivial XOR-based "signing" for tests: deterministic, cheap,
    /// obviously not cryptographically meaningful.
    pub struct FakeCrypto {
        pub key_byte: u8,
    }

    impl CryptoProvider for FakeCrypto {
        fn sign(&self, message: &[u8]) -> Vec<u8> {
            message.iter().map(|b| b ^ self.key_byte).collect()
        }

        fn verify(&self, message: &[u8], signature: &[u8], _signer: u64) -> bool {
            self.sign(message) == signature
        }

        fn hash(&self, data: &[u8]) -> [u8; 32] {
            let mut out = [0u8; 32];
            for (i, &b) in data.iter().enumerate() {
                out[i % 32] ^= b;
            }
            out
        }
    }
}
