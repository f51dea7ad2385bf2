//! Mesh transport core for a UTXO node running over constrained LoRa mesh
//! radios.
//!
//! Covers duty-cycle governance, compression, reliable fragmented
//! delivery, and neighbor discovery/routing, bound together by the
//! [`mesh`] facade. Every component that reasons about wall-clock time
//! takes a [`clock::Clock`] capability instead of reaching for the system
//! clock directly, so the whole stack can be driven deterministically in
//! tests with [`clock::VirtualClock`].

pub mod airtime;
pub mod clock;
pub mod compression;
pub mod config;
pub mod discovery;
pub mod duty_cycle;
pub mod envelope;
pub mod error;
pub mod fragmentation;
pub mod mesh;
pub mod queue;
pub mod radio;
pub mod reliability;
pub mod telemetry;

pub use error::{MeshError, MeshResult};
pub use mesh::{beacon_loop, cleanup_loop, receive_loop, retry_loop, send_loop, MeshNode, MeshNodeDeps};
