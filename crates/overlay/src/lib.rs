#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! A Kademlia-style overlay routing table over 256-bit node addresses.
//!
//! The table keeps known peer records and live connections in
//! proximity-order tries relative to its own base address, suggests the next
//! peer to dial with exponential redial back-off, notifies connected peers
//! of topology changes, prunes over-full bins, and can self-report
//! connectivity health against an expected topology.

/// Proximity-order trie.
pub mod pot;

mod health;
mod kademlia;

pub use health::{peer_pot_map, PeerPot};
pub use kademlia::{
    DisconnectReason, Entry, KadParams, Kademlia, Notifier, OverlayAddr, OverlayConn,
    OverlayError, OverlayPeer,
};
