//! Connectivity health: expected nearest-neighbour sets and empty bins.

use crate::{
    kademlia::{Kademlia, Tables},
    pot::{ProximityTrie, MAX_PO},
};
use comb_primitives::OverlayAddress;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Expected connectivity for one node, derived from the full address set.
#[derive(Debug, Clone, Default)]
pub struct PeerPot {
    /// Addresses expected in the node's nearest-neighbour set.
    pub nn_set: Vec<OverlayAddress>,
    /// Proximity orders expected to hold no peers at all.
    pub empty_bins: Vec<usize>,
}

/// Derives the expected nearest-neighbour set and empty bins for every
/// address in `addrs`, given the nearest-neighbour core cardinality.
pub fn peer_pot_map(
    min_prox_bin_size: usize,
    addrs: &[OverlayAddress],
) -> HashMap<OverlayAddress, PeerPot> {
    let mut trie = ProximityTrie::new();
    for addr in addrs {
        trie.add(*addr);
    }

    let mut map = HashMap::new();
    for addr in addrs {
        let mut pl: isize = MAX_PO as isize;
        let mut prev: isize = MAX_PO as isize;
        let mut empty_bins = Vec::new();
        let mut nn_set = Vec::new();
        trie.each_neighbour(addr, |neighbour, po| {
            if po == MAX_PO {
                return true;
            }
            let po = po as isize;
            if pl == MAX_PO as isize || pl == po {
                nn_set.push(*neighbour);
            }
            if pl == MAX_PO as isize && nn_set.len() >= min_prox_bin_size {
                pl = po;
                prev = po;
            }
            if prev < pl {
                let mut bin = prev;
                while bin > po {
                    empty_bins.push(bin as usize);
                    bin -= 1;
                }
            }
            prev = po - 1;
            true
        });
        let mut bin = prev;
        while bin >= 0 {
            empty_bins.push(bin as usize);
            bin -= 1;
        }
        map.insert(*addr, PeerPot { nn_set, empty_bins });
    }
    map
}

impl Kademlia {
    /// Reports the health of the table's connectivity against `expected`:
    /// every expected nearest neighbour must be connected at or beyond the
    /// depth, and every expected-empty bin must hold no connection.
    ///
    /// With the health check enabled, one topology event is consumed first
    /// to synchronise with a just-completed connection.
    pub fn healthy(&self, expected: &PeerPot) -> bool {
        if let Some(events) = &self.events {
            events.consume();
        }
        let tables = self.inner.read();
        let got_nn = self.nearest_neighbours_connected(&tables, &expected.nn_set);
        let full = self.expected_bins_empty(&tables, &expected.empty_bins);
        trace!(target: "net::overlay", got_nn, full, "health check");
        got_nn && full
    }

    fn nearest_neighbours_connected(
        &self,
        tables: &Tables,
        expected: &[OverlayAddress],
    ) -> bool {
        let mut connected = HashSet::new();
        self.each_conn_locked(tables, None, MAX_PO - 1, &mut |conn, _po, nn| {
            if !nn {
                return false;
            }
            connected.insert(*conn.address());
            true
        });
        expected.iter().all(|addr| connected.contains(addr))
    }

    fn expected_bins_empty(&self, tables: &Tables, empty_bins: &[usize]) -> bool {
        let mut occupied = HashSet::new();
        tables.conns.each_bin(self.base_addr(), 0, |bin| {
            occupied.insert(bin.po);
            true
        });
        empty_bins.iter().all(|bin| !occupied.contains(bin))
    }
}
