//! The overlay routing table: known peer records, live connections, and the
//! policies that keep the neighbourhood connected.

use crate::pot::{Change, ProximityKey, ProximityTrie, SwapOp, MAX_PO};
use comb_primitives::{hex, OverlayAddress};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum number of live peers notified of a new connection.
const NOTIFY_FANOUT: usize = 1024;

/// Errors from overlay table operations.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// Attempted to register the table's own base address.
    #[error("cannot register own address {0}")]
    SelfRegister(OverlayAddress),
}

/// Reasons a peer connection is asked to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer's bin is over capacity.
    TooManyPeers,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyPeers => f.write_str("too many peers"),
        }
    }
}

/// Common view of a peer in the overlay.
pub trait OverlayPeer: Send + Sync {
    /// The peer's 32-byte overlay address.
    fn address(&self) -> &OverlayAddress;
}

/// A known peer record.
pub trait OverlayAddr: OverlayPeer {
    /// Merges a newer record into this one, returning the refreshed record.
    fn update(&self, newer: &dyn OverlayAddr) -> Arc<dyn OverlayAddr>;
}

/// A live peer connection.
pub trait OverlayConn: OverlayPeer {
    /// Requests removal of the connection. Advisory and asynchronous.
    fn disconnect(&self, reason: DisconnectReason);

    /// Projects the connection back to a persistent peer record.
    fn off(&self) -> Arc<dyn OverlayAddr>;

    /// The peer's notification capability, if it has one.
    fn notifier(&self) -> Option<&dyn Notifier> {
        None
    }
}

/// Capability for receiving peer and depth notifications.
pub trait Notifier: Send + Sync {
    /// Informs the peer of a newly connected peer at the given proximity.
    fn notify_peer(&self, peer: Arc<dyn OverlayAddr>, po: u8);

    /// Informs the peer of the table's new neighbourhood depth.
    fn notify_depth(&self, depth: u8);
}

/// A table slot holding either a peer record or a live connection.
#[derive(Clone)]
pub(crate) enum PeerSlot {
    /// A known address.
    Addr(Arc<dyn OverlayAddr>),
    /// A live connection.
    Conn(Arc<dyn OverlayConn>),
}

impl PeerSlot {
    fn address(&self) -> &OverlayAddress {
        match self {
            Self::Addr(addr) => addr.address(),
            Self::Conn(conn) => conn.address(),
        }
    }
}

/// A table entry: a peer plus dial bookkeeping.
///
/// `seen_at` is set at creation and never mutated; `retries` is charged by
/// the suggestion policy when the entry is handed out for dialing.
pub struct Entry {
    peer: PeerSlot,
    seen_at: Instant,
    retries: AtomicU32,
}

impl Entry {
    fn new(peer: PeerSlot) -> Self {
        Self { peer, seen_at: Instant::now(), retries: AtomicU32::new(0) }
    }

    /// The entry's overlay address.
    pub fn address(&self) -> &OverlayAddress {
        self.peer.address()
    }

    /// The peer record view of the entry.
    pub fn record(&self) -> Arc<dyn OverlayAddr> {
        match &self.peer {
            PeerSlot::Addr(addr) => addr.clone(),
            PeerSlot::Conn(conn) => conn.off(),
        }
    }

    /// The live connection, if the entry is connected.
    pub fn conn(&self) -> Option<&Arc<dyn OverlayConn>> {
        match &self.peer {
            PeerSlot::Addr(_) => None,
            PeerSlot::Conn(conn) => Some(conn),
        }
    }

    /// Number of dial attempts charged against this entry.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

impl ProximityKey for Entry {
    fn proximity_key(&self) -> &OverlayAddress {
        self.address()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", hex::encode(&self.address()[..2]), self.retries())
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("address", self.address())
            .field("connected", &self.conn().is_some())
            .field("retries", &self.retries())
            .finish()
    }
}

/// Configuration parameters of the overlay table.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KadParams {
    /// Number of rows the table display shows.
    pub max_prox_display: usize,
    /// Nearest-neighbour core minimum cardinality.
    pub min_prox_bin_size: usize,
    /// Minimum number of peers in a bin.
    pub min_bin_size: usize,
    /// Maximum number of peers in a bin before pruning.
    pub max_bin_size: usize,
    /// Initial interval before a known peer is first redialed.
    pub retry_interval: Duration,
    /// Exponent applied between successive retry intervals.
    pub retry_exponent: u32,
    /// Maximum number of redial attempts.
    pub max_retries: u32,
    /// Interval between prune cycles; `None` disables pruning.
    pub prune_interval: Option<Duration>,
    /// Whether connection events are published for the health check.
    pub health_check: bool,
}

impl Default for KadParams {
    fn default() -> Self {
        Self {
            max_prox_display: 8,
            min_prox_bin_size: 2,
            min_bin_size: 2,
            max_bin_size: 4,
            retry_interval: Duration::from_millis(420),
            retry_exponent: 2,
            max_retries: 42,
            prune_interval: None,
            health_check: false,
        }
    }
}

impl KadParams {
    /// Sets the nearest-neighbour core minimum cardinality.
    pub fn with_min_prox_bin_size(mut self, size: usize) -> Self {
        self.min_prox_bin_size = size;
        self
    }

    /// Sets the bin size bounds.
    pub fn with_bin_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_bin_size = min;
        self.max_bin_size = max;
        self
    }

    /// Sets the initial redial interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Caps the number of redial attempts.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enables periodic pruning at the given interval.
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = Some(interval);
        self
    }

    /// Enables publishing of connection events for the health check.
    pub fn with_health_check(mut self) -> Self {
        self.health_check = true;
        self
    }
}

pub(crate) struct Tables {
    pub(crate) addrs: ProximityTrie<Entry>,
    pub(crate) conns: ProximityTrie<Entry>,
}

pub(crate) struct HealthEvents {
    tx: SyncSender<()>,
    rx: Mutex<Receiver<()>>,
}

impl HealthEvents {
    pub(crate) fn consume(&self) {
        self.rx.lock().recv().ok();
    }
}

/// A proximity-ordered table of known peer records and live connections.
///
/// The base address is immutable after construction. The set of connections
/// is always a subset of the set of known addresses.
pub struct Kademlia {
    params: KadParams,
    base: OverlayAddress,
    pub(crate) inner: RwLock<Tables>,
    current_depth: AtomicU8,
    pub(crate) events: Option<HealthEvents>,
}

impl Kademlia {
    /// Creates a table for `base` with the given parameters.
    pub fn new(base: OverlayAddress, params: KadParams) -> Self {
        let events = params.health_check.then(|| {
            let (tx, rx) = sync_channel(1);
            HealthEvents { tx, rx: Mutex::new(rx) }
        });
        Self {
            params,
            base,
            inner: RwLock::new(Tables {
                addrs: ProximityTrie::new(),
                conns: ProximityTrie::new(),
            }),
            current_depth: AtomicU8::new(0),
            events,
        }
    }

    /// The table's base address.
    pub fn base_addr(&self) -> &OverlayAddress {
        &self.base
    }

    /// The table's configuration.
    pub fn params(&self) -> &KadParams {
        &self.params
    }

    /// Number of known peer records.
    pub fn num_addrs(&self) -> usize {
        self.inner.read().addrs.len()
    }

    /// Number of live connections.
    pub fn num_conns(&self) -> usize {
        self.inner.read().conns.len()
    }

    /// Drains `peers` into the known-address set; returns when the stream
    /// ends. The table's own address is rejected.
    pub async fn register(
        &self,
        mut peers: mpsc::UnboundedReceiver<Arc<dyn OverlayAddr>>,
    ) -> Result<(), OverlayError> {
        let mut incoming = ProximityTrie::new();
        while let Some(peer) = peers.recv().await {
            if peer.address() == &self.base {
                return Err(OverlayError::SelfRegister(self.base));
            }
            incoming.add(Entry::new(PeerSlot::Addr(peer)));
        }
        let registered = incoming.len();

        let mut tables = self.inner.write();
        let common = tables.addrs.union(incoming, |existing, incoming| {
            // a live connection outranks a record; otherwise refresh the
            // record while keeping the dial bookkeeping
            let refreshed = match (&existing.peer, &incoming.peer) {
                (PeerSlot::Addr(current), PeerSlot::Addr(newer)) => {
                    Some(current.update(newer.as_ref()))
                }
                _ => None,
            };
            if let Some(record) = refreshed {
                existing.peer = PeerSlot::Addr(record);
            }
        });
        trace!(
            target: "net::overlay",
            registered, common, known = tables.addrs.len(), "registered peers"
        );
        Ok(())
    }

    /// Inserts a live connection, indexing it among the known addresses as
    /// needed, and schedules neighbour notification.
    pub fn on(&self, peer: Arc<dyn OverlayConn>) {
        let key = *peer.address();
        {
            let mut tables = self.inner.write();
            let entry = Entry::new(PeerSlot::Conn(peer.clone()));
            let change = tables
                .conns
                .swap(&key, |slot| if slot.is_none() { SwapOp::Put(entry) } else { SwapOp::Keep });
            if change == Change::Inserted {
                let entry = Entry::new(PeerSlot::Conn(peer.clone()));
                tables.addrs.swap(&key, |_| SwapOp::Put(entry));
            }
            if let Some(events) = &self.events {
                let _ = events.tx.send(());
            }
        }
        let Some(plan) = self.prepare_notify(peer) else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { plan.dispatch() });
            }
            Err(_) => plan.dispatch(),
        }
    }

    /// Removes a live connection, demoting it to a known address record.
    ///
    /// Panics if the peer has no address entry: a connection that was never
    /// inserted is a programming error on the caller's side.
    pub fn off(&self, peer: &Arc<dyn OverlayConn>) {
        let key = *peer.address();
        let mut tables = self.inner.write();
        let record = peer.off();
        tables.addrs.swap(&key, move |slot| {
            assert!(slot.is_some(), "connected peer {key} not found among addresses");
            SwapOp::Put(Entry::new(PeerSlot::Addr(record)))
        });
        tables.conns.swap(&key, |_| SwapOp::Remove);
    }

    /// Captures the depth and the nearest live peers for a new connection,
    /// observing the state the insertion committed. Returns `None` when the
    /// peer has no notification capability.
    fn prepare_notify(&self, peer: Arc<dyn OverlayConn>) -> Option<NotifyPlan> {
        peer.notifier()?;
        let tables = self.inner.read();
        let depth = self.depth_locked(&tables.conns) as u8;
        let previous = self.current_depth.swap(depth, Ordering::AcqRel);
        let neighbours: Vec<(Arc<dyn OverlayConn>, u8)> = tables
            .conns
            .nearest(peer.address(), NOTIFY_FANOUT, MAX_PO - 1)
            .into_iter()
            .filter_map(|(entry, po)| entry.conn().cloned().map(|conn| (conn, po as u8)))
            .collect();
        Some(NotifyPlan { peer, depth, depth_changed: previous != depth, neighbours })
    }

    /// Applies `f` to each live peer at proximity `max_po` or less from
    /// `base` (the table base when `None`), nearest first. The flag passed
    /// to `f` marks membership in the nearest-neighbour set.
    pub fn each_conn(
        &self,
        base: Option<&OverlayAddress>,
        max_po: usize,
        mut f: impl FnMut(&Arc<dyn OverlayConn>, usize, bool) -> bool,
    ) {
        let tables = self.inner.read();
        self.each_conn_locked(&tables, base, max_po, &mut f)
    }

    pub(crate) fn each_conn_locked(
        &self,
        tables: &Tables,
        base: Option<&OverlayAddress>,
        max_po: usize,
        f: &mut impl FnMut(&Arc<dyn OverlayConn>, usize, bool) -> bool,
    ) {
        let base = base.unwrap_or(&self.base);
        let depth = self.depth_locked(&tables.conns);
        tables.conns.each_neighbour(base, |entry, po| {
            if po > max_po {
                return true;
            }
            match entry.conn() {
                Some(conn) => f(conn, po, po >= depth),
                None => true,
            }
        });
    }

    /// Applies `f` to each known peer record at proximity `max_po` or less
    /// from `base` (the table base when `None`), nearest first.
    pub fn each_addr(
        &self,
        base: Option<&OverlayAddress>,
        max_po: usize,
        mut f: impl FnMut(Arc<dyn OverlayAddr>, usize) -> bool,
    ) {
        let tables = self.inner.read();
        let base = base.unwrap_or(&self.base);
        tables.addrs.each_neighbour(base, |entry, po| {
            if po > max_po {
                return true;
            }
            f(entry.record(), po)
        });
    }

    /// The neighbourhood depth: the smallest proximity order at which at
    /// least `min_prox_bin_size` live connections sit at or beyond it, or 0
    /// when there are fewer connections than that altogether.
    pub fn depth(&self) -> usize {
        self.depth_locked(&self.inner.read().conns)
    }

    pub(crate) fn depth_locked(&self, conns: &ProximityTrie<Entry>) -> usize {
        if conns.len() < self.params.min_prox_bin_size {
            return 0;
        }
        let mut size = 0;
        let mut depth = 0;
        conns.each_neighbour(&self.base, |_, po| {
            size += 1;
            depth = po;
            size < self.params.min_prox_bin_size
        });
        depth
    }

    /// Picks the next known peer to dial.
    ///
    /// Returns `(record, po, want)`: a callable peer record when one exists
    /// (first completing the nearest-neighbour set, then filling the
    /// shortest bin below depth), or `want = true` with the proximity order
    /// of a bin that discovery should be asked to fill. All-saturated
    /// tables return `(None, 0, false)`.
    pub fn suggest_peer(&self) -> (Option<Arc<dyn OverlayAddr>>, usize, bool) {
        let tables = self.inner.read();
        let mut min_size = self.params.min_bin_size;
        let depth = self.depth_locked(&tables.conns);

        // a callable peer within the neighbourhood completes the nearest-neighbour set
        let mut candidate = None;
        tables.addrs.each_neighbour(&self.base, |entry, po| {
            if po < depth {
                return false;
            }
            candidate = self.callable(entry);
            candidate.is_none()
        });
        if let Some(record) = candidate {
            trace!(target: "net::overlay", "candidate nearest neighbour found");
            return (Some(record), 0, false);
        }

        // record short bins and proximity orders with no bin at all
        let mut short_bins = Vec::new();
        let mut prev: isize = -1;
        tables.conns.each_bin(&self.base, 0, |bin| {
            prev += 1;
            while (prev as usize) < bin.po {
                short_bins.push(prev as usize);
                min_size = 0;
                prev += 1;
            }
            if bin.size() < min_size {
                short_bins.push(bin.po);
                min_size = bin.size();
            }
            bin.size() > 0 && bin.po < depth
        });
        let Some(&first_short) = short_bins.first() else {
            debug!(target: "net::overlay", "all bins saturated");
            return (None, 0, false);
        };

        // look for a callable known peer in the first short bin below depth
        let mut candidate = None;
        tables.addrs.each_bin(&self.base, first_short, |bin| {
            if bin.po >= depth {
                return false;
            }
            for entry in bin.iter() {
                candidate = self.callable(entry);
                if candidate.is_some() {
                    break;
                }
            }
            false
        });
        if let Some(record) = candidate {
            return (Some(record), 0, false);
        }

        // no candidate: ask discovery for more peers at this proximity
        (None, first_short, true)
    }

    /// Whether the entry is eligible for a dial attempt under its back-off,
    /// charging the attempt when it is.
    fn callable(&self, entry: &Entry) -> Option<Arc<dyn OverlayAddr>> {
        let retries = entry.retries();
        if entry.conn().is_some() || retries > self.params.max_retries {
            return None;
        }
        // the number of dial attempts the elapsed time pays for
        let elapsed = entry.seen_at.elapsed();
        let interval = self.params.retry_interval.as_nanos().max(1);
        // an exponent below 2 would never drain the quotient
        let exponent = self.params.retry_exponent.max(2) as u128;
        let mut allowed = 0u32;
        let mut delta = elapsed.as_nanos() / interval;
        while delta > 0 {
            allowed += 1;
            delta /= exponent;
        }
        if allowed < retries {
            trace!(
                target: "net::overlay",
                ?elapsed, retries, allowed, "peer not callable yet"
            );
            return None;
        }
        entry.retries.fetch_add(1, Ordering::Relaxed);
        trace!(target: "net::overlay", retries, "peer is callable");
        Some(entry.record())
    }

    /// Runs bin pruning on each tick until the tick source closes.
    ///
    /// Bins holding more than `max_bin_size` live peers are reduced to
    /// `min_bin_size` by asking the oldest surplus peers to disconnect.
    pub fn prune(self: Arc<Self>, mut ticks: mpsc::Receiver<()>) {
        tokio::spawn(async move {
            while ticks.recv().await.is_some() {
                let victims = self.prune_victims();
                let total = victims.len();
                for conn in victims {
                    conn.disconnect(DisconnectReason::TooManyPeers);
                }
                trace!(target: "net::overlay", pruned = total, "pruned peers");
            }
        });
    }

    fn prune_victims(&self) -> Vec<Arc<dyn OverlayConn>> {
        let tables = self.inner.read();
        let mut victims: Vec<Arc<dyn OverlayConn>> = Vec::new();
        tables.conns.each_bin(&self.base, 0, |bin| {
            if bin.size() > self.params.max_bin_size {
                let extra = bin.size() - self.params.min_bin_size;
                let mut members: Vec<&Entry> = bin.iter().collect();
                members.sort_by_key(|entry| entry.seen_at);
                victims
                    .extend(members.into_iter().take(extra).filter_map(|e| e.conn().cloned()));
            }
            true
        });
        victims
    }
}

/// A snapshot of the notifications owed for one new connection, dispatched
/// off the table's lock.
struct NotifyPlan {
    peer: Arc<dyn OverlayConn>,
    depth: u8,
    depth_changed: bool,
    neighbours: Vec<(Arc<dyn OverlayConn>, u8)>,
}

impl NotifyPlan {
    fn dispatch(self) {
        let Some(notifier) = self.peer.notifier() else { return };
        notifier.notify_depth(self.depth);
        for (conn, po) in &self.neighbours {
            let Some(target) = conn.notifier() else { continue };
            target.notify_peer(self.peer.off(), *po);
            trace!(target: "net::overlay", po, "peer notified of new connection");
            if self.depth_changed {
                target.notify_depth(self.depth);
            }
        }
    }
}

impl fmt::Display for Kademlia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.inner.read();
        let rows = self.params.max_prox_display;
        writeln!(f, "overlay table: base address {}", hex::encode(&self.base[..3]))?;
        writeln!(
            f,
            "population: {} ({}), MinProxBinSize: {}, MinBinSize: {}, MaxBinSize: {}",
            tables.conns.len(),
            tables.addrs.len(),
            self.params.min_prox_bin_size,
            self.params.min_bin_size,
            self.params.max_bin_size
        )?;
        if rows == 0 {
            return Ok(());
        }

        let render = |trie: &ProximityTrie<Entry>| {
            let mut lines = vec![String::new(); rows];
            trie.each_bin(&self.base, 0, |bin| {
                let row = bin.po.min(rows - 1);
                let mut cells = vec![format!("{:2}", bin.size())];
                cells.extend(bin.iter().take(4).map(|entry| entry.to_string()));
                lines[row] = cells.join(" ");
                true
            });
            lines
        };
        let live = render(&tables.conns);
        let known = render(&tables.addrs);

        let depth = self.depth_locked(&tables.conns);
        for row in 0..rows {
            if row == depth {
                writeln!(f, "============ depth: {depth} ============")?;
            }
            let left = if live[row].is_empty() { " 0" } else { live[row].as_str() };
            let right = if known[row].is_empty() { " 0" } else { known[row].as_str() };
            writeln!(f, "{row:03} {left:<31} | {right}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comb_primitives::B256;
    use std::sync::atomic::AtomicBool;

    fn addr_at_po(base: &OverlayAddress, po: usize, seed: u8) -> OverlayAddress {
        let mut bytes = base.0;
        bytes[po / 8] ^= 0x80u8 >> (po % 8);
        bytes[31] ^= seed;
        B256::from(bytes)
    }

    #[derive(Debug)]
    struct TestAddr {
        addr: OverlayAddress,
    }

    impl TestAddr {
        fn new(addr: OverlayAddress) -> Arc<Self> {
            Arc::new(Self { addr })
        }
    }

    impl OverlayPeer for TestAddr {
        fn address(&self) -> &OverlayAddress {
            &self.addr
        }
    }

    impl OverlayAddr for TestAddr {
        fn update(&self, newer: &dyn OverlayAddr) -> Arc<dyn OverlayAddr> {
            TestAddr::new(*newer.address())
        }
    }

    struct TestConn {
        addr: OverlayAddress,
        dropped: AtomicBool,
        peers_seen: Mutex<Vec<(OverlayAddress, u8)>>,
        depths_seen: Mutex<Vec<u8>>,
        notifying: bool,
    }

    impl TestConn {
        fn build(addr: OverlayAddress, notifying: bool) -> Arc<Self> {
            Arc::new(Self {
                addr,
                dropped: AtomicBool::new(false),
                peers_seen: Mutex::new(Vec::new()),
                depths_seen: Mutex::new(Vec::new()),
                notifying,
            })
        }

        fn new(addr: OverlayAddress) -> Arc<Self> {
            Self::build(addr, false)
        }

        fn notifying(addr: OverlayAddress) -> Arc<Self> {
            Self::build(addr, true)
        }

        fn is_dropped(&self) -> bool {
            self.dropped.load(Ordering::Relaxed)
        }
    }

    impl OverlayPeer for TestConn {
        fn address(&self) -> &OverlayAddress {
            &self.addr
        }
    }

    impl OverlayConn for TestConn {
        fn disconnect(&self, _reason: DisconnectReason) {
            self.dropped.store(true, Ordering::Relaxed);
        }

        fn off(&self) -> Arc<dyn OverlayAddr> {
            TestAddr::new(self.addr)
        }

        fn notifier(&self) -> Option<&dyn Notifier> {
            self.notifying.then_some(self as &dyn Notifier)
        }
    }

    impl Notifier for TestConn {
        fn notify_peer(&self, peer: Arc<dyn OverlayAddr>, po: u8) {
            self.peers_seen.lock().push((*peer.address(), po));
        }

        fn notify_depth(&self, depth: u8) {
            self.depths_seen.lock().push(depth);
        }
    }

    fn table() -> Arc<Kademlia> {
        Arc::new(Kademlia::new(B256::ZERO, KadParams::default()))
    }

    async fn register_addrs(kad: &Kademlia, addrs: &[OverlayAddress]) {
        let (tx, rx) = mpsc::unbounded_channel();
        for addr in addrs {
            tx.send(TestAddr::new(*addr) as Arc<dyn OverlayAddr>).unwrap();
        }
        drop(tx);
        kad.register(rx).await.unwrap();
    }

    #[test]
    fn connections_stay_a_subset_of_addresses() {
        let kad = table();
        let conns: Vec<_> =
            (1..=3).map(|po| TestConn::new(addr_at_po(kad.base_addr(), po, 0))).collect();
        for conn in &conns {
            kad.on(conn.clone());
        }
        assert_eq!(kad.num_conns(), 3);
        assert_eq!(kad.num_addrs(), 3);

        let gone: Arc<dyn OverlayConn> = conns[0].clone();
        kad.off(&gone);
        assert_eq!(kad.num_conns(), 2);
        assert_eq!(kad.num_addrs(), 3);

        // reconnecting the same peer is idempotent
        kad.on(conns[1].clone());
        assert_eq!(kad.num_conns(), 2);
    }

    #[test]
    #[should_panic(expected = "not found among addresses")]
    fn off_without_on_is_a_programmer_error() {
        let kad = table();
        let conn: Arc<dyn OverlayConn> = TestConn::new(addr_at_po(kad.base_addr(), 1, 0));
        kad.off(&conn);
    }

    #[test]
    fn depth_follows_the_nearest_neighbour_core() {
        let kad = table();
        assert_eq!(kad.depth(), 0);

        let c3 = TestConn::new(addr_at_po(kad.base_addr(), 3, 0));
        let c5 = TestConn::new(addr_at_po(kad.base_addr(), 5, 0));
        let c7 = TestConn::new(addr_at_po(kad.base_addr(), 7, 0));

        kad.on(c3.clone());
        assert_eq!(kad.depth(), 0); // fewer than MinProxBinSize connections
        kad.on(c5.clone());
        assert_eq!(kad.depth(), 3);
        kad.on(c7.clone());
        assert_eq!(kad.depth(), 5);

        let gone: Arc<dyn OverlayConn> = c7;
        kad.off(&gone);
        assert_eq!(kad.depth(), 3);
    }

    #[tokio::test]
    async fn register_rejects_the_base_address() {
        let kad = table();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TestAddr::new(*kad.base_addr()) as Arc<dyn OverlayAddr>).unwrap();
        drop(tx);
        assert!(matches!(kad.register(rx).await, Err(OverlayError::SelfRegister(_))));
    }

    #[tokio::test]
    async fn register_unions_into_known_addresses() {
        let kad = table();
        let connected = TestConn::new(addr_at_po(kad.base_addr(), 2, 0));
        kad.on(connected.clone());

        let addrs = vec![
            *connected.address(), // already known through the connection
            addr_at_po(kad.base_addr(), 4, 0),
            addr_at_po(kad.base_addr(), 6, 0),
        ];
        register_addrs(&kad, &addrs).await;
        assert_eq!(kad.num_addrs(), 3);
        assert_eq!(kad.num_conns(), 1);
    }

    #[test]
    fn suggest_peer_on_an_empty_table() {
        let kad = table();
        let (peer, po, want) = kad.suggest_peer();
        assert!(peer.is_none());
        assert_eq!((po, want), (0, false));
    }

    #[tokio::test]
    async fn suggested_peers_are_charged_a_dial_attempt() {
        let kad = Arc::new(Kademlia::new(
            B256::ZERO,
            KadParams::default().with_retry_interval(Duration::from_millis(1)),
        ));
        let addr = addr_at_po(kad.base_addr(), 3, 0);
        register_addrs(&kad, &[addr]).await;

        let (peer, _, want) = kad.suggest_peer();
        assert_eq!(*peer.expect("peer should be callable").address(), addr);
        assert!(!want);

        // without time advance the back-off refuses a second attempt
        let (peer, po, want) = kad.suggest_peer();
        assert!(peer.is_none());
        assert_eq!((po, want), (0, false));

        // elapsed time pays for the retry
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (peer, _, _) = kad.suggest_peer();
        assert!(peer.is_some());
    }

    #[tokio::test]
    async fn suggest_peer_after_saturation() {
        let kad = table();
        let mut bin3: Vec<Arc<TestConn>> = Vec::new();
        for po in 0..=4 {
            for seed in 0..4 {
                let conn = TestConn::new(addr_at_po(kad.base_addr(), po, seed));
                if po == 3 {
                    bin3.push(conn.clone());
                }
                kad.on(conn);
            }
        }
        assert_eq!(kad.depth(), 4);

        // every bin up to depth is saturated
        let (peer, po, want) = kad.suggest_peer();
        assert!(peer.is_none());
        assert_eq!((po, want), (0, false));

        // drain bin 3 below MinBinSize; its records become dial candidates
        let mut offed = std::collections::HashSet::new();
        for conn in bin3.iter().take(3) {
            offed.insert(*conn.address());
            let gone: Arc<dyn OverlayConn> = conn.clone();
            kad.off(&gone);
        }
        for _ in 0..3 {
            let (peer, po, want) = kad.suggest_peer();
            let peer = peer.expect("bin 3 record should be callable");
            assert!(offed.contains(peer.address()));
            assert_eq!((po, want), (0, false));
        }

        // candidates exhausted: ask discovery for more peers at that order
        let (peer, po, want) = kad.suggest_peer();
        assert!(peer.is_none());
        assert_eq!((po, want), (3, true));
    }

    #[tokio::test]
    async fn prune_drops_the_surplus_beyond_max_bin_size() {
        let kad = table();
        let conns: Vec<_> = (0..6u8)
            .map(|seed| TestConn::new(addr_at_po(kad.base_addr(), 2, seed)))
            .collect();
        for conn in &conns {
            kad.on(conn.clone());
        }

        let (tick_tx, tick_rx) = mpsc::channel(1);
        Arc::clone(&kad).prune(tick_rx);
        tick_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dropped = conns.iter().filter(|conn| conn.is_dropped()).count();
        assert_eq!(dropped, 4); // 6 connected, reduced to MinBinSize = 2
        assert_eq!(kad.num_conns(), 6); // drop requests are advisory
    }

    #[test]
    fn notify_informs_the_new_peer_and_its_neighbours() {
        let kad = table();
        let first = TestConn::notifying(addr_at_po(kad.base_addr(), 3, 0));
        let second = TestConn::notifying(addr_at_po(kad.base_addr(), 5, 0));

        kad.on(first.clone());
        assert_eq!(*first.depths_seen.lock(), vec![0]);

        kad.on(second.clone());
        // the new peer learns the depth, which just changed to 3
        assert_eq!(*second.depths_seen.lock(), vec![3]);
        // the standing peer hears about the connection and the new depth
        assert_eq!(*first.peers_seen.lock(), vec![(*second.address(), 3)]);
        assert_eq!(*first.depths_seen.lock(), vec![0, 3]);
    }

    #[test]
    fn iterators_run_nearest_first_with_neighbour_flags() {
        let kad = table();
        for po in [1usize, 3, 5] {
            kad.on(TestConn::new(addr_at_po(kad.base_addr(), po, 0)));
        }

        let mut seen = Vec::new();
        kad.each_conn(None, 255, |_, po, nn| {
            seen.push((po, nn));
            true
        });
        assert_eq!(seen, vec![(5, true), (3, true), (1, false)]);

        let mut capped = Vec::new();
        kad.each_conn(None, 2, |_, po, _| {
            capped.push(po);
            true
        });
        assert_eq!(capped, vec![1]);

        let mut records = 0;
        kad.each_addr(None, 255, |_, _| {
            records += 1;
            true
        });
        assert_eq!(records, 3);
    }

    #[test]
    fn display_renders_the_table() {
        let kad = table();
        kad.on(TestConn::new(addr_at_po(kad.base_addr(), 1, 0)));
        kad.on(TestConn::new(addr_at_po(kad.base_addr(), 2, 0)));
        let rendered = kad.to_string();
        assert!(rendered.contains("population: 2 (2)"));
        assert!(rendered.contains("depth"));
    }
}
