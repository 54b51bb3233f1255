use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};
use crate::peer::{LogicalAddr, Peer, PeerDirectory, PeerRef};

/// An in-memory [PeerDirectory].
///
/// Applications [insert](AddressVector::insert) their peers' network addresses and get a
///  [LogicalAddr] in return that they use for addressing. Each logical address holds a
///  reference to its peer. Peers that connect to us without having been inserted are
///  registered implicitly and disappear from the directory once their last reference is gone.
///
/// Peer indices are allocated lowest-free-first, so they stay small and dense.
pub struct AddressVector {
    inner: Mutex<AvInner>,
}

#[derive(Default)]
struct AvInner {
    peers: Vec<Option<PeerRef>>,
    by_addr: FxHashMap<SocketAddr, usize>,
    logical: FxHashMap<LogicalAddr, PeerRef>,
    next_logical: u64,
}

impl AvInner {
    fn get_or_register(&mut self, addr: SocketAddr) -> PeerRef {
        if let Some(peer) = self.by_addr.get(&addr)
            .and_then(|&index| self.peers.get(index))
            .and_then(|p| p.clone())
        {
            peer.add_ref();
            return peer;
        }

        let index = match self.peers.iter().position(|p| p.is_none()) {
            Some(index) => index,
            None => {
                self.peers.push(None);
                self.peers.len() - 1
            }
        };

        let peer = Arc::new(Peer::new(index, addr));
        debug!("registered {:?}", peer);
        self.peers[index] = Some(peer.clone());
        self.by_addr.insert(addr, index);
        peer
    }

    fn release(&mut self, peer: &PeerRef) {
        if peer.drop_ref() > 0 {
            return;
        }

        match self.peers.get(peer.index()) {
            Some(Some(p)) if Arc::ptr_eq(p, peer) => {
                debug!("last reference released, removing {:?}", peer);
                self.peers[peer.index()] = None;
                self.by_addr.remove(&peer.addr());
            }
            _ => {
                error!("released {:?} which is not registered in the address vector", peer);
            }
        }
    }
}

impl AddressVector {
    pub fn new() -> AddressVector {
        AddressVector {
            inner: Mutex::new(AvInner::default()),
        }
    }

    /// Registers a peer's network address, returning the logical address for it. The logical
    ///  address holds a reference to the peer until it is [removed](Self::remove).
    ///
    /// Inserting the same network address twice yields two logical addresses for the same peer.
    pub fn insert(&self, addr: SocketAddr) -> LogicalAddr {
        let mut inner = self.lock();
        let peer = inner.get_or_register(addr);

        let logical = LogicalAddr(inner.next_logical);
        inner.next_logical += 1;

        trace!("{:?} -> {:?}", logical, peer);
        inner.logical.insert(logical, peer);
        logical
    }

    pub fn remove(&self, addr: LogicalAddr) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let peer = inner.logical.remove(&addr)
            .ok_or_else(|| anyhow!("logical address {:?} is not registered", addr))?;
        inner.release(&peer);
        Ok(())
    }

    /// The current reference count of the peer with the given index, if there is one
    pub fn refcount(&self, index: usize) -> Option<usize> {
        self.lock().peers.get(index)
            .and_then(|p| p.as_ref())
            .map(|p| p.ref_count())
    }

    pub fn num_peers(&self) -> usize {
        self.lock().by_addr.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AvInner> {
        // the table is consistent after every operation, so there is nothing to repair after a
        //  panic in some other thread
        self.inner.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AddressVector {
    fn default() -> Self {
        AddressVector::new()
    }
}

impl PeerDirectory for AddressVector {
    fn resolve(&self, addr: LogicalAddr) -> Option<PeerRef> {
        self.lock().logical.get(&addr).cloned()
    }

    fn get_or_register(&self, addr: SocketAddr) -> anyhow::Result<PeerRef> {
        Ok(self.lock().get_or_register(addr))
    }

    fn acquire(&self, peer: &PeerRef) {
        peer.add_ref();
    }

    fn release(&self, peer: &PeerRef) {
        // NB: decrementing under the lock prevents a concurrent get_or_register() from picking up
        //      a peer that is about to be removed
        self.lock().release(peer);
    }

    fn max_peers(&self) -> usize {
        self.lock().peers.len()
    }
}
