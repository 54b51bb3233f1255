//! The peer directory maps the logical addresses that applications use to stable peer
//!  identities. It owns the lifetime of a [Peer]: Connection management only references peers,
//!  taking and releasing references through the directory.

pub mod address_vector;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)] use mockall::automock;

/// An opaque address handed out to applications when they register a peer's network address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LogicalAddr(pub u64);

pub struct Peer {
    index: usize,
    addr: SocketAddr,
    refcnt: AtomicUsize,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{#{}@{:?}}}", self.index, self.addr)
    }
}

impl Peer {
    /// The new peer starts out with a single reference, owned by whoever created it
    pub fn new(index: usize, addr: SocketAddr) -> Peer {
        Peer {
            index,
            addr,
            refcnt: AtomicUsize::new(1),
        }
    }

    /// A small integer that is stable for the peer's lifetime and unique among live peers
    pub fn index(&self) -> usize {
        self.index
    }

    /// The peer's listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ref_count(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// For [PeerDirectory] implementations
    pub fn add_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// For [PeerDirectory] implementations: returns the number of remaining references
    pub fn drop_ref(&self) -> usize {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "reference count underflow for {:?}", self);
        prev - 1
    }
}

pub type PeerRef = Arc<Peer>;

#[cfg_attr(test, automock)]
pub trait PeerDirectory: Send + Sync {
    /// Returns the peer registered for a logical address, without taking a reference
    fn resolve(&self, addr: LogicalAddr) -> Option<PeerRef>;

    /// Returns the peer for a network address, registering it if it is not known yet. The
    ///  caller owns one reference to the returned peer and must [release](Self::release) it.
    fn get_or_register(&self, addr: SocketAddr) -> anyhow::Result<PeerRef>;

    fn acquire(&self, peer: &PeerRef);
    fn release(&self, peer: &PeerRef);

    /// Upper bound (exclusive) for the index of any peer that is currently registered
    fn max_peers(&self) -> usize;
}
