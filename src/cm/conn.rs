use std::fmt::{Debug, Formatter};
use bitflags::bitflags;
use crate::peer::PeerRef;
use crate::transport::{EndpointState, TransportEndpoint};

/// Identifies a connection entry by its slot in the [ConnPool].
///
/// NB: Slots are reused after an entry is freed, so a stale `ConnId` may refer to an unrelated
///      entry. This is why closing an entry purges all queued events referring to it.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnId(u32);

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl ConnId {
    pub fn from_raw(raw: u32) -> ConnId {
        ConnId(raw)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct ConnFlags: u8 {
        /// the entry is stored in the indexed connection table under its peer's index
        const INDEXED = 1 << 0;
        /// the entry is on the loopback list rather than in the table
        const LOOPBACK = 1 << 1;
    }
}

/// An open transport endpoint together with the peer reference that the endpoint holds
pub(crate) struct ConnEndpoint {
    pub ep: Box<dyn TransportEndpoint>,
    pub peer: PeerRef,
}

/// A connection entry binds a peer to at most one live transport endpoint
pub struct Conn {
    pub(crate) peer: PeerRef,
    pub(crate) ep: Option<ConnEndpoint>,
    pub(crate) flags: ConnFlags,
    pub(crate) remote_pid: u32,
    pub(crate) version: Option<u8>,
}

impl Debug for Conn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn{{{:?}, state:{:?}, flags:{:?}, remote_pid:{}}}", self.peer, self.state(), self.flags, self.remote_pid)
    }
}

impl Conn {
    pub(crate) fn new(peer: PeerRef) -> Conn {
        Conn {
            peer,
            ep: None,
            flags: ConnFlags::empty(),
            remote_pid: 0,
            version: None,
        }
    }

    pub fn peer(&self) -> &PeerRef {
        &self.peer
    }

    /// `None` if there is no open endpoint
    pub fn state(&self) -> Option<EndpointState> {
        self.ep.as_ref()
            .map(|ep| ep.ep.state())
    }

    pub fn has_endpoint(&self) -> bool {
        self.ep.is_some()
    }

    /// This is all the data path needs to know about a connection
    pub fn is_connected(&self) -> bool {
        self.state() == Some(EndpointState::Connected)
    }

    pub fn remote_pid(&self) -> u32 {
        self.remote_pid
    }

    /// The protocol version agreed on in the handshake, once it is known
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn is_indexed(&self) -> bool {
        self.flags.contains(ConnFlags::INDEXED)
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.contains(ConnFlags::LOOPBACK)
    }

    pub(crate) fn endpoint_mut(&mut self) -> Option<&mut Box<dyn TransportEndpoint>> {
        self.ep.as_mut()
            .map(|ep| &mut ep.ep)
    }
}

/// Fixed-capacity backing store for connection entries. Freed slots are handed out again
///  before fresh ones, most recently freed first.
pub struct ConnPool {
    slots: Vec<Option<Conn>>,
    free: Vec<u32>,
    capacity: usize,
}

impl ConnPool {
    pub fn new(capacity: usize) -> ConnPool {
        ConnPool {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// `None` if the pool is exhausted
    pub fn alloc(&mut self, conn: Conn) -> Option<ConnId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.capacity {
                    return None;
                }
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };

        self.slots[index as usize] = Some(conn);
        Some(ConnId(index))
    }

    pub fn get(&self, id: ConnId) -> Option<&Conn> {
        self.slots.get(id.0 as usize)
            .and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Conn> {
        self.slots.get_mut(id.0 as usize)
            .and_then(|s| s.as_mut())
    }

    pub fn release(&mut self, id: ConnId) -> Option<Conn> {
        let conn = self.slots.get_mut(id.0 as usize)
            .and_then(|s| s.take())?;
        self.free.push(id.0);
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
