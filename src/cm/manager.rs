use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use crate::cm::conn::{Conn, ConnEndpoint, ConnFlags, ConnId, ConnPool};
use crate::cm::event::{CmEvent, EventQueue};
use crate::cm::handshake::Handshake;
use crate::config::RdmConfig;
use crate::error::CmError;
use crate::peer::{LogicalAddr, PeerDirectory, PeerRef};
use crate::transport::{CompletionBindings, ConnInfo, EndpointState, TransportDomain, TransportEndpoint};
use crate::util::id_map::IdMap;

/// The connection manager of one RDM context: it owns the context's connection entries, the
///  table indexing them by peer, the loopback list and the event queue.
///
/// There is no locking in here. A `ConnManager` lives behind its RDM context's progress lock,
///  and holding `&mut ConnManager` is what it means to hold that lock.
pub struct ConnManager {
    config: Arc<RdmConfig>,
    addr: SocketAddr,
    bindings: CompletionBindings,
    pub(crate) peers: Arc<dyn PeerDirectory>,
    pub(crate) domain: Arc<dyn TransportDomain>,

    pub(crate) pool: ConnPool,
    pub(crate) conn_idx_map: IdMap<ConnId>,
    pub(crate) loopback_list: Vec<ConnId>,
    pub(crate) events: EventQueue,
}

impl ConnManager {
    pub fn new(
        config: Arc<RdmConfig>,
        addr: SocketAddr,
        bindings: CompletionBindings,
        peers: Arc<dyn PeerDirectory>,
        domain: Arc<dyn TransportDomain>,
    ) -> ConnManager {
        ConnManager {
            pool: ConnPool::new(config.max_connections),
            conn_idx_map: IdMap::new(config.max_peer_index),
            config,
            addr,
            bindings,
            peers,
            domain,
            loopback_list: Vec::new(),
            events: EventQueue::default(),
        }
    }

    /// The RDM context's own (listening) address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &RdmConfig {
        &self.config
    }

    pub fn conn(&self, id: ConnId) -> Option<&Conn> {
        self.pool.get(id)
    }

    /// The entry in the indexed table for a peer index
    pub fn lookup(&self, peer_index: usize) -> Option<ConnId> {
        self.conn_idx_map.lookup(peer_index).copied()
    }

    pub fn loopback_conns(&self) -> &[ConnId] {
        &self.loopback_list
    }

    pub fn num_conns(&self) -> usize {
        self.pool.len()
    }

    pub fn num_indexed(&self) -> usize {
        self.conn_idx_map.len()
    }

    pub fn num_queued_events(&self) -> usize {
        self.events.len()
    }

    /// This is how the transport hands connection events to connection management
    pub fn raise_event(&mut self, event: CmEvent) {
        self.events.push(event);
    }

    pub(crate) fn conn_mut(&mut self, id: ConnId) -> Result<&mut Conn, CmError> {
        self.pool.get_mut(id)
            .ok_or_else(|| CmError::InvariantViolation(format!("{:?} is not allocated", id)))
    }

    pub(crate) fn conn_state(&self, id: ConnId) -> Option<EndpointState> {
        self.pool.get(id)
            .and_then(|c| c.state())
    }

    /// Creates a connection entry for a peer, without indexing it and without opening an
    ///  endpoint. The entry holds a reference to the peer until it is freed.
    pub(crate) fn alloc_conn(&mut self, peer: &PeerRef) -> Option<ConnId> {
        let Some(id) = self.pool.alloc(Conn::new(peer.clone())) else {
            warn!("no free connection entry: all {} are in use", self.pool.capacity());
            return None;
        };
        self.peers.acquire(peer);

        debug!("allocated {:?} for {:?}", id, peer);
        Some(id)
    }

    /// Returns the indexed entry for a peer, creating and indexing it if there is none
    pub(crate) fn add_conn(&mut self, peer: &PeerRef) -> Result<ConnId, CmError> {
        if let Some(id) = self.lookup(peer.index()) {
            return Ok(id);
        }

        let id = self.alloc_conn(peer)
            .ok_or(CmError::NoMemory)?;

        if let Err(e) = self.conn_idx_map.set(peer.index(), id) {
            warn!("can not index {:?}: {}", peer, e);
            self.free_conn(id);
            return Err(CmError::IndexExhausted(peer.index()));
        }

        self.conn_mut(id)?.flags |= ConnFlags::INDEXED;
        Ok(id)
    }

    fn bind_conn(&self, ep: &mut dyn TransportEndpoint) -> Result<(), CmError> {
        for (target, flags) in self.bindings.bind_list() {
            ep.bind(target, flags)
                .map_err(|e| {
                    warn!("binding endpoint to {:?} failed: {}", target, e);
                    CmError::transport("bind", e)
                })?;
        }
        Ok(())
    }

    /// Opens and enables a transport endpoint for an entry, bound to all of the RDM context's
    ///  completion queues and counters. The endpoint takes a reference to the entry's peer.
    ///
    /// If this fails, the entry is left without an endpoint.
    pub(crate) fn open_conn(&mut self, id: ConnId, info: &ConnInfo) -> Result<(), CmError> {
        let peer = self.conn_mut(id)?.peer.clone();

        let mut ep = self.domain.open_endpoint(info, id)
            .map_err(|e| {
                warn!("opening endpoint for {:?} failed: {}", id, e);
                CmError::transport("open endpoint", e)
            })?;

        if let Err(e) = self.bind_conn(ep.as_mut()) {
            ep.close();
            return Err(e);
        }

        self.peers.acquire(&peer);
        if let Err(e) = ep.enable() {
            warn!("enabling endpoint for {:?} failed: {}", id, e);
            ep.close();
            self.peers.release(&peer);
            return Err(CmError::transport("enable", e));
        }

        self.conn_mut(id)?.ep = Some(ConnEndpoint { ep, peer });
        Ok(())
    }

    /// Closes an entry's endpoint, if it has one, and drops all queued events that refer to the
    ///  entry. The entry itself stays allocated (and indexed).
    pub(crate) fn close_conn(&mut self, id: ConnId) {
        let Some(conn) = self.pool.get_mut(id) else {
            error!("closing {:?} which is not allocated", id);
            return;
        };
        debug!("closing {:?}", id);

        if conn.flags.contains(ConnFlags::LOOPBACK) {
            conn.flags.remove(ConnFlags::LOOPBACK);
            self.loopback_list.retain(|c| *c != id);
        }

        if let Some(mut ep) = conn.ep.take() {
            ep.ep.close();
            self.peers.release(&ep.peer);
        }

        let num_purged = self.events.purge_conn(id);
        if num_purged > 0 {
            debug!("dropped {} queued event(s) for {:?}", num_purged, id);
        }
    }

    /// Returns an entry to the pool, removing it from the table and releasing its peer
    ///  reference. The entry must be closed.
    pub(crate) fn free_conn(&mut self, id: ConnId) {
        debug!("free {:?}", id);
        if self.conn_state(id).is_some() {
            error!("freeing {:?} while its endpoint is open - closing it", id);
            self.close_conn(id);
        }

        let Some(conn) = self.pool.release(id) else {
            error!("freeing {:?} which is not allocated", id);
            return;
        };

        if conn.flags.contains(ConnFlags::INDEXED)
            && self.conn_idx_map.lookup(conn.peer.index()) == Some(&id)
        {
            self.conn_idx_map.clear(conn.peer.index());
        }
        if conn.flags.contains(ConnFlags::LOOPBACK) {
            self.loopback_list.retain(|c| *c != id);
        }

        self.peers.release(&conn.peer);
    }

    /// Closes and frees all connections of the RDM context. This is for tearing the context
    ///  down and must not overlap with any other connection activity.
    pub fn free_all_conns(&mut self) {
        // there can not be more connections than the current number of possible peers
        let cnt = self.peers.max_peers();
        for index in 0..cnt {
            if let Some(id) = self.lookup(index) {
                self.close_conn(id);
                self.free_conn(id);
            }
        }

        for id in self.loopback_list.clone() {
            self.close_conn(id);
            self.free_conn(id);
        }

        if !self.conn_idx_map.is_empty() {
            error!("{} indexed connection(s) survived teardown", self.conn_idx_map.len());
        }
    }

    /// Starts establishing a connection for an entry that has no endpoint. On failure, the entry
    ///  is closed again.
    pub(crate) fn connect(&mut self, id: ConnId) -> Result<(), CmError> {
        debug!("connecting {:?}", id);
        let conn = self.conn_mut(id)?;
        if conn.has_endpoint() {
            return Err(CmError::InvariantViolation(format!("{:?} is connecting with an open endpoint", id)));
        }
        let dest_addr = conn.peer.addr();

        let info = ConnInfo {
            src_addr: self.addr,
            dest_addr: Some(dest_addr),
            tx_size: self.config.tx_size,
            rx_size: self.config.rx_size,
            handle: None,
        };
        self.open_conn(id, &info)?;

        let msg = Handshake {
            version: self.config.protocol_version,
            port: self.addr.port(),
            pid: self.config.process_id,
        };

        let result = match self.conn_mut(id)?.endpoint_mut() {
            Some(ep) => ep.connect(dest_addr, &msg.to_bytes()),
            None => return Err(CmError::InvariantViolation(format!("{:?} has no endpoint after opening it", id))),
        };
        if let Err(e) = result {
            warn!("connect for {:?} to {:?} failed: {}", id, dest_addr, e);
            self.close_conn(id);
            return Err(CmError::transport("connect", e));
        }
        Ok(())
    }

    /// This is the entry point for the data path: it returns the connection for a logical
    ///  address if it is established. Otherwise it starts establishing it (if that is not under
    ///  way already) and returns [CmError::TryAgain].
    pub fn get_conn(&mut self, addr: LogicalAddr) -> Result<ConnId, CmError> {
        let peer = self.peers.resolve(addr)
            .ok_or(CmError::UnknownAddress(addr))?;
        let id = self.add_conn(&peer)?;

        if self.conn_state(id).is_none() {
            self.connect(id)?;
        }

        match self.conn_state(id) {
            Some(EndpointState::Connected) => Ok(id),
            _ => Err(CmError::TryAgain),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::cm::event::EventKind;
    use crate::cm::test_support::*;
    use crate::test_util::node::test_addr_from_number;
    use bytes::Bytes;
    use super::*;

    #[test]
    fn test_add_conn() {
        let mut f = Fixture::new();
        let addr = f.av.insert(test_addr_from_number(7));
        let peer = f.av.resolve(addr).unwrap();

        let id = f.cm.add_conn(&peer).unwrap();
        assert_eq!(f.cm.lookup(peer.index()), Some(id));
        assert!(f.cm.conn(id).unwrap().is_indexed());
        assert!(!f.cm.conn(id).unwrap().has_endpoint());
        assert_eq!(f.av.refcount(peer.index()), Some(2));

        assert_eq!(f.cm.add_conn(&peer).unwrap(), id);
        assert_eq!(f.av.refcount(peer.index()), Some(2));
        assert_eq!(f.cm.num_conns(), 1);
    }

    #[test]
    fn test_add_conn_pool_exhausted() {
        let mut config = RdmConfig::new();
        config.max_connections = 1;
        let mut f = Fixture::with(config, Fail::Nothing);

        let a = f.av.resolve(f.av.insert(test_addr_from_number(7))).unwrap();
        let b = f.av.resolve(f.av.insert(test_addr_from_number(8))).unwrap();
        f.cm.add_conn(&a).unwrap();

        assert!(matches!(f.cm.add_conn(&b), Err(CmError::NoMemory)));
        assert_eq!(f.av.refcount(b.index()), Some(1));
        assert_eq!(f.cm.lookup(b.index()), None);
    }

    #[test]
    fn test_add_conn_index_exhausted() {
        let mut config = RdmConfig::new();
        config.max_peer_index = 1;
        let mut f = Fixture::with(config, Fail::Nothing);

        let _a = f.av.insert(test_addr_from_number(7));
        let b = f.av.resolve(f.av.insert(test_addr_from_number(8))).unwrap();
        assert_eq!(b.index(), 1);

        assert!(matches!(f.cm.add_conn(&b), Err(CmError::IndexExhausted(1))));
        assert_eq!(f.cm.num_conns(), 0);
        assert_eq!(f.av.refcount(1), Some(1));
    }

    #[test]
    fn test_get_conn_unknown_address() {
        let mut f = Fixture::new();
        assert!(matches!(f.cm.get_conn(LogicalAddr(17)), Err(CmError::UnknownAddress(LogicalAddr(17)))));
        assert_eq!(f.cm.num_conns(), 0);
    }

    #[test]
    fn test_get_conn() {
        let mut f = Fixture::new();
        let addr = f.av.insert(test_addr_from_number(7));

        assert!(matches!(f.cm.get_conn(addr), Err(CmError::TryAgain)));
        assert_eq!(f.recorder.num_connects(), 1);
        // only the first call connects
        assert!(matches!(f.cm.get_conn(addr), Err(CmError::TryAgain)));
        assert_eq!(f.recorder.num_connects(), 1);

        {
            let connects = f.recorder.connects.lock().unwrap();
            assert_eq!(connects[0].0, test_addr_from_number(7));
            let handshake = Handshake::deser(&mut connects[0].1.as_ref()).unwrap();
            assert_eq!(handshake, Handshake { version: 1, port: LOCAL_NUMBER, pid: LOCAL_PID });
        }
        assert_eq!(f.recorder.num_binds.load(std::sync::atomic::Ordering::SeqCst), 3);

        // address vector + entry + endpoint
        assert_eq!(f.av.refcount(0), Some(3));

        f.recorder.set_last_state(EndpointState::Connected);
        let id = f.cm.get_conn(addr).unwrap();
        assert_eq!(f.cm.lookup(0), Some(id));
        assert!(f.cm.conn(id).unwrap().is_connected());
    }

    #[rstest]
    #[case::open(Fail::Open, "open endpoint", 0)]
    #[case::bind(Fail::Bind, "bind", 1)]
    #[case::enable(Fail::Enable, "enable", 1)]
    #[case::connect(Fail::Connect, "connect", 1)]
    fn test_get_conn_transport_failure(#[case] fail: Fail, #[case] expected_op: &str, #[case] expected_closed: usize) {
        let mut f = Fixture::failing(fail);
        let addr = f.av.insert(test_addr_from_number(7));

        match f.cm.get_conn(addr) {
            Err(CmError::Transport { op, .. }) => assert_eq!(op, expected_op),
            other => panic!("unexpected result {:?}", other),
        }

        // the entry stays, without an endpoint
        let id = f.cm.lookup(0).unwrap();
        assert!(!f.cm.conn(id).unwrap().has_endpoint());
        assert_eq!(f.recorder.num_opened(), expected_closed);
        assert_eq!(f.recorder.num_closed(), expected_closed);
        assert_eq!(f.av.refcount(0), Some(2));
    }

    #[test]
    fn test_close_conn_purges_events() {
        let mut f = Fixture::new();
        let id = f.connecting(7);
        let other = f.connecting(8);

        for _ in 0..5 {
            f.cm.raise_event(CmEvent::for_conn(EventKind::Connected, id, Bytes::new()));
            f.cm.raise_event(CmEvent::for_conn(EventKind::Shutdown, id, Bytes::new()));
        }
        f.cm.raise_event(CmEvent::for_conn(EventKind::Shutdown, other, Bytes::new()));
        assert_eq!(f.cm.num_queued_events(), 11);

        f.cm.close_conn(id);
        assert_eq!(f.cm.num_queued_events(), 1);
        assert!(!f.cm.conn(id).unwrap().has_endpoint());
        assert_eq!(f.cm.lookup(0), Some(id));
        assert_eq!(f.recorder.num_closed(), 1);
        assert_eq!(f.av.refcount(0), Some(2));

        // only the other entry's shutdown is left
        assert_eq!(f.cm.handle_events().unwrap(), 1);
        assert_eq!(f.cm.lookup(1), None);
        assert_eq!(f.cm.lookup(0), Some(id));
    }

    #[test]
    fn test_free_conn_closes_open_endpoint() {
        let mut f = Fixture::new();
        let id = f.connecting(7);

        f.cm.free_conn(id);
        assert_eq!(f.recorder.num_closed(), 1);
        assert!(f.cm.conn(id).is_none());
        assert_eq!(f.cm.lookup(0), None);
        assert_eq!(f.av.refcount(0), Some(1));
    }

    #[test]
    fn test_free_all_conns() {
        let mut f = Fixture::new();
        let _a = f.connecting(7);
        let _b = f.connecting(8);
        let _own = f.connecting(LOCAL_NUMBER);

        // the connection to ourselves gets a second entry on the passive side
        f.cm.raise_event(conn_req_event(LOCAL_NUMBER, LOCAL_PID));
        f.cm.handle_events().unwrap();
        assert_eq!(f.cm.num_conns(), 4);
        assert_eq!(f.cm.loopback_conns().len(), 1);

        f.cm.free_all_conns();
        assert_eq!(f.cm.num_conns(), 0);
        assert_eq!(f.cm.num_indexed(), 0);
        assert!(f.cm.loopback_conns().is_empty());
        assert_eq!(f.recorder.num_closed(), f.recorder.num_opened());
        for index in 0..3 {
            assert_eq!(f.av.refcount(index), Some(1));
        }
    }
}
