use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::cm::conn::ConnId;
use crate::cm::event::{CmEvent, EventKind};
use crate::rdm::RdmEndpoint;
use crate::transport::{BindFlags, BindTarget, ConnInfo, ConnReqHandle, EndpointState, TransportDomain, TransportEndpoint};

const FIRST_EPHEMERAL_PORT: u16 = 40000;
const MAX_SETTLE_ROUNDS: usize = 100;

/// An in-memory connection-oriented transport for any number of RDM endpoints.
///
/// Endpoints never raise events directly: the fabric queues them, and [SimFabric::deliver_all]
///  hands them to the owning RDM endpoints' connection managers. This keeps the order of
///  events under the test's control, and it means that transport calls made under an RDM
///  endpoint's progress lock never need that lock themselves.
///
/// The fabric behaves like a well-behaved socket transport:
/// * a request to an address without a listener is refused, i.e. the requester is shut down
/// * rejecting a request shuts the requester down
/// * accepting a request completes the connection on both sides - unless the requester was
///    closed in the meantime, in which case the accepting side is shut down
/// * closing a connected endpoint shuts down its peer, unless the closing process crashed
/// * events for closed endpoints are dropped
pub struct SimFabric {
    inner: Arc<Mutex<FabricInner>>,
}

struct SimNode {
    addr: SocketAddr,
    rdm: Option<Weak<RdmEndpoint>>,
    crashed: bool,
}

struct SimEp {
    node: usize,
    context: ConnId,
    local_addr: SocketAddr,
    state: EndpointState,
    closed: bool,
    num_bindings: usize,
    enabled: bool,
    /// the inbound request this endpoint was opened for
    request: Option<ConnReqHandle>,
    linked: Option<usize>,
}

struct PendingReq {
    origin: Option<usize>,
    data: Bytes,
}

enum Delivery {
    ConnReq {
        to: SocketAddr,
        from: SocketAddr,
        handle: ConnReqHandle,
        data: Bytes,
    },
    ToEndpoint {
        ep: usize,
        kind: EventKind,
        data: Bytes,
    },
}

struct FabricInner {
    nodes: Vec<SimNode>,
    endpoints: Vec<SimEp>,
    pending: FxHashMap<ConnReqHandle, PendingReq>,
    deliveries: VecDeque<Delivery>,
    next_port: u16,
    next_handle: u64,
    num_rejects: usize,
}

impl FabricInner {
    fn ephemeral_addr(&mut self, node_addr: SocketAddr) -> SocketAddr {
        let result = SocketAddr::new(node_addr.ip(), self.next_port);
        self.next_port = match self.next_port.checked_add(1) {
            Some(port) => port,
            None => FIRST_EPHEMERAL_PORT,
        };
        result
    }

    fn listener(&self, addr: SocketAddr) -> Option<usize> {
        self.nodes.iter()
            .rposition(|n| n.addr == addr && n.rdm.is_some() && !n.crashed)
    }

    fn rdm_of(&self, node: usize) -> Option<Arc<RdmEndpoint>> {
        let node = self.nodes.get(node)?;
        if node.crashed {
            return None;
        }
        node.rdm.as_ref()?.upgrade()
    }

    fn is_open(&self, ep: usize) -> bool {
        self.endpoints.get(ep)
            .map(|ep| !ep.closed)
            .unwrap_or(false)
    }

    fn raise(&mut self, ep: usize, kind: EventKind, data: Bytes) {
        self.deliveries.push_back(Delivery::ToEndpoint { ep, kind, data });
    }

    /// Turns a queued delivery into an event for an RDM endpoint, or drops it
    fn resolve(&mut self, delivery: Delivery) -> Option<(Arc<RdmEndpoint>, CmEvent)> {
        match delivery {
            Delivery::ConnReq { to, from, handle, data } => {
                let rdm = self.listener(to)
                    .and_then(|node| self.rdm_of(node));
                match rdm {
                    Some(rdm) => {
                        let info = ConnInfo {
                            src_addr: to,
                            dest_addr: Some(from),
                            tx_size: rdm.config().tx_size,
                            rx_size: rdm.config().rx_size,
                            handle: Some(handle),
                        };
                        Some((rdm, CmEvent::conn_req(info, data)))
                    }
                    None => {
                        debug!("no listener at {:?} - refusing connection request from {:?}", to, from);
                        if let Some(origin) = self.pending.remove(&handle).and_then(|p| p.origin) {
                            self.raise(origin, EventKind::Shutdown, Bytes::new());
                        }
                        None
                    }
                }
            }
            Delivery::ToEndpoint { ep, kind, data } => {
                let sim_ep = self.endpoints.get_mut(ep)?;
                if sim_ep.closed {
                    trace!("dropping {:?} event for closed endpoint {}", kind, ep);
                    return None;
                }
                match kind {
                    EventKind::Connected => sim_ep.state = EndpointState::Connected,
                    EventKind::Shutdown => sim_ep.state = EndpointState::Disconnected,
                    _ => {}
                }
                let (node, context) = (sim_ep.node, sim_ep.context);
                let rdm = self.rdm_of(node)?;
                Some((rdm, CmEvent::for_conn(kind, context, data)))
            }
        }
    }
}

fn lock(inner: &Mutex<FabricInner>) -> MutexGuard<'_, FabricInner> {
    inner.lock()
        .unwrap_or_else(|e| e.into_inner())
}

impl SimFabric {
    pub fn new() -> SimFabric {
        SimFabric {
            inner: Arc::new(Mutex::new(FabricInner {
                nodes: Vec::new(),
                endpoints: Vec::new(),
                pending: FxHashMap::default(),
                deliveries: VecDeque::new(),
                next_port: FIRST_EPHEMERAL_PORT,
                next_handle: 1,
                num_rejects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricInner> {
        lock(&self.inner)
    }

    /// A transport domain for an RDM endpoint listening at `addr`. The RDM endpoint must be
    ///  [attached](Self::attach) before it can receive events.
    pub fn domain(&self, addr: SocketAddr) -> Arc<dyn TransportDomain> {
        let mut inner = self.lock();
        inner.nodes.push(SimNode {
            addr,
            rdm: None,
            crashed: false,
        });
        Arc::new(SimDomain {
            fabric: self.inner.clone(),
            node: inner.nodes.len() - 1,
        })
    }

    pub fn attach(&self, rdm: &Arc<RdmEndpoint>) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let node = inner.nodes.iter_mut()
            .rev()
            .find(|n| n.addr == rdm.addr() && n.rdm.is_none())
            .ok_or_else(|| anyhow!("no domain was created for {:?}", rdm.addr()))?;
        node.rdm = Some(Arc::downgrade(rdm));
        Ok(())
    }

    /// Simulates a process going away without closing its endpoints: nothing is delivered to
    ///  it any more, and its address is free for a new RDM endpoint
    pub fn crash(&self, addr: SocketAddr) {
        for node in self.lock().nodes.iter_mut().filter(|n| n.addr == addr) {
            node.crashed = true;
        }
    }

    /// Sends a connection request that does not originate from any endpoint, with arbitrary
    ///  private data
    pub fn inject_conn_req(&self, from_node: SocketAddr, to: SocketAddr, data: Bytes) -> ConnReqHandle {
        let mut inner = self.lock();
        let handle = ConnReqHandle(inner.next_handle);
        inner.next_handle += 1;

        let from = inner.ephemeral_addr(from_node);
        inner.pending.insert(handle, PendingReq { origin: None, data: data.clone() });
        inner.deliveries.push_back(Delivery::ConnReq { to, from, handle, data });
        handle
    }

    /// Hands all queued events to their RDM endpoints' event queues, including events that
    ///  are raised while doing so. Returns the number of events that were delivered.
    pub fn deliver_all(&self) -> usize {
        let mut num_delivered = 0;
        loop {
            let next = {
                let mut inner = self.lock();
                let Some(delivery) = inner.deliveries.pop_front() else {
                    break;
                };
                inner.resolve(delivery)
            };

            if let Some((rdm, event)) = next {
                rdm.with_cm(|cm| cm.raise_event(event));
                num_delivered += 1;
            }
        }
        num_delivered
    }

    /// Alternates between delivering events and driving progress on the RDM endpoints until
    ///  nothing happens any more
    pub fn settle(&self, rdms: &[&Arc<RdmEndpoint>]) -> anyhow::Result<()> {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut num_events = self.deliver_all();
            for rdm in rdms {
                num_events += rdm.progress()?;
            }
            if num_events == 0 {
                return Ok(());
            }
        }
        bail!("fabric did not settle after {} rounds", MAX_SETTLE_ROUNDS)
    }

    /// The number of endpoints that were opened for the RDM endpoint at `addr` and not closed
    ///  yet
    pub fn num_open_endpoints(&self, addr: SocketAddr) -> usize {
        let inner = self.lock();
        inner.endpoints.iter()
            .filter(|ep| !ep.closed)
            .filter(|ep| inner.nodes[ep.node].addr == addr && !inner.nodes[ep.node].crashed)
            .count()
    }

    pub fn num_rejects(&self) -> usize {
        self.lock().num_rejects
    }

    pub fn num_queued_deliveries(&self) -> usize {
        self.lock().deliveries.len()
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        SimFabric::new()
    }
}

struct SimDomain {
    fabric: Arc<Mutex<FabricInner>>,
    node: usize,
}

impl TransportDomain for SimDomain {
    fn open_endpoint(&self, info: &ConnInfo, context: ConnId) -> anyhow::Result<Box<dyn TransportEndpoint>> {
        let mut inner = lock(&self.fabric);
        let local_addr = inner.ephemeral_addr(info.src_addr);
        inner.endpoints.push(SimEp {
            node: self.node,
            context,
            local_addr,
            state: EndpointState::Idle,
            closed: false,
            num_bindings: 0,
            enabled: false,
            request: info.handle,
            linked: None,
        });
        Ok(Box::new(SimEndpoint {
            fabric: self.fabric.clone(),
            id: inner.endpoints.len() - 1,
        }))
    }

    fn reject(&self, handle: ConnReqHandle, private_data: &[u8]) -> anyhow::Result<()> {
        let mut inner = lock(&self.fabric);
        let pending = inner.pending.remove(&handle)
            .ok_or_else(|| anyhow!("unknown connection request {:?}", handle))?;
        inner.num_rejects += 1;

        if let Some(origin) = pending.origin {
            inner.raise(origin, EventKind::Shutdown, Bytes::copy_from_slice(private_data));
        }
        Ok(())
    }
}

struct SimEndpoint {
    fabric: Arc<Mutex<FabricInner>>,
    id: usize,
}

impl SimEndpoint {
    fn open_ep<'a>(&self, inner: &'a mut FabricInner) -> anyhow::Result<&'a mut SimEp> {
        match inner.endpoints.get_mut(self.id) {
            Some(ep) if !ep.closed => Ok(ep),
            _ => bail!("endpoint {} is closed", self.id),
        }
    }
}

impl TransportEndpoint for SimEndpoint {
    fn bind(&mut self, _target: BindTarget, _flags: BindFlags) -> anyhow::Result<()> {
        let mut inner = lock(&self.fabric);
        self.open_ep(&mut inner)?.num_bindings += 1;
        Ok(())
    }

    fn enable(&mut self) -> anyhow::Result<()> {
        let mut inner = lock(&self.fabric);
        let ep = self.open_ep(&mut inner)?;
        if ep.num_bindings == 0 {
            bail!("enabling an unbound endpoint");
        }
        ep.enabled = true;
        Ok(())
    }

    fn connect(&mut self, dest: SocketAddr, private_data: &[u8]) -> anyhow::Result<()> {
        let mut inner = lock(&self.fabric);
        let ep = self.open_ep(&mut inner)?;
        if !ep.enabled || ep.state != EndpointState::Idle {
            bail!("connect on endpoint in state {:?}", ep.state);
        }
        ep.state = EndpointState::ReqSent;
        let from = ep.local_addr;

        let handle = ConnReqHandle(inner.next_handle);
        inner.next_handle += 1;

        let data = Bytes::copy_from_slice(private_data);
        inner.pending.insert(handle, PendingReq { origin: Some(self.id), data: data.clone() });
        inner.deliveries.push_back(Delivery::ConnReq { to: dest, from, handle, data });
        Ok(())
    }

    fn accept(&mut self, private_data: &[u8]) -> anyhow::Result<()> {
        let mut inner = lock(&self.fabric);
        let ep = self.open_ep(&mut inner)?;
        let Some(handle) = ep.request else {
            bail!("accept on an endpoint that was not opened for a connection request");
        };
        if !ep.enabled || ep.state != EndpointState::Idle {
            bail!("accept on endpoint in state {:?}", ep.state);
        }
        ep.state = EndpointState::Accepting;

        let pending = inner.pending.remove(&handle)
            .ok_or_else(|| anyhow!("connection request {:?} is gone", handle))?;

        match pending.origin.filter(|&origin| inner.is_open(origin)) {
            Some(origin) => {
                inner.endpoints[origin].linked = Some(self.id);
                inner.endpoints[self.id].linked = Some(origin);
                inner.raise(origin, EventKind::Connected, Bytes::copy_from_slice(private_data));
                inner.raise(self.id, EventKind::Connected, pending.data);
            }
            None => {
                debug!("requester of {:?} went away before the request was accepted", handle);
                inner.raise(self.id, EventKind::Shutdown, Bytes::new());
            }
        }
        Ok(())
    }

    fn state(&self) -> EndpointState {
        let inner = lock(&self.fabric);
        match inner.endpoints.get(self.id) {
            Some(ep) if !ep.closed => ep.state,
            _ => EndpointState::Disconnected,
        }
    }

    fn close(&mut self) {
        let mut inner = lock(&self.fabric);
        let Ok(ep) = self.open_ep(&mut inner) else {
            return;
        };
        ep.closed = true;
        ep.state = EndpointState::Disconnected;
        let (node, linked) = (ep.node, ep.linked);

        // a crashed process goes away silently
        if inner.nodes[node].crashed {
            return;
        }
        if let Some(peer) = linked {
            if inner.is_open(peer) {
                inner.raise(peer, EventKind::Shutdown, Bytes::new());
            }
        }
    }
}
