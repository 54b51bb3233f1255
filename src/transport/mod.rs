//! The interface to the underlying connection-oriented transport. Connection management opens,
//!  binds, connects, accepts and closes endpoints through these traits; everything that moves
//!  bytes lives on the other side of them.
//!
//! Endpoints do not report progress by return value: the transport raises connection events
//!  ([crate::cm::event::CmEvent]) into the owning RDM context's event queue, tagged with the
//!  context value that was passed when the endpoint was opened.

use std::net::SocketAddr;
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;
use crate::cm::conn::ConnId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndpointState {
    /// opened, but neither connecting nor accepting
    Idle,
    Connecting,
    /// a connection request is on its way to the peer
    ReqSent,
    /// the peer's request was accepted, waiting for the transport to complete the connection
    Accepting,
    Connected,
    Disconnected,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
    pub struct BindFlags: u32 {
        const RECV = 1 << 0;
        const SEND = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const REMOTE_READ = 1 << 4;
        const REMOTE_WRITE = 1 << 5;
    }
}

/// Identifies a completion queue, counter or shared receive context inside the transport domain
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ResourceId(pub u32);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BindTarget {
    SharedRx(ResourceId),
    Cq(ResourceId),
    Counter(ResourceId),
}

/// The completion queues and counters of an RDM context. Every connection's endpoint reports
///  to all of them, so completions of all peers arrive in one place.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompletionBindings {
    pub srx: ResourceId,
    pub rx_cq: ResourceId,
    pub tx_cq: ResourceId,
    pub rx_cntr: Option<ResourceId>,
    pub tx_cntr: Option<ResourceId>,
    pub rd_cntr: Option<ResourceId>,
    pub wr_cntr: Option<ResourceId>,
    pub rem_rd_cntr: Option<ResourceId>,
    pub rem_wr_cntr: Option<ResourceId>,
}

impl CompletionBindings {
    /// Bindings with the mandatory queues only, and no counters
    pub fn new(srx: ResourceId, rx_cq: ResourceId, tx_cq: ResourceId) -> CompletionBindings {
        CompletionBindings {
            srx,
            rx_cq,
            tx_cq,
            rx_cntr: None,
            tx_cntr: None,
            rd_cntr: None,
            wr_cntr: None,
            rem_rd_cntr: None,
            rem_wr_cntr: None,
        }
    }

    /// All bindings of an endpoint, in the order they are applied: shared receive context,
    ///  receive and transmit queues, then whichever counters are present.
    pub fn bind_list(&self) -> Vec<(BindTarget, BindFlags)> {
        let mut result = vec![
            (BindTarget::SharedRx(self.srx), BindFlags::empty()),
            (BindTarget::Cq(self.rx_cq), BindFlags::RECV),
            (BindTarget::Cq(self.tx_cq), BindFlags::SEND),
        ];

        let counters = [
            (self.rx_cntr, BindFlags::RECV),
            (self.tx_cntr, BindFlags::SEND),
            (self.rd_cntr, BindFlags::READ),
            (self.wr_cntr, BindFlags::WRITE),
            (self.rem_rd_cntr, BindFlags::REMOTE_READ),
            (self.rem_wr_cntr, BindFlags::REMOTE_WRITE),
        ];
        for (cntr, flags) in counters {
            if let Some(id) = cntr {
                result.push((BindTarget::Counter(id), flags));
            }
        }
        result
    }
}

/// The provisional handle of an inbound connection request. It is consumed either by opening an
///  endpoint for it and accepting, or by rejecting it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnReqHandle(pub u64);

/// Parameters for opening an endpoint
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnInfo {
    pub src_addr: SocketAddr,
    /// For active endpoints, the address to connect to. For inbound requests, the address the
    ///  request came from - note that the port of that address is the peer's ephemeral port,
    ///  not the one it listens on.
    pub dest_addr: Option<SocketAddr>,
    pub tx_size: usize,
    pub rx_size: usize,
    pub handle: Option<ConnReqHandle>,
}

#[cfg_attr(test, automock)]
pub trait TransportDomain: Send + Sync {
    /// Opens a new endpoint. Events for the endpoint are raised with `context` as their source.
    ///
    /// For an inbound request, `info` is the request's info (including its handle), and the
    ///  endpoint is the one the request will be accepted on.
    fn open_endpoint(&self, info: &ConnInfo, context: ConnId) -> anyhow::Result<Box<dyn TransportEndpoint>>;

    /// Rejects an inbound request, sending `private_data` back to the originator. This releases
    ///  the request's resources.
    fn reject(&self, handle: ConnReqHandle, private_data: &[u8]) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
pub trait TransportEndpoint: Send {
    fn bind(&mut self, target: BindTarget, flags: BindFlags) -> anyhow::Result<()>;
    fn enable(&mut self) -> anyhow::Result<()>;

    fn connect(&mut self, dest: SocketAddr, private_data: &[u8]) -> anyhow::Result<()>;
    fn accept(&mut self, private_data: &[u8]) -> anyhow::Result<()>;

    fn state(&self) -> EndpointState;

    /// Shuts the endpoint down. No events are raised for it afterwards.
    fn close(&mut self);
}
