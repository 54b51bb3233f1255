//! Connection management emulates reliable datagrams on top of connection-oriented transport
//!  endpoints: the data path addresses peers, and connection management makes sure there is
//!  (at most) one connection per peer, establishing it on demand.
//!
//! All of this runs under the owning RDM context's progress lock. The transport raises events
//!  (inbound requests, established connections, shutdowns) into a queue that is drained by
//!  [ConnManager::handle_events] once per progress iteration.
//!
//! When two processes connect to each other at the same time, both sides see a connection
//!  request for a peer they are connecting to themselves. They resolve this independently by
//!  comparing addresses, so that both agree on the surviving connection. A process connecting to
//!  its own address gets a separate loopback entry for the passive side.

pub mod conn;
mod connreq;
mod dispatch;
pub mod event;
pub mod handshake;
pub mod manager;

#[cfg(test)] mod test_support;

pub use conn::{Conn, ConnId};
pub use event::{CmEvent, EventKind};
pub use manager::ConnManager;
