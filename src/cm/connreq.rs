use std::cmp::Ordering;
use tracing::{error, info, warn};
use crate::cm::conn::{ConnFlags, ConnId};
use crate::cm::event::{CmEntry, EventSource};
use crate::cm::handshake::Handshake;
use crate::cm::manager::ConnManager;
use crate::error::CmError;
use crate::peer::PeerRef;
use crate::transport::{ConnInfo, ConnReqHandle, EndpointState};
use crate::util::addr::addr_cmp;

/// What to do with an inbound connection request
enum Decision {
    Accept(ConnId),
    Reject,
}

/// An inbound request's handle together with the private data it arrived with. Every request is
///  either accepted or rejected exactly once, and a rejection echoes the data back unchanged.
#[derive(Clone, Copy)]
struct PendingReq<'a> {
    handle: ConnReqHandle,
    data: &'a [u8],
}

impl ConnManager {
    /// Handles an inbound connection request: accepts it, or rejects it because a connection
    ///  with the peer exists or is being established and wins over the new one.
    ///
    /// Two processes that connect to each other at the same time must agree on which of the two
    ///  connections survives, without being able to talk about it. They do so by comparing
    ///  addresses: the request coming from the higher address wins on both sides.
    pub(crate) fn process_connreq(&mut self, entry: CmEntry) -> Result<(), CmError> {
        let Some(info) = entry.info else {
            // NB: without request info there is no handle, so there is nothing to dispose of
            return Err(CmError::InvariantViolation("connection request without request info".to_string()));
        };
        let Some(handle) = info.handle else {
            return Err(CmError::InvariantViolation(format!("connection request without handle: {:?}", info)));
        };
        let req = PendingReq { handle, data: &entry.data };

        if entry.source != EventSource::Listener {
            self.reject(req);
            return Err(CmError::InvariantViolation(format!("connection request raised by {:?}", entry.source)));
        }
        let Some(mut peer_addr) = info.dest_addr else {
            self.reject(req);
            return Err(CmError::InvariantViolation(format!("connection request without source address: {:?}", info)));
        };

        let msg = match Handshake::deser(&mut entry.data.as_ref()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("rejecting connection request from {:?} with malformed handshake: {}", peer_addr, e);
                self.reject(req);
                return Err(CmError::MalformedHandshake(e));
            }
        };

        // the request comes from the peer's ephemeral port, we need the one it listens on
        peer_addr.set_port(msg.port);

        let peer = match self.peers.get_or_register(peer_addr) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("no peer for connection request from {:?}: {}", peer_addr, e);
                self.reject(req);
                return Err(CmError::NoMemory);
            }
        };

        let result = self.process_connreq_for_peer(&peer, &info, req, msg);
        self.peers.release(&peer);
        result
    }

    fn process_connreq_for_peer(&mut self, peer: &PeerRef, info: &ConnInfo, req: PendingReq, msg: Handshake) -> Result<(), CmError> {
        let id = match self.add_conn(peer) {
            Ok(id) => id,
            Err(e) => {
                self.reject(req);
                return Err(e);
            }
        };
        info!("connreq for {:?} from {:?}", id, peer);

        let (decision, report) = self.decide(id, peer, &msg);
        let result = match decision {
            Decision::Reject => {
                self.reject(req);
                Ok(())
            }
            Decision::Accept(target) => self.accept_conn(target, info, req, msg),
        };
        match report {
            Some(e) => Err(e),
            None => result,
        }
    }

    /// Resolves a request for a peer that may already have a connection entry. This may close
    ///  the existing entry's endpoint (which loses against the request), or allocate a separate
    ///  loopback entry for a connection to ourselves.
    ///
    /// The second part of the result is an error to report after the decision was carried out.
    ///  An endpoint in a state that can not coexist with a request is an invariant violation;
    ///  the endpoint is closed and the request accepted in that case.
    fn decide(&mut self, id: ConnId, peer: &PeerRef, msg: &Handshake) -> (Decision, Option<CmError>) {
        let Some(state) = self.conn_state(id) else {
            return (Decision::Accept(id), None);
        };

        match state {
            EndpointState::Connecting | EndpointState::ReqSent => {
                // simultaneous connections
                match addr_cmp(&peer.addr(), &self.addr()) {
                    Ordering::Less => {
                        // let our request finish
                        info!("simultaneous, reject peer {:?}", id);
                        (Decision::Reject, None)
                    }
                    Ordering::Greater => {
                        info!("simultaneous, accept peer {:?}", id);
                        self.close_conn(id);
                        (Decision::Accept(id), None)
                    }
                    Ordering::Equal => {
                        info!("loopback conn for {:?}", id);
                        match self.alloc_loopback_conn(peer) {
                            Some(lb) => (Decision::Accept(lb), None),
                            None => (Decision::Reject, Some(CmError::NoMemory)),
                        }
                    }
                }
            }
            EndpointState::Accepting | EndpointState::Connected => {
                let remote_pid = self.pool.get(id)
                    .map(|c| c.remote_pid);
                if remote_pid == Some(msg.pid) {
                    info!("simultaneous, reject peer {:?}", id);
                    (Decision::Reject, None)
                }
                else {
                    info!("old connection exists, replacing {:?}", id);
                    self.close_conn(id);
                    (Decision::Accept(id), None)
                }
            }
            other => {
                error!("connection request for {:?} in unexpected state {:?}", id, other);
                self.close_conn(id);
                (Decision::Accept(id), Some(CmError::InvariantViolation(format!("connection request for {:?} in state {:?}", id, other))))
            }
        }
    }

    fn alloc_loopback_conn(&mut self, peer: &PeerRef) -> Option<ConnId> {
        let id = self.alloc_conn(peer)?;
        if let Some(conn) = self.pool.get_mut(id) {
            conn.flags |= ConnFlags::LOOPBACK;
        }
        self.loopback_list.push(id);
        Some(id)
    }

    /// Opens an endpoint for the request and accepts it. If that fails, the entry is closed and
    ///  freed, and the request is rejected.
    fn accept_conn(&mut self, id: ConnId, info: &ConnInfo, req: PendingReq, msg: Handshake) -> Result<(), CmError> {
        let reply = msg.accept_reply(self.config().protocol_version, self.config().process_id);

        let Some(conn) = self.pool.get_mut(id) else {
            self.reject(req);
            return Err(CmError::InvariantViolation(format!("accepting for {:?} which is not allocated", id)));
        };
        conn.remote_pid = msg.pid;
        conn.version = Some(reply.version);

        if let Err(e) = self.open_conn(id, info) {
            self.discard_conn(id, req);
            return Err(e);
        }

        let result = match self.pool.get_mut(id).and_then(|c| c.endpoint_mut()) {
            Some(ep) => ep.accept(&reply.to_bytes()),
            None => {
                self.discard_conn(id, req);
                return Err(CmError::InvariantViolation(format!("{:?} has no endpoint after opening it", id)));
            }
        };
        if let Err(e) = result {
            warn!("accepting connection request for {:?} failed: {}", id, e);
            self.discard_conn(id, req);
            return Err(CmError::transport("accept", e));
        }
        Ok(())
    }

    /// Gives up on an entry that was set up for a request, and rejects the request
    fn discard_conn(&mut self, id: ConnId, req: PendingReq) {
        if self.pool.get(id).is_some() {
            self.close_conn(id);
            self.free_conn(id);
        }
        self.reject(req);
    }

    /// Rejecting is best effort: if it fails, the peer will notice eventually
    fn reject(&self, req: PendingReq) {
        if let Err(e) = self.domain.reject(req.handle, req.data) {
            warn!("rejecting connection request {:?} failed: {}", req.handle, e);
        }
    }
}
