use std::collections::VecDeque;
use bytes::Bytes;
use tracing::trace;
use crate::cm::conn::ConnId;
use crate::transport::ConnInfo;

/// The kinds of events a transport can raise. Connection management handles only connection
///  requests, established connections and shutdowns - anything else arriving in its queue is a
///  defect.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventKind {
    Notify,
    ConnReq,
    Connected,
    Shutdown,
    MrComplete,
    AvComplete,
    JoinComplete,
}

/// What raised an event: the RDM context's listening endpoint (for inbound requests), or the
///  endpoint of a connection entry
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventSource {
    Listener,
    Conn(ConnId),
}

/// The connection management record of an event as it comes from the transport
#[derive(Debug, Clone)]
pub struct CmEntry {
    pub source: EventSource,
    /// present for inbound requests: the request's parameters and handle
    pub info: Option<ConnInfo>,
    /// private data, i.e. the peer's serialized [crate::cm::handshake::Handshake]
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct CmEvent {
    pub kind: EventKind,
    pub entry: CmEntry,
}

impl CmEvent {
    pub fn conn_req(info: ConnInfo, data: Bytes) -> CmEvent {
        CmEvent {
            kind: EventKind::ConnReq,
            entry: CmEntry {
                source: EventSource::Listener,
                info: Some(info),
                data,
            },
        }
    }

    pub fn for_conn(kind: EventKind, conn: ConnId, data: Bytes) -> CmEvent {
        CmEvent {
            kind,
            entry: CmEntry {
                source: EventSource::Conn(conn),
                info: None,
                data,
            },
        }
    }

    pub fn refers_to(&self, conn: ConnId) -> bool {
        self.entry.source == EventSource::Conn(conn)
    }
}

/// Pending connection events of one RDM context, in arrival order. It is only ever touched while
///  holding the context's progress lock.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<CmEvent>,
}

impl EventQueue {
    pub fn push(&mut self, event: CmEvent) {
        trace!("queueing {:?} event from {:?}", event.kind, event.entry.source);
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<CmEvent> {
        self.events.pop_front()
    }

    /// Drops all queued events that were raised for a connection, returning how many there were
    pub fn purge_conn(&mut self, conn: ConnId) -> usize {
        let before = self.events.len();
        self.events.retain(|e| !e.refers_to(conn));
        before - self.events.len()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
