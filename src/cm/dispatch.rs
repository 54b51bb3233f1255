use tracing::{debug, error, info, warn};
use crate::cm::conn::ConnId;
use crate::cm::event::{CmEntry, EventKind, EventSource};
use crate::cm::handshake::Handshake;
use crate::cm::manager::ConnManager;
use crate::error::CmError;

impl ConnManager {
    /// Drains the event queue, dispatching every event in arrival order. This is called once per
    ///  progress iteration.
    ///
    /// Failures to handle an individual event (e.g. a connection request that could not be
    ///  accepted) are logged and do not stop the drain. Invariant violations are logged, and the
    ///  first one is returned after the queue was drained completely.
    pub fn handle_events(&mut self) -> Result<usize, CmError> {
        let mut num_dispatched = 0;
        let mut violation = None;

        while let Some(event) = self.events.pop() {
            info!("event {:?}", event.kind);

            let result = match event.kind {
                EventKind::ConnReq => self.process_connreq(event.entry),
                EventKind::Connected => self.process_connected(event.entry),
                EventKind::Shutdown => self.process_shutdown(event.entry),
                other => Err(CmError::InvariantViolation(format!("unexpected {:?} event", other))),
            };
            num_dispatched += 1;

            match result {
                Ok(()) => {}
                Err(e) if e.is_invariant_violation() => {
                    error!("{}", e);
                    violation.get_or_insert(e);
                }
                Err(e) => {
                    warn!("{:?} event was not processed successfully: {}", event.kind, e);
                }
            }
        }

        match violation {
            Some(e) => Err(e),
            None => Ok(num_dispatched),
        }
    }

    fn event_conn(&self, entry: &CmEntry) -> Result<ConnId, CmError> {
        let EventSource::Conn(id) = entry.source else {
            return Err(CmError::InvariantViolation(format!("connection event raised by {:?}", entry.source)));
        };
        if self.conn(id).is_none() {
            return Err(CmError::InvariantViolation(format!("event for {:?} which is not allocated", id)));
        }
        Ok(id)
    }

    /// The transport completed a connection: record what the peer told us in its handshake
    pub(crate) fn process_connected(&mut self, entry: CmEntry) -> Result<(), CmError> {
        let id = self.event_conn(&entry)?;
        let msg = Handshake::deser(&mut entry.data.as_ref())
            .map_err(CmError::MalformedHandshake)?;

        let local_version = self.config().protocol_version;
        let conn = self.conn_mut(id)?;
        conn.remote_pid = msg.pid;

        if msg.version > local_version {
            warn!("{:?}: peer returned protocol version {}, which is higher than the proposed version {}", id, msg.version, local_version);
        }
        conn.version = Some(msg.version.min(local_version));

        debug!("{:?} established with remote pid {}", id, msg.pid);
        Ok(())
    }

    /// Either side shut the connection down: the entry goes away
    pub(crate) fn process_shutdown(&mut self, entry: CmEntry) -> Result<(), CmError> {
        let id = self.event_conn(&entry)?;
        self.close_conn(id);
        self.free_conn(id);
        Ok(())
    }
}
