use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use anyhow::anyhow;
use bytes::Bytes;
use crate::cm::conn::ConnId;
use crate::cm::event::CmEvent;
use crate::cm::handshake::Handshake;
use crate::cm::manager::ConnManager;
use crate::config::RdmConfig;
use crate::peer::PeerDirectory;
use crate::peer::address_vector::AddressVector;
use crate::test_util::node::test_addr_from_number;
use crate::transport::{CompletionBindings, ConnInfo, ConnReqHandle, EndpointState, MockTransportDomain, MockTransportEndpoint, ResourceId};

pub const LOCAL_NUMBER: u16 = 5;
pub const LOCAL_PID: u32 = 4711;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Fail {
    Nothing,
    Open,
    Bind,
    Enable,
    Connect,
    Accept,
}

/// Records what connection management did to the (mocked) transport
#[derive(Default)]
pub struct Recorder {
    pub num_opened: AtomicUsize,
    pub num_closed: AtomicUsize,
    pub num_binds: AtomicUsize,
    pub connects: Mutex<Vec<(SocketAddr, Bytes)>>,
    pub accepts: Mutex<Vec<Bytes>>,
    pub rejects: Mutex<Vec<(ConnReqHandle, Bytes)>>,
    states: Mutex<Vec<Arc<Mutex<EndpointState>>>>,
}

impl Recorder {
    pub fn num_opened(&self) -> usize {
        self.num_opened.load(Ordering::SeqCst)
    }

    pub fn num_closed(&self) -> usize {
        self.num_closed.load(Ordering::SeqCst)
    }

    pub fn num_connects(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn num_accepts(&self) -> usize {
        self.accepts.lock().unwrap().len()
    }

    pub fn num_rejects(&self) -> usize {
        self.rejects.lock().unwrap().len()
    }

    /// Overrides the state of the most recently opened endpoint
    pub fn set_last_state(&self, state: EndpointState) {
        let states = self.states.lock().unwrap();
        *states.last().unwrap().lock().unwrap() = state;
    }
}

fn mock_endpoint(recorder: Arc<Recorder>, fail: Fail) -> MockTransportEndpoint {
    let state = Arc::new(Mutex::new(EndpointState::Idle));
    recorder.states.lock().unwrap().push(state.clone());

    let mut ep = MockTransportEndpoint::new();

    let r = recorder.clone();
    ep.expect_bind().returning(move |_, _| {
        r.num_binds.fetch_add(1, Ordering::SeqCst);
        if fail == Fail::Bind { Err(anyhow!("bind failed")) } else { Ok(()) }
    });
    ep.expect_enable().returning(move || {
        if fail == Fail::Enable { Err(anyhow!("enable failed")) } else { Ok(()) }
    });

    let r = recorder.clone();
    let s = state.clone();
    ep.expect_connect().returning(move |dest, data| {
        if fail == Fail::Connect {
            return Err(anyhow!("connect failed"));
        }
        r.connects.lock().unwrap().push((dest, Bytes::copy_from_slice(data)));
        *s.lock().unwrap() = EndpointState::ReqSent;
        Ok(())
    });

    let r = recorder.clone();
    let s = state.clone();
    ep.expect_accept().returning(move |data| {
        if fail == Fail::Accept {
            return Err(anyhow!("accept failed"));
        }
        r.accepts.lock().unwrap().push(Bytes::copy_from_slice(data));
        *s.lock().unwrap() = EndpointState::Accepting;
        Ok(())
    });

    let s = state.clone();
    ep.expect_state().returning(move || *s.lock().unwrap());

    ep.expect_close().returning(move || {
        recorder.num_closed.fetch_add(1, Ordering::SeqCst);
        *state.lock().unwrap() = EndpointState::Disconnected;
    });
    ep
}

fn mock_domain(recorder: Arc<Recorder>, fail: Fail) -> MockTransportDomain {
    let mut domain = MockTransportDomain::new();

    let r = recorder.clone();
    domain.expect_open_endpoint().returning(move |_, _| {
        if fail == Fail::Open {
            return Err(anyhow!("open failed"));
        }
        r.num_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(mock_endpoint(r.clone(), fail)) as Box<dyn crate::transport::TransportEndpoint>)
    });
    domain.expect_reject().returning(move |handle, data| {
        recorder.rejects.lock().unwrap().push((handle, Bytes::copy_from_slice(data)));
        Ok(())
    });
    domain
}

pub struct Fixture {
    pub cm: ConnManager,
    pub av: Arc<AddressVector>,
    pub recorder: Arc<Recorder>,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with(RdmConfig::new(), Fail::Nothing)
    }

    pub fn failing(fail: Fail) -> Fixture {
        Fixture::with(RdmConfig::new(), fail)
    }

    pub fn with(config: RdmConfig, fail: Fail) -> Fixture {
        let av = Arc::new(AddressVector::new());
        let (cm, recorder) = Fixture::cm_with_peers(config, fail, av.clone());
        Fixture { cm, av, recorder }
    }

    pub fn cm_with_peers(mut config: RdmConfig, fail: Fail, peers: Arc<dyn PeerDirectory>) -> (ConnManager, Arc<Recorder>) {
        config.process_id = LOCAL_PID;
        let recorder = Arc::new(Recorder::default());
        let cm = ConnManager::new(
            Arc::new(config),
            test_addr_from_number(LOCAL_NUMBER),
            CompletionBindings::new(ResourceId(1), ResourceId(2), ResourceId(3)),
            peers,
            Arc::new(mock_domain(recorder.clone(), fail)),
        );
        (cm, recorder)
    }

    /// Starts connecting to the peer with the given address number, returning the entry
    pub fn connecting(&mut self, number: u16) -> ConnId {
        let addr = self.av.insert(test_addr_from_number(number));
        assert!(self.cm.get_conn(addr).unwrap_err().is_retryable());
        let peer = self.av.resolve(addr).unwrap();
        self.cm.lookup(peer.index()).unwrap()
    }
}

/// A connection request as the transport raises it, coming in from an ephemeral port of the
///  peer with the given address number
pub fn conn_req_event(number: u16, pid: u32) -> CmEvent {
    let handshake = Handshake { version: 1, port: number, pid };
    conn_req_event_with_data(number, handshake.to_bytes())
}

pub fn conn_req_event_with_data(number: u16, data: Bytes) -> CmEvent {
    let info = ConnInfo {
        src_addr: test_addr_from_number(LOCAL_NUMBER),
        dest_addr: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000 + number)),
        tx_size: 256,
        rx_size: 256,
        handle: Some(ConnReqHandle(number as u64)),
    };
    CmEvent::conn_req(info, data)
}
