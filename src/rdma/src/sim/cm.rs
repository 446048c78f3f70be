use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use crate::provider::CmId;
use crate::types::{CmEventType, ConnParam, QpInitAttr, QpType};

use super::qp::{PdInner, QpShared};
use super::{ChannelShared, FabricInner, Fault, Op, PendingEvent, SimFabric};
use super::{SimCompChannel, SimCq, SimEventChannel, SimPd, SimQp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Bound,
    Listening,
    AddrResolved,
    RouteResolved,
    /// Active side, connect request sent.
    Connecting,
    /// Passive side, connect request received and not yet accepted.
    ConnectRequested,
    Established,
    Disconnected,
}

pub(crate) struct IdState {
    phase: Phase,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    peer: Weak<IdShared>,
    qp: Weak<QpShared>,
}

pub(crate) struct IdShared {
    pub(crate) serial: u64,
    channel: spin::Mutex<Arc<ChannelShared>>,
    state: spin::Mutex<IdState>,
}

impl IdShared {
    fn new(serial: u64, channel: Arc<ChannelShared>, state: IdState) -> Self {
        IdShared {
            serial,
            channel: spin::Mutex::new(channel),
            state: spin::Mutex::new(state),
        }
    }

    fn notify(&self, kind: CmEventType, status: i32, new_id: Option<Arc<IdShared>>) {
        let channel = Arc::clone(&self.channel.lock());
        channel.push(PendingEvent {
            kind,
            status,
            new_id,
        });
    }

    /// Tears down an established connection on both sides. Returns `false` if this id was not
    /// established.
    fn disconnect(&self) -> bool {
        let (peer, qp) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Established {
                return false;
            }
            state.phase = Phase::Disconnected;
            (state.peer.upgrade(), state.qp.upgrade())
        };
        if let Some(qp) = qp {
            qp.set_error();
        }
        self.notify(CmEventType::Disconnected, 0, None);

        if let Some(peer) = peer {
            let peer_qp = {
                let mut state = peer.state.lock();
                if state.phase != Phase::Established {
                    return true;
                }
                state.phase = Phase::Disconnected;
                state.qp.upgrade()
            };
            if let Some(qp) = peer_qp {
                qp.set_error();
            }
            peer.notify(CmEventType::Disconnected, 0, None);
        }
        true
    }

    /// Rejects a connection that never got established.
    fn abort_pending(&self) {
        let peer = self.state.lock().peer.upgrade();
        if let Some(peer) = peer {
            let rejected = {
                let mut state = peer.state.lock();
                match state.phase {
                    Phase::Connecting | Phase::ConnectRequested => {
                        state.phase = Phase::Disconnected;
                        true
                    }
                    _ => false,
                }
            };
            if rejected {
                peer.notify(CmEventType::Rejected, libc::ECONNREFUSED, None);
            }
        }
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

/// A connection identifier on the software fabric.
pub struct SimCmId {
    shared: Arc<IdShared>,
    fabric: Arc<FabricInner>,
    // Must be dropped after the id is released.
    channel: Option<SimEventChannel>,
}

impl SimCmId {
    pub(crate) fn new(fabric: Arc<FabricInner>, channel: Arc<ChannelShared>) -> Self {
        let shared = Arc::new(IdShared::new(
            fabric.serial(),
            channel,
            IdState {
                phase: Phase::Idle,
                local: None,
                remote: None,
                peer: Weak::new(),
                qp: Weak::new(),
            },
        ));
        fabric.record(shared.serial, Op::CreateId);
        SimCmId {
            shared,
            fabric,
            channel: None,
        }
    }

    pub(crate) fn from_shared(shared: Arc<IdShared>, fabric: Arc<FabricInner>) -> Self {
        SimCmId {
            shared,
            fabric,
            channel: None,
        }
    }

    /// The journal serial of this id.
    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().remote
    }
}

impl Drop for SimCmId {
    fn drop(&mut self) {
        let (phase, local) = {
            let state = self.shared.state.lock();
            (state.phase, state.local)
        };
        match phase {
            Phase::Listening => {
                if let Some(addr) = local {
                    self.fabric.remove_listener(&addr, self.shared.serial);
                }
            }
            Phase::Established => {
                self.shared.disconnect();
            }
            Phase::Connecting | Phase::ConnectRequested => self.shared.abort_pending(),
            _ => {}
        }
        log::trace!("destroying cm id {}", self.shared.serial);
        self.fabric.record(self.shared.serial, Op::DestroyId);
    }
}

impl CmId<SimFabric> for SimCmId {
    fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Idle {
            return Err(einval());
        }
        let mut addr = *addr;
        if addr.port() == 0 {
            addr.set_port(self.fabric.ephemeral_port());
        }
        state.local = Some(addr);
        state.phase = Phase::Bound;
        Ok(())
    }

    fn listen(&self, _backlog: i32) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        let addr = match (state.phase, state.local) {
            (Phase::Bound, Some(addr)) => addr,
            _ => return Err(einval()),
        };
        self.fabric.add_listener(addr, &self.shared)?;
        state.phase = Phase::Listening;
        log::debug!("cm id {} listening on {}", self.shared.serial, addr);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local
    }

    fn resolve_addr(&self, addr: &SocketAddr, _timeout_ms: i32) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !matches!(state.phase, Phase::Idle | Phase::Bound) {
                return Err(einval());
            }
            if state.local.is_none() {
                let ip = if addr.ip().is_unspecified() {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    addr.ip()
                };
                state.local = Some(SocketAddr::new(ip, self.fabric.ephemeral_port()));
            }
            state.remote = Some(*addr);
            state.phase = Phase::AddrResolved;
        }
        self.shared.notify(CmEventType::AddrResolved, 0, None);
        Ok(())
    }

    fn resolve_route(&self, _timeout_ms: i32) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::AddrResolved {
                return Err(einval());
            }
            state.phase = Phase::RouteResolved;
        }
        self.shared.notify(CmEventType::RouteResolved, 0, None);
        Ok(())
    }

    fn connect(&self, _conn_param: &ConnParam) -> io::Result<()> {
        let (local, remote) = {
            let state = self.shared.state.lock();
            match (state.phase, state.remote) {
                (Phase::RouteResolved, Some(remote)) => (state.local, remote),
                _ => return Err(einval()),
            }
        };

        let listener = match self.fabric.find_listener(&remote) {
            Some(listener) => listener,
            None => {
                log::debug!("no listener on {}, rejecting", remote);
                self.shared.state.lock().phase = Phase::Disconnected;
                self.shared
                    .notify(CmEventType::Rejected, libc::ECONNREFUSED, None);
                return Ok(());
            }
        };

        let listener_addr = listener.state.lock().local;
        let channel = Arc::clone(&listener.channel.lock());
        let server = Arc::new(IdShared::new(
            self.fabric.serial(),
            channel,
            IdState {
                phase: Phase::ConnectRequested,
                local: listener_addr,
                remote: local,
                peer: Arc::downgrade(&self.shared),
                qp: Weak::new(),
            },
        ));
        self.fabric.record(server.serial, Op::CreateId);
        {
            let mut state = self.shared.state.lock();
            state.phase = Phase::Connecting;
            state.peer = Arc::downgrade(&server);
        }
        let status = match self.fabric.check(Fault::ConnectRequest) {
            Ok(()) => 0,
            Err(_) => -libc::ECONNABORTED,
        };
        listener.notify(CmEventType::ConnectRequest, status, Some(server));
        Ok(())
    }

    fn accept(&self, _conn_param: &ConnParam) -> io::Result<()> {
        self.fabric.check(Fault::Accept)?;
        let (peer, qp) = {
            let state = self.shared.state.lock();
            if state.phase != Phase::ConnectRequested {
                return Err(einval());
            }
            let peer = state
                .peer
                .upgrade()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ECONNABORTED))?;
            (peer, state.qp.upgrade().ok_or_else(einval)?)
        };
        let peer_qp = {
            let state = peer.state.lock();
            if state.phase != Phase::Connecting {
                return Err(io::Error::from_raw_os_error(libc::ECONNABORTED));
            }
            state.qp.upgrade().ok_or_else(einval)?
        };

        qp.link(&peer_qp);
        peer_qp.link(&qp);
        self.shared.state.lock().phase = Phase::Established;
        peer.state.lock().phase = Phase::Established;
        self.fabric.record(self.shared.serial, Op::Accept);

        self.shared.notify(CmEventType::Established, 0, None);
        peer.notify(CmEventType::Established, 0, None);
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        if self.shared.disconnect() {
            return Ok(());
        }
        match self.shared.state.lock().phase {
            Phase::Disconnected => Ok(()),
            _ => Err(einval()),
        }
    }

    fn migrate_id(&mut self, mut channel: SimEventChannel) -> io::Result<()> {
        self.fabric.check(Fault::MigrateId)?;
        channel.set_owner(self.shared.serial);
        *self.shared.channel.lock() = Arc::clone(channel.shared());
        self.channel = Some(channel);
        Ok(())
    }

    fn event_channel(&self) -> Option<&SimEventChannel> {
        self.channel.as_ref()
    }

    fn alloc_pd(&self) -> io::Result<SimPd> {
        self.fabric.check(Fault::AllocPd)?;
        let serial = self.shared.serial;
        self.fabric.record(serial, Op::AllocPd);
        Ok(SimPd::new(Arc::new(PdInner::new(
            serial,
            Arc::clone(&self.fabric),
        ))))
    }

    fn create_comp_channel(&self) -> io::Result<SimCompChannel> {
        self.fabric.check(Fault::CreateCompChannel)?;
        self.fabric.record(self.shared.serial, Op::CreateCompChannel);
        Ok(SimCompChannel::new(
            self.shared.serial,
            Arc::clone(&self.fabric),
        ))
    }

    fn create_cq(&self, cqe: i32, _channel: &SimCompChannel) -> io::Result<SimCq> {
        self.fabric.check(Fault::CreateCq)?;
        if cqe <= 0 {
            return Err(einval());
        }
        self.fabric.record(self.shared.serial, Op::CreateCq);
        Ok(SimCq::new(
            cqe as usize,
            self.shared.serial,
            Arc::clone(&self.fabric),
        ))
    }

    fn create_qp(&self, _pd: &SimPd, cq: &SimCq, attr: &QpInitAttr) -> io::Result<SimQp> {
        self.fabric.check(Fault::CreateQp)?;
        if attr.qp_type != QpType::RC {
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }
        let mut state = self.shared.state.lock();
        if state.qp.upgrade().is_some() {
            return Err(einval());
        }
        let qp = SimQp::new(attr, cq, self.shared.serial, Arc::clone(&self.fabric));
        state.qp = Arc::downgrade(qp.shared());
        self.fabric.record(self.shared.serial, Op::CreateQp);
        Ok(qp)
    }
}
