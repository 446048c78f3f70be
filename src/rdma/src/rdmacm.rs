//! librdmacm objects: event channels, events and connection identifiers.
use std::ffi::CStr;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};

use crate::ffi;
use crate::ibv::{CompChannel, CompletionQueue, ProtectionDomain, QueuePair};
use crate::net::{self, IntoInner};
use crate::provider;
use crate::types::{CmEventType, ConnParam, QpInitAttr, QpType};
use crate::verbs::Verbs;

const CHANNEL_TOKEN: Token = Token(0);

struct Poller {
    poll: mio::Poll,
    events: Events,
}

pub struct EventChannel {
    raw: *mut ffi::rdma_event_channel,
    poller: spin::Mutex<Poller>,
}

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl AsRawFd for EventChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        assert!(!self.raw.is_null());
        unsafe { &*self.raw }.fd
    }
}

impl EventChannel {
    pub fn create_event_channel() -> io::Result<Self> {
        let raw = unsafe { ffi::rdma_create_event_channel() };
        if raw.is_null() {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { &*raw }.fd;
        let poller = match mio::Poll::new().and_then(|poll| {
            poll.registry()
                .register(&mut SourceFd(&fd), CHANNEL_TOKEN, Interest::READABLE)?;
            Ok(poll)
        }) {
            Ok(poll) => Poller {
                poll,
                events: Events::with_capacity(1),
            },
            Err(e) => {
                unsafe { ffi::rdma_destroy_event_channel(raw) };
                return Err(e);
            }
        };
        Ok(EventChannel {
            raw,
            poller: spin::Mutex::new(poller),
        })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut ffi::rdma_event_channel {
        self.raw
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_event_channel(self.raw) };
    }
}

impl provider::EventChannel for EventChannel {
    type Event = CmEvent;

    fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let fd = self.as_raw_fd();
        let mut poller = self.poller.lock();
        let Poller { poll, events } = &mut *poller;
        // reregister everytime to simulate level-trigger
        poll.registry()
            .reregister(&mut SourceFd(&fd), CHANNEL_TOKEN, Interest::READABLE)?;
        match poll.poll(events, timeout) {
            Ok(()) => Ok(!events.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_cm_event(&self) -> io::Result<CmEvent> {
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(self.raw, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CmEvent {
            raw: event,
            id_taken: false,
        })
    }
}

pub struct CmEvent {
    raw: *mut ffi::rdma_cm_event,
    id_taken: bool,
}

unsafe impl Send for CmEvent {}

/// All events which are allocated by rdma_get_cm_event must be released, there
/// should be a one-to-one correspondence  between  successful  gets  and  acks.
impl Drop for CmEvent {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_ack_cm_event(self.raw) };
        if rc != 0 {
            log::debug!(
                "An error occurred on ack_cm_event: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { CStr::from_ptr(ffi::rdma_event_str((*self.raw).event)) };
        write!(f, "{}", msg.to_string_lossy())
    }
}

impl provider::CmEvent for CmEvent {
    type CmId = CmId;

    #[inline]
    fn status(&self) -> i32 {
        unsafe { &*self.raw }.status
    }

    #[inline]
    fn event(&self) -> CmEventType {
        CmEventType::from_raw(unsafe { &*self.raw }.event as u32)
    }

    fn take_id(&mut self) -> Option<CmId> {
        let event = unsafe { &*self.raw };
        if self.id_taken
            || event.event != ffi::rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST
            || event.id.is_null()
        {
            return None;
        }
        self.id_taken = true;
        Some(CmId {
            raw: event.id,
            channel: None,
        })
    }
}

/// A connection identifier. After `migrate_id` it owns its event channel, which is destroyed
/// after the id.
pub struct CmId {
    raw: *mut ffi::rdma_cm_id,
    channel: Option<EventChannel>,
}

unsafe impl Send for CmId {}

impl Drop for CmId {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_destroy_id(self.raw) };
        if rc != 0 {
            log::debug!(
                "error occured when destroying cm_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

fn check(rc: i32) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn conn_param_into_inner(param: &ConnParam) -> ffi::rdma_conn_param {
    let (private_data, private_data_len) = param
        .private_data
        .as_ref()
        .map_or((ptr::null(), 0), |d| (d.as_ptr() as *const _, d.len() as u8));
    ffi::rdma_conn_param {
        private_data,
        private_data_len,
        responder_resources: param.responder_resources,
        initiator_depth: param.initiator_depth,
        flow_control: param.flow_control,
        retry_count: param.retry_count,
        rnr_retry_count: param.rnr_retry_count,
        ..Default::default()
    }
}

impl CmId {
    pub fn create_id(channel: &EventChannel, ps: ffi::rdma_port_space::Type) -> io::Result<Self> {
        let mut raw = ptr::null_mut();
        let rc = unsafe { ffi::rdma_create_id(channel.as_ptr(), &mut raw, ptr::null_mut(), ps) };
        check(rc)?;
        assert!(!raw.is_null());
        Ok(CmId { raw, channel: None })
    }

    #[inline]
    fn verbs(&self) -> io::Result<*mut ffi::ibv_context> {
        let ctx = unsafe { &*self.raw }.verbs;
        if ctx.is_null() {
            // not bound to a device yet
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(ctx)
    }
}

impl provider::CmId<Verbs> for CmId {
    fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()> {
        let mut addr = addr.into_inner();
        check(unsafe { ffi::rdma_bind_addr(self.raw, addr.as_mut_ptr()) })
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        check(unsafe { ffi::rdma_listen(self.raw, backlog) })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        // The source address leads `struct rdma_addr`.
        let src = unsafe { &(*self.raw).route.addr } as *const _ as *const ffi::sockaddr;
        unsafe { net::socket_addr_from_raw(src) }
    }

    fn resolve_addr(&self, addr: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let mut dst = addr.into_inner();
        check(unsafe {
            ffi::rdma_resolve_addr(self.raw, ptr::null_mut(), dst.as_mut_ptr(), timeout_ms)
        })
    }

    fn resolve_route(&self, timeout_ms: i32) -> io::Result<()> {
        check(unsafe { ffi::rdma_resolve_route(self.raw, timeout_ms) })
    }

    fn connect(&self, conn_param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param_into_inner(conn_param);
        check(unsafe { ffi::rdma_connect(self.raw, &mut param) })
    }

    fn accept(&self, conn_param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param_into_inner(conn_param);
        check(unsafe { ffi::rdma_accept(self.raw, &mut param) })
    }

    fn disconnect(&self) -> io::Result<()> {
        check(unsafe { ffi::rdma_disconnect(self.raw) })
    }

    fn migrate_id(&mut self, channel: EventChannel) -> io::Result<()> {
        check(unsafe { ffi::rdma_migrate_id(self.raw, channel.as_ptr()) })?;
        self.channel = Some(channel);
        Ok(())
    }

    fn event_channel(&self) -> Option<&EventChannel> {
        self.channel.as_ref()
    }

    fn alloc_pd(&self) -> io::Result<ProtectionDomain> {
        ProtectionDomain::new(self.verbs()?)
    }

    fn create_comp_channel(&self) -> io::Result<CompChannel> {
        CompChannel::new(self.verbs()?)
    }

    fn create_cq(&self, cqe: i32, channel: &CompChannel) -> io::Result<CompletionQueue> {
        CompletionQueue::new(self.verbs()?, cqe, channel)
    }

    fn create_qp(
        &self,
        pd: &ProtectionDomain,
        cq: &CompletionQueue,
        attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        let qp_type = match attr.qp_type {
            QpType::RC => ffi::ibv_qp_type::IBV_QPT_RC,
            QpType::UD => ffi::ibv_qp_type::IBV_QPT_UD,
        };
        let mut init_attr = ffi::ibv_qp_init_attr {
            send_cq: cq.as_ptr(),
            recv_cq: cq.as_ptr(),
            cap: ffi::ibv_qp_cap {
                max_send_wr: attr.cap.max_send_wr,
                max_recv_wr: attr.cap.max_recv_wr,
                max_send_sge: attr.cap.max_send_sge,
                max_recv_sge: attr.cap.max_recv_sge,
                max_inline_data: attr.cap.max_inline_data,
            },
            qp_type,
            sq_sig_all: attr.sq_sig_all as i32,
            ..Default::default()
        };
        check(unsafe { ffi::rdma_create_qp(self.raw, pd.as_ptr(), &mut init_attr) })?;
        // Safety: the qp was just created on this id.
        Ok(unsafe { QueuePair::from_id(self.raw) })
    }
}
