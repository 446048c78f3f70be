use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::{Arc, Weak};

use crate::provider::{CompletionQueue, MemoryRegion, ProtectionDomain, QueuePair};
use crate::types::{AccessFlags, QpCapability, QpInitAttr, SendFlags};
use crate::types::{WcOpcode, WcStatus, WorkCompletion};

use super::{FabricInner, Fault, Op, SimFabric};

pub struct SimCompChannel {
    id: u64,
    fabric: Arc<FabricInner>,
}

impl SimCompChannel {
    pub(crate) fn new(id: u64, fabric: Arc<FabricInner>) -> Self {
        SimCompChannel { id, fabric }
    }
}

impl Drop for SimCompChannel {
    fn drop(&mut self) {
        self.fabric.record(self.id, Op::DestroyCompChannel);
    }
}

pub(crate) struct PdInner {
    id: u64,
    fabric: Arc<FabricInner>,
}

impl PdInner {
    pub(crate) fn new(id: u64, fabric: Arc<FabricInner>) -> Self {
        PdInner { id, fabric }
    }
}

impl Drop for PdInner {
    fn drop(&mut self) {
        self.fabric.record(self.id, Op::DeallocPd);
    }
}

/// A protection domain. Memory regions registered in it hold a reference, so the domain is
/// deallocated only after all of them are deregistered.
pub struct SimPd {
    inner: Arc<PdInner>,
}

impl SimPd {
    pub(crate) fn new(inner: Arc<PdInner>) -> Self {
        SimPd { inner }
    }
}

impl ProtectionDomain<SimFabric> for SimPd {
    fn reg_mr(&self, buf: Box<[u8]>, access: AccessFlags) -> io::Result<SimMr> {
        self.inner.fabric.check(Fault::RegMr)?;
        self.inner.fabric.record(self.inner.id, Op::RegMr);
        Ok(SimMr {
            buf: Box::into_raw(buf),
            access,
            pd: Arc::clone(&self.inner),
        })
    }
}

/// A registered memory region owning its buffer.
pub struct SimMr {
    buf: *mut [u8],
    access: AccessFlags,
    pd: Arc<PdInner>,
}

// Safety: the region exclusively owns its buffer.
unsafe impl Send for SimMr {}

impl SimMr {
    #[inline]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.buf as *mut u8
    }

    #[inline]
    pub fn access(&self) -> AccessFlags {
        self.access
    }
}

impl Deref for SimMr {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        // Safety: `buf` comes from `Box::into_raw` and is freed only in drop.
        unsafe { &*self.buf }
    }
}

impl DerefMut for SimMr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.buf }
    }
}

impl Drop for SimMr {
    fn drop(&mut self) {
        self.pd.fabric.record(self.pd.id, Op::DeregMr);
        // Safety: `buf` comes from `Box::into_raw` and is not referenced anymore.
        unsafe { drop(Box::from_raw(self.buf)) };
    }
}

impl MemoryRegion for SimMr {}

pub(crate) struct CqShared {
    queue: spin::Mutex<VecDeque<WorkCompletion>>,
    capacity: usize,
}

impl CqShared {
    fn push(&self, wc: WorkCompletion) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            log::warn!(
                "completion queue overrun (capacity {}), wr_id {}",
                self.capacity,
                wc.wr_id
            );
        }
        queue.push_back(wc);
    }
}

pub struct SimCq {
    shared: Arc<CqShared>,
    id: u64,
    fabric: Arc<FabricInner>,
}

impl SimCq {
    pub(crate) fn new(capacity: usize, id: u64, fabric: Arc<FabricInner>) -> Self {
        SimCq {
            shared: Arc::new(CqShared {
                queue: spin::Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
            }),
            id,
            fabric,
        }
    }
}

impl Drop for SimCq {
    fn drop(&mut self) {
        self.fabric.record(self.id, Op::DestroyCq);
    }
}

impl CompletionQueue for SimCq {
    fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let n = {
            let mut queue = self.shared.queue.lock();
            let n = wc.len().min(queue.len());
            for (slot, c) in wc.iter_mut().zip(queue.drain(..n)) {
                *slot = c;
            }
            n
        };
        if n == 0 {
            std::thread::yield_now();
        }
        Ok(n)
    }
}

struct PostedRecv {
    wr_id: u64,
    buf: *mut u8,
    len: usize,
}

struct Inbound {
    data: Vec<u8>,
    wr_id: u64,
    signaled: bool,
    sender_cq: Weak<CqShared>,
}

impl Inbound {
    fn complete(&self, status: WcStatus) {
        if !self.signaled && status.is_success() {
            return;
        }
        if let Some(cq) = self.sender_cq.upgrade() {
            let byte_len = self.data.len() as u32;
            cq.push(WorkCompletion::new(self.wr_id, WcOpcode::Send, status, byte_len));
        }
    }

    /// Lands this message in a posted receive, completing both sides.
    fn land(self, recv: PostedRecv, cq: &CqShared) {
        if self.data.len() > recv.len {
            cq.push(WorkCompletion::new(
                recv.wr_id,
                WcOpcode::Recv,
                WcStatus::LocLenErr,
                0,
            ));
            self.complete(WcStatus::RemInvReqErr);
            return;
        }
        // Safety: the receiver keeps the region alive until the receive completes.
        unsafe { ptr::copy_nonoverlapping(self.data.as_ptr(), recv.buf, self.data.len()) };
        cq.push(WorkCompletion::new(
            recv.wr_id,
            WcOpcode::Recv,
            WcStatus::Success,
            self.data.len() as u32,
        ));
        self.complete(WcStatus::Success);
    }
}

struct QpState {
    error: bool,
    recvs: VecDeque<PostedRecv>,
    inbound: VecDeque<Inbound>,
    // None until connected
    peer: Option<Weak<QpShared>>,
}

// Safety: receive buffers are only written while the owning region is alive.
unsafe impl Send for QpState {}

pub(crate) struct QpShared {
    state: spin::Mutex<QpState>,
    cq: Arc<CqShared>,
    cap: QpCapability,
    sq_sig_all: bool,
}

impl QpShared {
    pub(crate) fn link(&self, peer: &Arc<QpShared>) {
        self.state.lock().peer = Some(Arc::downgrade(peer));
    }

    /// Moves the queue pair to the error state, flushing outstanding receives.
    pub(crate) fn set_error(&self) {
        let mut state = self.state.lock();
        state.error = true;
        for recv in state.recvs.drain(..) {
            self.cq.push(WorkCompletion::new(
                recv.wr_id,
                WcOpcode::Recv,
                WcStatus::WrFlushErr,
                0,
            ));
        }
        for msg in state.inbound.drain(..) {
            msg.complete(WcStatus::RetryExcErr);
        }
    }

    fn deliver(&self, msg: Inbound) {
        let mut state = self.state.lock();
        if state.error {
            drop(state);
            msg.complete(WcStatus::RetryExcErr);
            return;
        }
        match state.recvs.pop_front() {
            Some(recv) => msg.land(recv, &self.cq),
            None => state.inbound.push_back(msg),
        }
    }
}

pub struct SimQp {
    shared: Arc<QpShared>,
    id: u64,
    fabric: Arc<FabricInner>,
}

impl SimQp {
    pub(crate) fn new(attr: &QpInitAttr, cq: &SimCq, id: u64, fabric: Arc<FabricInner>) -> Self {
        SimQp {
            shared: Arc::new(QpShared {
                state: spin::Mutex::new(QpState {
                    error: false,
                    recvs: VecDeque::new(),
                    inbound: VecDeque::new(),
                    peer: None,
                }),
                cq: Arc::clone(&cq.shared),
                cap: attr.cap,
                sq_sig_all: attr.sq_sig_all,
            }),
            id,
            fabric,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<QpShared> {
        &self.shared
    }
}

impl Drop for SimQp {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.error = true;
            state.recvs.clear();
            for msg in state.inbound.drain(..) {
                msg.complete(WcStatus::RetryExcErr);
            }
        }
        self.fabric.record(self.id, Op::DestroyQp);
    }
}

impl QueuePair<SimFabric> for SimQp {
    unsafe fn post_recv(&self, wr_id: u64, mr: &SimMr, len: usize) -> io::Result<()> {
        self.fabric.check(Fault::PostRecv)?;
        if len > mr.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if !mr.access().contains(AccessFlags::LOCAL_WRITE) {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        let recv = PostedRecv {
            wr_id,
            buf: mr.as_mut_ptr(),
            len,
        };

        let mut state = self.shared.state.lock();
        if state.error {
            drop(state);
            self.shared.cq.push(WorkCompletion::new(
                wr_id,
                WcOpcode::Recv,
                WcStatus::WrFlushErr,
                0,
            ));
            return Ok(());
        }
        if state.recvs.len() >= self.shared.cap.max_recv_wr as usize {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        match state.inbound.pop_front() {
            Some(msg) => msg.land(recv, &self.shared.cq),
            None => state.recvs.push_back(recv),
        }
        Ok(())
    }

    unsafe fn post_send(
        &self,
        wr_id: u64,
        mr: &SimMr,
        len: usize,
        flags: SendFlags,
    ) -> io::Result<()> {
        self.fabric.check(Fault::PostSend)?;
        if len > mr.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let msg = Inbound {
            data: mr[..len].to_vec(),
            wr_id,
            signaled: self.shared.sq_sig_all || flags.contains(SendFlags::SIGNALED),
            sender_cq: Arc::downgrade(&self.shared.cq),
        };

        let peer = {
            let state = self.shared.state.lock();
            if state.error {
                drop(state);
                self.shared.cq.push(WorkCompletion::new(
                    wr_id,
                    WcOpcode::Send,
                    WcStatus::WrFlushErr,
                    0,
                ));
                return Ok(());
            }
            match &state.peer {
                Some(peer) => peer.upgrade(),
                None => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
            }
        };

        match peer {
            Some(peer) => peer.deliver(msg),
            None => msg.complete(WcStatus::RetryExcErr),
        }
        Ok(())
    }
}
