//! libibverbs objects owned by a connection.
use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::Arc;

use static_assertions::assert_eq_size;

use crate::ffi;
use crate::provider;
use crate::types::{AccessFlags, SendFlags, WcFlags, WcOpcode, WcStatus, WorkCompletion};
use crate::verbs::Verbs;

assert_eq_size!(ffi::ibv_access_flags, u32);

const POLL_BATCH: usize = 32;

struct PdInner(*mut ffi::ibv_pd);

unsafe impl Send for PdInner {}
unsafe impl Sync for PdInner {}

impl Drop for PdInner {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_dealloc_pd(self.0) };
        if rc != 0 {
            log::warn!("ibv_dealloc_pd: {}", io::Error::from_raw_os_error(rc));
        }
    }
}

pub struct ProtectionDomain {
    inner: Arc<PdInner>,
}

impl ProtectionDomain {
    pub(crate) fn new(ctx: *mut ffi::ibv_context) -> io::Result<Self> {
        let pd = unsafe { ffi::ibv_alloc_pd(ctx) };
        if pd.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(ProtectionDomain {
            inner: Arc::new(PdInner(pd)),
        })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut ffi::ibv_pd {
        self.inner.0
    }
}

impl provider::ProtectionDomain<Verbs> for ProtectionDomain {
    fn reg_mr(&self, buf: Box<[u8]>, access: AccessFlags) -> io::Result<MemoryRegion> {
        let len = buf.len();
        let buf = Box::into_raw(buf);
        let flags = ffi::ibv_access_flags(access.bits());
        let mr = unsafe { ffi::ibv_reg_mr(self.as_ptr(), buf as *mut _, len, flags.0 as i32) };
        if mr.is_null() {
            let err = io::Error::last_os_error();
            // Safety: the buffer was never handed to the device.
            unsafe { drop(Box::from_raw(buf)) };
            return Err(err);
        }
        Ok(MemoryRegion {
            mr,
            buf,
            _pd: Arc::clone(&self.inner),
        })
    }
}

/// A registered memory region owning its buffer. It holds its protection domain, so the domain
/// is deallocated after every region registered in it.
pub struct MemoryRegion {
    mr: *mut ffi::ibv_mr,
    buf: *mut [u8],
    _pd: Arc<PdInner>,
}

unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    #[inline]
    fn lkey(&self) -> u32 {
        unsafe { &*self.mr }.lkey
    }

    #[inline]
    fn sge(&self, len: usize) -> ffi::ibv_sge {
        ffi::ibv_sge {
            addr: self.buf as *mut u8 as u64,
            length: len as u32,
            lkey: self.lkey(),
        }
    }
}

impl Deref for MemoryRegion {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.buf }
    }
}

impl DerefMut for MemoryRegion {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.buf }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_dereg_mr(self.mr) };
        if rc != 0 {
            log::warn!("ibv_dereg_mr: {}", io::Error::from_raw_os_error(rc));
        }
        unsafe { drop(Box::from_raw(self.buf)) };
    }
}

impl provider::MemoryRegion for MemoryRegion {}

pub struct CompChannel(*mut ffi::ibv_comp_channel);

unsafe impl Send for CompChannel {}

impl CompChannel {
    pub(crate) fn new(ctx: *mut ffi::ibv_context) -> io::Result<Self> {
        let channel = unsafe { ffi::ibv_create_comp_channel(ctx) };
        if channel.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(CompChannel(channel))
    }
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_destroy_comp_channel(self.0) };
        if rc != 0 {
            log::warn!("ibv_destroy_comp_channel: {}", io::Error::from_raw_os_error(rc));
        }
    }
}

pub struct CompletionQueue(*mut ffi::ibv_cq);

unsafe impl Send for CompletionQueue {}

impl CompletionQueue {
    pub(crate) fn new(
        ctx: *mut ffi::ibv_context,
        cqe: i32,
        channel: &CompChannel,
    ) -> io::Result<Self> {
        let cq = unsafe { ffi::ibv_create_cq(ctx, cqe, ptr::null_mut(), channel.0, 0) };
        if cq.is_null() {
            return Err(io::Error::last_os_error());
        }
        let cq = CompletionQueue(cq);
        cq.req_notify(false)?;
        Ok(cq)
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut ffi::ibv_cq {
        self.0
    }

    fn req_notify(&self, solicited_only: bool) -> io::Result<()> {
        let ctx = unsafe { &*(*self.0).context };
        let req_notify_cq = ctx
            .ops
            .req_notify_cq
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EOPNOTSUPP))?;
        let rc = unsafe { req_notify_cq(self.0, solicited_only as i32) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_destroy_cq(self.0) };
        if rc != 0 {
            log::warn!("ibv_destroy_cq: {}", io::Error::from_raw_os_error(rc));
        }
    }
}

fn wc_opcode(opcode: ffi::ibv_wc_opcode::Type) -> WcOpcode {
    match opcode {
        ffi::ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ffi::ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        ffi::ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        ffi::ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        ffi::ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        _ => WcOpcode::Invalid,
    }
}

impl provider::CompletionQueue for CompletionQueue {
    fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut raw: [ffi::ibv_wc; POLL_BATCH] = Default::default();
        let n = wc.len().min(POLL_BATCH);
        let ctx = unsafe { &*(*self.0).context };
        let poll_cq = ctx
            .ops
            .poll_cq
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EOPNOTSUPP))?;
        let rc = unsafe { poll_cq(self.0, n as i32, raw.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let got = rc as usize;
        for (dst, src) in wc.iter_mut().zip(&raw[..got]) {
            *dst = WorkCompletion {
                wr_id: src.wr_id,
                status: WcStatus::from_code(src.status as u32),
                opcode: wc_opcode(src.opcode),
                vendor_err: src.vendor_err,
                byte_len: src.byte_len,
                imm_data: 0,
                wc_flags: WcFlags::from_bits_truncate(src.wc_flags as u32),
            };
        }
        Ok(got)
    }
}

/// The queue pair of a `CmId`. It must be dropped before that id.
pub struct QueuePair {
    id: *mut ffi::rdma_cm_id,
    qp: *mut ffi::ibv_qp,
}

unsafe impl Send for QueuePair {}

impl QueuePair {
    /// # Safety
    ///
    /// `id` must carry a queue pair created by `rdma_create_qp` and outlive the returned value.
    pub(crate) unsafe fn from_id(id: *mut ffi::rdma_cm_id) -> Self {
        QueuePair { id, qp: (*id).qp }
    }

    #[inline]
    fn ops(&self) -> &ffi::ibv_context_ops {
        unsafe { &(*(*self.qp).context).ops }
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_qp(self.id) };
    }
}

impl provider::QueuePair<Verbs> for QueuePair {
    unsafe fn post_recv(&self, wr_id: u64, mr: &MemoryRegion, len: usize) -> io::Result<()> {
        if len > mr.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut sge = mr.sge(len);
        let mut wr = ffi::ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
        };
        let mut bad_wr = ptr::null_mut();
        let post_recv = self
            .ops()
            .post_recv
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EOPNOTSUPP))?;
        let rc = post_recv(self.qp, &mut wr, &mut bad_wr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    unsafe fn post_send(
        &self,
        wr_id: u64,
        mr: &MemoryRegion,
        len: usize,
        flags: SendFlags,
    ) -> io::Result<()> {
        if len > mr.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut sge = mr.sge(len);
        let mut wr = ffi::ibv_send_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
            opcode: ffi::ibv_wr_opcode::IBV_WR_SEND,
            send_flags: flags.bits(),
            ..Default::default()
        };
        let mut bad_wr = ptr::null_mut();
        let post_send = self
            .ops()
            .post_send
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EOPNOTSUPP))?;
        let rc = post_send(self.qp, &mut wr, &mut bad_wr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}
