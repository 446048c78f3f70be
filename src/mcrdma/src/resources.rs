//! Per-connection verbs resources.
use std::io;

use rdma::provider::{CmId, ProtectionDomain, Provider};
use rdma::types::{AccessFlags, QpCapability, QpInitAttr, QpType};

use crate::config::TransportConfig;
use crate::error::{Error, Result};

/// The verbs objects backing one connection.
///
/// The fields are released in declaration order, which is the reverse of the order `new`
/// creates them in. A memory region also holds its protection domain, so the domain goes away
/// only after both regions are deregistered.
pub struct RdmaResources<P: Provider> {
    // Do NOT change the order of the following fields.
    pub qp: P::QueuePair,
    pub cq: P::CompletionQueue,
    pub comp_channel: P::CompChannel,
    pub send_mr: P::MemoryRegion,
    pub recv_mr: P::MemoryRegion,
    pub pd: P::ProtectionDomain,
}

fn alloc_buffer(size: usize) -> io::Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    buf.resize(size, 0);
    Ok(buf.into_boxed_slice())
}

fn step<T>(step: &'static str, res: io::Result<T>) -> Result<T> {
    res.map_err(|source| Error::Resource { step, source })
}

impl<P: Provider> RdmaResources<P> {
    /// Creates the resources on `id`: protection domain, the two registered buffers,
    /// completion channel, completion queue and a reliable-connected queue pair.
    ///
    /// Stops at the first failing step. Whatever was created before it is released on return.
    pub fn new(id: &P::CmId, config: &TransportConfig) -> Result<Self> {
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;

        let pd = step("allocate protection domain", id.alloc_pd())?;
        let recv_buf = step("allocate receive buffer", alloc_buffer(config.buffer_size))?;
        let recv_mr = step("register receive buffer", pd.reg_mr(recv_buf, access))?;
        let send_buf = step("allocate send buffer", alloc_buffer(config.buffer_size))?;
        let send_mr = step("register send buffer", pd.reg_mr(send_buf, access))?;
        let comp_channel = step("create completion channel", id.create_comp_channel())?;
        let cq = step(
            "create completion queue",
            id.create_cq(config.cq_capacity, &comp_channel),
        )?;
        let attr = QpInitAttr {
            cap: QpCapability {
                max_send_wr: config.max_send_wr,
                max_recv_wr: config.max_recv_wr,
                max_send_sge: config.max_send_sge,
                max_recv_sge: config.max_recv_sge,
                max_inline_data: 0,
            },
            qp_type: QpType::RC,
            sq_sig_all: false,
        };
        let qp = step("create queue pair", id.create_qp(&pd, &cq, &attr))?;

        Ok(RdmaResources {
            qp,
            cq,
            comp_channel,
            send_mr,
            recv_mr,
            pd,
        })
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.send_mr.len()
    }
}
