//! The hardware provider over librdmacm and libibverbs.
use std::io;

use crate::ffi;
use crate::ibv::{CompChannel, CompletionQueue, MemoryRegion, ProtectionDomain, QueuePair};
use crate::provider::Provider;
use crate::rdmacm::{CmEvent, CmId, EventChannel};
use crate::types::PortSpace;

/// Connection manager and verbs of the local RDMA devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct Verbs;

impl Verbs {
    pub fn new() -> Self {
        Verbs
    }
}

fn port_space(ps: PortSpace) -> ffi::rdma_port_space::Type {
    match ps {
        PortSpace::IPOIB => ffi::rdma_port_space::RDMA_PS_IPOIB,
        PortSpace::TCP => ffi::rdma_port_space::RDMA_PS_TCP,
        PortSpace::UDP => ffi::rdma_port_space::RDMA_PS_UDP,
        PortSpace::IB => ffi::rdma_port_space::RDMA_PS_IB,
    }
}

impl Provider for Verbs {
    type EventChannel = EventChannel;
    type CmEvent = CmEvent;
    type CmId = CmId;
    type ProtectionDomain = ProtectionDomain;
    type CompChannel = CompChannel;
    type CompletionQueue = CompletionQueue;
    type QueuePair = QueuePair;
    type MemoryRegion = MemoryRegion;

    fn create_event_channel(&self) -> io::Result<EventChannel> {
        EventChannel::create_event_channel()
    }

    fn create_id(&self, channel: &EventChannel, ps: PortSpace) -> io::Result<CmId> {
        CmId::create_id(channel, port_space(ps))
    }
}
