//! The provider trait family.
//!
//! A `Provider` supplies the connection-manager and verbs objects a transport needs. Every
//! object releases its underlying resource in `Drop`, so the order in which an owner declares
//! its fields is the order in which they are destroyed.
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::types::{AccessFlags, CmEventType, ConnParam, PortSpace, QpInitAttr, SendFlags};
use crate::types::WorkCompletion;

pub trait Provider: Sized + Send + Sync + 'static {
    type EventChannel: EventChannel<Event = Self::CmEvent> + 'static;
    type CmEvent: CmEvent<CmId = Self::CmId> + 'static;
    type CmId: CmId<Self> + 'static;
    type ProtectionDomain: ProtectionDomain<Self> + 'static;
    type CompChannel: Send + 'static;
    type CompletionQueue: CompletionQueue + 'static;
    type QueuePair: QueuePair<Self> + 'static;
    type MemoryRegion: MemoryRegion + 'static;

    /// Opens a new connection-manager event channel.
    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;

    /// Creates a connection identifier reporting its events on `channel`.
    fn create_id(&self, channel: &Self::EventChannel, ps: PortSpace) -> io::Result<Self::CmId>;
}

pub trait EventChannel: Send {
    type Event;

    /// Waits until an event is ready. `None` blocks indefinitely. Returns `false` on timeout.
    fn poll(&self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Retrieves the next event, blocking if there is none.
    fn get_cm_event(&self) -> io::Result<Self::Event>;
}

/// A connection-manager event. The event is acknowledged when dropped.
pub trait CmEvent: Send + fmt::Display {
    type CmId;

    fn status(&self) -> i32;

    fn event(&self) -> CmEventType;

    /// Takes the new connection identifier carried by a connect request. Returns `None` for
    /// every other event or when the id has already been taken.
    fn take_id(&mut self) -> Option<Self::CmId>;
}

pub trait CmId<P: Provider>: Send {
    fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()>;

    fn listen(&self, backlog: i32) -> io::Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn resolve_addr(&self, addr: &SocketAddr, timeout_ms: i32) -> io::Result<()>;

    fn resolve_route(&self, timeout_ms: i32) -> io::Result<()>;

    fn connect(&self, conn_param: &ConnParam) -> io::Result<()>;

    fn accept(&self, conn_param: &ConnParam) -> io::Result<()>;

    fn disconnect(&self) -> io::Result<()>;

    /// Moves this id onto `channel`. The id takes ownership of the channel and releases it
    /// after the id itself is destroyed.
    fn migrate_id(&mut self, channel: P::EventChannel) -> io::Result<()>;

    /// The channel this id owns after a migration.
    fn event_channel(&self) -> Option<&P::EventChannel>;

    fn alloc_pd(&self) -> io::Result<P::ProtectionDomain>;

    fn create_comp_channel(&self) -> io::Result<P::CompChannel>;

    fn create_cq(&self, cqe: i32, channel: &P::CompChannel) -> io::Result<P::CompletionQueue>;

    fn create_qp(
        &self,
        pd: &P::ProtectionDomain,
        cq: &P::CompletionQueue,
        attr: &QpInitAttr,
    ) -> io::Result<P::QueuePair>;
}

pub trait ProtectionDomain<P: Provider>: Send {
    /// Registers `buf` in this protection domain. The region owns the buffer and keeps the
    /// domain alive.
    fn reg_mr(&self, buf: Box<[u8]>, access: AccessFlags) -> io::Result<P::MemoryRegion>;
}

pub trait MemoryRegion: Send + Deref<Target = [u8]> + DerefMut {}

pub trait CompletionQueue: Send {
    /// Polls at most `wc.len()` completions. Returns the number written.
    fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize>;
}

pub trait QueuePair<P: Provider>: Send {
    /// Posts a receive of up to `len` bytes into `mr`.
    ///
    /// # Safety
    ///
    /// The memory region can only be safely reused or dropped after the request is fully
    /// executed and a work completion has been retrieved from the corresponding completion
    /// queue.
    unsafe fn post_recv(&self, wr_id: u64, mr: &P::MemoryRegion, len: usize) -> io::Result<()>;

    /// Posts a send of the first `len` bytes of `mr`.
    ///
    /// # Safety
    ///
    /// The memory region can only be safely reused or dropped after the request is fully
    /// executed and a work completion has been retrieved from the corresponding completion
    /// queue.
    unsafe fn post_send(
        &self,
        wr_id: u64,
        mr: &P::MemoryRegion,
        len: usize,
        flags: SendFlags,
    ) -> io::Result<()>;
}
