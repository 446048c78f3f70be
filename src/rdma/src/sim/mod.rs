//! An in-process RDMA fabric.
//!
//! `SimFabric` implements the [`Provider`] traits entirely in software. Listeners are keyed by
//! socket address, connection requests and establishment are reported through event channels
//! exactly as the connection manager would, and reliable-connected queue pairs move bytes
//! between registered buffers. A message sent before the peer posted a receive waits on the
//! peer (receiver-not-ready with unlimited retries).
//!
//! Every resource creation and destruction is recorded in a journal keyed by the serial of the
//! connection id it belongs to, and each resource step can be made to fail once with
//! [`SimFabric::inject`].
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::provider::{self, Provider};
use crate::types::{CmEventType, PortSpace};

mod cm;
mod qp;

pub use cm::SimCmId;
pub use qp::{SimCompChannel, SimCq, SimMr, SimPd, SimQp};

const EPHEMERAL_PORT_BASE: u16 = 40000;

/// A resource step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateEventChannel,
    CreateId,
    AllocPd,
    RegMr,
    CreateCompChannel,
    CreateCq,
    CreateQp,
    MigrateId,
    Accept,
    PostRecv,
    PostSend,
    /// The next connect request reaches the listener with a non-zero status.
    ConnectRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreateId,
    AllocPd,
    DeallocPd,
    RegMr,
    DeregMr,
    CreateCompChannel,
    DestroyCompChannel,
    CreateCq,
    DestroyCq,
    CreateQp,
    DestroyQp,
    Accept,
    DestroyId,
    DestroyEventChannel,
}

/// One journal record. `id` is the serial of the connection id owning the resource, or 0 for
/// an event channel that never got migrated to an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: u64,
    pub op: Op,
}

pub(crate) struct FabricInner {
    listeners: spin::Mutex<HashMap<SocketAddr, Weak<cm::IdShared>>>,
    next_port: AtomicU16,
    next_serial: AtomicU64,
    faults: spin::Mutex<Vec<Fault>>,
    journal: spin::Mutex<Vec<JournalEntry>>,
}

impl FabricInner {
    pub(crate) fn serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record(&self, id: u64, op: Op) {
        self.journal.lock().push(JournalEntry { id, op });
    }

    /// Fails once if `fault` was injected.
    pub(crate) fn check(&self, fault: Fault) -> io::Result<()> {
        let mut faults = self.faults.lock();
        if let Some(pos) = faults.iter().position(|f| *f == fault) {
            faults.remove(pos);
            log::debug!("injected fault: {:?}", fault);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected fault: {:?}", fault),
            ));
        }
        Ok(())
    }

    pub(crate) fn ephemeral_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port >= EPHEMERAL_PORT_BASE {
                return port;
            }
            // wrapped around
            self.next_port.store(EPHEMERAL_PORT_BASE, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_listener(&self, addr: SocketAddr, id: &Arc<cm::IdShared>) -> io::Result<()> {
        let mut listeners = self.listeners.lock();
        if listeners.get(&addr).and_then(Weak::upgrade).is_some() {
            return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
        }
        listeners.insert(addr, Arc::downgrade(id));
        Ok(())
    }

    pub(crate) fn remove_listener(&self, addr: &SocketAddr, serial: u64) {
        let mut listeners = self.listeners.lock();
        let owned = listeners
            .get(addr)
            .and_then(Weak::upgrade)
            .map_or(true, |l| l.serial == serial);
        if owned {
            listeners.remove(addr);
        }
    }

    /// Finds the listener for `addr`, falling back to a wildcard listener on the same port.
    pub(crate) fn find_listener(&self, addr: &SocketAddr) -> Option<Arc<cm::IdShared>> {
        let listeners = self.listeners.lock();
        let wildcards = [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port()),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), addr.port()),
        ];
        std::iter::once(addr)
            .chain(wildcards.iter())
            .find_map(|a| listeners.get(a).and_then(Weak::upgrade))
    }
}

/// Handle to a software fabric. Clones share the same fabric.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<FabricInner>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimFabric")
            .field("listeners", &self.inner.listeners.lock().len())
            .field("journal", &self.inner.journal.lock().len())
            .finish()
    }
}

impl SimFabric {
    pub fn new() -> Self {
        SimFabric {
            inner: Arc::new(FabricInner {
                listeners: spin::Mutex::new(HashMap::new()),
                next_port: AtomicU16::new(EPHEMERAL_PORT_BASE),
                next_serial: AtomicU64::new(1),
                faults: spin::Mutex::new(Vec::new()),
                journal: spin::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes the next occurrence of `fault` fail.
    pub fn inject(&self, fault: Fault) {
        self.inner.faults.lock().push(fault);
    }

    /// Faults injected but not triggered yet.
    pub fn pending_faults(&self) -> Vec<Fault> {
        self.inner.faults.lock().clone()
    }

    /// A snapshot of the resource journal.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.inner.journal.lock().clone()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct PendingEvent {
    pub(crate) kind: CmEventType,
    pub(crate) status: i32,
    pub(crate) new_id: Option<Arc<cm::IdShared>>,
}

#[derive(Default)]
pub(crate) struct ChannelShared {
    queue: Mutex<VecDeque<PendingEvent>>,
    ready: Condvar,
}

impl ChannelShared {
    pub(crate) fn push(&self, event: PendingEvent) {
        lock(&self.queue).push_back(event);
        self.ready.notify_all();
    }
}

pub struct SimEventChannel {
    shared: Arc<ChannelShared>,
    owner: u64,
    fabric: Arc<FabricInner>,
}

impl SimEventChannel {
    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub(crate) fn set_owner(&mut self, owner: u64) {
        self.owner = owner;
    }
}

impl Drop for SimEventChannel {
    fn drop(&mut self) {
        log::trace!("destroying event channel owned by id {}", self.owner);
        self.fabric.record(self.owner, Op::DestroyEventChannel);
    }
}

impl provider::EventChannel for SimEventChannel {
    type Event = SimCmEvent;

    fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = lock(&self.shared.queue);
        while queue.is_empty() {
            match deadline {
                None => {
                    queue = self
                        .shared
                        .ready
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    queue = self
                        .shared
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        Ok(true)
    }

    fn get_cm_event(&self) -> io::Result<SimCmEvent> {
        let mut queue = lock(&self.shared.queue);
        let pending = loop {
            match queue.pop_front() {
                Some(ev) => break ev,
                None => {
                    queue = self
                        .shared
                        .ready
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        };
        drop(queue);
        Ok(SimCmEvent {
            kind: pending.kind,
            status: pending.status,
            id: pending
                .new_id
                .map(|shared| SimCmId::from_shared(shared, Arc::clone(&self.fabric))),
        })
    }
}

/// An event retrieved from a [`SimEventChannel`].
pub struct SimCmEvent {
    kind: CmEventType,
    status: i32,
    id: Option<SimCmId>,
}

impl fmt::Display for SimCmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl Drop for SimCmEvent {
    fn drop(&mut self) {
        log::trace!("ack cm event {}", self.kind);
    }
}

impl provider::CmEvent for SimCmEvent {
    type CmId = SimCmId;

    #[inline]
    fn status(&self) -> i32 {
        self.status
    }

    #[inline]
    fn event(&self) -> CmEventType {
        self.kind
    }

    fn take_id(&mut self) -> Option<SimCmId> {
        self.id.take()
    }
}

impl Provider for SimFabric {
    type EventChannel = SimEventChannel;
    type CmEvent = SimCmEvent;
    type CmId = SimCmId;
    type ProtectionDomain = SimPd;
    type CompChannel = SimCompChannel;
    type CompletionQueue = SimCq;
    type QueuePair = SimQp;
    type MemoryRegion = SimMr;

    fn create_event_channel(&self) -> io::Result<SimEventChannel> {
        self.inner.check(Fault::CreateEventChannel)?;
        Ok(SimEventChannel {
            shared: Arc::new(ChannelShared::default()),
            owner: 0,
            fabric: Arc::clone(&self.inner),
        })
    }

    fn create_id(&self, channel: &SimEventChannel, _ps: PortSpace) -> io::Result<SimCmId> {
        self.inner.check(Fault::CreateId)?;
        Ok(SimCmId::new(Arc::clone(&self.inner), Arc::clone(&channel.shared)))
    }
}

#[cfg(test)]
mod tests;
