//! The listening side. Accepts connect requests and hands each one to a new worker thread.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rdma::provider::{CmEvent, CmId, EventChannel, Provider};
use rdma::types::{CmEventType, PortSpace};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::transport::RdmaConn;
use crate::worker::{self, ServerContext};

pub struct Dispatcher<P: Provider> {
    // Do NOT change the order of the following fields. The listening id must be destroyed
    // before the channel it reports to.
    listener: Option<P::CmId>,
    channel: Option<P::EventChannel>,
    ctx: Arc<ServerContext<P>>,
    workers: Vec<JoinHandle<()>>,
}

impl<P: Provider> Dispatcher<P> {
    pub fn new(ctx: Arc<ServerContext<P>>) -> Self {
        Dispatcher {
            listener: None,
            channel: None,
            ctx,
            workers: Vec::new(),
        }
    }

    #[inline]
    pub fn context(&self) -> &Arc<ServerContext<P>> {
        &self.ctx
    }

    /// Binds to `interface` (all interfaces when `None`) and `port`, then starts listening.
    pub fn init(&mut self, interface: Option<&str>, port: u16) -> Result<()> {
        if self.listener.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        self.ctx.config().transport.validate()?;
        let ip = match interface {
            Some(s) => s
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidInterface(s.to_owned()))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let addr = SocketAddr::new(ip, port);

        let provider = self.ctx.provider();
        let channel = provider
            .create_event_channel()
            .map_err(Error::EventChannel)?;
        let listener = provider
            .create_id(&channel, PortSpace::TCP)
            .map_err(Error::CreateId)?;
        listener.bind_addr(&addr).map_err(Error::BindFailed)?;
        listener
            .listen(self.ctx.config().transport.backlog)
            .map_err(Error::ListenFailed)?;

        tracing::info!(
            "listening on {}",
            listener.local_addr().unwrap_or(addr)
        );
        self.listener = Some(listener);
        self.channel = Some(channel);
        Ok(())
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|id| id.local_addr())
    }

    /// Waits up to the configured timeout for a connect request and dispatches it. Returns the
    /// number of ready events, 0 on timeout.
    pub fn poll_once(&mut self) -> Result<usize> {
        let channel = self.channel.as_ref().ok_or(Error::NotInitialized)?;
        let timeout = Duration::from_millis(self.ctx.config().transport.dispatcher_poll_timeout_ms);
        if !channel.poll(Some(timeout)).map_err(Error::CmEvent)? {
            self.reap_workers();
            return Ok(0);
        }

        let mut event = channel.get_cm_event().map_err(Error::CmEvent)?;
        let res = match event.event() {
            CmEventType::ConnectRequest if event.status() != 0 => {
                // dropping the event releases the id, which rejects the peer
                tracing::warn!("connect request failed with status {}", event.status());
                self.ctx.stats().conn_rejected();
                Ok(())
            }
            CmEventType::ConnectRequest => match event.take_id() {
                Some(id) => self.dispatch(id),
                None => {
                    tracing::warn!("connect request without a connection id");
                    Ok(())
                }
            },
            _ => {
                tracing::info!("dispatcher ignoring cm event {}", event);
                Ok(())
            }
        };
        // acknowledged after the worker got the id
        drop(event);
        self.reap_workers();
        res.map(|()| 1)
    }

    fn dispatch(&mut self, id: P::CmId) -> Result<()> {
        let conn_id = self.ctx.next_conn_id();
        let transport = RdmaConn::new(id, &self.ctx.config().transport);
        let conn = Conn::new(conn_id, transport, Arc::clone(self.ctx.stats()));
        let ctx = Arc::clone(&self.ctx);
        let handle = thread::Builder::new()
            .name(format!("mcrdma-worker-{}", conn_id))
            .spawn(move || worker::run(ctx, conn))
            .map_err(|e| {
                tracing::warn!("couldn't spawn a worker for connection {}: {}", conn_id, e);
                self.ctx.stats().conn_rejected();
                Error::Spawn(e)
            })?;
        tracing::debug!("connection {} dispatched", conn_id);
        self.workers.push(handle);
        Ok(())
    }

    fn reap_workers(&mut self) {
        self.workers.retain(|handle| !handle.is_finished());
    }

    /// Number of workers still serving a connection.
    pub fn active_workers(&mut self) -> usize {
        self.reap_workers();
        self.workers.len()
    }

    /// Releases the listening id, then its channel. Running workers keep serving their
    /// connections.
    pub fn destroy(mut self) {
        tracing::info!("shutting down the dispatcher");
        self.listener.take();
        self.channel.take();
    }
}
