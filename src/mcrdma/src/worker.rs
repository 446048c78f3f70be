//! Connection workers. Each accepted connection is served by its own thread.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rdma::provider::Provider;
use rdma::types::{CmEventType, ConnParam};

use crate::config::Config;
use crate::conn::{Conn, ConnState};
use crate::error::Result;
use crate::proto::Protocol;
use crate::stats::Stats;
use crate::transport::RdmaConn;

/// Receives connections that switched to log watching.
pub trait WatchSink<T>: Send + Sync {
    fn watch(&self, conn: Conn<T>);
}

/// Logs the handover and releases the connection.
#[derive(Debug, Default)]
pub struct LogWatchSink;

impl<T> WatchSink<T> for LogWatchSink {
    fn watch(&self, conn: Conn<T>) {
        tracing::info!("connection {} requested log watching, releasing it", conn.id());
    }
}

/// State shared by the dispatcher and all workers.
pub struct ServerContext<P: Provider> {
    provider: Arc<P>,
    config: Config,
    stats: Arc<Stats>,
    protocol: Arc<dyn Protocol>,
    watch_sink: Arc<dyn WatchSink<RdmaConn<P>>>,
    next_conn_id: AtomicU64,
}

impl<P: Provider> ServerContext<P> {
    pub fn new(provider: Arc<P>, config: Config, protocol: Arc<dyn Protocol>) -> Self {
        ServerContext {
            provider,
            config,
            stats: Arc::new(Stats::new()),
            protocol,
            watch_sink: Arc::new(LogWatchSink),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn with_watch_sink(mut self, sink: Arc<dyn WatchSink<RdmaConn<P>>>) -> Self {
        self.watch_sink = sink;
        self
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Provisions the connection and completes the handshake.
fn bootstrap<P: Provider>(ctx: &ServerContext<P>, rdma: &mut RdmaConn<P>) -> Result<()> {
    rdma.prepare(&ctx.provider, &ctx.config.transport)?;
    rdma.post_recv()?;
    let conn_param = ConnParam {
        initiator_depth: 1,
        responder_resources: 1,
        ..Default::default()
    };
    rdma.accept(&conn_param)?;
    rdma.wait_event(CmEventType::Established, None)?;
    Ok(())
}

/// Body of a worker thread.
pub(crate) fn run<P: Provider>(ctx: Arc<ServerContext<P>>, mut conn: Conn<RdmaConn<P>>) {
    let span = tracing::info_span!("conn", id = conn.id());
    let _enter = span.enter();

    let mut handler = ctx.protocol.new_handler();
    if let Err(e) = bootstrap(&ctx, conn.transport_mut()) {
        tracing::warn!("connection setup failed: {}", e);
        ctx.stats.accept_failed();
        // dropping the connection releases whatever was provisioned
        return;
    }
    tracing::debug!("connection established");

    while !matches!(conn.state(), ConnState::Closed | ConnState::Watch) {
        conn.drive_machine(&mut *handler);
    }

    match conn.state() {
        ConnState::Watch => ctx.watch_sink.watch(conn),
        _ => tracing::debug!("connection closed"),
    }
}
