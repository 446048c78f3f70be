//! The active side of a connection.
use std::net::SocketAddr;
use std::time::Duration;

use rdma::provider::{CmId, Provider};
use rdma::types::{CmEventType, ConnParam, PortSpace};

use crate::cm;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::resources::RdmaResources;
use crate::transport::{RdmaConn, Transport};

/// Whether `reply` holds one complete response. Retrievals end with `END`, everything else
/// is a single line.
fn reply_complete(reply: &[u8]) -> bool {
    if reply.starts_with(b"VALUE ") {
        reply.ends_with(b"END\r\n")
    } else {
        reply.ends_with(b"\r\n")
    }
}

pub struct RdmaClient<P: Provider> {
    conn: RdmaConn<P>,
    buf: Vec<u8>,
}

impl<P: Provider> RdmaClient<P> {
    /// Resolves `addr`, provisions the connection and connects.
    pub fn connect(provider: &P, addr: &SocketAddr, config: &TransportConfig) -> Result<Self> {
        let timeout_ms = config.resolve_timeout_ms;
        let timeout = Some(Duration::from_millis(timeout_ms.max(0) as u64));

        let channel = provider
            .create_event_channel()
            .map_err(Error::EventChannel)?;
        let id = provider
            .create_id(&channel, PortSpace::TCP)
            .map_err(Error::CreateId)?;

        id.resolve_addr(addr, timeout_ms)
            .map_err(Error::ConnectFailed)?;
        cm::process_event(&channel, CmEventType::AddrResolved, timeout)?;
        id.resolve_route(timeout_ms).map_err(Error::ConnectFailed)?;
        cm::process_event(&channel, CmEventType::RouteResolved, timeout)?;

        let resources = RdmaResources::<P>::new(&id, config)?;
        let mut conn = RdmaConn::from_parts(id, channel, resources, config);
        conn.post_recv()?;

        let conn_param = ConnParam {
            initiator_depth: 3,
            responder_resources: 3,
            retry_count: 3,
            ..Default::default()
        };
        conn.id()
            .connect(&conn_param)
            .map_err(Error::ConnectFailed)?;
        conn.wait_event(CmEventType::Established, None)?;
        tracing::debug!("connected to {}", addr);

        let buf = vec![0; conn.max_message()];
        Ok(RdmaClient { conn, buf })
    }

    /// Sends `data` as one message.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.conn.sendmsg(&[data])
    }

    /// Receives one message. `Ok(0)` means the server went away.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.conn.read(buf)
    }

    /// Sends `req` and collects messages until one complete response has arrived.
    pub fn request(&mut self, req: &[u8]) -> Result<Vec<u8>> {
        self.send(req)?;
        let mut reply = Vec::new();
        loop {
            let n = self.conn.read(&mut self.buf)?;
            if n == 0 {
                return Err(Error::PeerDisconnected);
            }
            reply.extend_from_slice(&self.buf[..n]);
            if reply_complete(&reply) {
                return Ok(reply);
            }
        }
    }

    #[inline]
    pub fn max_message(&self) -> usize {
        self.conn.max_message()
    }

    /// Disconnects and waits for the connection manager to confirm.
    pub fn disconnect(self) -> Result<()> {
        self.conn
            .id()
            .disconnect()
            .map_err(Error::ConnectFailed)?;
        let res = self.conn.wait_event(
            CmEventType::Disconnected,
            Some(Duration::from_millis(2000)),
        );
        self.conn.destroy();
        res
    }
}
