//! Message-oriented byte transport over one RDMA connection.
use std::mem;
use std::time::Duration;

use rdma::provider::{CmId, Provider, QueuePair};
use rdma::types::{CmEventType, ConnParam, SendFlags, WcOpcode, WcStatus, WorkCompletion};

use crate::cm;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::poller;
use crate::resources::RdmaResources;

/// A message starting with this byte is a liveness probe, answered with [`PONG`].
pub const PING_SENTINEL: u8 = b'P';
pub const PONG: &[u8] = b"PONG\r\n";

const RECV_WR_ID: u64 = 1;
const SEND_WR_ID: u64 = 2;

/// What the connection state machine needs from the wire.
pub trait Transport {
    /// Receives one message into `buf`. `Ok(0)` means the stream ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Sends the concatenation of `iov` as one message.
    fn sendmsg(&mut self, iov: &[&[u8]]) -> Result<usize>;

    /// The largest message `sendmsg` accepts and `read` can return.
    fn max_message(&self) -> usize;

    /// Whether the last `read` consumed a liveness probe instead of data. Clears the flag.
    fn take_pinged(&mut self) -> bool {
        false
    }
}

/// One RDMA connection: its id, its verbs resources and the receive bookkeeping.
///
/// Released in field order: the resources first, then the id, which destroys the event
/// channel it owns after itself. A client keeps the channel its id was created on in
/// `channel`, dropped last.
pub struct RdmaConn<P: Provider> {
    // Do NOT change the order of the following fields.
    resources: Option<RdmaResources<P>>,
    id: P::CmId,
    channel: Option<P::EventChannel>,
    recv_posted: bool,
    stashed: Option<WorkCompletion>,
    pinged: bool,
    answer_pings: bool,
    disconnect_check_interval: usize,
}

impl<P: Provider> RdmaConn<P> {
    /// Wraps the id of an incoming connection request. Nothing is allocated until `prepare`.
    pub fn new(id: P::CmId, config: &TransportConfig) -> Self {
        RdmaConn {
            resources: None,
            id,
            channel: None,
            recv_posted: false,
            stashed: None,
            pinged: false,
            answer_pings: true,
            disconnect_check_interval: config.disconnect_check_interval,
        }
    }

    /// Assembles the active side of a connection. Liveness probes are not answered.
    pub(crate) fn from_parts(
        id: P::CmId,
        channel: P::EventChannel,
        resources: RdmaResources<P>,
        config: &TransportConfig,
    ) -> Self {
        RdmaConn {
            resources: Some(resources),
            id,
            channel: Some(channel),
            recv_posted: false,
            stashed: None,
            pinged: false,
            answer_pings: false,
            disconnect_check_interval: config.disconnect_check_interval,
        }
    }

    /// Allocates the verbs resources, then moves the id onto a fresh event channel of its own
    /// so its events are no longer reported to the listener.
    pub fn prepare(&mut self, provider: &P, config: &TransportConfig) -> Result<()> {
        if self.resources.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let resources = RdmaResources::<P>::new(&self.id, config)?;
        let channel = provider.create_event_channel().map_err(Error::EventChannel)?;
        self.id.migrate_id(channel).map_err(Error::Migrate)?;
        self.resources = Some(resources);
        tracing::trace!("connection resources prepared");
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> &P::CmId {
        &self.id
    }

    #[inline]
    pub fn is_prepared(&self) -> bool {
        self.resources.is_some()
    }

    fn event_channel(&self) -> Result<&P::EventChannel> {
        self.id
            .event_channel()
            .or(self.channel.as_ref())
            .ok_or(Error::NotPrepared)
    }

    /// Posts the receive buffer unless a receive is already outstanding.
    pub fn post_recv(&mut self) -> Result<()> {
        if self.recv_posted {
            return Ok(());
        }
        let res = self.resources.as_ref().ok_or(Error::NotPrepared)?;
        // Safety: the receive buffer is only read after its completion is polled, and it is
        // deregistered after the queue pair is destroyed.
        unsafe {
            res.qp
                .post_recv(RECV_WR_ID, &res.recv_mr, res.recv_mr.len())
                .map_err(Error::PostFailed)?;
        }
        self.recv_posted = true;
        Ok(())
    }

    pub fn accept(&self, conn_param: &ConnParam) -> Result<()> {
        self.id.accept(conn_param).map_err(Error::AcceptFailed)
    }

    /// Waits for `expected` on this connection's event channel.
    pub fn wait_event(&self, expected: CmEventType, timeout: Option<Duration>) -> Result<()> {
        let channel = self.event_channel()?;
        cm::process_event(channel, expected, timeout)?;
        Ok(())
    }

    /// Releases the connection. Every resource is destroyed exactly once, in reverse order of
    /// creation.
    pub fn destroy(self) {
        tracing::trace!("destroying connection");
        drop(self);
    }

    fn next_completion(
        resources: &RdmaResources<P>,
        channel: &P::EventChannel,
        interval: usize,
    ) -> Result<WorkCompletion> {
        let mut wc = [WorkCompletion::default(); 1];
        poller::poll_cq_interleaved(&resources.cq, &mut wc, 1, channel, interval)?;
        Ok(wc[0])
    }

    fn recv_completion(&mut self) -> Result<WorkCompletion> {
        if let Some(wc) = self.stashed.take() {
            return Ok(wc);
        }
        let res = self.resources.as_ref().ok_or(Error::NotPrepared)?;
        let channel = self.event_channel()?;
        loop {
            let wc = Self::next_completion(res, channel, self.disconnect_check_interval)?;
            match wc.opcode {
                WcOpcode::Recv => return Ok(wc),
                _ => tracing::debug!("dropping stray completion, wr_id: {}", wc.wr_id),
            }
        }
    }

    /// Copies the first `len` bytes of the receive buffer into `buf`.
    fn copy_received(&self, len: usize, buf: &mut [u8]) -> Result<()> {
        let res = self.resources.as_ref().ok_or(Error::NotPrepared)?;
        buf[..len].copy_from_slice(&res.recv_mr[..len]);
        Ok(())
    }

    fn first_received_byte(&self) -> Option<u8> {
        self.resources
            .as_ref()
            .and_then(|res| res.recv_mr.first().copied())
    }
}

impl<P: Provider> Transport for RdmaConn<P> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            self.post_recv()?;
            let wc = match self.recv_completion() {
                Ok(wc) => wc,
                Err(Error::PeerDisconnected) => return Ok(0),
                Err(Error::CompletionFailed {
                    status: WcStatus::WrFlushErr,
                    ..
                }) => {
                    self.recv_posted = false;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            };
            self.recv_posted = false;

            let len = wc.byte_len as usize;
            if len == 0 {
                continue;
            }
            if self.answer_pings && self.first_received_byte() == Some(PING_SENTINEL) {
                self.post_recv()?;
                self.sendmsg(&[PONG])?;
                self.pinged = true;
                return Ok(len);
            }
            if len > buf.len() {
                self.post_recv()?;
                return Err(Error::BufferTooSmall {
                    len,
                    capacity: buf.len(),
                });
            }
            self.copy_received(len, buf)?;
            self.post_recv()?;
            return Ok(len);
        }
    }

    fn sendmsg(&mut self, iov: &[&[u8]]) -> Result<usize> {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        let interval = self.disconnect_check_interval;
        let res = self.resources.as_mut().ok_or(Error::NotPrepared)?;
        let capacity = res.send_mr.len();
        if total > capacity {
            return Err(Error::BufferTooSmall {
                len: total,
                capacity,
            });
        }

        let mut off = 0;
        for s in iov {
            res.send_mr[off..off + s.len()].copy_from_slice(s);
            off += s.len();
        }

        // Safety: the send buffer is not touched again until the completion below is polled.
        unsafe {
            res.qp
                .post_send(SEND_WR_ID, &res.send_mr, total, SendFlags::SIGNALED)
                .map_err(Error::PostFailed)?;
        }

        let channel = self
            .id
            .event_channel()
            .or(self.channel.as_ref())
            .ok_or(Error::NotPrepared)?;
        loop {
            let wc = Self::next_completion(res, channel, interval)?;
            match wc.opcode {
                WcOpcode::Send => return Ok(total),
                WcOpcode::Recv => {
                    // a request arrived while waiting, keep it for the next read
                    self.stashed = Some(wc);
                }
                _ => tracing::debug!("dropping stray completion, wr_id: {}", wc.wr_id),
            }
        }
    }

    #[inline]
    fn max_message(&self) -> usize {
        self.resources
            .as_ref()
            .map_or(0, RdmaResources::buffer_size)
    }

    #[inline]
    fn take_pinged(&mut self) -> bool {
        mem::replace(&mut self.pinged, false)
    }
}

impl<P: Provider> Drop for RdmaConn<P> {
    fn drop(&mut self) {
        if self.resources.is_some() {
            if let Err(e) = self.id.disconnect() {
                tracing::debug!("rdma_disconnect: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma::provider::{CmEvent, EventChannel};
    use rdma::sim::SimFabric;
    use rdma::types::PortSpace;

    type Conn = RdmaConn<SimFabric>;

    fn config() -> TransportConfig {
        TransportConfig {
            buffer_size: 64,
            ..Default::default()
        }
    }

    /// Returns (server, client), both established.
    fn pair(fabric: &SimFabric) -> (Conn, Conn, <SimFabric as Provider>::CmId) {
        let config = config();
        let listen_ch = fabric.create_event_channel().unwrap();
        let listener = fabric.create_id(&listen_ch, PortSpace::TCP).unwrap();
        listener.bind_addr(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let ch = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&ch, PortSpace::TCP).unwrap();
        id.resolve_addr(&addr, 100).unwrap();
        drop(cm::process_event(&ch, CmEventType::AddrResolved, None).unwrap());
        id.resolve_route(100).unwrap();
        drop(cm::process_event(&ch, CmEventType::RouteResolved, None).unwrap());
        let res = RdmaResources::<SimFabric>::new(&id, &config).unwrap();
        let mut client = RdmaConn::from_parts(id, ch, res, &config);
        client.post_recv().unwrap();
        client.id().connect(&ConnParam::default()).unwrap();

        let mut ev = cm::process_event(&listen_ch, CmEventType::ConnectRequest, None).unwrap();
        let mut server = RdmaConn::new(ev.take_id().unwrap(), &config);
        drop(ev);
        server.prepare(fabric, &config).unwrap();
        server.post_recv().unwrap();
        server.accept(&ConnParam::default()).unwrap();
        server.wait_event(CmEventType::Established, None).unwrap();
        client.wait_event(CmEventType::Established, None).unwrap();
        drop(listen_ch);
        (server, client, listener)
    }

    #[test]
    fn message_round_trip() {
        let fabric = SimFabric::new();
        let (mut server, mut client, _listener) = pair(&fabric);
        assert_eq!(client.sendmsg(&[b"get ", b"foo\r\n"]).unwrap(), 9);
        let mut buf = [0u8; 64];
        assert_eq!(server.read(&mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"get foo\r\n");
        assert!(!server.take_pinged());

        server.sendmsg(&[b"END\r\n"]).unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"END\r\n");
    }

    #[test]
    fn oversized_message_is_refused() {
        let fabric = SimFabric::new();
        let (_server, mut client, _listener) = pair(&fabric);
        let big = [b'x'; 65];
        assert!(matches!(
            client.sendmsg(&[&big]),
            Err(Error::BufferTooSmall {
                len: 65,
                capacity: 64
            })
        ));
        assert_eq!(client.sendmsg(&[&big[..64]]).unwrap(), 64);
    }

    #[test]
    fn probe_is_answered_and_not_returned() {
        let fabric = SimFabric::new();
        let (mut server, mut client, _listener) = pair(&fabric);
        client.sendmsg(&[b"PING\r\n"]).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(server.read(&mut buf).unwrap(), 6);
        assert!(server.take_pinged());
        assert!(!server.take_pinged());
        assert_eq!(buf, [0u8; 64]);

        // the client does not answer probes, the reply is plain data
        assert_eq!(client.read(&mut buf).unwrap(), PONG.len());
        assert_eq!(&buf[..PONG.len()], PONG);
    }

    #[test]
    fn request_arriving_during_send_is_kept() {
        let fabric = SimFabric::new();
        let (mut server, mut client, _listener) = pair(&fabric);
        client.sendmsg(&[b"one\r\n"]).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(server.read(&mut buf).unwrap(), 5);

        // the second request lands while the server waits for its reply to complete
        client.sendmsg(&[b"two\r\n"]).unwrap();
        server.sendmsg(&[b"ONE\r\n"]).unwrap();
        assert_eq!(server.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"two\r\n");
        assert_eq!(client.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"ONE\r\n");
    }

    #[test]
    fn peer_disconnect_ends_the_stream() {
        let fabric = SimFabric::new();
        let (mut server, client, _listener) = pair(&fabric);
        client.destroy();
        let mut buf = [0u8; 64];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        let channel = server.event_channel().unwrap();
        assert!(channel.poll(Some(Duration::ZERO)).unwrap());
        assert_eq!(
            channel.get_cm_event().unwrap().event(),
            CmEventType::Disconnected
        );
    }

    #[test]
    fn unprepared_connection_refuses_io() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel, PortSpace::TCP).unwrap();
        let mut conn: Conn = RdmaConn::new(id, &config());
        assert!(!conn.is_prepared());
        assert_eq!(conn.max_message(), 0);
        assert!(matches!(conn.post_recv(), Err(Error::NotPrepared)));
        assert!(matches!(conn.sendmsg(&[b"x"]), Err(Error::NotPrepared)));
    }
}
