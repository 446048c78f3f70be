//! The per-connection state machine.
use std::fmt;
use std::sync::Arc;

use minstant::Instant;

use crate::error::Error;
use crate::proto::{Action, CommandHandler, Parsed, Responses};
use crate::stats::Stats;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the transport to become readable.
    Waiting,
    Read,
    ParseCmd,
    NewCmd,
    /// Reading the data block of a storage command.
    Nread,
    /// Discarding bytes the client already sent.
    Swallow,
    /// Single-buffer write. Handlers here always queue through [`Responses`], so the machine
    /// only enters `Mwrite`; both states transmit the same way.
    Write,
    Mwrite,
    Closing,
    Closed,
    /// Handed over to the log watcher.
    Watch,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Waiting => "conn_waiting",
            ConnState::Read => "conn_read",
            ConnState::ParseCmd => "conn_parse_cmd",
            ConnState::NewCmd => "conn_new_cmd",
            ConnState::Nread => "conn_nread",
            ConnState::Swallow => "conn_swallow",
            ConnState::Write => "conn_write",
            ConnState::Mwrite => "conn_mwrite",
            ConnState::Closing => "conn_closing",
            ConnState::Closed => "conn_closed",
            ConnState::Watch => "conn_watch",
        };
        f.write_str(name)
    }
}

enum ReadResult {
    DataReceived,
    NoDataReceived,
    Error,
    MemoryError,
}

enum TransmitResult {
    Complete,
    Incomplete,
    SoftError,
    HardError,
}

/// A client connection, owned by exactly one worker thread.
pub struct Conn<T> {
    id: u64,
    state: ConnState,
    write_and_go: ConnState,
    rbuf: Vec<u8>,
    rcurr: usize,
    rbytes: usize,
    responses: Responses,
    // payload of the storage command being read and its full length
    item: Option<Vec<u8>>,
    rlbytes: usize,
    sbytes: usize,
    last_cmd_time: Instant,
    authenticated: bool,
    stats: Arc<Stats>,
    transport: T,
}

impl<T> fmt::Debug for Conn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("rbytes", &self.rbytes)
            .finish()
    }
}

impl<T> Conn<T> {
    pub fn new(id: u64, transport: T, stats: Arc<Stats>) -> Self {
        stats.conn_opened();
        Conn {
            id,
            state: ConnState::Waiting,
            write_and_go: ConnState::NewCmd,
            rbuf: Vec::new(),
            rcurr: 0,
            rbytes: 0,
            responses: Responses::new(),
            item: None,
            rlbytes: 0,
            sbytes: 0,
            last_cmd_time: Instant::now(),
            // RDMA connections are not authenticated separately
            authenticated: true,
            stats,
            transport,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[inline]
    pub fn last_cmd_time(&self) -> Instant {
        self.last_cmd_time
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn set_state(&mut self, state: ConnState) {
        if state != self.state {
            tracing::trace!("{} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Moves to `next`, writing the queued responses first if there are any.
    fn write_then(&mut self, next: ConnState) {
        if self.responses.is_empty() {
            self.set_state(next);
        } else {
            self.write_and_go = next;
            self.set_state(ConnState::Mwrite);
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::NewCmd => self.write_then(ConnState::NewCmd),
            Action::Nread(len) => {
                self.rlbytes = len;
                self.item = None;
                self.set_state(ConnState::Nread);
            }
            Action::Swallow(len) => {
                self.sbytes = len;
                self.write_then(ConnState::Swallow);
            }
            Action::Write(next) => {
                self.write_and_go = next;
                self.set_state(ConnState::Mwrite);
            }
            Action::Close => self.set_state(ConnState::Closing),
        }
    }

    fn out_of_memory(&mut self, msg: &str) {
        self.stats.malloc_failed();
        self.responses.push(msg);
    }
}

impl<T: Transport> Conn<T> {
    /// Reads one message into the read buffer, growing it to fit a full message first.
    fn try_read_network(&mut self) -> ReadResult {
        if self.rcurr != 0 {
            if self.rbytes != 0 {
                self.rbuf
                    .copy_within(self.rcurr..self.rcurr + self.rbytes, 0);
            }
            self.rcurr = 0;
        }

        let need = self.rbytes.saturating_add(self.transport.max_message());
        if self.rbuf.len() < need {
            if self.rbuf.try_reserve(need - self.rbuf.len()).is_err() {
                tracing::warn!("couldn't grow the read buffer to {} bytes", need);
                self.rbytes = 0;
                self.out_of_memory("SERVER_ERROR out of memory reading request\r\n");
                self.write_and_go = ConnState::Closing;
                self.set_state(ConnState::Mwrite);
                return ReadResult::MemoryError;
            }
            self.rbuf.resize(need, 0);
        }

        match self.transport.read(&mut self.rbuf[self.rbytes..]) {
            Ok(_) if self.transport.take_pinged() => ReadResult::NoDataReceived,
            Ok(0) => {
                tracing::debug!("connection closed by peer");
                ReadResult::Error
            }
            Ok(n) => {
                self.rbytes += n;
                ReadResult::DataReceived
            }
            Err(e) => {
                tracing::warn!("read failed: {}", e);
                ReadResult::Error
            }
        }
    }

    fn transmit<H: CommandHandler + ?Sized>(&mut self, handler: &mut H) -> TransmitResult {
        if handler.submit_io(&mut self.responses) {
            return TransmitResult::SoftError;
        }
        if self.responses.is_empty() {
            return TransmitResult::Complete;
        }
        let max = self.transport.max_message();
        let iov = self.responses.chunk(max);
        match self.transport.sendmsg(&iov) {
            Ok(n) => {
                self.responses.consume(n);
                if self.responses.is_empty() {
                    TransmitResult::Complete
                } else {
                    TransmitResult::Incomplete
                }
            }
            // only a transport that reports a full send queue as WouldBlock gets here
            Err(Error::PostFailed(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                TransmitResult::SoftError
            }
            Err(e) => {
                tracing::warn!("failed to write, and not due to blocking: {}", e);
                self.responses.clear();
                self.set_state(ConnState::Closing);
                TransmitResult::HardError
            }
        }
    }

    /// Moves buffered bytes into the in-flight item, or reads more from the network.
    fn fill_item<H: CommandHandler + ?Sized>(&mut self, handler: &mut H) -> bool {
        if self.item.is_none() {
            let mut data = Vec::new();
            if data.try_reserve_exact(self.rlbytes).is_err() {
                tracing::warn!("couldn't allocate an item of {} bytes", self.rlbytes);
                self.out_of_memory("SERVER_ERROR out of memory storing object\r\n");
                self.sbytes = self.rlbytes;
                self.write_then(ConnState::Swallow);
                return false;
            }
            self.item = Some(data);
        }

        let filled = self.item.as_ref().map_or(0, Vec::len);
        let want = self.rlbytes - filled;
        if want == 0 {
            let data = self.item.take().unwrap_or_default();
            let action = handler.complete_nread(data, &mut self.responses);
            self.apply(action);
            return false;
        }

        if self.rbytes > 0 {
            let n = want.min(self.rbytes);
            if let Some(item) = self.item.as_mut() {
                item.extend_from_slice(&self.rbuf[self.rcurr..self.rcurr + n]);
            }
            self.rcurr += n;
            self.rbytes -= n;
            return false;
        }

        match self.try_read_network() {
            ReadResult::DataReceived => false,
            ReadResult::NoDataReceived => true,
            ReadResult::Error => {
                self.set_state(ConnState::Closing);
                false
            }
            ReadResult::MemoryError => false,
        }
    }

    /// Discards buffered bytes, or reads more from the network.
    fn swallow(&mut self) -> bool {
        if self.sbytes == 0 {
            self.set_state(ConnState::NewCmd);
            return false;
        }
        if self.rbytes > 0 {
            let n = self.sbytes.min(self.rbytes);
            self.sbytes -= n;
            self.rcurr += n;
            self.rbytes -= n;
            return false;
        }
        match self.try_read_network() {
            ReadResult::DataReceived => false,
            ReadResult::NoDataReceived => true,
            ReadResult::Error => {
                self.set_state(ConnState::Closing);
                false
            }
            ReadResult::MemoryError => false,
        }
    }

    /// Runs the state machine until it has to wait, the connection is closed or it is handed
    /// to the watcher.
    pub fn drive_machine<H: CommandHandler + ?Sized>(&mut self, handler: &mut H) {
        if self.state == ConnState::Closed {
            tracing::error!("connection {} entered the state machine after close", self.id);
            std::process::abort();
        }

        let mut stop = false;
        while !stop {
            match self.state {
                ConnState::Waiting => self.set_state(ConnState::Read),
                ConnState::Read => match self.try_read_network() {
                    ReadResult::NoDataReceived => stop = true,
                    ReadResult::DataReceived => self.set_state(ConnState::ParseCmd),
                    ReadResult::Error => self.set_state(ConnState::Closing),
                    ReadResult::MemoryError => {}
                },
                ConnState::ParseCmd => {
                    let input = &self.rbuf[self.rcurr..self.rcurr + self.rbytes];
                    match handler.try_read_command(input, &mut self.responses) {
                        Parsed::NeedMore => {
                            if self.responses.is_empty() {
                                self.set_state(ConnState::Read);
                            } else {
                                self.write_and_go = ConnState::NewCmd;
                                self.set_state(ConnState::Mwrite);
                            }
                        }
                        Parsed::Command { consumed, action } => {
                            self.rcurr += consumed;
                            self.rbytes -= consumed;
                            self.last_cmd_time = Instant::now();
                            self.apply(action);
                        }
                    }
                }
                ConnState::NewCmd => {
                    handler.reset_cmd_handler();
                    self.item = None;
                    self.rlbytes = 0;
                    self.sbytes = 0;
                    self.write_and_go = ConnState::NewCmd;
                    self.set_state(ConnState::ParseCmd);
                }
                ConnState::Nread => stop = self.fill_item(handler),
                ConnState::Swallow => stop = self.swallow(),
                ConnState::Write | ConnState::Mwrite => match self.transmit(handler) {
                    TransmitResult::Complete => {
                        let next = self.write_and_go;
                        self.set_state(next);
                    }
                    TransmitResult::Incomplete | TransmitResult::HardError => {}
                    TransmitResult::SoftError => stop = true,
                },
                ConnState::Closing => {
                    tracing::debug!("closing connection {}", self.id);
                    self.set_state(ConnState::Closed);
                    stop = true;
                }
                ConnState::Closed | ConnState::Watch => stop = true,
            }
        }
    }
}

impl<T> Drop for Conn<T> {
    fn drop(&mut self) {
        self.stats.conn_closed();
    }
}
