//! The seam between the connection state machine and a command protocol.
use std::collections::VecDeque;

use crate::conn::ConnState;

pub mod ascii;

/// What the state machine does after a command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start the next command, writing any queued responses first.
    NewCmd,
    /// Read a payload of this many bytes, then call
    /// [`CommandHandler::complete_nread`].
    Nread(usize),
    /// Discard this many incoming bytes, writing any queued responses first.
    Swallow(usize),
    /// Write the queued responses, then move to the given state.
    Write(ConnState),
    /// Close the connection without writing.
    Close,
}

/// Result of [`CommandHandler::try_read_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// No complete command is buffered yet.
    NeedMore,
    /// A command of `consumed` bytes was handled.
    Command { consumed: usize, action: Action },
}

/// Responses waiting to be transmitted, in order.
#[derive(Debug, Default)]
pub struct Responses {
    queue: VecDeque<Vec<u8>>,
    // bytes of the front response already sent
    sent: usize,
}

impl Responses {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push<B: Into<Vec<u8>>>(&mut self, resp: B) {
        let resp = resp.into();
        if !resp.is_empty() {
            self.queue.push_back(resp);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes not sent yet.
    pub fn pending_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum::<usize>() - self.sent
    }

    /// Borrows the unsent bytes as slices totalling at most `max` bytes.
    pub fn chunk(&self, max: usize) -> Vec<&[u8]> {
        let mut iov = Vec::new();
        let mut total = 0;
        let mut skip = self.sent;
        for resp in &self.queue {
            if total == max {
                break;
            }
            let rest = &resp[skip..];
            skip = 0;
            let take = rest.len().min(max - total);
            iov.push(&rest[..take]);
            total += take;
        }
        iov
    }

    /// Drops the first `n` unsent bytes.
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let front_left = match self.queue.front() {
                Some(front) => front.len() - self.sent,
                None => break,
            };
            if n < front_left {
                self.sent += n;
                return;
            }
            n -= front_left;
            self.sent = 0;
            self.queue.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.sent = 0;
    }
}

/// Per-connection command processing. One handler lives on each worker thread.
pub trait CommandHandler {
    /// Handles the first complete command in `input`, queueing any output in `out`.
    fn try_read_command(&mut self, input: &[u8], out: &mut Responses) -> Parsed;

    /// Called once the payload announced by [`Action::Nread`] has been read. `data` holds
    /// exactly that many bytes.
    fn complete_nread(&mut self, data: Vec<u8>, out: &mut Responses) -> Action;

    /// Clears per-command state before the next command.
    fn reset_cmd_handler(&mut self);

    /// Submits queued side-channel I/O instead of transmitting responses. Returns `true` when
    /// I/O was submitted and the state machine should stop this pass.
    fn submit_io(&mut self, _out: &mut Responses) -> bool {
        false
    }
}

/// A protocol shared by all workers.
pub trait Protocol: Send + Sync {
    fn new_handler(&self) -> Box<dyn CommandHandler>;
}
