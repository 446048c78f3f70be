//! memcached ASCII protocol.
use std::io::Write;
use std::str;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::conn::ConnState;
use crate::store::{DeltaOutcome, Store, StoreMode, StoreOutcome};

use super::{Action, CommandHandler, Parsed, Protocol, Responses};

/// Longest command line accepted without a terminator.
pub const MAX_LINE: usize = 2048;
pub const KEY_MAX_LENGTH: usize = 250;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const BAD_FORMAT: &str = "CLIENT_ERROR bad command line format\r\n";

pub struct AsciiProtocol {
    store: Arc<Store>,
    item_size_max: usize,
}

impl AsciiProtocol {
    pub fn new(store: Arc<Store>, config: &CacheConfig) -> Self {
        AsciiProtocol {
            store,
            item_size_max: config.item_size_max,
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

impl Protocol for AsciiProtocol {
    fn new_handler(&self) -> Box<dyn CommandHandler> {
        Box::new(AsciiHandler {
            store: Arc::clone(&self.store),
            item_size_max: self.item_size_max,
            pending: None,
        })
    }
}

/// A storage command waiting for its data block.
#[derive(Debug)]
struct PendingStore {
    mode: StoreMode,
    key: Vec<u8>,
    flags: u32,
    exptime: i64,
    noreply: bool,
}

pub struct AsciiHandler {
    store: Arc<Store>,
    item_size_max: usize,
    pending: Option<PendingStore>,
}

fn parse<T: str::FromStr>(token: &[u8]) -> Option<T> {
    str::from_utf8(token).ok()?.parse().ok()
}

/// Splits off a trailing `noreply`.
fn split_noreply<'a, 'b>(tokens: &'a [&'b [u8]]) -> (&'a [&'b [u8]], bool) {
    match tokens.split_last() {
        Some((last, rest)) if *last == b"noreply" => (rest, true),
        _ => (tokens, false),
    }
}

fn reply(out: &mut Responses, noreply: bool, msg: &str) {
    if !noreply {
        out.push(msg);
    }
}

impl AsciiHandler {
    fn process_command(&mut self, tokens: &[&[u8]], out: &mut Responses) -> Action {
        let (cmd, args) = match tokens.split_first() {
            Some(split) => split,
            None => {
                out.push("ERROR\r\n");
                return Action::NewCmd;
            }
        };
        match *cmd {
            b"get" => self.process_get(args, false, out),
            b"gets" => self.process_get(args, true, out),
            b"set" => self.process_update(args, StoreMode::Set, out),
            b"add" => self.process_update(args, StoreMode::Add, out),
            b"replace" => self.process_update(args, StoreMode::Replace, out),
            b"append" => self.process_update(args, StoreMode::Append, out),
            b"prepend" => self.process_update(args, StoreMode::Prepend, out),
            b"cas" => self.process_update(args, StoreMode::Cas(0), out),
            b"delete" => self.process_delete(args, out),
            b"incr" => self.process_delta(args, true, out),
            b"decr" => self.process_delta(args, false, out),
            b"touch" => self.process_touch(args, out),
            b"flush_all" => self.process_flush_all(args, out),
            b"version" => {
                out.push(format!("VERSION {}\r\n", VERSION));
                Action::NewCmd
            }
            b"verbosity" => {
                let (args, noreply) = split_noreply(args);
                match args {
                    [level] if parse::<u32>(level).is_some() => reply(out, noreply, "OK\r\n"),
                    _ => out.push(BAD_FORMAT),
                }
                Action::NewCmd
            }
            b"quit" => Action::Close,
            b"watch" => {
                out.push("OK\r\n");
                Action::Write(ConnState::Watch)
            }
            _ => {
                out.push("ERROR\r\n");
                Action::NewCmd
            }
        }
    }

    fn process_get(&mut self, keys: &[&[u8]], return_cas: bool, out: &mut Responses) -> Action {
        if keys.is_empty() {
            out.push("ERROR\r\n");
            return Action::NewCmd;
        }
        for key in keys {
            if key.len() > KEY_MAX_LENGTH {
                out.push(BAD_FORMAT);
                return Action::NewCmd;
            }
            if let Some(item) = self.store.get(key) {
                let mut resp = Vec::with_capacity(key.len() + item.data.len() + 64);
                resp.extend_from_slice(b"VALUE ");
                resp.extend_from_slice(key);
                // writing into a Vec cannot fail
                let _ = write!(resp, " {} {}", item.flags, item.data.len());
                if return_cas {
                    let _ = write!(resp, " {}", item.cas);
                }
                resp.extend_from_slice(b"\r\n");
                resp.extend_from_slice(&item.data);
                resp.extend_from_slice(b"\r\n");
                out.push(resp);
            }
        }
        out.push("END\r\n");
        Action::NewCmd
    }

    fn process_update(&mut self, args: &[&[u8]], mode: StoreMode, out: &mut Responses) -> Action {
        let (args, noreply) = split_noreply(args);
        let parsed = match (mode, args) {
            (StoreMode::Cas(_), [key, flags, exptime, bytes, unique]) => {
                parse::<u64>(unique).map(|u| (*key, *flags, *exptime, *bytes, StoreMode::Cas(u)))
            }
            (StoreMode::Cas(_), _) => None,
            (_, [key, flags, exptime, bytes]) => Some((*key, *flags, *exptime, *bytes, mode)),
            _ => None,
        };
        let fields = parsed.and_then(|(key, flags, exptime, bytes, mode)| {
            if key.len() > KEY_MAX_LENGTH {
                return None;
            }
            Some((
                key,
                parse::<u32>(flags)?,
                parse::<i64>(exptime)?,
                parse::<usize>(bytes)?,
                mode,
            ))
        });
        let (key, flags, exptime, bytes, mode) = match fields {
            Some(fields) => fields,
            None => {
                out.push(BAD_FORMAT);
                return Action::NewCmd;
            }
        };
        // the data block ends with "\r\n"
        let block = match bytes.checked_add(2) {
            Some(block) => block,
            None => {
                out.push(BAD_FORMAT);
                return Action::NewCmd;
            }
        };

        if bytes > self.item_size_max {
            out.push("SERVER_ERROR object too large for cache\r\n");
            if mode == StoreMode::Set {
                // a failed set must not leave the old value visible
                self.store.delete(key);
            }
            return Action::Swallow(block);
        }

        self.pending = Some(PendingStore {
            mode,
            key: key.to_vec(),
            flags,
            exptime,
            noreply,
        });
        Action::Nread(block)
    }

    fn process_delete(&mut self, args: &[&[u8]], out: &mut Responses) -> Action {
        let (args, noreply) = split_noreply(args);
        match args {
            [key] | [key, b"0"] if key.len() <= KEY_MAX_LENGTH => {
                let msg = if self.store.delete(key) {
                    "DELETED\r\n"
                } else {
                    "NOT_FOUND\r\n"
                };
                reply(out, noreply, msg);
            }
            _ => out.push(BAD_FORMAT),
        }
        Action::NewCmd
    }

    fn process_delta(&mut self, args: &[&[u8]], incr: bool, out: &mut Responses) -> Action {
        let (args, noreply) = split_noreply(args);
        let (key, delta) = match args {
            [key, delta] if key.len() <= KEY_MAX_LENGTH => (*key, *delta),
            _ => {
                out.push(BAD_FORMAT);
                return Action::NewCmd;
            }
        };
        let delta = match parse::<u64>(delta) {
            Some(delta) => delta,
            None => {
                out.push("CLIENT_ERROR invalid numeric delta argument\r\n");
                return Action::NewCmd;
            }
        };
        match self.store.delta(key, incr, delta) {
            DeltaOutcome::Value(v) => {
                if !noreply {
                    out.push(format!("{}\r\n", v));
                }
            }
            DeltaOutcome::NotFound => reply(out, noreply, "NOT_FOUND\r\n"),
            DeltaOutcome::NonNumeric => out.push(
                "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
            ),
        }
        Action::NewCmd
    }

    fn process_touch(&mut self, args: &[&[u8]], out: &mut Responses) -> Action {
        let (args, noreply) = split_noreply(args);
        match args {
            [key, exptime] if key.len() <= KEY_MAX_LENGTH => match parse::<i64>(exptime) {
                Some(exptime) => {
                    let msg = if self.store.touch(key, exptime) {
                        "TOUCHED\r\n"
                    } else {
                        "NOT_FOUND\r\n"
                    };
                    reply(out, noreply, msg);
                }
                None => out.push("CLIENT_ERROR invalid exptime argument\r\n"),
            },
            _ => out.push(BAD_FORMAT),
        }
        Action::NewCmd
    }

    fn process_flush_all(&mut self, args: &[&[u8]], out: &mut Responses) -> Action {
        let (args, noreply) = split_noreply(args);
        let delay = match args {
            [] => Some(0),
            [delay] => parse::<u64>(delay),
            _ => None,
        };
        match delay {
            Some(delay) => {
                self.store.flush_all(delay);
                reply(out, noreply, "OK\r\n");
            }
            None => out.push(BAD_FORMAT),
        }
        Action::NewCmd
    }
}

impl CommandHandler for AsciiHandler {
    fn try_read_command(&mut self, input: &[u8], out: &mut Responses) -> Parsed {
        let end = match input.iter().position(|&b| b == b'\n') {
            Some(end) => end,
            None if input.len() > MAX_LINE => {
                tracing::debug!("command line of {} bytes without terminator", input.len());
                out.push("CLIENT_ERROR line too long\r\n");
                return Parsed::Command {
                    consumed: input.len(),
                    action: Action::Write(ConnState::Closing),
                };
            }
            None => return Parsed::NeedMore,
        };
        let line = &input[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let tokens: Vec<&[u8]> = line
            .split(|&b| b == b' ')
            .filter(|t| !t.is_empty())
            .collect();
        let action = self.process_command(&tokens, out);
        Parsed::Command {
            consumed: end + 1,
            action,
        }
    }

    fn complete_nread(&mut self, mut data: Vec<u8>, out: &mut Responses) -> Action {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                tracing::warn!("data block without a pending storage command");
                out.push("SERVER_ERROR no pending storage command\r\n");
                return Action::NewCmd;
            }
        };
        if !data.ends_with(b"\r\n") {
            out.push("CLIENT_ERROR bad data chunk\r\n");
            return Action::NewCmd;
        }
        data.truncate(data.len() - 2);

        let outcome = self.store.store(
            pending.mode,
            &pending.key,
            pending.flags,
            pending.exptime,
            data,
        );
        let msg = match outcome {
            StoreOutcome::Stored => "STORED\r\n",
            StoreOutcome::NotStored => "NOT_STORED\r\n",
            StoreOutcome::Exists => "EXISTS\r\n",
            StoreOutcome::NotFound => "NOT_FOUND\r\n",
        };
        reply(out, pending.noreply, msg);
        Action::NewCmd
    }

    fn reset_cmd_handler(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> Box<dyn CommandHandler> {
        AsciiProtocol::new(Arc::new(Store::new()), &CacheConfig { item_size_max: 16 }).new_handler()
    }

    fn drain(out: &mut Responses) -> Vec<u8> {
        let bytes = out.chunk(usize::MAX).concat();
        out.clear();
        bytes
    }

    /// Runs one command line and, for storage commands, its data block.
    fn run(h: &mut dyn CommandHandler, line: &[u8], data: Option<&[u8]>) -> (Action, Vec<u8>) {
        let mut out = Responses::new();
        h.reset_cmd_handler();
        let action = match h.try_read_command(line, &mut out) {
            Parsed::Command { consumed, action } => {
                assert_eq!(consumed, line.len());
                action
            }
            Parsed::NeedMore => panic!("incomplete command {:?}", line),
        };
        let action = match (action, data) {
            (Action::Nread(n), Some(data)) => {
                assert_eq!(n, data.len());
                h.complete_nread(data.to_vec(), &mut out)
            }
            (action, _) => action,
        };
        (action, drain(&mut out))
    }

    #[test]
    fn set_then_get() {
        let mut h = handler();
        let (action, out) = run(&mut *h, b"set foo 5 0 3\r\n", Some(b"bar\r\n"));
        assert_eq!(action, Action::NewCmd);
        assert_eq!(out, b"STORED\r\n");
        let (_, out) = run(&mut *h, b"get foo missing\r\n", None);
        assert_eq!(out, b"VALUE foo 5 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn gets_reports_cas_for_cas_command() {
        let mut h = handler();
        run(&mut *h, b"set k 0 0 1\r\n", Some(b"a\r\n"));
        let (_, out) = run(&mut *h, b"gets k\r\n", None);
        let line = String::from_utf8(out).unwrap();
        let cas: u64 = line.lines().next().unwrap().rsplit(' ').next().unwrap().parse().unwrap();

        let cmd = format!("cas k 0 0 1 {}\r\n", cas + 100);
        let (_, out) = run(&mut *h, cmd.as_bytes(), Some(b"b\r\n"));
        assert_eq!(out, b"EXISTS\r\n");
        let cmd = format!("cas k 0 0 1 {}\r\n", cas);
        let (_, out) = run(&mut *h, cmd.as_bytes(), Some(b"b\r\n"));
        assert_eq!(out, b"STORED\r\n");
    }

    #[test]
    fn incomplete_line_needs_more() {
        let mut h = handler();
        let mut out = Responses::new();
        assert_eq!(h.try_read_command(b"get fo", &mut out), Parsed::NeedMore);
        assert!(out.is_empty());
    }

    #[test]
    fn overlong_line_closes() {
        let mut h = handler();
        let mut out = Responses::new();
        let line = vec![b'a'; MAX_LINE + 1];
        assert_eq!(
            h.try_read_command(&line, &mut out),
            Parsed::Command {
                consumed: MAX_LINE + 1,
                action: Action::Write(ConnState::Closing)
            }
        );
        assert_eq!(drain(&mut out), b"CLIENT_ERROR line too long\r\n");
    }

    #[test]
    fn oversized_value_is_swallowed() {
        let mut h = handler();
        let (action, out) = run(&mut *h, b"set big 0 0 17\r\n", None);
        assert_eq!(action, Action::Swallow(19));
        assert_eq!(out, b"SERVER_ERROR object too large for cache\r\n");
    }

    #[test]
    fn bad_data_chunk() {
        let mut h = handler();
        let (_, out) = run(&mut *h, b"set k 0 0 2\r\n", Some(b"abcd"));
        assert_eq!(out, b"CLIENT_ERROR bad data chunk\r\n");
        let (_, out) = run(&mut *h, b"get k\r\n", None);
        assert_eq!(out, b"END\r\n");
    }

    #[test]
    fn counters_and_deletes() {
        let mut h = handler();
        run(&mut *h, b"set n 0 0 2\r\n", Some(b"10\r\n"));
        assert_eq!(run(&mut *h, b"incr n 5\r\n", None).1, b"15\r\n");
        assert_eq!(run(&mut *h, b"decr n 20\r\n", None).1, b"0\r\n");
        assert_eq!(
            run(&mut *h, b"incr n x\r\n", None).1,
            b"CLIENT_ERROR invalid numeric delta argument\r\n"
        );
        assert_eq!(run(&mut *h, b"delete n noreply\r\n", None).1, b"");
        assert_eq!(run(&mut *h, b"delete n\r\n", None).1, b"NOT_FOUND\r\n");
        assert_eq!(run(&mut *h, b"touch n 10\r\n", None).1, b"NOT_FOUND\r\n");
    }

    #[test]
    fn add_replace_append() {
        let mut h = handler();
        assert_eq!(
            run(&mut *h, b"replace k 0 0 1\r\n", Some(b"a\r\n")).1,
            b"NOT_STORED\r\n"
        );
        assert_eq!(run(&mut *h, b"add k 0 0 1\r\n", Some(b"a\r\n")).1, b"STORED\r\n");
        assert_eq!(
            run(&mut *h, b"add k 0 0 1\r\n", Some(b"b\r\n")).1,
            b"NOT_STORED\r\n"
        );
        run(&mut *h, b"append k 0 0 1\r\n", Some(b"z\r\n"));
        run(&mut *h, b"prepend k 0 0 1\r\n", Some(b"y\r\n"));
        assert_eq!(
            run(&mut *h, b"get k\r\n", None).1,
            b"VALUE k 0 3\r\nyaz\r\nEND\r\n"
        );
    }

    #[test]
    fn session_commands() {
        let mut h = handler();
        assert_eq!(run(&mut *h, b"quit\r\n", None).0, Action::Close);
        let (action, out) = run(&mut *h, b"watch\r\n", None);
        assert_eq!(action, Action::Write(ConnState::Watch));
        assert_eq!(out, b"OK\r\n");
        assert_eq!(run(&mut *h, b"bogus\r\n", None).1, b"ERROR\r\n");
        assert_eq!(run(&mut *h, b"\r\n", None).1, b"ERROR\r\n");
        assert!(run(&mut *h, b"version\r\n", None).1.starts_with(b"VERSION "));
        assert_eq!(run(&mut *h, b"flush_all\r\n", None).1, b"OK\r\n");
        assert_eq!(run(&mut *h, b"verbosity 1\r\n", None).1, b"OK\r\n");
    }

    #[test]
    fn huge_numeric_arguments_are_answered() {
        let store = Arc::new(Store::new());
        let proto = AsciiProtocol::new(Arc::clone(&store), &CacheConfig { item_size_max: 16 });
        let mut h = proto.new_handler();

        let (action, out) = run(&mut *h, b"set k 0 0 18446744073709551615\r\n", None);
        assert_eq!(action, Action::NewCmd);
        assert_eq!(out, BAD_FORMAT.as_bytes());

        let (action, out) = run(&mut *h, b"set k 0 9223372036854775807 1\r\n", Some(b"a\r\n"));
        assert_eq!(action, Action::NewCmd);
        assert_eq!(out, b"STORED\r\n");
        assert_eq!(run(&mut *h, b"touch k 9223372036854775807\r\n", None).1, b"TOUCHED\r\n");
        assert_eq!(run(&mut *h, b"flush_all 18446744073709551615\r\n", None).1, b"OK\r\n");
        assert_eq!(run(&mut *h, b"get k\r\n", None).1, b"VALUE k 0 1\r\na\r\nEND\r\n");
        assert_eq!(proto.store().len(), 1);
    }
}
