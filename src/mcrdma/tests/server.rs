mod common;

use crossbeam::thread;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use std::sync::{Arc, Mutex};

use mcrdma::conn::{Conn, ConnState};
use mcrdma::dispatcher::Dispatcher;
use mcrdma::worker::WatchSink;
use mcrdma::{Error, RdmaClient, RdmaConn};
use rdma::sim::{Fault, SimFabric};

use common::{config, context, wait_until, Server};

const SEED: u64 = 999;

#[test]
fn set_get_with_interleaved_probes() {
    let fabric = SimFabric::new();
    let server = Server::start(&fabric, config(1024));
    let conf = config(1024).transport;
    let mut client = RdmaClient::connect(&fabric, &server.addr, &conf).unwrap();

    assert_eq!(client.request(b"PING\r\n").unwrap(), b"PONG\r\n");
    assert_eq!(
        client.request(b"set foo 0 0 3\r\nbar\r\n").unwrap(),
        b"STORED\r\n"
    );
    assert_eq!(client.request(b"PING\r\n").unwrap(), b"PONG\r\n");
    assert_eq!(
        client.request(b"get foo\r\n").unwrap(),
        b"VALUE foo 0 3\r\nbar\r\nEND\r\n"
    );
    client.disconnect().unwrap();

    let stats = server.ctx.stats();
    wait_until("the worker to finish", || stats.snapshot().curr_conns == 0);
    assert_eq!(stats.snapshot().total_conns, 1);
}

#[test]
fn values_larger_than_one_buffer() {
    let fabric = SimFabric::new();
    let server = Server::start(&fabric, config(128));
    let conf = config(128).transport;
    let mut client = RdmaClient::connect(&fabric, &server.addr, &conf).unwrap();

    let mut rng = StdRng::seed_from_u64(SEED);
    let value: Vec<u8> = (0..300).map(|_| rng.gen_range(b'a'..=b'z')).collect();

    client.send(b"set big 0 0 300\r\n").unwrap();
    for chunk in value.chunks(128) {
        client.send(chunk).unwrap();
    }
    assert_eq!(client.request(b"\r\n").unwrap(), b"STORED\r\n");

    let mut expected = b"VALUE big 0 300\r\n".to_vec();
    expected.extend_from_slice(&value);
    expected.extend_from_slice(b"\r\nEND\r\n");
    assert_eq!(client.request(b"get big\r\n").unwrap(), expected);
}

#[test]
fn oversized_message_is_not_sent() {
    let fabric = SimFabric::new();
    let server = Server::start(&fabric, config(128));
    let conf = config(128).transport;
    let mut client = RdmaClient::connect(&fabric, &server.addr, &conf).unwrap();

    assert_eq!(client.max_message(), 128);
    match client.send(&[b'x'; 129]) {
        Err(Error::BufferTooSmall { len, capacity }) => {
            assert_eq!(len, 129);
            assert_eq!(capacity, 128);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    // nothing reached the server, the connection is still usable
    assert_eq!(client.request(b"get nothing\r\n").unwrap(), b"END\r\n");
}

#[test]
fn quit_ends_the_connection() {
    let fabric = SimFabric::new();
    let server = Server::start(&fabric, config(256));
    let conf = config(256).transport;
    let mut client = RdmaClient::connect(&fabric, &server.addr, &conf).unwrap();

    client.send(b"quit\r\n").unwrap();
    let mut buf = [0u8; 256];
    assert_eq!(client.recv(&mut buf).unwrap(), 0);
    let stats = server.ctx.stats();
    wait_until("the worker to finish", || stats.snapshot().curr_conns == 0);
}

#[test]
fn concurrent_connections() {
    const CLIENTS: usize = 8;
    const ROUNDS: usize = 20;

    let fabric = SimFabric::new();
    let server = Server::start(&fabric, config(512));
    let conf = config(512).transport;

    thread::scope(|s| {
        for c in 0..CLIENTS {
            let fabric = &fabric;
            let conf = &conf;
            let addr = server.addr;
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(SEED + c as u64);
                let mut client = RdmaClient::connect(fabric, &addr, conf).unwrap();
                for r in 0..ROUNDS {
                    let len = rng.gen_range(1..64);
                    let value: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
                    let key = format!("key-{}-{}", c, r);

                    let mut set = format!("set {} {} 0 {}\r\n", key, c, len).into_bytes();
                    set.extend_from_slice(&value);
                    set.extend_from_slice(b"\r\n");
                    assert_eq!(client.request(&set).unwrap(), b"STORED\r\n");

                    let mut expected = format!("VALUE {} {} {}\r\n", key, c, len).into_bytes();
                    expected.extend_from_slice(&value);
                    expected.extend_from_slice(b"\r\nEND\r\n");
                    let get = format!("get {}\r\n", key);
                    assert_eq!(client.request(get.as_bytes()).unwrap(), expected);
                }
                client.disconnect().unwrap();
            });
        }
    })
    .unwrap();

    let stats = server.ctx.stats();
    wait_until("all workers to finish", || stats.snapshot().curr_conns == 0);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_conns, CLIENTS as u64);
    assert_eq!(snapshot.conn_structs, 0);
    assert_eq!(snapshot.accept_failures, 0);

    let mut dispatcher = server.stop();
    wait_until("threads to exit", || dispatcher.active_workers() == 0);
    dispatcher.destroy();
}

#[test]
fn init_errors() {
    let fabric = SimFabric::new();
    let ctx = Arc::new(context(&fabric, config(256)));

    let mut dispatcher = Dispatcher::new(Arc::clone(&ctx));
    assert!(matches!(dispatcher.poll_once(), Err(Error::NotInitialized)));
    assert!(dispatcher.local_addr().is_none());
    match dispatcher.init(Some("not-an-address"), 0) {
        Err(Error::InvalidInterface(s)) => assert_eq!(s, "not-an-address"),
        other => panic!("unexpected result: {:?}", other),
    }

    dispatcher.init(None, 0).unwrap();
    let addr = dispatcher.local_addr().unwrap();
    assert!(matches!(
        dispatcher.init(None, 0),
        Err(Error::AlreadyInitialized)
    ));
    assert_eq!(dispatcher.poll_once().unwrap(), 0);

    let mut second = Dispatcher::new(ctx);
    assert!(matches!(
        second.init(None, addr.port()),
        Err(Error::ListenFailed(_))
    ));
    dispatcher.destroy();
}

/// Keeps the connections handed over for log watching.
#[derive(Default)]
struct Watchers(Mutex<Vec<Conn<RdmaConn<SimFabric>>>>);

impl WatchSink<RdmaConn<SimFabric>> for Watchers {
    fn watch(&self, conn: Conn<RdmaConn<SimFabric>>) {
        self.0.lock().unwrap().push(conn);
    }
}

#[test]
fn watch_hands_the_connection_to_the_sink() {
    let fabric = SimFabric::new();
    let watchers = Arc::new(Watchers::default());
    let sink: Arc<dyn WatchSink<RdmaConn<SimFabric>>> = watchers.clone();
    let ctx = context(&fabric, config(256)).with_watch_sink(sink);
    let server = Server::with_context(Arc::new(ctx));
    let conf = config(256).transport;
    let mut client = RdmaClient::connect(&fabric, &server.addr, &conf).unwrap();

    assert_eq!(client.request(b"watch\r\n").unwrap(), b"OK\r\n");
    wait_until("the handover", || watchers.0.lock().unwrap().len() == 1);
    {
        let conns = watchers.0.lock().unwrap();
        assert_eq!(conns[0].state(), ConnState::Watch);
        assert!(conns[0].transport().is_prepared());
    }
    // the sink owns the connection now
    let stats = server.ctx.stats();
    assert_eq!(stats.snapshot().curr_conns, 1);

    watchers.0.lock().unwrap().clear();
    let mut buf = [0u8; 256];
    assert_eq!(client.recv(&mut buf).unwrap(), 0);
    assert_eq!(stats.snapshot().curr_conns, 0);
}

#[test]
fn failed_connect_request_is_rejected() {
    let fabric = SimFabric::new();
    let server = Server::start(&fabric, config(256));
    let conf = config(256).transport;

    fabric.inject(Fault::ConnectRequest);
    match RdmaClient::connect(&fabric, &server.addr, &conf) {
        Err(Error::RemoteRejected { .. }) => {}
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("connected on a failed request"),
    }
    let stats = server.ctx.stats();
    wait_until("the rejection", || stats.snapshot().rejected_conns == 1);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_conns, 0);
    assert_eq!(snapshot.conn_structs, 0);

    let mut client = RdmaClient::connect(&fabric, &server.addr, &conf).unwrap();
    assert_eq!(client.request(b"get k\r\n").unwrap(), b"END\r\n");
    client.disconnect().unwrap();
}
