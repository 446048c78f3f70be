#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mcrdma::config::Config;
use mcrdma::proto::ascii::AsciiProtocol;
use mcrdma::store::Store;
use mcrdma::{Dispatcher, ServerContext};
use rdma::sim::SimFabric;

pub fn config(buffer_size: usize) -> Config {
    let mut config = Config::default();
    config.transport.buffer_size = buffer_size;
    config.transport.dispatcher_poll_timeout_ms = 10;
    config
}

pub fn context(fabric: &SimFabric, config: Config) -> ServerContext<SimFabric> {
    let protocol = Arc::new(AsciiProtocol::new(Arc::new(Store::new()), &config.cache));
    ServerContext::new(Arc::new(fabric.clone()), config, protocol)
}

/// A dispatcher polled on a background thread.
pub struct Server {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext<SimFabric>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Dispatcher<SimFabric>>>,
}

impl Server {
    pub fn start(fabric: &SimFabric, config: Config) -> Self {
        Self::with_context(Arc::new(context(fabric, config)))
    }

    pub fn with_context(ctx: Arc<ServerContext<SimFabric>>) -> Self {
        let mut dispatcher = Dispatcher::new(Arc::clone(&ctx));
        dispatcher.init(Some("127.0.0.1"), 0).unwrap();
        let addr = dispatcher.local_addr().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let stop = Arc::clone(&stop);
            move || {
                while !stop.load(Ordering::Acquire) {
                    dispatcher.poll_once().unwrap();
                }
                dispatcher
            }
        });
        Server {
            addr,
            ctx,
            stop,
            handle: Some(handle),
        }
    }

    /// Stops polling and returns the dispatcher.
    pub fn stop(mut self) -> Dispatcher<SimFabric> {
        self.stop.store(true, Ordering::Release);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Waits up to five seconds for `cond`.
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}
