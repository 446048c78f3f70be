//! RDMA transport for a memcached-style key-value server.
//!
//! A [`Dispatcher`] listens for connect requests and serves every accepted connection on a
//! dedicated worker thread. The worker provisions the connection's verbs resources, completes
//! the handshake and drives the connection state machine over the [`Transport`] the
//! connection provides, until the peer goes away.
pub mod client;
pub mod cm;
pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod proto;
pub mod resources;
pub mod stats;
pub mod store;
pub mod transport;
pub mod worker;

pub use client::RdmaClient;
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use transport::{RdmaConn, Transport};
pub use worker::ServerContext;
