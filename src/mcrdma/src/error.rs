use std::io;

use rdma::types::{CmEventType, WcStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport already initialized")]
    AlreadyInitialized,
    #[error("Transport not initialized")]
    NotInitialized,
    #[error("Invalid interface address: {0}")]
    InvalidInterface(String),
    #[error("Fail to create event channel: {0}")]
    EventChannel(#[source] io::Error),
    #[error("Fail to create cm id: {0}")]
    CreateId(#[source] io::Error),
    #[error("rdma_bind_addr: {0}")]
    BindFailed(#[source] io::Error),
    #[error("rdma_listen: {0}")]
    ListenFailed(#[source] io::Error),
    #[error("rdma_accept: {0}")]
    AcceptFailed(#[source] io::Error),
    #[error("rdma_connect: {0}")]
    ConnectFailed(#[source] io::Error),
    #[error("Fail to {step}: {source}")]
    Resource {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("rdma_migrate_id: {0}")]
    Migrate(#[source] io::Error),
    #[error("Remote rejected with status {status}")]
    RemoteRejected { status: i32 },
    #[error("Expected {expected}, received {received}")]
    UnexpectedEvent {
        received: CmEventType,
        expected: CmEventType,
    },
    #[error("Timed out waiting for a cm event")]
    CmEventTimeout,
    #[error("Cm event channel: {0}")]
    CmEvent(#[source] io::Error),
    #[error("Work completion {index} failed: {status}")]
    CompletionFailed { status: WcStatus, index: usize },
    #[error("ibv_poll_cq: {0}")]
    PollFailed(#[source] io::Error),
    #[error("Peer disconnected")]
    PeerDisconnected,
    #[error("Fail to post work request: {0}")]
    PostFailed(#[source] io::Error),
    #[error("Message of {len} bytes exceeds the buffer capacity {capacity}")]
    BufferTooSmall { len: usize, capacity: usize },
    #[error("RDMA resources are not prepared")]
    NotPrepared,
    #[error("Fail to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
