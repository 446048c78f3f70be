//! Connection-manager and verbs abstractions for RDMA transports.
//!
//! The [`provider`] traits describe the objects a reliable-connected transport needs. Two
//! providers implement them: [`sim::SimFabric`], an in-process software fabric, and (with the
//! `verbs` feature) [`verbs::Verbs`] over librdmacm and libibverbs.
pub mod provider;
pub mod sim;
pub mod types;

#[cfg(feature = "verbs")]
pub mod ffi;
#[cfg(feature = "verbs")]
pub mod ibv;
#[cfg(feature = "verbs")]
pub(crate) mod net;
#[cfg(feature = "verbs")]
pub mod rdmacm;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use provider::Provider;
