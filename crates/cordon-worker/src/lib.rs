//! Isolated session workers.
//!
//! One worker is one OS process hosting one session service instance. The
//! host side ([`WorkerProcess`]) owns the child and a framed JSON channel to
//! it; the guest side ([`guest::serve`]) dispatches incoming commands to a
//! [`guest::SessionService`] through an explicit registry. Every teardown
//! path (graceful stop, RPC timeout, broken channel) converges on the same
//! dead state so owners never double-free or hang.

mod error;
mod host;
mod proxy;

pub mod guest;

pub use error::{RemoteInvocationError, WorkerError};
pub use host::{
    locate_workerd, ProcessWorkerFactory, Worker, WorkerFactory, WorkerOptions, WorkerProcess,
    ENV_WORKERD_BIN, WORKERD_BIN_NAME,
};
pub use proxy::{InvokeHooks, ServiceProxy};
