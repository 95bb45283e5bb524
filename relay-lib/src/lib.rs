//! Event-driven core of a TCP Layer-4 load balancer.
//!
//! This crate owns the pieces that move bytes: a pluggable readiness
//! notifier (`notifier`), a round-robin backend pool and router
//! (`backend`, `router`), an upstream connection pool (`pool`), the
//! per-connection splice state machine (`proxy_conn`), the reactor
//! that dispatches readiness to connections (`reactor`), and the
//! accept loop that feeds it (`acceptor`).
//!
//! Configuration loading, logging and process wiring live one layer
//! up, in `relay-command` and the `relay` binary.

#[macro_use]
extern crate log;
extern crate libc;
extern crate relay_command;

#[cfg(test)]
extern crate quickcheck;

pub mod acceptor;
pub mod backend;
pub mod notifier;
pub mod pool;
pub mod proxy_conn;
pub mod reactor;
pub mod router;

pub use acceptor::Acceptor;
pub use backend::{BackendPool, Endpoint};
pub use pool::{ConnectionPool, PoolError};
pub use proxy_conn::{ConnState, ProxyConn};
pub use reactor::{Reactor, ReactorHandle};
pub use router::{Router, RouterError, RoutingAlgorithm};
