//! Routing policy wrapper around a `BackendPool`.
//!
//! Only round-robin is implemented. The reference library carries a
//! richer `LoadBalancingAlgorithms` enum (round robin, random, least
//! connections, power of two choices); this project keeps the enum's
//! shape for schema parity but rejects anything but round-robin at
//! construction time, matching the reference's own "fails fast at
//! startup rather than at request time" posture for unsupported
//! configuration.

use std::error::Error;
use std::fmt;

use crate::backend::{BackendPool, Endpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingAlgorithm {
    RoundRobin,
    LeastConnections,
    Random,
}

#[derive(Debug)]
pub enum RouterError {
    Unsupported(RoutingAlgorithm),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouterError::Unsupported(algo) => {
                write!(f, "routing algorithm {:?} is not implemented", algo)
            }
        }
    }
}

impl Error for RouterError {}

/// Selects a backend for each new connection. Holds the pool and the
/// chosen algorithm; the algorithm is fixed for the router's lifetime.
pub struct Router {
    pool: BackendPool,
}

impl Router {
    pub fn new(pool: BackendPool, algorithm: RoutingAlgorithm) -> Result<Router, RouterError> {
        match algorithm {
            RoutingAlgorithm::RoundRobin => Ok(Router { pool }),
            other => Err(RouterError::Unsupported(other)),
        }
    }

    pub fn next_backend(&self) -> &Endpoint {
        self.pool.next_backend()
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Endpoint;

    fn pool() -> BackendPool {
        BackendPool::new(vec![
            Endpoint::new("127.0.0.1", 9000),
            Endpoint::new("127.0.0.1", 9001),
        ])
    }

    #[test]
    fn round_robin_constructs_and_dispatches() {
        let router = Router::new(pool(), RoutingAlgorithm::RoundRobin).expect("round robin");
        assert_eq!(router.next_backend().port, 9000);
        assert_eq!(router.next_backend().port, 9001);
    }

    #[test]
    fn unsupported_algorithms_fail_at_construction() {
        let err = Router::new(pool(), RoutingAlgorithm::LeastConnections).unwrap_err();
        match err {
            RouterError::Unsupported(RoutingAlgorithm::LeastConnections) => {}
            other => panic!("unexpected error: {:?}", other),
        }

        let err = Router::new(pool(), RoutingAlgorithm::Random).unwrap_err();
        match err {
            RouterError::Unsupported(RoutingAlgorithm::Random) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
