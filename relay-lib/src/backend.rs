//! Backend endpoints and the round-robin pool that picks among them.
//!
//! Grounded on the teacher's `Backend` struct (`lib/src/lib.rs`:
//! address, status, `active_connections`) minus everything that
//! belongs to load-balancing parameters and circuit breaking this
//! project does not implement; the round-robin cursor itself is new,
//! built the way the teacher picks a next backend from a `Vec` under
//! an index.

use std::fmt;

/// An upstream TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint { host: host.into(), port }
    }

    /// The connection-pool key for this endpoint: `"host:port"`.
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An ordered, immutable set of backends with an atomic round-robin
/// cursor. Selection is O(1) and lock-free.
pub struct BackendPool {
    endpoints: Vec<Endpoint>,
    cursor: std::sync::atomic::AtomicUsize,
}

impl BackendPool {
    pub fn new(endpoints: Vec<Endpoint>) -> BackendPool {
        BackendPool {
            endpoints,
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the next backend in cyclic order. Panics if the pool is
    /// empty; construction-time validation (see `relay-command`'s
    /// config validation) guarantees at least one backend exists.
    pub fn next_backend(&self) -> &Endpoint {
        use std::sync::atomic::Ordering;
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[i % self.endpoints.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> BackendPool {
        let endpoints = (0..n)
            .map(|i| Endpoint::new("127.0.0.1", 9000 + i as u16))
            .collect();
        BackendPool::new(endpoints)
    }

    #[test]
    fn cycles_in_strict_round_robin_order() {
        let pool = pool(3);
        let picks: Vec<u16> = (0..9).map(|_| pool.next_backend().port).collect();
        assert_eq!(picks, vec![9000, 9001, 9002, 9000, 9001, 9002, 9000, 9001, 9002]);
    }

    #[test]
    fn distributes_evenly_for_non_multiple_counts() {
        let pool = pool(3);
        let mut counts = [0usize; 3];
        for _ in 0..10 {
            let picked = pool.next_backend();
            let idx = (picked.port - 9000) as usize;
            counts[idx] += 1;
        }
        for c in counts.iter() {
            assert!(*c == 3 || *c == 4);
        }
    }

    #[test]
    fn pool_key_matches_host_colon_port() {
        let e = Endpoint::new("example.internal", 8080);
        assert_eq!(e.pool_key(), "example.internal:8080");
    }

    quickcheck::quickcheck! {
        // For any K endpoints and N picks, every endpoint is chosen
        // either floor(N/K) or ceil(N/K) times, in strict cyclic order.
        fn round_robin_distributes_within_one(k: u8, n: u16) -> bool {
            let k = (k % 8) as usize + 1;
            let n = n as usize;
            let pool = pool(k);

            let mut counts = vec![0usize; k];
            for i in 0..n {
                let picked = pool.next_backend();
                let idx = (picked.port - 9000) as usize;
                assert_eq!(idx, i % k);
                counts[idx] += 1;
            }

            let lo = n / k;
            let hi = (n + k - 1) / k;
            counts.iter().all(|&c| c == lo || c == hi)
        }
    }
}
