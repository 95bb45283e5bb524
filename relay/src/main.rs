//! Process entry point: loads configuration, installs the logger,
//! wires the backend pool, router, connection pool, reactor and
//! acceptor together, and drives graceful shutdown on SIGINT/SIGTERM.
//!
//! Grounded on the reference binary's own startup sequence (config
//! first, logger second, everything else after, signal-driven
//! shutdown last) reworked around this project's own two-thread
//! model instead of `mio`'s single event loop.

#[macro_use]
extern crate log;

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, SigHandler, Signal};

use relay_command::config::Config;
use relay_lib::{Acceptor, BackendPool, ConnectionPool, Endpoint, Reactor, Router, RoutingAlgorithm};

const DEFAULT_CONFIG_PATH: &str = "config/config.json";

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), nix::Error> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))?;
    }
    Ok(())
}

fn main() {
    let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: could not load config from {:?}: {}", config_path, e);
            process::exit(2);
        }
    };

    if let Err(e) = relay_command::init_logging(&config.logging) {
        eprintln!("fatal: could not install logger: {}", e);
        process::exit(2);
    }

    if config.reactor.threads != 0 {
        warn!(
            "config.reactor.threads = {} is accepted for schema compatibility but ignored; \
             this reactor is single-threaded",
            config.reactor.threads
        );
    }

    if let Err(e) = install_signal_handlers() {
        error!("fatal: could not install signal handlers: {}", e);
        process::exit(2);
    }

    let endpoints: Vec<Endpoint> = config
        .backends
        .iter()
        .map(|b| Endpoint::new(b.host.clone(), b.port))
        .collect();
    let pool = BackendPool::new(endpoints);
    let router = match Router::new(pool, RoutingAlgorithm::RoundRobin) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("fatal: {}", e);
            process::exit(2);
        }
    };

    // Held for its planned lifetime even though no component currently
    // calls into it directly; the upstream connection pool exists
    // independently of the reactor's per-connection dial path (see
    // the connection pool module) and is wired here so startup order
    // matches the design's dependency chain.
    let _connection_pool = ConnectionPool::new(&config.connection_pool);

    let idle_timeout = Duration::from_secs(30);
    let (reactor_join, reactor_handle) = match Reactor::spawn(idle_timeout) {
        Ok(r) => r,
        Err(e) => {
            error!("fatal: could not start reactor: {}", e);
            process::exit(2);
        }
    };

    let acceptor = match Acceptor::bind(&config.listen, router, reactor_handle.clone()) {
        Ok(a) => a,
        Err(e) => {
            error!("fatal: could not bind {}:{}: {}", config.listen.host, config.listen.port, e);
            reactor_handle.stop();
            let _ = reactor_join.join();
            process::exit(2);
        }
    };

    let accept_join = match acceptor.start() {
        Ok(j) => j,
        Err(e) => {
            error!("fatal: could not start acceptor: {}", e);
            reactor_handle.stop();
            let _ = reactor_join.join();
            process::exit(2);
        }
    };

    info!(
        "relay listening on {}:{}, {} backend(s) configured",
        config.listen.host,
        config.listen.port,
        config.backends.len()
    );

    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutdown requested, draining");
    let shutdown_deadline = Instant::now() + Duration::from_secs(config.shutdown.drain_seconds);

    acceptor.stop();
    reactor_handle.stop();

    if accept_join.join().is_err() {
        error!("acceptor thread panicked during shutdown");
    }
    if reactor_join.join().is_err() {
        error!("reactor thread panicked during shutdown");
    }

    if Instant::now() > shutdown_deadline {
        warn!("shutdown exceeded drain_seconds={}", config.shutdown.drain_seconds);
    }

    info!("relay stopped cleanly");
    process::exit(0);
}
