//! Stratus — cache core of an HTTP reverse-proxy cache.
//!
//! Brings up the worker pools, expiry engine, ban lurker and acceptor,
//! then serves the management command surface on stdin.

use clap::Parser;
use std::io::{BufRead, Write};
use std::sync::Arc;
use stratus::cli;
use stratus::config::Params;
use stratus::server::Server;
use stratus::storage::MemStevedore;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "stratus", version, about = "Stratus: HTTP cache core")]
struct Args {
    /// Listen endpoints, [name=]addr:port (repeatable)
    #[arg(short = 'a', long = "listen", default_value = "default=127.0.0.1:6081")]
    listen: Vec<String>,

    /// Worker thread pools
    #[arg(short = 'p', long, default_value = "2")]
    pools: usize,

    /// Minimum worker threads per pool
    #[arg(long, default_value = "10")]
    thread_min: u32,

    /// Maximum worker threads per pool
    #[arg(long, default_value = "500")]
    thread_max: u32,

    /// Default object TTL in seconds
    #[arg(long, default_value = "120")]
    default_ttl: f64,

    /// Default grace window in seconds
    #[arg(long, default_value = "10")]
    default_grace: f64,

    /// Open the listeners but refuse traffic until told otherwise
    #[arg(long)]
    no_accept: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stratus=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut params = Params::default();
    params.wthread_pools = args.pools;
    params.wthread_min = args.thread_min;
    params.wthread_max = args.thread_max;
    params.default_ttl = args.default_ttl;
    params.default_grace = args.default_grace;
    params.accept_traffic = !args.no_accept;
    let params = params.shared();

    info!("stratus v{VERSION}");

    let server = Server::new(params, Arc::new(MemStevedore::new()));
    for spec in &args.listen {
        if let Err(e) = server.add_listen(spec) {
            error!("bad listen endpoint: {e}");
            return;
        }
    }

    if let Err(e) = server.start() {
        error!("startup failed: {e}");
        return;
    }
    for (name, addr) in server.acceptor.listen_addresses().unwrap_or_default() {
        info!("accepting on {name} ({addr})");
    }

    // management surface: one command per line on stdin
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        match cli::dispatch(&server, line) {
            Ok(out) => {
                let _ = stdout.write_all(out.as_bytes());
                let _ = stdout.write_all(b"200 OK\n");
            }
            Err(e) => {
                let _ = writeln!(stdout, "err: {e}");
            }
        }
        let _ = stdout.flush();
    }

    if server.is_running() {
        if let Err(e) = server.stop() {
            error!("shutdown: {e}");
        }
    }
    info!("bye");
}
