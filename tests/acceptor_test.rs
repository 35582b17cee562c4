//! Acceptor behavior over real loopback sockets: accepting, handing
//! sessions to the pools, and orderly shutdown.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use stratus::cli;
use stratus::{MemStevedore, Params, Server};

fn test_server() -> Arc<Server> {
    let mut p = Params::default();
    p.wthread_pools = 1;
    p.wthread_min = 3;
    p.wthread_max = 8;
    // short accept timeout so shutdown is quick
    p.timeout_idle = 0.3;
    p.ban_lurker_sleep = 0.0;
    let server = Server::new(p.shared(), Arc::new(MemStevedore::new()));
    server.add_listen("t1=127.0.0.1:0").unwrap();
    server
}

fn listen_addr(server: &Server) -> String {
    let addrs = server.acceptor.listen_addresses().unwrap();
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0].0, "t1");
    addrs[0].1.clone()
}

#[test]
fn test_accepts_connections() {
    let server = test_server();
    server.start().unwrap();
    let addr = listen_addr(&server);

    for _ in 0..5 {
        let mut conn = TcpStream::connect(&addr).expect("listener accepts");
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        // the sink transport closes the session straight away
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
    }

    server.stop().unwrap();
}

#[test]
fn test_shutdown_closes_all_listeners() {
    let server = test_server();
    server.start().unwrap();
    let addr = listen_addr(&server);
    assert!(TcpStream::connect(&addr).is_ok());

    // all listener sockets are closed before stop() returns
    server.stop().unwrap();
    assert!(TcpStream::connect(&addr).is_err());
}

#[test]
fn test_listen_address_via_cli() {
    let server = test_server();
    server.start().unwrap();
    let out = cli::dispatch(&server, "listen.address").unwrap();
    let line = out.lines().next().expect("one endpoint");
    let mut parts = line.split_whitespace();
    assert_eq!(parts.next(), Some("t1"));
    assert_eq!(parts.next(), Some("127.0.0.1"));
    let port: u16 = parts.next().unwrap().parse().unwrap();
    assert_ne!(port, 0);
    server.stop().unwrap();
}

#[test]
fn test_connections_survive_thread_pressure() {
    // with a tiny pool the acceptor falls back to serving sessions on
    // the accepting worker; connections must still be handled
    let mut p = Params::default();
    p.wthread_pools = 1;
    p.wthread_min = 2;
    p.wthread_max = 2;
    p.timeout_idle = 0.3;
    p.ban_lurker_sleep = 0.0;
    let server = Server::new(p.shared(), Arc::new(MemStevedore::new()));
    server.add_listen("t=127.0.0.1:0").unwrap();
    server.start().unwrap();
    let addr = server.acceptor.listen_addresses().unwrap()[0].1.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let addr = addr.clone();
        handles.push(std::thread::spawn(move || {
            let mut conn = TcpStream::connect(&addr)?;
            conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut buf = [0u8; 1];
            let _ = conn.read(&mut buf);
            Ok::<(), std::io::Error>(())
        }));
    }
    for h in handles {
        h.join().unwrap().expect("session served under pressure");
    }

    server.stop().unwrap();
}

#[test]
fn test_uptime_ticks() {
    let server = test_server();
    server.start().unwrap();
    std::thread::sleep(Duration::from_millis(2500));
    assert!(server.stats.uptime.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    server.stop().unwrap();
}
