//! TCP echo server.
//!
//! Every byte received on a connection is written straight back. Uses
//! the base loop for accepting and a configurable pool of I/O loops
//! for connections.
//!
//! Run: muxr-echo [--port 7000] [--threads 4]
//! Env: MUXR_PORT, MUXR_THREADS (flags override)

use muxr::{minfo, Buffer, ConnectionObserver, EventLoop, TcpConnectionRef, TcpServer, Timestamp};
use std::sync::Arc;

struct Echo;

impl ConnectionObserver for Echo {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        minfo!(
            "{} {} -> {} is {}",
            conn.name(),
            conn.peer_addr(),
            conn.local_addr(),
            if conn.is_connected() { "up" } else { "down" }
        );
    }

    fn on_message(&self, conn: &TcpConnectionRef, buf: &mut Buffer, _ts: Timestamp) {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    }
}

fn main() {
    let mut port: u16 = 7000;
    let mut threads: usize = 4;

    if let Ok(v) = std::env::var("MUXR_PORT") {
        if let Ok(p) = v.parse::<u16>() {
            port = p;
        }
    }
    if let Ok(v) = std::env::var("MUXR_THREADS") {
        if let Ok(t) = v.parse::<usize>() {
            threads = t;
        }
    }

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if let Some(p) = args.get(i).and_then(|s| s.parse().ok()) {
                    port = p;
                }
            }
            "--threads" | "-t" => {
                i += 1;
                if let Some(t) = args.get(i).and_then(|s| s.parse().ok()) {
                    threads = t;
                }
            }
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: muxr-echo [--port PORT] [--threads N]");
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let base = EventLoop::new();
    let server = TcpServer::new(
        base.clone(),
        format!("0.0.0.0:{}", port).parse().unwrap(),
        "echo".to_string(),
        false,
        Arc::new(Echo),
    );
    server.set_thread_num(threads);
    server.start();
    minfo!("echo server listening on port {} with {} threads", port, threads);
    base.run();
}
