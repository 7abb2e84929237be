//! TCP discard server (RFC 863 flavor).
//!
//! Reads and throws away everything a client sends, keeping running
//! totals. Good as a sink for load generators.
//!
//! Run: muxr-discard [--port 7001] [--threads 1]
//! Env: MUXR_PORT, MUXR_THREADS (flags override)

use muxr::{minfo, Buffer, ConnectionObserver, EventLoop, TcpConnectionRef, TcpServer, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Discard {
    total_bytes: AtomicU64,
    total_messages: AtomicU64,
}

impl ConnectionObserver for Discard {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        if conn.is_connected() {
            minfo!("{}: {} connected", conn.name(), conn.peer_addr());
        } else {
            minfo!(
                "{}: {} gone, lifetime totals {} bytes in {} reads",
                conn.name(),
                conn.peer_addr(),
                self.total_bytes.load(Ordering::Relaxed),
                self.total_messages.load(Ordering::Relaxed)
            );
        }
    }

    fn on_message(&self, _conn: &TcpConnectionRef, buf: &mut Buffer, _ts: Timestamp) {
        let n = buf.readable_bytes() as u64;
        buf.retrieve_all();
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() {
    let mut port: u16 = 7001;
    let mut threads: usize = 1;

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
                eprintln!("usage: muxr-discard [--port PORT] [--threads N]");
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let base = EventLoop::new();
    let server = TcpServer::new(
        base.clone(),
        format!("0.0.0.0:{}", port).parse().unwrap(),
        "discard".to_string(),
        false,
        Arc::new(Discard {
            total_bytes: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
        }),
    );
    server.set_thread_num(threads);
    server.start();
    minfo!("discard server listening on port {} with {} threads", port, threads);
    base.run();
}
