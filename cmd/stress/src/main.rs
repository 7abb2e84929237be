//! Ping-pong stress test.
//!
//! Starts an in-process echo server on an ephemeral port, then hammers
//! it from plain blocking client threads: each client writes a message
//! and waits for the full echo, in a loop, for the test duration.
//! Reports aggregate round trips and throughput at the end.
//!
//! Run: muxr-stress [--clients 8] [--threads 4] [--size 4096] [--seconds 10]

use muxr::{Buffer, ConnectionObserver, EventLoop, TcpConnectionRef, TcpServer, Timestamp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Echo;

impl ConnectionObserver for Echo {
    fn on_message(&self, conn: &TcpConnectionRef, buf: &mut Buffer, _ts: Timestamp) {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    }
}

struct Cfg {
    clients: usize,
    threads: usize,
    size: usize,
    seconds: u64,
}

fn parse_args() -> Cfg {
    let mut cfg = Cfg {
        clients: 8,
        threads: 4,
        size: 4096,
        seconds: 10,
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--clients" | "-c" => {
                i += 1;
                if let Some(v) = args.get(i).and_then(|s| s.parse().ok()) {
                    cfg.clients = v;
                }
            }
            "--threads" | "-t" => {
                i += 1;
                if let Some(v) = args.get(i).and_then(|s| s.parse().ok()) {
                    cfg.threads = v;
                }
            }
            "--size" | "-s" => {
                i += 1;
                if let Some(v) = args.get(i).and_then(|s| s.parse().ok()) {
                    cfg.size = v;
                }
            }
            "--seconds" | "-d" => {
                i += 1;
                if let Some(v) = args.get(i).and_then(|s| s.parse().ok()) {
                    cfg.seconds = v;
                }
            }
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: muxr-stress [--clients N] [--threads N] [--size BYTES] [--seconds N]");
                std::process::exit(2);
            }
        }
        i += 1;
    }
    cfg
}

fn main() {
    let cfg = parse_args();
    println!("=== muxr ping-pong stress ===");
    println!(
        "{} clients, {} server threads, {} byte messages, {} seconds\n",
        cfg.clients, cfg.threads, cfg.size, cfg.seconds
    );

    let base = EventLoop::new();
    let server = TcpServer::new(
        base.clone(),
        "127.0.0.1:0".parse().unwrap(),
        "stress".to_string(),
        false,
        Arc::new(Echo),
    );
    server.set_thread_num(cfg.threads);
    server.start();
    let addr = server.local_addr().expect("listening socket has an address");

    let stop = Arc::new(AtomicBool::new(false));
    let round_trips = Arc::new(AtomicU64::new(0));

    let mut clients = Vec::with_capacity(cfg.clients);
    for _ in 0..cfg.clients {
        let stop = stop.clone();
        let round_trips = round_trips.clone();
        let size = cfg.size;
        clients.push(thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream.set_nodelay(true).expect("nodelay");
            let payload = vec![0xab_u8; size];
            let mut back = vec![0u8; size];
            while !stop.load(Ordering::Relaxed) {
                stream.write_all(&payload).expect("write");
                stream.read_exact(&mut back).expect("read");
                round_trips.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    // Echoes may be served by the base loop itself (--threads 0), so
    // clients must finish their final round trip before it stops.
    let timer_stop = stop.clone();
    let timer_base = base.clone();
    let seconds = cfg.seconds;
    let timer = thread::spawn(move || {
        thread::sleep(Duration::from_secs(seconds));
        timer_stop.store(true, Ordering::Relaxed);
        for c in clients {
            c.join().unwrap();
        }
        timer_base.stop();
    });

    let start = Instant::now();
    base.run();
    timer.join().unwrap();
    let elapsed = start.elapsed().as_secs_f64();

    let trips = round_trips.load(Ordering::Relaxed);
    let bytes = trips * 2 * cfg.size as u64;
    println!("\n{} round trips in {:.2}s", trips, elapsed);
    println!("{:.0} round trips/s", trips as f64 / elapsed);
    println!("{:.2} MiB/s on the wire", bytes as f64 / elapsed / (1024.0 * 1024.0));
    drop(server);
}
