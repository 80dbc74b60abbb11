//! End-to-end dispatch tests: a real datagram listener, a real rate limit,
//! and the selector/worker machinery in between.

use quotabox::config::types::{Fungible, PortResource, Renewable};
use quotabox::context::SandboxContext;
use quotabox::platform::select_platform;
use quotabox::ResourceLimits;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_limits(ports: &[u16]) -> ResourceLimits {
    let mut limits = ResourceLimits::default();
    limits.renewable.insert(Renewable::Cpu, 0.5);
    limits.memory = 1 << 30;
    limits.diskused = 1 << 30;
    for r in [
        Renewable::LoopSend,
        Renewable::LoopRecv,
        Renewable::NetSend,
        Renewable::NetRecv,
        Renewable::FileRead,
        Renewable::FileWrite,
    ] {
        limits.renewable.insert(r, 1e9);
    }
    for f in [
        Fungible::Events,
        Fungible::InSockets,
        Fungible::OutSockets,
        Fungible::FilesOpened,
    ] {
        limits.fungible.insert(f, 16);
    }
    for port in ports {
        limits
            .ports
            .entry(PortResource::MessPort)
            .or_default()
            .insert(*port);
        limits
            .ports
            .entry(PortResource::ConnPort)
            .or_default()
            .insert(*port);
    }
    limits
}

fn context(limits: &ResourceLimits) -> (SandboxContext, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let ctx = SandboxContext::bootstrap(
        limits,
        dir.path().to_path_buf(),
        select_platform().unwrap(),
    )
    .unwrap();
    (ctx, dir)
}

fn wait_until<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn datagrams_are_delivered_with_source_and_payload() {
    let port = 34251;
    let (ctx, _dir) = context(&test_limits(&[port]));

    let seen: Arc<Mutex<Vec<(IpAddr, u16, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ctx.recv_message(LOCALHOST, port, move |_ctx, event| {
        sink.lock()
            .unwrap()
            .push((event.source_addr, event.source_port, event.payload));
    })
    .unwrap();

    ctx.send_message(LOCALHOST, port, b"first", None).unwrap();
    ctx.send_message(LOCALHOST, port, b"second", None).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 2),
        "expected both datagrams to be delivered"
    );
    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|(addr, _, _)| *addr == LOCALHOST));
    let payloads: Vec<&[u8]> = seen.iter().map(|(_, _, p)| p.as_slice()).collect();
    assert!(payloads.contains(&b"first".as_slice()));
    assert!(payloads.contains(&b"second".as_slice()));
}

#[test]
fn send_rate_limit_throttles_back_to_back_sends() {
    // 5 bytes/sec on loopback sends. The first 10-byte datagram leaves the
    // bucket 5 over its limit, so the first call settles for about a
    // second; the second stacks another 10 on top and settles for about
    // two. Twenty bytes against 5/sec: both calls together take ~3s.
    let port = 34252;
    let mut limits = test_limits(&[port]);
    limits.renewable.insert(Renewable::LoopSend, 5.0);
    let (ctx, _dir) = context(&limits);

    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);
    ctx.recv_message(LOCALHOST, port, move |_ctx, event| {
        assert_eq!(event.payload, b"tenbytes!!");
        *sink.lock().unwrap() += 1;
    })
    .unwrap();

    let start = Instant::now();
    ctx.send_message(LOCALHOST, port, b"tenbytes!!", None).unwrap();
    let first = start.elapsed().as_secs_f64();
    assert!(
        first > 0.5,
        "first send returned in {:.2}s, post-hoc charge did not block",
        first
    );

    let start = Instant::now();
    ctx.send_message(LOCALHOST, port, b"tenbytes!!", None).unwrap();
    let second = start.elapsed().as_secs_f64();
    assert!(
        second > 1.0,
        "second send returned in {:.2}s, accumulated debt not enforced",
        second
    );
    assert!(second < 3.5, "second send overslept: {:.2}s", second);

    assert!(
        wait_until(Duration::from_secs(5), || *count.lock().unwrap() == 2),
        "handler should fire exactly once per datagram"
    );
    // No phantom deliveries after the fact.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*count.lock().unwrap(), 2);
}

#[test]
fn stream_connections_are_accepted_and_metered() -> anyhow::Result<()> {
    let port = 34253;
    let (ctx, _dir) = context(&test_limits(&[port]));

    let greeted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&greeted);
    ctx.wait_for_connections(LOCALHOST, port, move |ctx, event| {
        // Echo whatever the client leads with.
        let data = ctx.socket_recv(event.socket, 16).unwrap();
        ctx.socket_send(event.socket, &data).unwrap();
        sink.lock().unwrap().push(event.remote_addr);
    })?;

    let client = ctx.open_connection(LOCALHOST, port, None, Duration::from_secs(5))?;
    let sent = ctx.socket_send(client, b"hello")?;
    assert_eq!(sent, 5);
    let echoed = ctx.socket_recv(client, 16)?;
    assert_eq!(echoed, b"hello");

    assert!(wait_until(Duration::from_secs(5), || {
        greeted.lock().unwrap().len() == 1
    }));
    assert_eq!(greeted.lock().unwrap()[0], LOCALHOST);
    Ok(())
}
