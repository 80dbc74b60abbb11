//! Handle lifecycle: stop semantics, idempotent registration, the
//! already-connected guard, and timer cancellation races.

use quotabox::config::types::{Fungible, PortResource, Renewable, SandboxError};
use quotabox::context::SandboxContext;
use quotabox::platform::select_platform;
use quotabox::{ResourceLimits, StopOutcome};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

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
    ] {
        limits.renewable.insert(r, 1e9);
    }
    for f in [Fungible::Events, Fungible::InSockets, Fungible::OutSockets] {
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
    let dir = TempDir::new().unwrap();
    let ctx = SandboxContext::bootstrap(
        limits,
        dir.path().to_path_buf(),
        select_platform().unwrap(),
    )
    .unwrap();
    (ctx, dir)
}

#[test]
fn stopping_an_unknown_handle_reports_not_found() {
    let (ctx, _dir) = context(&test_limits(&[]));
    assert_eq!(ctx.stop_comm(Uuid::new_v4()), StopOutcome::NotFound);
}

#[test]
fn reregistration_swaps_the_callback_in_place() {
    let port = 34261;
    let (ctx, _dir) = context(&test_limits(&[port]));

    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first_hits);
    let original = ctx
        .recv_message(LOCALHOST, port, move |_ctx, _event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let counter = Arc::clone(&second_hits);
    let replacement = ctx
        .recv_message(LOCALHOST, port, move |_ctx, _event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(original, replacement, "re-registration must reuse the entry");

    ctx.send_message(LOCALHOST, port, b"ping", None).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while second_hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    assert_eq!(first_hits.load(Ordering::SeqCst), 0);

    // Exactly one live entry: the first stop takes it, the second finds
    // nothing.
    assert_eq!(ctx.stop_comm(original), StopOutcome::Stopped);
    assert_eq!(ctx.stop_comm(original), StopOutcome::NotFound);
}

#[test]
fn connecting_from_an_occupied_binding_is_refused_without_leaking() {
    let listen_port = 34262;
    let second_listen_port = 34265;
    let local_port = 34263;
    let (ctx, _dir) = context(&test_limits(&[listen_port, second_listen_port, local_port]));

    ctx.wait_for_connections(LOCALHOST, listen_port, |_ctx, _event| {})
        .unwrap();
    ctx.wait_for_connections(LOCALHOST, second_listen_port, |_ctx, _event| {})
        .unwrap();

    let held = ctx
        .open_connection(
            LOCALHOST,
            listen_port,
            Some((LOCALHOST, local_port)),
            Duration::from_secs(5),
        )
        .unwrap();

    // Same local binding again: refused up front.
    assert!(matches!(
        ctx.open_connection(
            LOCALHOST,
            listen_port,
            Some((LOCALHOST, local_port)),
            Duration::from_secs(1),
        ),
        Err(SandboxError::AlreadyConnected)
    ));
    // Listening on it is refused the same way.
    assert!(matches!(
        ctx.wait_for_connections(LOCALHOST, local_port, |_ctx, _event| {}),
        Err(SandboxError::AlreadyConnected)
    ));

    // Nothing leaked: once the holder is stopped, the local port can carry
    // a fresh connection (to a different destination, so the old 4-tuple's
    // teardown state is not in the way).
    assert_eq!(ctx.stop_comm(held), StopOutcome::Stopped);
    let retry = ctx.open_connection(
        LOCALHOST,
        second_listen_port,
        Some((LOCALHOST, local_port)),
        Duration::from_secs(5),
    );
    assert!(retry.is_ok(), "binding still unusable: {:?}", retry.err());
}

#[test]
fn denied_ports_never_bind() {
    let (ctx, _dir) = context(&test_limits(&[34264]));
    assert!(matches!(
        ctx.recv_message(LOCALHOST, 40000, |_ctx, _event| {}),
        Err(SandboxError::Denied { port: 40000, .. })
    ));
    assert!(matches!(
        ctx.wait_for_connections(LOCALHOST, 40000, |_ctx, _event| {}),
        Err(SandboxError::Denied { .. })
    ));
}

#[test]
fn timer_fires_once_and_releases_its_slot() {
    let mut limits = test_limits(&[]);
    limits.fungible.insert(Fungible::Events, 1);
    let (ctx, _dir) = context(&limits);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    ctx.set_timer(Duration::from_millis(50), move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The slot came back after the callback completed; with a cap of one,
    // another timer can only be armed if it was released.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ctx.set_timer(Duration::from_millis(10), |_ctx| {}) {
            Ok(_) => break,
            Err(SandboxError::ResourceExceeded(_)) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
}

#[test]
fn cancel_wins_before_the_deadline_and_loses_after() {
    let (ctx, _dir) = context(&test_limits(&[]));

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let timer = ctx
        .set_timer(Duration::from_secs(30), move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(ctx.cancel_timer(timer), "cancel before the deadline wins");
    assert!(!ctx.cancel_timer(timer), "second cancel finds nothing");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let timer = ctx
        .set_timer(Duration::from_millis(20), move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!ctx.cancel_timer(timer), "cancel after firing loses");
}

#[test]
fn sleep_never_returns_early() {
    let (ctx, _dir) = context(&test_limits(&[]));
    let start = Instant::now();
    ctx.sleep(Duration::from_millis(250));
    assert!(start.elapsed() >= Duration::from_millis(250));
}
