//! Event delivery workers.
//!
//! Each ready entry gets one worker thread: receive/accept, account the
//! bytes, invoke the bound callback, release the `events` slot, return the
//! entry to its registered state. A panic escaping a user callback is fatal
//! to the whole sandbox; a runtime that kept going would be claiming to
//! enforce policy on a program it has lost track of.

use crate::comm::registry::{
    BoundHandler, CommEntry, CommSocket, ConnectionEvent, HandleId, MessageEvent, SocketKind,
};
use crate::comm::MAX_DATAGRAM;
use crate::config::types::{Fungible, Renewable};
use crate::context::SandboxContext;
use crate::ledger::{new_token, ItemToken};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Spawn the delivery thread for one dispatch.
pub(crate) fn dispatch(ctx: SandboxContext, handle: HandleId, event_token: ItemToken) {
    let spawned = std::thread::Builder::new()
        .name("event-deliverer".to_string())
        .spawn(move || run(ctx, handle, event_token));
    if spawned.is_err() {
        crate::fatal::thread_error("could not start an event delivery thread");
    }
}

fn run(ctx: SandboxContext, handle: HandleId, event_token: ItemToken) {
    match ctx.comm_registry().handler(handle) {
        Some(BoundHandler::Message(callback)) => deliver_datagram(&ctx, handle, callback),
        Some(BoundHandler::Connection(callback)) => deliver_connection(&ctx, handle, callback),
        // Stopped while the dispatch was queued.
        None => {}
    }
    finish(&ctx, handle, &event_token);
}

fn finish(ctx: &SandboxContext, handle: HandleId, event_token: &ItemToken) {
    ctx.comm_registry().set_dispatching(handle, false);
    ctx.ledger().release_item(Fungible::Events, event_token);
}

fn deliver_datagram(
    ctx: &SandboxContext,
    handle: HandleId,
    callback: crate::comm::registry::MessageHandler,
) {
    let Some((socket, local_addr)) = ctx.comm_registry().clone_datagram(handle) else {
        return;
    };
    let mut buf = [0u8; MAX_DATAGRAM];
    let (len, source) = match socket.recv_from(&mut buf) {
        Ok(received) => received,
        // Closed in the meantime.
        Err(_) => return,
    };
    if len == 0 {
        return;
    }

    let resource = if local_addr.is_loopback() {
        Renewable::LoopRecv
    } else {
        Renewable::NetRecv
    };
    if let Err(err) = ctx.ledger().charge_renewable(resource, len as f64) {
        // A socket was granted but its receive rate was not; the datagram
        // cannot be accounted, so the sandbox cannot keep running.
        crate::fatal::internal_error(&format!("inbound datagram cannot be accounted: {}", err));
    }

    let event = MessageEvent {
        source_addr: source.ip(),
        source_port: source.port(),
        payload: buf[..len].to_vec(),
        handle,
    };
    invoke_guarded(|| callback(ctx, event));
}

fn deliver_connection(
    ctx: &SandboxContext,
    handle: HandleId,
    callback: crate::comm::registry::ConnectionHandler,
) {
    let Some(listener) = ctx.comm_registry().clone_listener(handle) else {
        return;
    };
    let (stream, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        // Closed in the meantime.
        Err(_) => return,
    };

    let Some((local_addr, local_port)) = ctx.comm_registry().binding_of(handle) else {
        return;
    };

    // The accepted socket is accounted like any other outgoing socket; if
    // the cap is already full the connection is dropped on the floor and
    // the peer sees a close.
    let reservation = new_token();
    if ctx
        .ledger()
        .reserve_item(Fungible::OutSockets, reservation)
        .is_err()
    {
        ctx.ledger()
            .release_item(Fungible::OutSockets, &reservation);
        log::warn!(
            "refused connection from {}: outgoing socket cap reached",
            peer
        );
        return;
    }

    let socket = ctx.comm_registry().insert(CommEntry {
        kind: SocketKind::Stream,
        local_addr,
        local_port,
        remote: Some((peer.ip(), peer.port())),
        outgoing: true,
        socket: CommSocket::Stream(stream),
        handler: None,
        reservation: (Fungible::OutSockets, reservation),
        dispatching: false,
    });

    let event = ConnectionEvent {
        remote_addr: peer.ip(),
        remote_port: peer.port(),
        socket,
        listener: handle,
    };
    invoke_guarded(|| callback(ctx, event));
}

/// Run a user callback; a panic crossing this boundary takes the whole
/// process down.
fn invoke_guarded<F: FnOnce()>(callback: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        let reason = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("non-string panic payload");
        crate::fatal::uncaught_callback(&format!("user callback panicked: {}", reason));
    }
}
