//! The socket handle table.
//!
//! One mutex guards every add/remove; entries own their OS socket and the
//! fungible-item reservation that covers it, so a handle's lifetime and its
//! ledger accounting can only move together.

use crate::config::types::{Fungible, Result, SandboxError, StopOutcome};
use crate::context::SandboxContext;
use crate::ledger::ItemToken;
use std::collections::HashMap;
use std::net::{IpAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub type HandleId = Uuid;

/// Message-oriented vs stream-oriented bindings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Message,
    Stream,
}

/// One inbound datagram, delivered to the bound callback.
pub struct MessageEvent {
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub payload: Vec<u8>,
    pub handle: HandleId,
}

/// One accepted stream connection, delivered to the bound callback.
pub struct ConnectionEvent {
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub socket: HandleId,
    pub listener: HandleId,
}

pub type MessageHandler = Arc<dyn Fn(&SandboxContext, MessageEvent) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(&SandboxContext, ConnectionEvent) + Send + Sync>;

pub(crate) enum CommSocket {
    Datagram(UdpSocket),
    Listener(TcpListener),
    Stream(TcpStream),
}

impl CommSocket {
    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            CommSocket::Datagram(s) => s.as_raw_fd(),
            CommSocket::Listener(s) => s.as_raw_fd(),
            CommSocket::Stream(s) => s.as_raw_fd(),
        }
    }
}

#[derive(Clone)]
pub(crate) enum BoundHandler {
    Message(MessageHandler),
    Connection(ConnectionHandler),
}

pub(crate) struct CommEntry {
    pub kind: SocketKind,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote: Option<(IpAddr, u16)>,
    /// Accepted or outgoing sockets are not polled by the selector.
    pub outgoing: bool,
    pub socket: CommSocket,
    pub handler: Option<BoundHandler>,
    /// The fungible reservation covering this handle, released exactly once
    /// when the handle dies.
    pub reservation: (Fungible, ItemToken),
    /// Set while a worker dispatch is running for this entry; at most one
    /// dispatch is ever in flight per entry.
    pub dispatching: bool,
}

/// A listening entry the selector should poll.
pub(crate) struct PollTarget {
    pub handle: HandleId,
    pub fd: RawFd,
}

#[derive(Default)]
pub(crate) struct CommRegistry {
    entries: Mutex<HashMap<HandleId, CommEntry>>,
}

impl CommRegistry {
    pub fn new() -> CommRegistry {
        CommRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, CommEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, entry: CommEntry) -> HandleId {
        let handle = Uuid::new_v4();
        self.lock().insert(handle, entry);
        handle
    }

    /// Find any live entry bound to `(kind, addr, port)` locally. Accepted
    /// and outgoing sockets count; used to refuse connects on an occupied
    /// binding.
    pub fn find_binding(&self, kind: SocketKind, addr: IpAddr, port: u16) -> Option<HandleId> {
        self.lock()
            .iter()
            .find(|(_, e)| e.kind == kind && e.local_addr == addr && e.local_port == port)
            .map(|(h, _)| *h)
    }

    /// Find the listening entry on `(kind, addr, port)`, ignoring accepted
    /// and outgoing sockets that share the binding. This is the entry a
    /// re-registration updates in place.
    pub fn find_listener(&self, kind: SocketKind, addr: IpAddr, port: u16) -> Option<HandleId> {
        self.lock()
            .iter()
            .find(|(_, e)| {
                e.kind == kind && e.local_addr == addr && e.local_port == port && !e.outgoing
            })
            .map(|(h, _)| *h)
    }

    /// Replace the callback of an existing listening entry in place,
    /// preserving its socket and ledger reservation. Errors with
    /// `AlreadyConnected` if the binding belongs to a connected socket
    /// rather than a listener.
    pub fn rebind_handler(&self, handle: HandleId, handler: BoundHandler) -> Result<()> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&handle)
            .ok_or(SandboxError::SocketClosed)?;
        if entry.outgoing {
            return Err(SandboxError::AlreadyConnected);
        }
        entry.handler = Some(handler);
        Ok(())
    }

    /// Whether the binding is occupied by a connected (non-listening)
    /// socket. Used to refuse connect/listen without touching any
    /// reservation.
    pub fn binding_is_connected(&self, kind: SocketKind, addr: IpAddr, port: u16) -> bool {
        self.lock()
            .values()
            .any(|e| e.kind == kind && e.local_addr == addr && e.local_port == port && e.outgoing)
    }

    /// Snapshot of pollable listening entries: bound, not outgoing, and not
    /// currently dispatched.
    pub fn poll_targets(&self) -> Vec<PollTarget> {
        self.lock()
            .iter()
            .filter(|(_, e)| !e.outgoing && !e.dispatching)
            .map(|(h, e)| PollTarget {
                handle: *h,
                fd: e.socket.raw_fd(),
            })
            .collect()
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.lock().contains_key(&handle)
    }

    /// Count of registered listening entries (the selector exits when this
    /// reaches zero).
    pub fn listening_count(&self) -> usize {
        self.lock().values().filter(|e| !e.outgoing).count()
    }

    pub fn set_dispatching(&self, handle: HandleId, dispatching: bool) {
        if let Some(entry) = self.lock().get_mut(&handle) {
            entry.dispatching = dispatching;
        }
    }

    /// Clone the datagram socket of a message entry for use off-lock.
    pub fn clone_datagram(&self, handle: HandleId) -> Option<(UdpSocket, IpAddr)> {
        let entries = self.lock();
        let entry = entries.get(&handle)?;
        match &entry.socket {
            CommSocket::Datagram(s) => s.try_clone().ok().map(|s| (s, entry.local_addr)),
            _ => None,
        }
    }

    /// Clone the listener socket of a stream entry for use off-lock.
    pub fn clone_listener(&self, handle: HandleId) -> Option<TcpListener> {
        let entries = self.lock();
        match entries.get(&handle).map(|e| &e.socket) {
            Some(CommSocket::Listener(s)) => s.try_clone().ok(),
            _ => None,
        }
    }

    /// Clone the stream and remote endpoint of a connected entry.
    pub fn clone_stream(&self, handle: HandleId) -> Result<(TcpStream, (IpAddr, u16))> {
        let entries = self.lock();
        let entry = entries.get(&handle).ok_or(SandboxError::SocketClosed)?;
        match (&entry.socket, entry.remote) {
            (CommSocket::Stream(s), Some(remote)) => {
                let clone = s.try_clone().map_err(SandboxError::Io)?;
                Ok((clone, remote))
            }
            (CommSocket::Stream(_), None) => Err(SandboxError::NotConnected),
            _ => Err(SandboxError::NotConnected),
        }
    }

    pub fn handler(&self, handle: HandleId) -> Option<BoundHandler> {
        self.lock().get(&handle).and_then(|e| e.handler.clone())
    }

    /// Local binding of an entry, if it is still registered.
    pub fn binding_of(&self, handle: HandleId) -> Option<(IpAddr, u16)> {
        self.lock()
            .get(&handle)
            .map(|e| (e.local_addr, e.local_port))
    }

    /// Close and unregister a handle, reporting whether anything was there.
    /// The ledger release is the caller's job so the registry stays free of
    /// ledger knowledge.
    pub fn stop(&self, handle: HandleId) -> (StopOutcome, Option<(Fungible, ItemToken)>) {
        match self.lock().remove(&handle) {
            Some(entry) => (StopOutcome::Stopped, Some(entry.reservation)),
            None => (StopOutcome::NotFound, None),
        }
    }
}
