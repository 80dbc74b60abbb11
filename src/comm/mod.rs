//! Mediated socket primitives.
//!
//! Every byte-moving operation follows the same discipline: validate the
//! arguments, block on a zero-quantity charge until the relevant byte-rate
//! resource has headroom, perform the real I/O with recoverable conditions
//! retried transparently, then charge the ledger with the bytes actually
//! moved. Loopback traffic is accounted separately from network traffic so
//! local chatter never competes against the network quota.

pub(crate) mod registry;
pub(crate) mod sockets;

use crate::config::types::{
    Fungible, PortResource, Renewable, Result, SandboxError, StopOutcome, TcpState,
};
use crate::context::SandboxContext;
use crate::ledger::{new_token, ResourceLedger};
use crate::platform::{PlatformOps, Proto};
use registry::{
    BoundHandler, CommEntry, CommRegistry, CommSocket, ConnectionHandler, MessageHandler,
    SocketKind,
};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use registry::{ConnectionEvent, HandleId, MessageEvent};

/// Ceiling on a single datagram receive.
pub(crate) const MAX_DATAGRAM: usize = 4096;

/// Socket operations that would block or time out softly are retried with
/// this granularity so a concurrent `stop` is noticed.
const RETRY_TIMEOUT: Duration = Duration::from_millis(200);

/// How often the connect pre-flight re-probes an occupied 4-tuple.
const COLLISION_PROBE_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct CommMediator {
    registry: Arc<CommRegistry>,
    ledger: Arc<ResourceLedger>,
    platform: Arc<dyn PlatformOps>,
    selector: Arc<crate::dispatch::selector::EventSelector>,
}

fn require_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(SandboxError::Argument("port must be in 1-65535".to_string()));
    }
    Ok(())
}

fn require_v4(addr: IpAddr) -> Result<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(SandboxError::Argument(
            "only IPv4 addresses are mediated".to_string(),
        )),
    }
}

fn send_resource(dest: IpAddr) -> Renewable {
    if dest.is_loopback() {
        Renewable::LoopSend
    } else {
        Renewable::NetSend
    }
}

fn recv_resource(remote: IpAddr) -> Renewable {
    if remote.is_loopback() {
        Renewable::LoopRecv
    } else {
        Renewable::NetRecv
    }
}

/// Interrupted calls, would-block, and soft timeouts are retried; anything
/// else propagates.
fn recoverable(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

impl CommMediator {
    pub fn new(ledger: Arc<ResourceLedger>, platform: Arc<dyn PlatformOps>) -> CommMediator {
        let registry = Arc::new(CommRegistry::new());
        let selector = Arc::new(crate::dispatch::selector::EventSelector::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
        ));
        CommMediator {
            registry,
            ledger,
            platform,
            selector,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<CommRegistry> {
        &self.registry
    }

    /// Send one datagram. When a listener is already bound to the requested
    /// local endpoint its socket is reused; otherwise a one-shot socket is
    /// opened and closed around the send.
    pub fn send_message(
        &self,
        dest: IpAddr,
        dest_port: u16,
        payload: &[u8],
        local: Option<(IpAddr, u16)>,
    ) -> Result<usize> {
        require_port(dest_port)?;
        let dest_v4 = require_v4(dest)?;
        if let Some((_, local_port)) = local {
            require_port(local_port)?;
            self.ledger
                .check_individual(PortResource::MessPort, local_port)?;
        }

        let resource = send_resource(dest);

        if let Some((local_addr, local_port)) = local {
            if let Some(handle) =
                self.registry
                    .find_listener(SocketKind::Message, local_addr, local_port)
            {
                if let Some((socket, _)) = self.registry.clone_datagram(handle) {
                    self.ledger.charge_renewable(resource, 0.0)?;
                    let sent = socket.send_to(payload, SocketAddrV4::new(dest_v4, dest_port))?;
                    self.ledger.charge_renewable(resource, sent as f64)?;
                    return Ok(sent);
                }
            }
        }

        let local_v4 = match local {
            Some((addr, port)) => Some(SocketAddrV4::new(require_v4(addr)?, port)),
            None => None,
        };
        let socket = sockets::bind_udp(local_v4)?;
        self.ledger.charge_renewable(resource, 0.0)?;
        let sent = socket.send_to(payload, SocketAddrV4::new(dest_v4, dest_port))?;
        self.ledger.charge_renewable(resource, sent as f64)?;
        Ok(sent)
    }

    /// Register a datagram handler on a local endpoint. Registering the
    /// same binding again swaps the callback in place and keeps the
    /// existing socket and reservation.
    pub fn recv_message(
        &self,
        ctx: &SandboxContext,
        local_addr: IpAddr,
        local_port: u16,
        handler: MessageHandler,
    ) -> Result<HandleId> {
        require_port(local_port)?;
        let local_v4 = require_v4(local_addr)?;
        self.ledger
            .check_individual(PortResource::MessPort, local_port)?;

        if let Some(existing) =
            self.registry
                .find_listener(SocketKind::Message, local_addr, local_port)
        {
            self.registry
                .rebind_handler(existing, BoundHandler::Message(handler))?;
            return Ok(existing);
        }

        // Not ours, but an external process may already hold the endpoint;
        // refuse deterministically instead of surfacing a raw bind error.
        if let Ok(true) = self
            .platform
            .exists_listening_socket(local_addr, local_port, Proto::Udp)
        {
            return Err(SandboxError::AlreadyConnected);
        }

        let reservation = new_token();
        if let Err(err) = self.ledger.reserve_item(Fungible::InSockets, reservation) {
            self.ledger.release_item(Fungible::InSockets, &reservation);
            return Err(err);
        }
        let socket = match sockets::bind_udp(Some(SocketAddrV4::new(local_v4, local_port))) {
            Ok(socket) => socket,
            Err(err) => {
                self.ledger.release_item(Fungible::InSockets, &reservation);
                return Err(err);
            }
        };

        let handle = self.registry.insert(CommEntry {
            kind: SocketKind::Message,
            local_addr,
            local_port,
            remote: None,
            outgoing: false,
            socket: CommSocket::Datagram(socket),
            handler: Some(BoundHandler::Message(handler)),
            reservation: (Fungible::InSockets, reservation),
            dispatching: false,
        });
        self.selector.ensure_running(ctx);
        Ok(handle)
    }

    /// Register a connection handler on a local endpoint. Same idempotency
    /// contract as `recv_message`.
    pub fn wait_for_connections(
        &self,
        ctx: &SandboxContext,
        local_addr: IpAddr,
        local_port: u16,
        handler: ConnectionHandler,
    ) -> Result<HandleId> {
        require_port(local_port)?;
        let local_v4 = require_v4(local_addr)?;
        self.ledger
            .check_individual(PortResource::ConnPort, local_port)?;

        if let Some(existing) =
            self.registry
                .find_listener(SocketKind::Stream, local_addr, local_port)
        {
            self.registry
                .rebind_handler(existing, BoundHandler::Connection(handler))?;
            return Ok(existing);
        }
        // A connected socket on this binding refuses a listen without
        // touching any reservation.
        if self
            .registry
            .binding_is_connected(SocketKind::Stream, local_addr, local_port)
        {
            return Err(SandboxError::AlreadyConnected);
        }
        if let Ok(true) = self
            .platform
            .exists_listening_socket(local_addr, local_port, Proto::Tcp)
        {
            return Err(SandboxError::AlreadyConnected);
        }

        let reservation = new_token();
        if let Err(err) = self.ledger.reserve_item(Fungible::InSockets, reservation) {
            self.ledger.release_item(Fungible::InSockets, &reservation);
            return Err(err);
        }
        let listener = match sockets::bind_listener(SocketAddrV4::new(local_v4, local_port)) {
            Ok(listener) => listener,
            Err(err) => {
                self.ledger.release_item(Fungible::InSockets, &reservation);
                return Err(err);
            }
        };

        let handle = self.registry.insert(CommEntry {
            kind: SocketKind::Stream,
            local_addr,
            local_port,
            remote: None,
            outgoing: false,
            socket: CommSocket::Listener(listener),
            handler: Some(BoundHandler::Connection(handler)),
            reservation: (Fungible::InSockets, reservation),
            dispatching: false,
        });
        self.selector.ensure_running(ctx);
        Ok(handle)
    }

    /// Open an outgoing stream connection. The timeout bounds the entire
    /// path: the pre-flight collision probe and the connect itself.
    pub fn open_connection(
        &self,
        dest: IpAddr,
        dest_port: u16,
        local: Option<(IpAddr, u16)>,
        timeout: Duration,
    ) -> Result<HandleId> {
        require_port(dest_port)?;
        let dest_v4 = require_v4(dest)?;
        let local_v4 = match local {
            Some((addr, port)) => {
                require_port(port)?;
                let v4 = require_v4(addr)?;
                self.ledger.check_individual(PortResource::ConnPort, port)?;
                if self
                    .registry
                    .find_binding(SocketKind::Stream, addr, port)
                    .is_some()
                {
                    return Err(SandboxError::AlreadyConnected);
                }
                Some(SocketAddrV4::new(v4, port))
            }
            None => None,
        };

        let deadline = Instant::now() + timeout;
        let reservation = new_token();
        if let Err(err) = self.ledger.reserve_item(Fungible::OutSockets, reservation) {
            self.ledger.release_item(Fungible::OutSockets, &reservation);
            return Err(err);
        }

        // An OS-level socket already on this 4-tuple (an external process,
        // or one of ours mid-teardown) would collide with the connect; wait
        // for it to clear, up to the caller's budget.
        if let Some(local_v4) = local_v4 {
            loop {
                let occupied = match self.platform.exists_outgoing_socket(
                    IpAddr::V4(*local_v4.ip()),
                    local_v4.port(),
                    dest,
                    dest_port,
                ) {
                    Ok((true, TcpState::Established)) | Ok((true, TcpState::Closing)) => true,
                    _ => false,
                };
                if !occupied {
                    break;
                }
                if Instant::now() >= deadline {
                    self.ledger.release_item(Fungible::OutSockets, &reservation);
                    return Err(SandboxError::Timeout(
                        "local endpoint still occupied by an existing connection".to_string(),
                    ));
                }
                std::thread::sleep(COLLISION_PROBE_INTERVAL);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.ledger.release_item(Fungible::OutSockets, &reservation);
            return Err(SandboxError::Timeout("connection attempt timed out".to_string()));
        }
        let stream = match sockets::connect_stream(
            SocketAddrV4::new(dest_v4, dest_port),
            local_v4,
            remaining,
        ) {
            Ok(stream) => stream,
            Err(err) => {
                self.ledger.release_item(Fungible::OutSockets, &reservation);
                return Err(err);
            }
        };

        let bound = stream
            .local_addr()
            .map(|a| (a.ip(), a.port()))
            .unwrap_or_else(|_| local.unwrap_or((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)));

        Ok(self.registry.insert(CommEntry {
            kind: SocketKind::Stream,
            local_addr: bound.0,
            local_port: bound.1,
            remote: Some((dest, dest_port)),
            outgoing: true,
            socket: CommSocket::Stream(stream),
            handler: None,
            reservation: (Fungible::OutSockets, reservation),
            dispatching: false,
        }))
    }

    /// Send on a connected stream socket. Returns the bytes the OS actually
    /// took, which the ledger is charged for.
    pub fn socket_send(&self, handle: HandleId, data: &[u8]) -> Result<usize> {
        let (mut stream, remote) = self.registry.clone_stream(handle)?;
        let resource = send_resource(remote.0);
        self.ledger.charge_renewable(resource, 0.0)?;

        stream.set_write_timeout(Some(RETRY_TIMEOUT))?;
        let sent = loop {
            if !self.registry.contains(handle) {
                return Err(SandboxError::SocketClosed);
            }
            match stream.write(data) {
                Ok(n) => break n,
                Err(err) if recoverable(err.kind()) => continue,
                Err(err) => return Err(err.into()),
            }
        };
        self.ledger.charge_renewable(resource, sent as f64)?;
        Ok(sent)
    }

    /// Receive up to `max` bytes from a connected stream socket. An empty
    /// result means the peer closed the connection.
    pub fn socket_recv(&self, handle: HandleId, max: usize) -> Result<Vec<u8>> {
        let (mut stream, remote) = self.registry.clone_stream(handle)?;
        let resource = recv_resource(remote.0);
        self.ledger.charge_renewable(resource, 0.0)?;

        stream.set_read_timeout(Some(RETRY_TIMEOUT))?;
        let mut buf = vec![0u8; max];
        let received = loop {
            if !self.registry.contains(handle) {
                return Err(SandboxError::SocketClosed);
            }
            match stream.read(&mut buf) {
                Ok(n) => break n,
                Err(err) if recoverable(err.kind()) => continue,
                Err(err) => return Err(err.into()),
            }
        };
        self.ledger.charge_renewable(resource, received as f64)?;
        buf.truncate(received);
        Ok(buf)
    }

    /// Close a handle and release its reservation. A dispatch already in
    /// flight for the handle completes normally; no new one starts.
    pub fn stop(&self, handle: HandleId) -> StopOutcome {
        let (outcome, reservation) = self.registry.stop(handle);
        if let Some((resource, token)) = reservation {
            self.ledger.release_item(resource, &token);
        }
        outcome
    }
}
