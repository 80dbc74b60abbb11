//! The typed sandbox context.
//!
//! One `SandboxContext` is handed to every callback invocation and is the
//! only capability surface sandboxed code holds: sockets, files, timers,
//! and the small metered utility calls, all funneling through the ledger.
//! Cloning is cheap; all clones share the same process-wide state.

use crate::comm::registry::{
    CommRegistry, ConnectionEvent, HandleId, MessageEvent,
};
use crate::comm::CommMediator;
use crate::config::types::{ExitStatus, Renewable, Result, StopOutcome};
use crate::config::ResourceLimits;
use crate::fileio::{FileId, FileMediator, FileMode};
use crate::ledger::ResourceLedger;
use crate::platform::clock::RuntimeClock;
use crate::platform::PlatformOps;
use crate::timer::{TimerId, TimerService};
use std::io::SeekFrom;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Bytes charged to both network rates for one name resolution.
const LOOKUP_CHARGE: f64 = 4096.0;

#[derive(Clone)]
pub struct SandboxContext {
    ledger: Arc<ResourceLedger>,
    comm: Arc<CommMediator>,
    files: Arc<FileMediator>,
    timers: Arc<TimerService>,
    clock: RuntimeClock,
}

impl SandboxContext {
    /// Build the runtime state for one sandbox: ledger, handle tables, and
    /// mediators. Does not fork the watchdog; `runtime::launch` does the
    /// full supervised startup.
    pub fn bootstrap(
        limits: &ResourceLimits,
        workdir: PathBuf,
        platform: Arc<dyn PlatformOps>,
    ) -> Result<SandboxContext> {
        let clock = RuntimeClock::start();
        let ledger = Arc::new(ResourceLedger::new(limits, clock));
        let comm = Arc::new(CommMediator::new(Arc::clone(&ledger), platform));
        let files = Arc::new(FileMediator::new(workdir, Arc::clone(&ledger)));
        let timers = Arc::new(TimerService::new(Arc::clone(&ledger)));
        Ok(SandboxContext {
            ledger,
            comm,
            files,
            timers,
            clock,
        })
    }

    pub(crate) fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub(crate) fn comm_registry(&self) -> &Arc<CommRegistry> {
        self.comm.registry()
    }

    pub(crate) fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    // ---- sockets ----

    /// Send one datagram; returns the bytes sent.
    pub fn send_message(
        &self,
        dest: IpAddr,
        dest_port: u16,
        payload: &[u8],
        local: Option<(IpAddr, u16)>,
    ) -> Result<usize> {
        self.comm.send_message(dest, dest_port, payload, local)
    }

    /// Register a handler for datagrams arriving on `(local, port)`.
    pub fn recv_message<F>(&self, local: IpAddr, port: u16, handler: F) -> Result<HandleId>
    where
        F: Fn(&SandboxContext, MessageEvent) + Send + Sync + 'static,
    {
        self.comm.recv_message(self, local, port, Arc::new(handler))
    }

    /// Register a handler for stream connections arriving on `(local, port)`.
    pub fn wait_for_connections<F>(&self, local: IpAddr, port: u16, handler: F) -> Result<HandleId>
    where
        F: Fn(&SandboxContext, ConnectionEvent) + Send + Sync + 'static,
    {
        self.comm
            .wait_for_connections(self, local, port, Arc::new(handler))
    }

    /// Open an outgoing stream connection within `timeout`.
    pub fn open_connection(
        &self,
        dest: IpAddr,
        dest_port: u16,
        local: Option<(IpAddr, u16)>,
        timeout: Duration,
    ) -> Result<HandleId> {
        self.comm.open_connection(dest, dest_port, local, timeout)
    }

    pub fn socket_send(&self, handle: HandleId, data: &[u8]) -> Result<usize> {
        self.comm.socket_send(handle, data)
    }

    pub fn socket_recv(&self, handle: HandleId, max: usize) -> Result<Vec<u8>> {
        self.comm.socket_recv(handle, max)
    }

    /// Stop a socket handle of any kind.
    pub fn stop_comm(&self, handle: HandleId) -> StopOutcome {
        self.comm.stop(handle)
    }

    // ---- files ----

    pub fn open_file(&self, name: &str, mode: FileMode) -> Result<FileId> {
        self.files.open(name, mode)
    }

    pub fn file_read(&self, id: FileId, max: usize) -> Result<Vec<u8>> {
        self.files.read(id, max)
    }

    pub fn file_write(&self, id: FileId, data: &[u8]) -> Result<()> {
        self.files.write(id, data)
    }

    pub fn file_write_many(&self, id: FileId, parts: &[&[u8]]) -> Result<()> {
        self.files.write_many(id, parts)
    }

    pub fn file_flush(&self, id: FileId) -> Result<()> {
        self.files.flush(id)
    }

    pub fn file_seek(&self, id: FileId, position: SeekFrom) -> Result<u64> {
        self.files.seek(id, position)
    }

    pub fn close_file(&self, id: FileId) {
        self.files.close(id)
    }

    pub fn remove_file(&self, name: &str) -> Result<()> {
        self.files.remove(name)
    }

    pub fn list_files(&self) -> Result<Vec<String>> {
        self.files.list()
    }

    // ---- timers ----

    /// Arm a one-shot timer; the callback receives this context.
    pub fn set_timer<F>(&self, delay: Duration, callback: F) -> Result<TimerId>
    where
        F: FnOnce(&SandboxContext) + Send + 'static,
    {
        self.timers
            .schedule(self.clone(), delay, Box::new(callback))
    }

    /// True only if this call stopped the timer before it fired.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Block for at least `duration`.
    pub fn sleep(&self, duration: Duration) {
        self.timers.sleep(duration)
    }

    // ---- metered utilities ----

    /// One metered random draw in `[0, 1)`.
    pub fn random_float(&self) -> Result<f64> {
        self.ledger.charge_renewable(Renewable::Random, 1.0)?;
        Ok(fastrand::f64())
    }

    /// Seconds since the sandbox started.
    pub fn runtime(&self) -> f64 {
        self.clock.now()
    }

    /// Metered log output, charged per byte against `lograte`.
    pub fn log_write(&self, message: &str) -> Result<()> {
        self.ledger
            .charge_renewable(Renewable::LogRate, message.len() as f64)?;
        log::info!(target: "sandboxed", "{}", message);
        Ok(())
    }

    /// Resolve a host name. The lookup itself moves traffic we cannot see,
    /// so a flat charge is taken against both network rates up front.
    pub fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>> {
        self.ledger
            .charge_renewable(Renewable::NetSend, LOOKUP_CHARGE)?;
        self.ledger
            .charge_renewable(Renewable::NetRecv, LOOKUP_CHARGE)?;
        let addrs = (name, 0u16)
            .to_socket_addrs()?
            .map(|a| a.ip())
            .collect();
        Ok(addrs)
    }

    /// The local address the host routes external traffic from, discovered
    /// via a connected (but never written) datagram socket.
    pub fn my_ip(&self) -> Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    }

    /// Stop the whole sandbox immediately with a normal exit.
    pub fn exit_all(&self) -> ! {
        crate::fatal::terminate(ExitStatus::Normal, "sandboxed program requested exit")
    }
}
