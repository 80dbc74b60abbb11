//! Per-OS process and time queries behind one contract.
//!
//! Exactly one concrete adapter is selected at startup; nothing else in the
//! runtime branches on the operating system inline.

pub mod clock;
#[cfg(target_os = "linux")]
pub mod linux;

use crate::config::types::{Result, TcpState};
use nix::unistd::Pid;
use std::net::IpAddr;
use std::sync::Arc;

/// Transport protocol for the listening-socket probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// The process/time/socket queries the runtime needs from the OS.
pub trait PlatformOps: Send + Sync {
    /// Cumulative CPU seconds (user + system) consumed by `pid`.
    fn process_cpu_time(&self, pid: Pid) -> Result<f64>;

    /// Resident set size of `pid` in bytes.
    fn process_rss(&self, pid: Pid) -> Result<u64>;

    /// System uptime in seconds.
    fn system_uptime(&self) -> Result<f64>;

    /// Granularity of the uptime source in seconds.
    fn uptime_granularity(&self) -> f64;

    /// Pause all threads of `pid`.
    fn suspend(&self, pid: Pid) -> Result<()>;

    /// Resume a suspended `pid`.
    fn resume(&self, pid: Pid) -> Result<()>;

    /// Terminate `pid` without giving it a chance to object.
    fn kill(&self, pid: Pid) -> Result<()>;

    /// Whether any OS-level socket is listening on `(addr, port, proto)`.
    fn exists_listening_socket(&self, addr: IpAddr, port: u16, proto: Proto) -> Result<bool>;

    /// Whether an OS-level stream socket already occupies the given 4-tuple,
    /// and what state it is in. Used to avoid colliding with an external
    /// process or a socket mid-teardown.
    fn exists_outgoing_socket(
        &self,
        local_addr: IpAddr,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
    ) -> Result<(bool, TcpState)>;
}

/// Select the platform adapter for the host OS. Unsupported hosts are a
/// startup configuration error, never a runtime branch.
pub fn select_platform() -> Result<Arc<dyn PlatformOps>> {
    #[cfg(target_os = "linux")]
    {
        let platform = linux::LinuxPlatform::new();
        log::info!(
            "platform adapter selected: linux (uptime {:.0}s, granularity {}s)",
            platform.system_uptime().unwrap_or(0.0),
            platform.uptime_granularity()
        );
        Ok(Arc::new(platform))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(crate::config::types::SandboxError::Config(
            "no platform adapter for this operating system".to_string(),
        ))
    }
}
