//! Linux adapter: `/proc` for process and socket state, signals for
//! suspend/resume/kill.

use crate::config::types::{Result, SandboxError, TcpState};
use crate::platform::{PlatformOps, Proto};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::IpAddr;

/// Field offsets into `/proc/<pid>/stat` counted after the `(comm)` field.
/// `utime` and `stime` are stat fields 14 and 15; `rss` is field 24.
const STAT_UTIME: usize = 11;
const STAT_STIME: usize = 12;
const STAT_RSS: usize = 21;

/// `/proc/uptime` carries two decimal places.
const UPTIME_GRANULARITY: f64 = 0.01;

pub struct LinuxPlatform {
    jiffies_per_second: f64,
    page_size: u64,
}

impl LinuxPlatform {
    pub fn new() -> LinuxPlatform {
        // Both sysconf values are compile-time constants of the running
        // kernel configuration; a failure here means /proc arithmetic would
        // be meaningless anyway, so fall back to the historical defaults.
        let jiffies = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        LinuxPlatform {
            jiffies_per_second: if jiffies > 0 { jiffies as f64 } else { 100.0 },
            page_size: if page > 0 { page as u64 } else { 4096 },
        }
    }

    /// Read `/proc/<pid>/stat` and return the whitespace-split fields that
    /// follow the parenthesized command name. The command name may itself
    /// contain spaces and parentheses, so split at the *last* `)`.
    fn stat_fields(&self, pid: Pid) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(format!("/proc/{}/stat", pid.as_raw()))
            .map_err(|e| SandboxError::Platform(format!("stat({}): {}", pid, e)))?;
        let after_comm = raw
            .rfind(')')
            .map(|i| &raw[i + 1..])
            .ok_or_else(|| SandboxError::Platform(format!("stat({}): malformed line", pid)))?;
        Ok(after_comm.split_whitespace().map(str::to_string).collect())
    }

    fn stat_field_u64(&self, pid: Pid, index: usize) -> Result<u64> {
        let fields = self.stat_fields(pid)?;
        fields
            .get(index)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| SandboxError::Platform(format!("stat({}): missing field {}", pid, index)))
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        kill(pid, signal)
            .map_err(|e| SandboxError::Process(format!("kill({}, {}): {}", pid, signal, e)))
    }

    /// Scan one `/proc/net/*` table for rows matching the predicate.
    fn scan_net_table<F>(&self, table: &str, mut matches: F) -> Result<Option<u8>>
    where
        F: FnMut(IpAddr, u16, IpAddr, u16) -> bool,
    {
        let raw = std::fs::read_to_string(format!("/proc/net/{}", table))
            .map_err(|e| SandboxError::Platform(format!("/proc/net/{}: {}", table, e)))?;
        for line in raw.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let (Some(_sl), Some(local), Some(remote), Some(state)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Some((laddr, lport)), Some((raddr, rport))) =
                (parse_hex_endpoint(local), parse_hex_endpoint(remote))
            else {
                continue;
            };
            if matches(laddr, lport, raddr, rport) {
                let state = u8::from_str_radix(state, 16).unwrap_or(0);
                return Ok(Some(state));
            }
        }
        Ok(None)
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformOps for LinuxPlatform {
    fn process_cpu_time(&self, pid: Pid) -> Result<f64> {
        let fields = self.stat_fields(pid)?;
        let utime: u64 = fields
            .get(STAT_UTIME)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| SandboxError::Platform(format!("stat({}): missing utime", pid)))?;
        let stime: u64 = fields
            .get(STAT_STIME)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| SandboxError::Platform(format!("stat({}): missing stime", pid)))?;
        Ok((utime + stime) as f64 / self.jiffies_per_second)
    }

    fn process_rss(&self, pid: Pid) -> Result<u64> {
        let pages = self.stat_field_u64(pid, STAT_RSS)?;
        Ok(pages * self.page_size)
    }

    fn system_uptime(&self) -> Result<f64> {
        let raw = std::fs::read_to_string("/proc/uptime")
            .map_err(|e| SandboxError::Platform(format!("/proc/uptime: {}", e)))?;
        raw.split_whitespace()
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| SandboxError::Platform("/proc/uptime: malformed".to_string()))
    }

    fn uptime_granularity(&self) -> f64 {
        UPTIME_GRANULARITY
    }

    fn suspend(&self, pid: Pid) -> Result<()> {
        self.signal(pid, Signal::SIGSTOP)
    }

    fn resume(&self, pid: Pid) -> Result<()> {
        self.signal(pid, Signal::SIGCONT)
    }

    fn kill(&self, pid: Pid) -> Result<()> {
        self.signal(pid, Signal::SIGKILL)
    }

    fn exists_listening_socket(&self, addr: IpAddr, port: u16, proto: Proto) -> Result<bool> {
        match proto {
            Proto::Tcp => {
                // TCP listeners are rows in state 0x0A.
                let state = self.scan_net_table("tcp", |laddr, lport, _raddr, _rport| {
                    lport == port && (laddr == addr || laddr.is_unspecified())
                })?;
                Ok(state == Some(0x0A))
            }
            Proto::Udp => {
                // Any bound datagram socket counts as listening.
                let state = self.scan_net_table("udp", |laddr, lport, _raddr, _rport| {
                    lport == port && (laddr == addr || laddr.is_unspecified())
                })?;
                Ok(state.is_some())
            }
        }
    }

    fn exists_outgoing_socket(
        &self,
        local_addr: IpAddr,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
    ) -> Result<(bool, TcpState)> {
        let state = self.scan_net_table("tcp", |laddr, lport, raddr, rport| {
            laddr == local_addr && lport == local_port && raddr == remote_addr && rport == remote_port
        })?;
        match state {
            None => Ok((false, TcpState::Other)),
            Some(code) => Ok((true, classify_tcp_state(code))),
        }
    }
}

/// Map `/proc/net/tcp` state codes onto the coarse states the collision
/// probe cares about.
fn classify_tcp_state(code: u8) -> TcpState {
    match code {
        0x01 => TcpState::Established,
        // FIN_WAIT1, FIN_WAIT2, TIME_WAIT, CLOSE_WAIT, LAST_ACK, CLOSING
        0x04 | 0x05 | 0x06 | 0x08 | 0x09 | 0x0B => TcpState::Closing,
        0x0A => TcpState::Listening,
        _ => TcpState::Other,
    }
}

/// Parse a `/proc/net` endpoint of the form `0100007F:0035` (byte-swapped
/// IPv4 address, big-endian port).
fn parse_hex_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    if addr_hex.len() == 8 {
        let packed = u32::from_str_radix(addr_hex, 16).ok()?;
        Some((IpAddr::from(packed.swap_bytes().to_be_bytes()), port))
    } else {
        // IPv6 rows are not probed; the mediated surface is v4.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn hex_endpoint_decodes_loopback() {
        let (addr, port) = parse_hex_endpoint("0100007F:0035").unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(port, 53);
    }

    #[test]
    fn hex_endpoint_decodes_any() {
        let (addr, port) = parse_hex_endpoint("00000000:3039").unwrap();
        assert!(addr.is_unspecified());
        assert_eq!(port, 12345);
    }

    #[test]
    fn tcp_state_classification() {
        assert_eq!(classify_tcp_state(0x01), TcpState::Established);
        assert_eq!(classify_tcp_state(0x06), TcpState::Closing);
        assert_eq!(classify_tcp_state(0x0A), TcpState::Listening);
        assert_eq!(classify_tcp_state(0x02), TcpState::Other);
    }

    #[test]
    fn own_process_is_queryable() {
        let platform = LinuxPlatform::new();
        let me = Pid::this();
        let cpu = platform.process_cpu_time(me).unwrap();
        assert!(cpu >= 0.0);
        let rss = platform.process_rss(me).unwrap();
        assert!(rss > 0);
        let uptime = platform.system_uptime().unwrap();
        assert!(uptime > 0.0);
    }
}
