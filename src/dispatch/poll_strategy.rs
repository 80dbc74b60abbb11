//! Readiness polling with an explicit fallback policy.
//!
//! The normal path waits on every listening descriptor in one batched
//! `poll(2)`. If the batched wait itself fails (a descriptor went bad under
//! us, an interrupted call), the poller probes each descriptor individually
//! with a zero timeout and excludes the bad ones instead of failing the
//! whole cycle.

use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::RawFd;

/// Events that make an entry worth dispatching. Error/hangup conditions are
/// included so the worker can observe the failure and clean up.
fn ready_flags() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLERR | PollFlags::POLLHUP
}

pub(crate) struct ReadinessPoller;

impl ReadinessPoller {
    /// Descriptors with pending activity, waiting up to `timeout_ms`.
    pub fn ready(&self, fds: &[RawFd], timeout_ms: i32) -> Vec<RawFd> {
        match batch_poll(fds, timeout_ms) {
            Ok(ready) => ready,
            Err(err) => {
                log::warn!("batched poll failed ({}), probing descriptors individually", err);
                isolate_and_retry(fds)
            }
        }
    }
}

/// One poll over the whole set.
fn batch_poll(fds: &[RawFd], timeout_ms: i32) -> nix::Result<Vec<RawFd>> {
    let mut pollfds: Vec<PollFd> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN | PollFlags::POLLPRI))
        .collect();
    poll(&mut pollfds, timeout_ms)?;

    let mut ready = Vec::new();
    for (pollfd, fd) in pollfds.iter().zip(fds) {
        let Some(revents) = pollfd.revents() else {
            continue;
        };
        if revents.contains(PollFlags::POLLNVAL) {
            // Closed under us; the registry will drop it next cycle.
            continue;
        }
        if revents.intersects(ready_flags()) {
            ready.push(*fd);
        }
    }
    Ok(ready)
}

/// Probe each descriptor on its own, skipping any that cannot be polled.
fn isolate_and_retry(fds: &[RawFd]) -> Vec<RawFd> {
    let mut ready = Vec::new();
    for fd in fds {
        let mut single = [PollFd::new(*fd, PollFlags::POLLIN | PollFlags::POLLPRI)];
        match poll(&mut single, 0) {
            Ok(_) => {
                let Some(revents) = single[0].revents() else {
                    continue;
                };
                if revents.contains(PollFlags::POLLNVAL) {
                    continue;
                }
                if revents.intersects(ready_flags()) {
                    ready.push(*fd);
                }
            }
            Err(err) => {
                log::warn!("descriptor {} excluded from poll set: {}", fd, err);
            }
        }
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn idle_socket_is_not_ready() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let ready = ReadinessPoller.ready(&[socket.as_raw_fd()], 0);
        assert!(ready.is_empty());
    }

    #[test]
    fn pending_datagram_marks_socket_ready() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .unwrap();
        // Give the loopback stack a moment to queue the datagram.
        let ready = ReadinessPoller.ready(&[receiver.as_raw_fd()], 1000);
        assert_eq!(ready, vec![receiver.as_raw_fd()]);
    }

    #[test]
    fn bad_descriptor_is_excluded_not_fatal() {
        let good = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"x", good.local_addr().unwrap()).unwrap();
        // An fd well past anything open in a test process.
        let bogus: RawFd = 4090;
        let ready = ReadinessPoller.ready(&[bogus, good.as_raw_fd()], 1000);
        assert_eq!(ready, vec![good.as_raw_fd()]);
    }
}
