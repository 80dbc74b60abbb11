/// Core types shared across the quotabox runtime
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Renewable resources: a floating consumption that drains at `limit`
/// units per second (leaky bucket).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Renewable {
    Cpu,
    FileWrite,
    FileRead,
    NetSend,
    NetRecv,
    LoopSend,
    LoopRecv,
    LogRate,
    Random,
}

impl Renewable {
    pub const ALL: [Renewable; 9] = [
        Renewable::Cpu,
        Renewable::FileWrite,
        Renewable::FileRead,
        Renewable::NetSend,
        Renewable::NetRecv,
        Renewable::LoopSend,
        Renewable::LoopRecv,
        Renewable::LogRate,
        Renewable::Random,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Renewable::Cpu => "cpu",
            Renewable::FileWrite => "filewrite",
            Renewable::FileRead => "fileread",
            Renewable::NetSend => "netsend",
            Renewable::NetRecv => "netrecv",
            Renewable::LoopSend => "loopsend",
            Renewable::LoopRecv => "looprecv",
            Renewable::LogRate => "lograte",
            Renewable::Random => "random",
        }
    }

    pub fn from_name(name: &str) -> Option<Renewable> {
        Renewable::ALL.iter().copied().find(|r| r.name() == name)
    }
}

impl fmt::Display for Renewable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fungible item resources: interchangeable reservations counted against an
/// integer cap. Each reservation is tracked under a unique token so release
/// stays symmetric with reserve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fungible {
    Events,
    FilesOpened,
    InSockets,
    OutSockets,
}

impl Fungible {
    pub const ALL: [Fungible; 4] = [
        Fungible::Events,
        Fungible::FilesOpened,
        Fungible::InSockets,
        Fungible::OutSockets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Fungible::Events => "events",
            Fungible::FilesOpened => "filesopened",
            Fungible::InSockets => "insockets",
            Fungible::OutSockets => "outsockets",
        }
    }

    pub fn from_name(name: &str) -> Option<Fungible> {
        Fungible::ALL.iter().copied().find(|r| r.name() == name)
    }
}

impl fmt::Display for Fungible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Individual item resources: a fixed allow-set of port numbers granted up
/// front. Port 12345 is not interchangeable with port 54321.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortResource {
    MessPort,
    ConnPort,
}

impl PortResource {
    pub fn name(self) -> &'static str {
        match self {
            PortResource::MessPort => "messport",
            PortResource::ConnPort => "connport",
        }
    }

    pub fn from_name(name: &str) -> Option<PortResource> {
        match name {
            "messport" => Some(PortResource::MessPort),
            "connport" => Some(PortResource::ConnPort),
            _ => None,
        }
    }
}

impl fmt::Display for PortResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse lifecycle state recorded in the status side-channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Started,
    Stopped,
    Terminated,
    ThreadErr,
}

impl LifecycleStatus {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleStatus::Started => "Started",
            LifecycleStatus::Stopped => "Stopped",
            LifecycleStatus::Terminated => "Terminated",
            LifecycleStatus::ThreadErr => "ThreadErr",
        }
    }

    pub fn from_name(name: &str) -> Option<LifecycleStatus> {
        match name {
            "Started" => Some(LifecycleStatus::Started),
            "Stopped" => Some(LifecycleStatus::Stopped),
            "Terminated" => Some(LifecycleStatus::Terminated),
            "ThreadErr" => Some(LifecycleStatus::ThreadErr),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process exit classes. The discriminants are the actual exit codes, so an
/// external supervisor can distinguish normal completion, user faults,
/// resource violations, and monitor failure without parsing logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitStatus {
    Normal = 0,
    Interrupted = 4,
    UserException = 6,
    UncaughtCallbackError = 14,
    SelectorFailure = 13,
    Stopped = 44,
    ThreadError = 56,
    MonitorDied = 70,
    ResourceViolation = 98,
    InternalError = 132,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Stream socket states reported by the platform 4-tuple probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Established,
    Closing,
    Listening,
    Other,
}

/// Errors returned to the sandboxed caller. Contract violations (bad
/// arguments, policy denials, state misuse) surface here; anything that
/// threatens the runtime's own integrity goes through `fatal` instead and
/// never returns.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource '{0}' limit set to 0, will never drain")]
    Starved(&'static str),

    #[error("Resource '{0}' limit exceeded")]
    ResourceExceeded(&'static str),

    #[error("Resource '{resource} {port}' not allowed")]
    Denied { resource: &'static str, port: u16 },

    #[error("Local binding already connected or listening")]
    AlreadyConnected,

    #[error("Socket not connected")]
    NotConnected,

    #[error("Socket closed")]
    SocketClosed,

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Process error: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Outcome of stopping a handle. Stopping something already gone is not an
/// error; the caller just learns nothing was there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
}
