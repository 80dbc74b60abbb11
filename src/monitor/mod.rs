//! Out-of-band supervision: the forked watchdog, its throttle and disk
//! accounting, and the filesystem side-channels (status markers, stop
//! signal).

pub mod disk;
pub mod status;
pub mod stopfile;
pub mod throttle;
pub mod watchdog;

pub use status::StatusWriter;
pub use throttle::{CpuSample, CpuThrottle};
pub use watchdog::{spawn_monitored, MonitorConfig, MonitorVerdict, ProcessMonitor, Supervised};
