//! quotabox: a metered execution runtime with hard resource ceilings
//!
//! Untrusted code runs against a mediated API; every byte moved, socket
//! opened, timer armed, and random draw taken is charged to a resource
//! ledger before the real work happens, and an out-of-band watchdog
//! enforces the CPU/memory/disk ceilings whether or not the code
//! cooperates.
//!
//! # Architecture
//!
//! Leaves first, the way the pieces depend on each other:
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: resource vocabulary, error enum, exit codes
//! - [`config::limits`]: grant-file parsing and mandatory-ceiling validation
//!
//! ## Accounting ([`ledger`])
//! - [`ledger::decay`]: the pure leaky-bucket law
//! - [`ledger`]: blocking renewable charges, fungible item pools, port
//!   allow-sets
//!
//! ## Platform ([`platform`])
//! - [`platform::PlatformOps`]: the per-OS process/time/socket contract,
//!   one adapter selected at startup
//! - [`platform::clock`]: the monotonic runtime clock
//!
//! ## Mediated primitives ([`comm`], [`fileio`], [`timer`])
//! - [`comm`]: datagram and stream sockets with per-byte accounting
//! - [`fileio`]: sandbox-confined files with read/write metering
//! - [`timer`]: one-shot timers and blocking sleep
//!
//! ## Dispatch (internal)
//! - the lazily-started selector loop, its batched-poll/isolate-and-retry
//!   strategies, and the delivery workers
//!
//! ## Supervision ([`monitor`])
//! - [`monitor::watchdog`]: the forked watchdog (throttle CPU, kill on
//!   memory/disk)
//! - [`monitor::status`], [`monitor::stopfile`]: filesystem side-channels
//!
//! # Design principles
//!
//! 1. **Charge before work** - no primitive touches the OS before the
//!    ledger admits it
//! 2. **Contract violations return, integrity violations terminate** -
//!    sandboxed code can observe its own mistakes but never intercept
//!    enforcement
//! 3. **One adapter, selected once** - OS differences live behind
//!    [`platform::PlatformOps`], never inline
//! 4. **Explicit registries** - handle tables and meters are constructed
//!    objects, not ambient globals

pub mod comm;
pub mod config;
pub mod context;
pub mod fileio;
pub mod ledger;
pub mod monitor;
pub mod platform;
pub mod runtime;
pub mod timer;

mod dispatch;
mod fatal;

pub use comm::{ConnectionEvent, MessageEvent};
pub use config::types::{ExitStatus, LifecycleStatus, SandboxError, StopOutcome};
pub use config::{ResourceLimits, Result};
pub use context::SandboxContext;
pub use fileio::{FileId, FileMode};
pub use runtime::{launch, SandboxOptions};
pub use timer::TimerId;
